use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::{
    classify_store_error, CellFormat, CellRef, ErrorSignature, GridRange, StoreError, TableStore,
    ValueInput,
};

/// Bounded retry with linear backoff on quota errors and a fixed courtesy
/// pause after every successful call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
    pub courtesy_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(5),
            courtesy_delay: Duration::from_millis(800),
        }
    }
}

impl RetryPolicy {
    /// No pauses at all; for tests and local stores.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::ZERO,
            courtesy_delay: Duration::ZERO,
        }
    }

    /// Wait after the `attempt`-th (1-based) quota failure.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }
}

/// The only path to the table store. Failures are logged and degrade to
/// `None`; callers decide whether a missing result matters.
#[derive(Clone)]
pub struct ResilientWriter {
    store: Arc<dyn TableStore>,
    policy: RetryPolicy,
}

impl ResilientWriter {
    pub fn new(store: Arc<dyn TableStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn with_retry<T, F, Fut>(&self, op: &str, mut operation: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match operation().await {
                Ok(value) => {
                    pause(self.policy.courtesy_delay).await;
                    return Some(value);
                }
                Err(err) => {
                    let last = attempt == max_attempts;
                    match classify_store_error(&err) {
                        ErrorSignature::Quota if !last => {
                            let wait = self.policy.backoff_for_attempt(attempt);
                            warn!(
                                op,
                                attempt,
                                wait_secs = wait.as_secs_f64(),
                                "table store rate limited; backing off"
                            );
                            pause(wait).await;
                        }
                        _ if !last => {
                            debug!(op, attempt, error = %err, "table store call failed; retrying");
                        }
                        _ => {
                            error!(op, attempts = max_attempts, error = %err, "table store call gave up");
                        }
                    }
                }
            }
        }
        None
    }

    pub async fn ensure_sheet(&self, sheet: &str, rows: u32, columns: u32) -> Option<bool> {
        let store = self.store.as_ref();
        self.with_retry("ensure_sheet", move || store.ensure_sheet(sheet, rows, columns))
            .await
    }

    pub async fn sheet_names(&self) -> Option<Vec<String>> {
        let store = self.store.as_ref();
        self.with_retry("sheet_names", move || store.sheet_names()).await
    }

    pub async fn read_all(&self, sheet: &str) -> Option<Vec<Vec<String>>> {
        let store = self.store.as_ref();
        self.with_retry("read_all", move || store.read_all(sheet)).await
    }

    pub async fn append_row(&self, sheet: &str, values: &[String]) -> Option<()> {
        let store = self.store.as_ref();
        self.with_retry("append_row", move || store.append_row(sheet, values))
            .await
    }

    pub async fn update_row(&self, sheet: &str, row: usize, values: &[String]) -> Option<()> {
        let store = self.store.as_ref();
        self.with_retry("update_row", move || store.update_row(sheet, row, values))
            .await
    }

    pub async fn update_cell(
        &self,
        sheet: &str,
        cell: CellRef,
        value: &str,
        input: ValueInput,
    ) -> Option<()> {
        let store = self.store.as_ref();
        self.with_retry("update_cell", move || store.update_cell(sheet, cell, value, input))
            .await
    }

    pub async fn format_range(&self, sheet: &str, range: GridRange, format: &CellFormat) -> Option<()> {
        let store = self.store.as_ref();
        self.with_retry("format_range", move || store.format_range(sheet, range, format))
            .await
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}
