use std::time::Duration;

use rand::Rng;
use rollcall_adapters::SiteConfig;
use rollcall_storage::{spreadsheet_id_from_url, RetryPolicy, SheetsConfig};

use crate::SyncError;

pub const DEFAULT_SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
pub const DEFAULT_SITE_BASE_URL: &str = "https://damadam.pk";
pub const DEFAULT_SYNC_CRON: &str = "0 */30 * * * *";
pub const BATCH_PAUSE: Duration = Duration::from_secs(5);

/// Process-wide settings, read once at start and immutable for the run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sheet_url: String,
    pub sheets_token: String,
    pub sheets_api_base: String,
    pub site_base_url: String,
    pub session_cookie: String,
    /// 0 means every discovered identifier is processed.
    pub max_profiles_per_run: usize,
    pub batch_size: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub sheet_write_delay: Duration,
    pub page_load_timeout: Duration,
    pub source_label: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |key: &str, default: f64| {
            let value = var(key)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(default);
            Duration::from_millis((value * 1000.0).round() as u64)
        };

        Self {
            sheet_url: var("GOOGLE_SHEET_URL").unwrap_or_default(),
            sheets_token: var("GOOGLE_SHEETS_TOKEN").unwrap_or_default(),
            sheets_api_base: var("SHEETS_API_BASE")
                .unwrap_or_else(|| DEFAULT_SHEETS_API_BASE.to_string()),
            site_base_url: var("SITE_BASE_URL").unwrap_or_else(|| DEFAULT_SITE_BASE_URL.to_string()),
            session_cookie: var("SITE_SESSION_COOKIE").unwrap_or_default(),
            max_profiles_per_run: var("MAX_PROFILES_PER_RUN")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            batch_size: var("BATCH_SIZE").and_then(|v| v.parse().ok()).unwrap_or(20),
            min_delay: secs("MIN_DELAY", 0.4),
            max_delay: secs("MAX_DELAY", 0.6),
            sheet_write_delay: secs("SHEET_WRITE_DELAY", 0.8),
            page_load_timeout: secs("PAGE_LOAD_TIMEOUT", 30.0),
            source_label: var("ROLLCALL_SOURCE_LABEL").unwrap_or_else(|| "Online".to_string()),
            scheduler_enabled: var("ROLLCALL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("ROLLCALL_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            user_agent: var("ROLLCALL_USER_AGENT"),
        }
    }

    /// Every missing required setting is reported at once.
    pub fn validate(&self) -> Result<(), SyncError> {
        let mut missing = Vec::new();
        if self.sheet_url.is_empty() {
            missing.push("GOOGLE_SHEET_URL");
        }
        if self.sheets_token.is_empty() {
            missing.push("GOOGLE_SHEETS_TOKEN");
        }
        if self.session_cookie.is_empty() {
            missing.push("SITE_SESSION_COOKIE");
        }
        if !missing.is_empty() {
            return Err(SyncError::Config(format!(
                "missing env vars: {}",
                missing.join(", ")
            )));
        }
        if spreadsheet_id_from_url(&self.sheet_url).is_none() {
            return Err(SyncError::Config(format!(
                "GOOGLE_SHEET_URL has no spreadsheet id: {}",
                self.sheet_url
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            courtesy_delay: self.sheet_write_delay,
            ..RetryPolicy::default()
        }
    }

    pub fn sheets_config(&self) -> Result<SheetsConfig, SyncError> {
        let spreadsheet_id = spreadsheet_id_from_url(&self.sheet_url).ok_or_else(|| {
            SyncError::Config(format!("no spreadsheet id in {}", self.sheet_url))
        })?;
        Ok(SheetsConfig {
            api_base: self.sheets_api_base.clone(),
            spreadsheet_id,
            token: self.sheets_token.clone(),
            timeout: Duration::from_secs(30),
        })
    }

    pub fn site_config(&self) -> SiteConfig {
        SiteConfig {
            user_agent: self.user_agent.clone(),
            page_timeout: self.page_load_timeout,
            ..SiteConfig::new(self.site_base_url.clone(), self.session_cookie.clone())
        }
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            min_delay: self.min_delay,
            max_delay: self.max_delay,
            batch_size: self.batch_size,
            batch_pause: BATCH_PAUSE,
        }
    }
}

/// Waits between identifiers: a randomized per-identifier delay plus a longer
/// pause after every full batch. Nothing is awaited after the last identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            batch_size: 0,
            batch_pause: Duration::ZERO,
        }
    }

    /// `processed` is the 1-based count of identifiers finished so far.
    pub fn is_batch_boundary(&self, processed: usize, total: usize) -> bool {
        self.batch_size > 0 && processed % self.batch_size == 0 && processed < total
    }

    pub fn jitter(&self) -> Duration {
        let (low, high) = if self.min_delay <= self.max_delay {
            (self.min_delay, self.max_delay)
        } else {
            (self.max_delay, self.min_delay)
        };
        if low == high {
            return low;
        }
        let low = u64::try_from(low.as_nanos()).unwrap_or(u64::MAX);
        let high = u64::try_from(high.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::rng().random_range(low..=high))
    }

    pub async fn after_identifier(&self, processed: usize, total: usize) {
        if processed >= total {
            return;
        }
        if self.is_batch_boundary(processed, total) && !self.batch_pause.is_zero() {
            tracing::info!(processed, total, "batch pause");
            tokio::time::sleep(self.batch_pause).await;
        }
        let delay = self.jitter();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
