use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use rollcall_adapters::{AdapterError, SiteSession};
use rollcall_core::{site_now, Normalizer, OnlineEvent, RunSummary};
use rollcall_storage::{ResilientWriter, RetryPolicy, TableStore};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::IdentityCache;
use crate::config::{Pacing, SyncConfig};
use crate::events::EventLogger;
use crate::layout::{
    load_tags, prepare_table, run_number, SheetSpec, ONLINE_SHEET, PROFILES_SHEET,
};
use crate::reconcile::{OutcomeKind, Reconciler};
use crate::recovery::{scrape_with_recovery, ScrapeOutcome};
use crate::summary::{append_summary, log_report, RunAggregator};
use crate::SyncError;

#[derive(Debug, Clone)]
pub struct SyncRunReport {
    pub run_id: Uuid,
    pub summary: RunSummary,
    /// Whether the dashboard row actually landed.
    pub summary_recorded: bool,
    /// Fatal error that ended the run early, if any.
    pub error: Option<SyncError>,
}

impl SyncRunReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Progress that must survive an aborted run so cleanup can report it.
#[derive(Debug)]
struct RunContext {
    run_no: u32,
    aggregate: RunAggregator,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            run_no: 1,
            aggregate: RunAggregator::default(),
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn TableStore>,
    policy: RetryPolicy,
    pacing: Pacing,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn TableStore>) -> Self {
        let policy = config.retry_policy();
        let pacing = config.pacing();
        Self {
            config,
            store,
            policy,
            pacing,
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn writer(&self) -> ResilientWriter {
        ResilientWriter::new(self.store.clone(), self.policy)
    }

    /// One full run, interruptible with Ctrl-C.
    pub async fn run_once(&self, session: &mut dyn SiteSession) -> SyncRunReport {
        self.run_until(session, interrupt_signal()).await
    }

    /// One full run that stops early when `shutdown` resolves. Whatever ends
    /// the run, the session is released and exactly one summary row is
    /// appended to the dashboard.
    pub async fn run_until<S>(&self, session: &mut dyn SiteSession, shutdown: S) -> SyncRunReport
    where
        S: Future<Output = ()> + Send,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        async move {
            let mut ctx = RunContext::default();
            let result = {
                let drive = self.drive(session, &mut ctx);
                tokio::select! {
                    result = drive => result,
                    _ = shutdown => Err(SyncError::Interrupted),
                }
            };
            match &result {
                Ok(()) => {}
                Err(SyncError::Interrupted) => warn!("run interrupted; flushing summary"),
                Err(err) => error!(error = %err, "run aborted"),
            }

            session.close().await;
            let summary = ctx
                .aggregate
                .summary(ctx.run_no, site_now(), &self.config.source_label);
            let summary_recorded = append_summary(&self.writer(), &summary).await;
            log_report(&ctx.aggregate, ctx.run_no);

            SyncRunReport {
                run_id,
                summary,
                summary_recorded,
                error: result.err(),
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, session: &mut dyn SiteSession, ctx: &mut RunContext) -> Result<(), SyncError> {
        let writer = self.writer();

        let dashboard = prepare_table(&writer, &SheetSpec::dashboard()).await?;
        ctx.run_no = run_number(&dashboard);
        let profiles = prepare_table(&writer, &SheetSpec::profiles()).await?;
        let mut cache = IdentityCache::load(&profiles);
        prepare_table(&writer, &SheetSpec::online_status()).await?;
        let tags = load_tags(&writer).await;
        info!(run_no = ctx.run_no, profiles = cache.len(), "store ready");

        session
            .open()
            .await
            .map_err(|err| SyncError::Setup(format!("site session unavailable: {err}")))?;

        let targets = match session.online_nicknames().await {
            Ok(listed) => limit_targets(listed, self.config.max_profiles_per_run),
            Err(err @ AdapterError::NotAuthenticated(_)) => {
                return Err(SyncError::Setup(err.to_string()));
            }
            Err(err) => {
                warn!(error = %err, "online discovery failed; nothing to process");
                Vec::new()
            }
        };
        let total = targets.len();
        ctx.aggregate.set_targeted(total);
        info!(targets = total, "processing online profiles");

        let events = EventLogger::new(writer.clone(), ONLINE_SHEET);
        let reconciler = Reconciler::new(writer, PROFILES_SHEET);

        for (index, nickname) in targets.iter().enumerate() {
            events
                .log_online(&OnlineEvent {
                    nickname: nickname.clone(),
                    observed_at: site_now(),
                })
                .await;

            match scrape_with_recovery(session, nickname).await {
                ScrapeOutcome::Scraped(raw) => {
                    let record = Normalizer::at_site_now().profile(&raw, &self.config.source_label);
                    let outcome = reconciler.reconcile(record, &mut cache, &tags).await;
                    match outcome.kind {
                        OutcomeKind::New => info!(nickname = %nickname, row = ?outcome.row, "new profile"),
                        OutcomeKind::Updated => info!(
                            nickname = %nickname,
                            row = ?outcome.row,
                            changed = %outcome.changed_headers().join(", "),
                            "profile updated"
                        ),
                        OutcomeKind::Unchanged => info!(nickname = %nickname, "profile unchanged"),
                        OutcomeKind::Error => warn!(
                            nickname = %nickname,
                            error = outcome.error.as_deref().unwrap_or_default(),
                            "profile not written"
                        ),
                    }
                    ctx.aggregate.record(&outcome);
                }
                ScrapeOutcome::Failed(reason) => {
                    warn!(nickname = %nickname, reason, "profile skipped");
                    ctx.aggregate.record_failure();
                }
            }
            ctx.aggregate.finish_identifier();
            self.pacing.after_identifier(index + 1, total).await;
        }
        Ok(())
    }

    /// Run unless another run holds the lock; overlapping ticks are skipped.
    pub async fn run_scheduled(&self, session: &mut dyn SiteSession) -> Option<SyncRunReport> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("previous sync still running; skipping this tick");
            return None;
        };
        Some(self.run_once(session).await)
    }

    /// Resolves once no scheduled run is in flight.
    pub async fn wait_idle(&self) {
        let _guard = self.run_lock.lock().await;
    }

    pub async fn maybe_build_scheduler<F>(self: Arc<Self>, make_session: F) -> Result<Option<JobScheduler>>
    where
        F: Fn() -> Box<dyn SiteSession> + Send + Sync + 'static,
    {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let factory = Arc::new(make_session);
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let factory = factory.clone();
            Box::pin(async move {
                let mut session = factory();
                if let Some(report) = pipeline.run_scheduled(session.as_mut()).await {
                    info!(run_no = report.summary.run_no, ok = report.is_success(), "scheduled sync finished");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Apply the per-run cap; 0 means no cap.
pub fn limit_targets(mut targets: Vec<String>, max: usize) -> Vec<String> {
    if max > 0 && targets.len() > max {
        targets.truncate(max);
    }
    targets
}

async fn interrupt_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "interrupt handler unavailable");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn target_cap_applies_only_when_positive() {
        assert_eq!(limit_targets(names(&["a1x", "b2y", "c3z"]), 0).len(), 3);
        assert_eq!(limit_targets(names(&["a1x", "b2y", "c3z"]), 2), names(&["a1x", "b2y"]));
        assert_eq!(limit_targets(names(&["a1x"]), 5), names(&["a1x"]));
    }
}
