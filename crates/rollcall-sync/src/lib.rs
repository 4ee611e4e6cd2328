//! Roll-call engine: discovers online identifiers, scrapes and normalizes
//! their profiles, reconciles them into the identity-keyed `Profiles` table,
//! and keeps the online-event log and per-run dashboard.

pub mod cache;
pub mod config;
pub mod events;
pub mod formula;
pub mod layout;
pub mod pipeline;
pub mod reconcile;
pub mod recovery;
pub mod summary;
pub mod tags;

use std::sync::Arc;

use anyhow::{Context, Result};
use rollcall_adapters::{HttpSiteSession, SiteSession};
use rollcall_storage::SheetsTableStore;
use thiserror::Error;
use tracing::info;

pub use cache::{CacheEntry, IdentityCache};
pub use config::{Pacing, SyncConfig};
pub use events::EventLogger;
pub use pipeline::{SyncPipeline, SyncRunReport};
pub use reconcile::{Outcome, OutcomeKind, Reconciler};
pub use recovery::{scrape_with_recovery, ScrapeOutcome};
pub use summary::RunAggregator;
pub use tags::TagIndex;

pub const CRATE_NAME: &str = "rollcall-sync";

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("run interrupted")]
    Interrupted,
}

/// Pipeline over the configured spreadsheet. Fails on incomplete settings.
pub fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    config.validate()?;
    let store = SheetsTableStore::new(config.sheets_config()?).context("creating sheets client")?;
    Ok(SyncPipeline::new(config, Arc::new(store)))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunReport> {
    let pipeline = pipeline_from_env()?;
    let mut session = HttpSiteSession::new(pipeline.config().site_config());
    Ok(pipeline.run_once(&mut session).await)
}

/// Online identifiers the next run would target, without touching the sheets.
pub async fn discover_online_from_env() -> Result<Vec<String>> {
    let config = SyncConfig::from_env();
    let mut session = HttpSiteSession::new(config.site_config());
    session.open().await.context("opening site session")?;
    let listed = session.online_nicknames().await;
    session.close().await;
    let targets = pipeline::limit_targets(listed.context("listing online users")?, config.max_profiles_per_run);
    info!(count = targets.len(), "discovery complete");
    Ok(targets)
}
