//! Bounded scrape retry around a session restart.
//!
//! A failed scrape moves to `Restarting`; after a successful restart the
//! scrape is attempted once more. A second failure, or a restart that itself
//! fails, exhausts the identifier. Either way the run moves on to the next one.

use rollcall_adapters::SiteSession;
use rollcall_core::RawProfile;
use tracing::{info, warn};

pub const MAX_RESTARTS: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScrapeState {
    Attempting { restarts: u32 },
    Restarting { restarts: u32 },
    Exhausted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeOutcome {
    Scraped(RawProfile),
    Failed(String),
}

pub async fn scrape_with_recovery(
    session: &mut dyn SiteSession,
    nickname: &str,
) -> ScrapeOutcome {
    let mut state = ScrapeState::Attempting { restarts: 0 };
    loop {
        state = match state {
            ScrapeState::Attempting { restarts } => match session.fetch_profile(nickname).await {
                Ok(raw) => return ScrapeOutcome::Scraped(raw),
                Err(err) => {
                    warn!(nickname, attempt = restarts + 1, error = %err, "scrape failed");
                    if restarts < MAX_RESTARTS {
                        ScrapeState::Restarting { restarts }
                    } else {
                        ScrapeState::Exhausted(err.to_string())
                    }
                }
            },
            ScrapeState::Restarting { restarts } => match session.restart().await {
                Ok(()) => {
                    info!(nickname, "session restarted; retrying scrape");
                    ScrapeState::Attempting {
                        restarts: restarts + 1,
                    }
                }
                Err(err) => {
                    warn!(nickname, error = %err, "session restart failed");
                    ScrapeState::Exhausted(format!("session restart failed: {err}"))
                }
            },
            ScrapeState::Exhausted(reason) => return ScrapeOutcome::Failed(reason),
        };
    }
}
