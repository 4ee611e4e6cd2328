//! Site collaborators: online discovery and profile scraping over an
//! authenticated session, with fixture-tested pure parsers.

pub mod parse;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rollcall_core::RawProfile;
use rollcall_storage::{FetchError, Page, PageClientConfig, PageFetcher};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use parse::{
    absolute_url, first_match, is_identifier_token, parse_online_list, parse_profile_page,
    parse_recent_post, Extract, RecentPost,
};

pub const CRATE_NAME: &str = "rollcall-adapters";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("session is not authenticated (landed on {0})")]
    NotAuthenticated(String),
    #[error("page did not finish rendering: {0}")]
    PageNotReady(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Stateful, authenticated surface onto the site. Calls are strictly
/// sequential; a broken session is recovered with [`SiteSession::restart`].
#[async_trait]
pub trait SiteSession: Send {
    /// Establish the session and verify it is authenticated.
    async fn open(&mut self) -> Result<(), AdapterError>;

    /// Candidate identifiers currently listed as online, in page order.
    async fn online_nicknames(&mut self) -> Result<Vec<String>, AdapterError>;

    async fn fetch_profile(&mut self, nickname: &str) -> Result<RawProfile, AdapterError>;

    /// Tear the session down and establish a fresh one.
    async fn restart(&mut self) -> Result<(), AdapterError>;

    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub base_url: String,
    pub session_cookie: String,
    pub user_agent: Option<String>,
    pub page_timeout: Duration,
    /// Pause between a profile page and its posts page.
    pub post_page_delay: Duration,
}

impl SiteConfig {
    pub fn new(base_url: impl Into<String>, session_cookie: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            session_cookie: session_cookie.into(),
            user_agent: None,
            page_timeout: Duration::from_secs(30),
            post_page_delay: Duration::from_secs(1),
        }
    }

    fn client_config(&self) -> PageClientConfig {
        PageClientConfig {
            timeout: self.page_timeout,
            user_agent: Some(
                self.user_agent
                    .clone()
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            ),
            session_cookie: Some(self.session_cookie.clone()),
            ..Default::default()
        }
    }
}

/// [`SiteSession`] backed by plain HTTP and a pre-authenticated cookie.
pub struct HttpSiteSession {
    config: SiteConfig,
    fetcher: Option<PageFetcher>,
}

impl HttpSiteSession {
    pub fn new(config: SiteConfig) -> Self {
        Self {
            config,
            fetcher: None,
        }
    }

    fn fetcher(&self) -> Result<&PageFetcher, AdapterError> {
        self.fetcher
            .as_ref()
            .ok_or_else(|| AdapterError::Message("site session is not open".to_string()))
    }

    async fn get(&self, url: &str) -> Result<Page, AdapterError> {
        let response = self.fetcher()?.get(url).await?;
        ensure_authenticated(&response)?;
        Ok(response)
    }

    async fn connect(&mut self) -> Result<(), AdapterError> {
        let fetcher = PageFetcher::new(self.config.client_config())?;
        self.fetcher = Some(fetcher);
        let probe = parse::online_list_url(&self.config.base_url);
        self.get(&probe).await?;
        Ok(())
    }
}

/// Unauthenticated requests are redirected to the login page.
fn ensure_authenticated(response: &Page) -> Result<(), AdapterError> {
    if response.final_url.contains("/login") {
        return Err(AdapterError::NotAuthenticated(response.final_url.clone()));
    }
    Ok(())
}

#[async_trait]
impl SiteSession for HttpSiteSession {
    async fn open(&mut self) -> Result<(), AdapterError> {
        self.connect().await?;
        info!(base = %self.config.base_url, "site session ready");
        Ok(())
    }

    async fn online_nicknames(&mut self) -> Result<Vec<String>, AdapterError> {
        let url = parse::online_list_url(&self.config.base_url);
        let page = self.get(&url).await?;
        let names = parse_online_list(&page.body);
        info!(count = names.len(), "online users discovered");
        Ok(names)
    }

    async fn fetch_profile(&mut self, nickname: &str) -> Result<RawProfile, AdapterError> {
        let base = self.config.base_url.clone();
        let url = parse::profile_url(&base, nickname);
        let page = self.get(&url).await?;
        let mut raw = parse_profile_page(&page.body, nickname, &base, Utc::now())
            .ok_or(AdapterError::PageNotReady(url))?;

        if parse::has_posts(&raw) {
            if !self.config.post_page_delay.is_zero() {
                tokio::time::sleep(self.config.post_page_delay).await;
            }
            let posts_url = parse::public_posts_url(&base, nickname);
            match self.get(&posts_url).await {
                Ok(posts) => parse_recent_post(&posts.body, &base).apply(&mut raw),
                Err(AdapterError::NotAuthenticated(landed)) => {
                    return Err(AdapterError::NotAuthenticated(landed));
                }
                Err(err) => warn!(nickname, error = %err, "recent post unavailable"),
            }
        }
        debug!(nickname, fields = raw.fields.len(), "profile scraped");
        Ok(raw)
    }

    async fn restart(&mut self) -> Result<(), AdapterError> {
        warn!("restarting site session");
        self.fetcher = None;
        self.connect().await
    }

    async fn close(&mut self) {
        if self.fetcher.take().is_some() {
            debug!("site session closed");
        }
    }
}
