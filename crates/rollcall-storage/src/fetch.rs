//! Cookie-authenticated page fetching with a short exponential retry for
//! transient failures. Table calls never come through here.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

/// Throttling and server-side failures are worth another try.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRetry {
    pub retries: u32,
    pub first_wait: Duration,
    pub max_wait: Duration,
}

impl Default for PageRetry {
    fn default() -> Self {
        Self {
            retries: 2,
            first_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(5),
        }
    }
}

impl PageRetry {
    /// Wait before the `retry`-th (1-based) repeat: doubles each time, capped.
    pub fn wait_before(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(31);
        self.first_wait
            .saturating_mul(1u32 << doublings)
            .min(self.max_wait)
    }
}

#[derive(Debug, Clone)]
pub struct PageClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// `Cookie` header of a session that is already logged in.
    pub session_cookie: Option<String>,
    pub retry: PageRetry,
}

impl Default for PageClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            session_cookie: None,
            retry: PageRetry::default(),
        }
    }
}

/// A successfully fetched page. `final_url` is where redirects ended up.
#[derive(Debug, Clone)]
pub struct Page {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("page request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("page {url} answered {status}")]
    Status { status: u16, url: String },
}

enum Attempt {
    Done(Page),
    Transient(FetchError),
    Failed(FetchError),
}

pub struct PageFetcher {
    client: reqwest::Client,
    retry: PageRetry,
}

impl PageFetcher {
    pub fn new(config: PageClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = &config.session_cookie {
            let mut value =
                HeaderValue::from_str(cookie).context("session cookie is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(COOKIE, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }

        Ok(Self {
            client: builder.build().context("building page client")?,
            retry: config.retry,
        })
    }

    pub async fn get(&self, url: &str) -> Result<Page, FetchError> {
        self.get_with_retry(url)
            .instrument(info_span!("page_fetch", url))
            .await
    }

    async fn get_with_retry(&self, url: &str) -> Result<Page, FetchError> {
        let mut retries = 0;
        loop {
            match self.attempt(url).await {
                Attempt::Done(page) => return Ok(page),
                Attempt::Failed(err) => return Err(err),
                Attempt::Transient(err) if retries < self.retry.retries => {
                    retries += 1;
                    let wait = self.retry.wait_before(retries);
                    debug!(error = %err, retries, wait_ms = wait.as_millis() as u64, "page fetch retry");
                    tokio::time::sleep(wait).await;
                }
                Attempt::Transient(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, url: &str) -> Attempt {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(err) if is_transient_error(&err) => return Attempt::Transient(err.into()),
            Err(err) => return Attempt::Failed(err.into()),
        };
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            let err = FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            };
            return if is_transient_status(status) {
                Attempt::Transient(err)
            } else {
                Attempt::Failed(err)
            };
        }
        match response.text().await {
            Ok(body) => Attempt::Done(Page {
                status,
                final_url,
                body,
            }),
            Err(err) => Attempt::Failed(err.into()),
        }
    }
}
