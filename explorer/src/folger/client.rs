//! A client for the live Folger site.

use super::Folger;
use anyhow::Error;
use async_std::task::sleep;
use async_trait::async_trait;
use std::time::Duration;

/// How a [`Client`] retries failed requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts before giving up.
    pub max_retries: u32,
    /// Delay after the first failure. Each later failure doubles it.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// How long to wait after the failed attempt numbered `attempt` (starting from 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// A client for the live Folger site.
pub struct Client {
    client: surf::Client,
    retry: RetryPolicy,
}

impl Client {
    /// Create a client whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            client: surf::Config::new()
                .set_timeout(Some(timeout))
                .try_into()
                .map_err(Error::msg)?,
            retry: Default::default(),
        })
    }

    /// Use `retry` instead of the default retry policy.
    pub fn with_retries(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch `url`, retrying with exponential backoff on failure.
    ///
    /// A response with a non-success status counts as a failure.
    pub async fn fetch_with_retries(&self, url: &str) -> Result<String, Error> {
        for attempt in 0..self.retry.max_retries {
            match self.fetch(url).await {
                Ok(body) => return Ok(body),
                Err(err) => {
                    let wait = self.retry.delay(attempt);
                    tracing::warn!(
                        "request to {url} failed (attempt {}/{}): {err}; retrying in {:.1} seconds",
                        attempt + 1,
                        self.retry.max_retries,
                        wait.as_secs_f64(),
                    );
                    sleep(wait).await;
                }
            }
        }
        tracing::error!(
            "failed to fetch {url} after {} attempts",
            self.retry.max_retries
        );
        Err(Error::msg(format!(
            "failed to fetch {url} after {} attempts",
            self.retry.max_retries
        )))
    }

    async fn fetch(&self, url: &str) -> Result<String, Error> {
        tracing::debug!(url, "Folger request");
        let mut res = self.client.get(url).await.map_err(Error::msg)?;
        if !res.status().is_success() {
            return Err(Error::msg(format!("{url} returned status {}", res.status())));
        }
        res.body_string().await.map_err(Error::msg)
    }
}

#[async_trait]
impl Folger for Client {
    async fn search_page(&self, url: &str) -> Result<String, Error> {
        tracing::info!("scraping search results from {url}");
        self.fetch_with_retries(url).await
    }

    async fn detail_page(&self, url: &str) -> Result<String, Error> {
        tracing::info!("scraping detail page {url}");
        self.fetch_with_retries(url).await
    }
}
