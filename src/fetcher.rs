//! Fetching replays from the remote endpoint
//!
//! A [`Fetcher`] performs exactly one download attempt for one replay ID and
//! classifies the answer. It never retries; backoff is the coordinator's job.
//!
//! Classification used by [`HttpFetcher`]:
//!
//! | Response                                   | Outcome     |
//! |--------------------------------------------|-------------|
//! | 2xx with a complete body                   | `Success`   |
//! | status listed in `absent_statuses`         | `Absent`    |
//! | 429, 5xx, any other status                 | `Transient` |
//! | timeout, connect error, truncated body     | `Transient` |

use crate::config::SourceConfig;
use crate::types::{FetchOutcome, ReplayId};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;

/// One download attempt for one replay ID
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `id` and classify the result
    async fn fetch(&self, id: ReplayId) -> FetchOutcome;
}

/// [`Fetcher`] backed by HTTP GET requests against a URL template
pub struct HttpFetcher {
    client: reqwest::Client,
    config: SourceConfig,
}

impl HttpFetcher {
    /// Build a fetcher from the source configuration
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(config: SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| {
                Error::config(
                    "source.user_agent",
                    format!("Failed to create HTTP client: {}", e),
                )
            })?;

        Ok(Self { client, config })
    }

    /// URL requested for `id`
    pub fn url_for(&self, id: ReplayId) -> String {
        self.config.url_for(id.0)
    }

    fn classify_status(&self, status: StatusCode) -> Option<FetchOutcome> {
        if status.is_success() {
            return None;
        }

        if self.config.absent_statuses.contains(&status.as_u16()) {
            return Some(FetchOutcome::Absent {
                status: status.as_u16(),
            });
        }

        let reason = if status == StatusCode::TOO_MANY_REQUESTS {
            "rate limited (HTTP 429)".to_string()
        } else if status.is_server_error() {
            format!("server error (HTTP {})", status.as_u16())
        } else {
            format!("unexpected status (HTTP {})", status.as_u16())
        };
        Some(FetchOutcome::Transient { reason })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, id: ReplayId) -> FetchOutcome {
        let url = self.url_for(id);
        tracing::debug!(replay_id = id.0, url = %url, "Requesting replay");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                let reason = if e.is_timeout() {
                    format!("timeout after {:?}", self.config.request_timeout)
                } else if e.is_connect() {
                    format!("connection failed: {}", e)
                } else {
                    format!("request failed: {}", e)
                };
                return FetchOutcome::Transient { reason };
            }
        };

        let status = response.status();
        if let Some(outcome) = self.classify_status(status) {
            tracing::debug!(replay_id = id.0, status = status.as_u16(), "Replay not retrieved");
            return outcome;
        }

        let advertised = response.content_length();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return FetchOutcome::transient(format!("failed to read response body: {}", e));
            }
        };

        if let Some(expected) = advertised
            && (bytes.len() as u64) < expected
        {
            return FetchOutcome::transient(format!(
                "truncated body: got {} of {} bytes",
                bytes.len(),
                expected
            ));
        }

        tracing::debug!(replay_id = id.0, size = bytes.len(), "Replay retrieved");
        FetchOutcome::Success {
            bytes: bytes.to_vec(),
        }
    }
}
