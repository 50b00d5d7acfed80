//! HTTP commit-status client with retry logic

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ProviderConfiguration;

use super::{CommitState, CommitStatusSink, ReporterError, ReporterResult};

/// Maximum number of retry attempts
const MAX_RETRIES: u32 = 3;

/// Base delay between retries (exponentially increased)
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay between retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct StatusPayload<'a> {
    state: &'a str,
    target_url: &'a str,
    description: &'a str,
}

/// Commit-status sink talking to the provider's REST endpoint
pub struct HttpCommitStatus {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpCommitStatus {
    pub fn new(config: &ProviderConfiguration) -> ReporterResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ReporterError::Request)?;

        let base_url = config.url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ReporterError::Other(
                "provider URL must start with http:// or https://".into(),
            ));
        }

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
        })
    }

    fn url(&self, repo_full_name: &str, commit_sha: &str) -> String {
        format!(
            "{}/repos/{}/statuses/{}",
            self.base_url, repo_full_name, commit_sha
        )
    }

    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let delay = BASE_RETRY_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1));
        delay.min(MAX_RETRY_DELAY)
    }

    async fn execute(&self, url: &str, payload: &StatusPayload<'_>) -> ReporterResult<()> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(ReporterError::Request)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown provider error".to_string());

        Err(ReporterError::Provider {
            status: status.as_u16(),
            message,
        })
    }

    fn is_retryable(error: &ReporterError) -> bool {
        match error {
            ReporterError::Request(e) => e.is_timeout() || e.is_connect(),
            ReporterError::Provider { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            _ => false,
        }
    }
}

#[async_trait]
impl CommitStatusSink for HttpCommitStatus {
    async fn post(
        &self,
        repo_full_name: &str,
        commit_sha: &str,
        state: CommitState,
        target_url: &str,
        description: &str,
    ) -> ReporterResult<()> {
        let url = self.url(repo_full_name, commit_sha);
        let payload = StatusPayload {
            state: state.as_str(),
            target_url,
            description,
        };

        let mut last_error: Option<ReporterError> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = self.calculate_backoff(attempt);
                debug!(
                    "Retrying status post to {} (attempt {}/{}), waiting {:?}",
                    url,
                    attempt + 1,
                    MAX_RETRIES + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.execute(&url, &payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if Self::is_retryable(&e) && attempt < MAX_RETRIES {
                        warn!("Status post to {} failed (attempt {}): {}", url, attempt + 1, e);
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(ReporterError::RetryExhausted(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        ))
    }
}
