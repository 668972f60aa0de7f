//! Marketplace existence checker capability
//!
//! A checker error means "inconclusive": monitoring retries at the next
//! interval and never treats an error as a removal.

use crate::config::MonitoringConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff, ExponentialBackoffBuilder};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait ExistenceChecker: Send + Sync {
    /// Whether the review at `review_link` is still published
    async fn still_published(&self, review_link: &str) -> Result<bool>;
}

/// HTTP checker: 404/410 means removed, 2xx means present.
///
/// Network errors, 429 and 5xx are retried with exponential backoff;
/// any other status is an immediate inconclusive result.
pub struct HttpExistenceChecker {
    client: reqwest::Client,
    max_retries: u32,
    max_elapsed: Duration,
}

impl HttpExistenceChecker {
    pub fn new(config: &MonitoringConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.checker_timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("readerloop-monitor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            max_retries: config.checker_max_retries,
            max_elapsed: timeout * (config.checker_max_retries + 1),
        })
    }

    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(10))
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

/// Map a marketplace response status to a published / removed answer
pub fn classify_status(status: StatusCode) -> Option<bool> {
    if status.is_success() {
        Some(true)
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        Some(false)
    } else {
        None
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl ExistenceChecker for HttpExistenceChecker {
    async fn still_published(&self, review_link: &str) -> Result<bool> {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let client = &self.client;
        let max_retries = self.max_retries;

        retry(self.policy(), || async move {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed);

            let response = client.get(review_link).send().await.map_err(|e| {
                warn!(attempt, error = %e, "Existence check request failed");
                if attempt < max_retries {
                    backoff::Error::transient(AppError::HttpClient(e))
                } else {
                    backoff::Error::permanent(AppError::HttpClient(e))
                }
            })?;

            let status = response.status();
            debug!(attempt, status = status.as_u16(), "Existence check response");

            match classify_status(status) {
                Some(published) => Ok(published),
                None => {
                    let err = AppError::Collaborator {
                        collaborator: "existence_checker",
                        message: format!("unexpected status {}", status),
                    };
                    if is_transient(status) && attempt < max_retries {
                        Err(backoff::Error::transient(err))
                    } else {
                        Err(backoff::Error::permanent(err))
                    }
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), Some(true));
        assert_eq!(classify_status(StatusCode::NOT_FOUND), Some(false));
        assert_eq!(classify_status(StatusCode::GONE), Some(false));
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), None);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), None);
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient(StatusCode::BAD_GATEWAY));
        assert!(is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient(StatusCode::FORBIDDEN));
    }
}
