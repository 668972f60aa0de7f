//! Monitoring sweeper
//!
//! Runs one sweep of due monitoring records per tick and tracks consecutive
//! failures for the circuit breaker.

use readerloop_common::collaborators::ExistenceChecker;
use readerloop_common::engine::CheckSweepReport;
use readerloop_common::errors::{AppError, Result};
use readerloop_common::ReviewEngine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Consecutive failed sweeps before the breaker opens
pub const MAX_FAILURES: u32 = 5;

/// Pause while the breaker is open
pub const CIRCUIT_BREAK_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures >= MAX_FAILURES
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }
}

pub struct Sweeper {
    engine: ReviewEngine,
    checker: Arc<dyn ExistenceChecker>,
    breaker: CircuitBreaker,
}

impl Sweeper {
    pub fn new(engine: ReviewEngine, checker: Arc<dyn ExistenceChecker>) -> Self {
        Self {
            engine,
            checker,
            breaker: CircuitBreaker::default(),
        }
    }

    /// One sweep. A sweep where every check failed counts as a failure.
    pub async fn sweep(&mut self) -> Result<CheckSweepReport> {
        let result = self
            .engine
            .monitoring()
            .run_due_checks(self.checker.as_ref())
            .await
            .and_then(|report| {
                if report.checked > 0 && report.failed == report.checked {
                    Err(AppError::Internal {
                        message: format!("all {} checks in the sweep failed", report.checked),
                    })
                } else {
                    Ok(report)
                }
            });

        match &result {
            Ok(report) => {
                self.breaker.record_success();
                if report.checked > 0 {
                    info!(
                        checked = report.checked,
                        removed = report.removed,
                        "Sweep finished"
                    );
                }
            }
            Err(e) => {
                let failures = self.breaker.record_failure();
                error!(error = %e, failures, "Monitoring sweep failed");
            }
        }

        result
    }

    /// Sleep out the breaker pause if too many sweeps failed in a row
    pub async fn wait_if_open(&mut self) {
        if self.breaker.is_open() {
            warn!(
                failures = self.breaker.failures(),
                "Circuit breaker open, pausing..."
            );
            tokio::time::sleep(CIRCUIT_BREAK_DURATION).await;
            self.breaker.reset();
            info!("Circuit breaker reset, resuming...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use readerloop_common::config::AppConfig;
    use readerloop_common::db::{schema, DbPool};

    struct AlwaysPresent;

    #[async_trait]
    impl ExistenceChecker for AlwaysPresent {
        async fn still_published(&self, _review_link: &str) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_breaker_opens_after_max_failures() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..MAX_FAILURES - 1 {
            breaker.record_failure();
        }
        assert!(!breaker.is_open());
        assert_eq!(breaker.record_failure(), MAX_FAILURES);
        assert!(breaker.is_open());

        breaker.reset();
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_success_clears_failures() {
        let mut breaker = CircuitBreaker::default();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failures(), 0);
    }

    #[tokio::test]
    async fn test_empty_sweep_is_success() {
        let db = DbPool::sqlite_memory().await.unwrap();
        schema::ensure_schema(db.write()).await.unwrap();
        let mut config = AppConfig::default();
        config.notifications.provider = "none".to_string();
        let engine = ReviewEngine::from_config(&config, db).await.unwrap();

        let mut sweeper = Sweeper::new(engine, Arc::new(AlwaysPresent));
        sweeper.breaker.record_failure();

        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.checked, 0);
        assert_eq!(sweeper.breaker.failures(), 0);
    }
}
