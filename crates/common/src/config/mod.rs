//! Configuration management for ReaderLoop services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use crate::db::models::BookFormat;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Reader payout and author credit rates
    #[serde(default)]
    pub compensation: CompensationConfig,

    /// Guarantee monitoring
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Review submission and resubmission rules
    #[serde(default)]
    pub review: ReviewConfig,

    /// Notification delivery
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Create missing tables on startup
    #[serde(default)]
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompensationConfig {
    /// Reader payout for an ebook review, in cents
    #[serde(default = "default_ebook_payout")]
    pub ebook_payout_cents: i64,

    /// Reader payout for an audiobook review, in cents
    #[serde(default = "default_audiobook_payout")]
    pub audiobook_payout_cents: i64,

    /// Author credits consumed by an ebook review
    #[serde(default = "default_ebook_credits")]
    pub ebook_credits: i32,

    /// Author credits consumed by an audiobook review
    #[serde(default = "default_audiobook_credits")]
    pub audiobook_credits: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Guarantee window after validation, in days
    #[serde(default = "default_guarantee_window_days")]
    pub guarantee_window_days: i64,

    /// Interval between existence checks, in hours
    #[serde(default = "default_check_interval_hours")]
    pub check_interval_hours: i64,

    /// How often the worker looks for due records, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum due records processed per sweep
    #[serde(default = "default_monitoring_batch_size")]
    pub batch_size: u64,

    /// Concurrent existence checks per sweep
    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,

    /// Existence checker request timeout in seconds
    #[serde(default = "default_checker_timeout")]
    pub checker_timeout_secs: u64,

    /// Existence checker retries before the result is inconclusive
    #[serde(default = "default_checker_retries")]
    pub checker_max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReviewConfig {
    /// Minimum feedback length at submission
    #[serde(default = "default_min_feedback_chars")]
    pub min_feedback_chars: usize,

    /// Deadline extension granted by a resubmission request, in hours
    #[serde(default = "default_resubmission_hours")]
    pub default_resubmission_hours: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Notification provider: log, sqs, none
    #[serde(default = "default_notification_provider")]
    pub provider: String,

    /// SQS queue URL when the provider is sqs
    pub queue_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_ebook_payout() -> i64 { 100 }
fn default_audiobook_payout() -> i64 { 200 }
fn default_ebook_credits() -> i32 { 1 }
fn default_audiobook_credits() -> i32 { 2 }
fn default_guarantee_window_days() -> i64 { 14 }
fn default_check_interval_hours() -> i64 { 24 }
fn default_poll_interval() -> u64 { 300 }
fn default_monitoring_batch_size() -> u64 { 200 }
fn default_max_concurrent_checks() -> usize { 8 }
fn default_checker_timeout() -> u64 { 15 }
fn default_checker_retries() -> u32 { 3 }
fn default_min_feedback_chars() -> usize { 150 }
fn default_resubmission_hours() -> i64 { 72 }
fn default_notification_provider() -> String { "log".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "readerloop".to_string() }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            ebook_payout_cents: default_ebook_payout(),
            audiobook_payout_cents: default_audiobook_payout(),
            ebook_credits: default_ebook_credits(),
            audiobook_credits: default_audiobook_credits(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            guarantee_window_days: default_guarantee_window_days(),
            check_interval_hours: default_check_interval_hours(),
            poll_interval_secs: default_poll_interval(),
            batch_size: default_monitoring_batch_size(),
            max_concurrent_checks: default_max_concurrent_checks(),
            checker_timeout_secs: default_checker_timeout(),
            checker_max_retries: default_checker_retries(),
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            min_feedback_chars: default_min_feedback_chars(),
            default_resubmission_hours: default_resubmission_hours(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            provider: default_notification_provider(),
            queue_url: None,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // e.g., APP__MONITORING__CHECK_INTERVAL_HOURS=12
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }

    /// Sweep interval for the monitor worker
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.poll_interval_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/readerloop".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
                auto_migrate: false,
            },
            compensation: CompensationConfig::default(),
            monitoring: MonitoringConfig::default(),
            review: ReviewConfig::default(),
            notifications: NotificationConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl CompensationConfig {
    /// Reader payout for one validated review of this format
    pub fn payout_cents(&self, format: BookFormat) -> i64 {
        match format {
            BookFormat::Ebook => self.ebook_payout_cents,
            BookFormat::Audiobook => self.audiobook_payout_cents,
        }
    }

    /// Author credits one validated review of this format consumes
    pub fn credits_for(&self, format: BookFormat) -> i32 {
        match format {
            BookFormat::Ebook => self.ebook_credits,
            BookFormat::Audiobook => self.audiobook_credits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.compensation.ebook_payout_cents, 100);
        assert_eq!(config.compensation.audiobook_payout_cents, 200);
        assert_eq!(config.monitoring.guarantee_window_days, 14);
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/readerloop");
    }

    #[test]
    fn test_credits_track_payout_units() {
        let comp = CompensationConfig::default();
        assert_eq!(comp.ebook_payout_cents / 100, comp.ebook_credits as i64);
        assert_eq!(comp.audiobook_payout_cents / 100, comp.audiobook_credits as i64);
        assert_eq!(comp.payout_cents(BookFormat::Audiobook), 200);
        assert_eq!(comp.credits_for(BookFormat::Ebook), 1);
    }
}
