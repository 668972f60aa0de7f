//! ReaderLoop Common Library
//!
//! Shared code for the ReaderLoop services including:
//! - Database models, repository and schema bootstrap
//! - The review lifecycle engine (state machine, ledger, monitoring,
//!   replacement dispatch, issue tracking)
//! - Collaborator capability traits
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod collaborators;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod metrics;
pub mod queue;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{DbPool, Repository};
pub use engine::{EngineSettings, ReviewEngine};
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
