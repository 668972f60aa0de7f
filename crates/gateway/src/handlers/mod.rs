//! API handlers module

pub mod health;
pub mod issues;
pub mod ledger;
pub mod monitoring;
pub mod reviews;
