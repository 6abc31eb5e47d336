//! Ledger Sync Service - aggregator transaction sync, ledger reconciliation
//! and balance history reconstruction.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

pub use startup::AppState;
