//! HTTP handlers for ledger-sync-service.

pub mod accounts;
pub mod balances;
pub mod categories;
pub mod health;
pub mod sync;
pub mod webhooks;
