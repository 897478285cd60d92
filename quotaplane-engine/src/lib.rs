//! Quotaplane Engine Library
//!
//! Cluster-wide quota tracking and enforcement: stores quota specifications,
//! aggregates resource consumption of concurrently scheduled workloads
//! against them, and answers point-in-time usage queries while admission
//! decisions are being made elsewhere.
//!
//! Write path: schedulers call [`QuotaEngine::reserve`], the
//! [`coordinator::ReservationCoordinator`] checks the proposal against the
//! [`store::SpecStore`] and the [`ledger::UsageLedger`] inside a per
//! (quota, scope) critical section, and commits or rejects it.
//! Read path: [`query::UsageQueryService`] snapshots the ledger without
//! taking admission locks.

// Core modules
pub mod config;
pub mod validation;

// Logging
pub mod logging;

// Storage
pub mod ledger;
pub mod store;

// Admission
pub mod coordinator;
mod locks;

// Reporting
pub mod query;

// Facade
pub mod engine;

pub use config::EngineConfig;
pub use engine::QuotaEngine;
pub use ledger::{ScopeKey, ShardedLedger, UsageLedger};
pub use quotaplane_common::{Error, Result};
pub use store::{MemorySpecStore, SpecStore, SqliteSpecStore};
