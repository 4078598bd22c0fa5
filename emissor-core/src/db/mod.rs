//! Database layer for emissor
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository functions for receivers, queue jobs, reports and logs
//! - Atomic claiming of pending jobs

pub mod repo;
pub mod schema;

pub use repo::{encode_ts, Database, JobRecord, StoredReceiver};
