//! # emissor-core
//!
//! Core library for emissor - replicates posts from one site to many
//! receiver sites.
//!
//! This library provides:
//! - A receiver registry with tokens sealed at rest
//! - A durable SQLite job queue fed by post lifecycle events
//! - A queue processor that delivers jobs over HTTP with retry and backoff
//! - Delivery reports, one-shot notifications and a persisted activity log
//! - Configuration and logging infrastructure
//!
//! ## Architecture
//!
//! Work flows in two halves that only meet in the database:
//! - **Producer:** [`EventTrigger`] turns post events into queued jobs and
//!   returns as soon as the row is written
//! - **Consumer:** [`QueueProcessor`] claims batches on a fixed cadence,
//!   calls every receiver and records a [`Report`] per job
//!
//! ## Example
//!
//! ```rust,no_run
//! use emissor_core::{Config, Emissor};
//!
//! let app = Emissor::open(Config::load().expect("failed to load config"))
//!     .expect("failed to open emissor");
//! let stats = app.queue().stats().expect("failed to read queue");
//! println!("{} pending", stats.pending);
//! ```

// Re-export commonly used items at the crate root
pub use activity::ActivityLog;
pub use config::Config;
pub use context::Emissor;
pub use db::Database;
pub use delivery::DeliveryClient;
pub use error::{Error, Result};
pub use processor::{CycleOutcome, QueueProcessor};
pub use queue::DurableQueue;
pub use registry::ReceiverRegistry;
pub use reports::ReportStore;
pub use trigger::EventTrigger;
pub use types::*;
pub use vault::Vault;

// Public modules
pub mod activity;
pub mod config;
pub mod context;
pub mod db;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod reports;
pub mod translation;
pub mod trigger;
pub mod types;
pub mod validation;
pub mod vault;
