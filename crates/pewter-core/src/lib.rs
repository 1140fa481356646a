//! Multi-store transactional cache and coordination engine for pewter.
//!
//! This crate ties the schema and durable stores together into the
//! provisioning engine: per-prefix indexed caches over a pluggable
//! backing store, a canonical-order lock manager, a transaction-like
//! [`RequestTracker`] with post-commit side effects, the per-object
//! validation lifecycle with its cross-object cascade, boot-environment
//! materialization (arch bookkeeping, ISO explosion, install-repo
//! lookaside), template rendering into a virtual filesystem, event
//! fan-out, and per-object key pairs for secure parameters.

pub mod cache;
pub mod data_tracker;
pub mod events;
pub mod fs;
pub mod index;
pub mod iso;
pub mod models;
pub mod render;
pub mod request_tracker;

pub use cache::{CacheStore, WriteOp};
pub use data_tracker::{DataTracker, DtConfig, Stores};
pub use events::{Event, Publisher, Publishers};
pub use fs::{FileStream, FileSystem, Lookaside};
pub use index::{Index, Maker};
pub use iso::IsoTask;
pub use models::Model;
pub use render::Renderer;
pub use request_tracker::{RequestTracker, Tx};

use pewter_store::StoreError;
use thiserror::Error;

/// Every object prefix the engine registers, in canonical (sorted)
/// order. Prefix names double as lock names.
pub const PREFIXES: &[&str] = &[
    "bootenvs",
    "jobs",
    "machines",
    "params",
    "preferences",
    "profiles",
    "stages",
    "tasks",
    "templates",
];

/// The profile consulted last during parameter aggregation.
pub const GLOBAL_PROFILE: &str = "global";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("secure data error: {0}")]
    Secure(#[from] pewter_schema::SecureError),
    #[error("upstream fetch failed: {0}")]
    Upstream(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error(transparent)]
    Api(#[from] pewter_schema::ApiError),
}
