//! Shared types, error model, and configuration for crawltail.
//!
//! This crate is the foundation depended on by all other crawltail crates.
//! It provides:
//! - [`CrawlTailError`]: the unified error type
//! - Domain types ([`DocId`], [`Document`], [`JobId`], [`EventKind`], [`Collection`])
//! - Configuration ([`AppConfig`], [`TailConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, StorageConfig, TailConfig, TailSettings, config_dir, config_file_path, init_config,
    load_config, load_config_from,
};
pub use error::{CrawlTailError, Result};
pub use types::{Collection, DocId, Document, EventKind, ID_LITERAL_PREFIX, JobId};
