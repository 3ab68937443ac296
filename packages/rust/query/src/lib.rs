//! Predicate model, query builders, and identifier normalization.
//!
//! This crate provides:
//! - [`Predicate`] / [`Value`]: the store-agnostic filter tree handed to a store
//! - [`builder`]: turns subscription criteria into predicates
//!   ([`jobs_query`], [`pages_query`])
//! - [`normalize`]: rewrites `ObjectId(..)` literals into native
//!   [`DocId`](crawltail_shared::DocId)s

pub mod builder;
pub mod normalize;
pub mod predicate;

pub use builder::{
    DEFAULT_PAGE_URL_FIELD, IdRef, JOB_URL_FIELD, SourceCursor, jobs_query, pages_query,
    parse_source_criteria,
};
pub use normalize::{normalize_predicate, normalize_value};
pub use predicate::{ID_FIELD, Predicate, Value};
