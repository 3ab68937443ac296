//! Document stores that crawl jobs and pages are written to and tailed from.
//!
//! The [`DocumentStore`] trait is the only surface the tailing engine uses:
//! `find` documents matching a [`Predicate`] in identifier order, and `insert`
//! new ones. Two implementations ship here:
//! - [`MemoryStore`]: in-process, for embedding and tests
//! - [`SqlStore`]: Turso Embedded / libSQL file database
//!
//! Predicates are evaluated store-side by [`Evaluator`].

mod eval;
mod memory;
mod migrations;
mod sql;

use std::future::Future;

use crawltail_query::Predicate;
use crawltail_shared::{Collection, DocId, Document, Result};
use serde_json::{Map, Value};

pub use eval::Evaluator;
pub use memory::MemoryStore;
pub use sql::SqlStore;

/// A `find` request: filter, optional projection, and a page size.
///
/// Results are always ordered by identifier ascending.
#[derive(Debug, Clone)]
pub struct FindQuery {
    /// Documents must satisfy this predicate.
    pub filter: Predicate,
    /// Fields to keep in each returned body (`None` keeps everything).
    pub projection: Option<Vec<String>>,
    /// Maximum number of documents returned.
    pub limit: usize,
}

impl FindQuery {
    pub fn new(filter: Predicate) -> Self {
        Self {
            filter,
            projection: None,
            limit: usize::MAX,
        }
    }

    pub fn with_projection(mut self, fields: Option<Vec<String>>) -> Self {
        self.projection = fields;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Apply the projection to a matched document.
    pub(crate) fn shape(&self, doc: Document) -> Document {
        match &self.projection {
            Some(fields) => doc.project(fields),
            None => doc,
        }
    }
}

/// An append-mostly document store with totally ordered identifiers.
pub trait DocumentStore: Send + Sync + 'static {
    /// Documents in `collection` matching `query.filter`, ascending by id.
    fn find(
        &self,
        collection: Collection,
        query: &FindQuery,
    ) -> impl Future<Output = Result<Vec<Document>>> + Send;

    /// Insert a document, returning its newly assigned identifier.
    ///
    /// Identifiers are strictly increasing per store.
    fn insert(
        &self,
        collection: Collection,
        body: Map<String, Value>,
    ) -> impl Future<Output = Result<DocId>> + Send;
}
