//! In-process document store.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use crawltail_shared::{Collection, DocId, Document, Result};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{DocumentStore, Evaluator, FindQuery};

/// A [`DocumentStore`] kept entirely in memory.
///
/// Identifiers are shared across collections and start at 1, so
/// [`DocId::BEGINNING`] never names a real document.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    last_id: u64,
    collections: HashMap<Collection, BTreeMap<DocId, Map<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in `collection`.
    pub async fn len(&self, collection: Collection) -> usize {
        self.inner
            .read()
            .await
            .collections
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }
}

impl DocumentStore for MemoryStore {
    async fn find(&self, collection: Collection, query: &FindQuery) -> Result<Vec<Document>> {
        let inner = self.inner.read().await;
        let Some(docs) = inner.collections.get(&collection) else {
            return Ok(Vec::new());
        };

        let lower = match query.filter.id_lower_bound() {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };

        let mut eval = Evaluator::new();
        let mut found = Vec::new();
        for (id, body) in docs.range((lower, Bound::Unbounded)) {
            if found.len() >= query.limit {
                break;
            }
            let doc = Document::new(*id, body.clone());
            if eval.matches(&query.filter, &doc)? {
                found.push(query.shape(doc));
            }
        }

        debug!(%collection, found = found.len(), "memory store find");
        Ok(found)
    }

    async fn insert(&self, collection: Collection, mut body: Map<String, Value>) -> Result<DocId> {
        body.remove("_id");
        let mut inner = self.inner.write().await;
        inner.last_id += 1;
        let id = DocId(inner.last_id);
        inner.collections.entry(collection).or_default().insert(id, body);
        debug!(%collection, %id, "memory store insert");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawltail_query::Predicate;
    use serde_json::json;

    fn body(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let a = store.insert(Collection::Jobs, body(json!({"id": "a"}))).await.unwrap();
        let b = store.insert(Collection::Pages, body(json!({"url": "x"}))).await.unwrap();
        assert!(a < b);
        assert!(!a.is_beginning());
        assert_eq!(store.len(Collection::Jobs).await, 1);
        assert_eq!(store.len(Collection::Pages).await, 1);
    }

    #[tokio::test]
    async fn find_filters_orders_and_limits() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for url in ["http://a.com/1", "http://b.com/1", "http://a.com/2", "http://a.com/3"] {
            let page = body(json!({"url": url, "size": 1}));
            ids.push(store.insert(Collection::Pages, page).await.unwrap());
        }

        let query = FindQuery::new(Predicate::matches("url", "a.com"));
        let found = store.find(Collection::Pages, &query).await.unwrap();
        let found_ids: Vec<DocId> = found.iter().map(|d| d.id).collect();
        assert_eq!(found_ids, vec![ids[0], ids[2], ids[3]]);

        let filter = Predicate::id_after(ids[0]).and(Predicate::matches("url", "a.com"));
        let query = FindQuery::new(filter)
            .with_limit(1)
            .with_projection(Some(vec!["url".into()]));
        let found = store.find(Collection::Pages, &query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ids[2]);
        assert!(!found[0].body.contains_key("size"));
    }

    #[tokio::test]
    async fn find_on_empty_collection() {
        let store = MemoryStore::new();
        let found = store
            .find(Collection::Jobs, &FindQuery::new(Predicate::All))
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
