//! Core domain types for tailed crawl documents.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{CrawlTailError, Result};

/// Marker wrapping the textual form of a [`DocId`], e.g. `ObjectId(42)`.
pub const ID_LITERAL_PREFIX: &str = "ObjectId(";

// ---------------------------------------------------------------------------
// DocId
// ---------------------------------------------------------------------------

/// Native, totally ordered document identifier assigned by the store.
///
/// Identifiers grow with insertion order, which is what makes them usable as
/// a tailing watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(pub u64);

impl DocId {
    /// Sentinel meaning "from the beginning of the collection".
    pub const BEGINNING: DocId = DocId(0);

    /// Whether this is the [`DocId::BEGINNING`] sentinel.
    pub fn is_beginning(self) -> bool {
        self == Self::BEGINNING
    }

    /// The identifier immediately before this one (saturating at the sentinel).
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Whether `text` is wrapped in the identifier literal marker.
    pub fn is_literal(text: &str) -> bool {
        text.starts_with(ID_LITERAL_PREFIX) && text.ends_with(')')
    }

    /// Parse an `ObjectId(<n>)` literal.
    pub fn parse_literal(text: &str) -> Result<Self> {
        let payload = text
            .strip_prefix(ID_LITERAL_PREFIX)
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| {
                CrawlTailError::malformed(format!("not an identifier literal: '{text}'"))
            })?;
        payload.trim().parse::<u64>().map(Self).map_err(|e| {
            CrawlTailError::malformed(format!("bad identifier literal '{text}': {e}"))
        })
    }

    /// Render as an `ObjectId(<n>)` literal.
    pub fn to_literal(self) -> String {
        format!("{ID_LITERAL_PREFIX}{})", self.0)
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DocId {
    type Err = CrawlTailError;

    /// Accepts both the literal form and a bare decimal identifier.
    fn from_str(s: &str) -> Result<Self> {
        if Self::is_literal(s) {
            return Self::parse_literal(s);
        }
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|e| CrawlTailError::malformed(format!("bad identifier '{s}': {e}")))
    }
}

impl From<u64> for DocId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// Identifier of an upstream crawl job, as carried in job documents and stats signals.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl JobId {
    /// Extract a job identifier from a JSON scalar (string or number).
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// The job a tailed job document identifies: its `id` field, falling
    /// back to the store identifier `_id`.
    pub fn of_tailed(doc: &Value) -> Option<Self> {
        doc.get("id")
            .and_then(Self::from_json)
            .or_else(|| doc.get("_id").and_then(Self::from_json))
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// The document collections the crawler writes and sessions tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Crawl job documents.
    Jobs,
    /// Scraped page/item documents.
    Pages,
}

impl Collection {
    /// Name of the collection in the store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Pages => "items",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Collection {
    type Err = CrawlTailError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "jobs" => Ok(Self::Jobs),
            "pages" | "items" => Ok(Self::Pages),
            other => Err(CrawlTailError::validation(format!(
                "unknown collection '{other}' (expected jobs or pages)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Kinds of events written to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Aggregate crawl stats changed; payload is `[job_id, changes]`.
    #[serde(rename = "stats:changed")]
    StatsChanged,
    /// Current state of a job; payload is the job document.
    #[serde(rename = "jobs:state")]
    JobState,
    /// A job document was tailed from the store.
    #[serde(rename = "jobs.tailed")]
    JobsTailed,
    /// A page document was tailed from the store.
    #[serde(rename = "pages.tailed")]
    PagesTailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StatsChanged => "stats:changed",
            Self::JobState => "jobs:state",
            Self::JobsTailed => "jobs.tailed",
            Self::PagesTailed => "pages.tailed",
        }
    }

    /// Events scoped to a single job, gated by subscription interest sets.
    pub fn is_job_scoped(self) -> bool {
        matches!(self, Self::StatsChanged | Self::JobState)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A stored document: its native identifier plus the JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Store-assigned identifier (`_id`).
    pub id: DocId,
    /// All other fields.
    pub body: Map<String, Value>,
}

impl Document {
    pub fn new(id: DocId, body: Map<String, Value>) -> Self {
        Self { id, body }
    }

    /// Look up a field by dotted path (`stats.pages`); `_id` resolves to the identifier.
    pub fn field(&self, path: &str) -> Option<Value> {
        if path == "_id" {
            return Some(Value::from(self.id.0));
        }
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.body.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current.clone())
    }

    /// Keep only `fields` in the body. `_id` is always retained.
    pub fn project(mut self, fields: &[String]) -> Self {
        self.body.retain(|key, _| fields.iter().any(|f| f == key));
        self
    }

    /// JSON representation with `_id` merged into the body.
    pub fn to_json(&self) -> Value {
        let mut body = self.body.clone();
        body.insert("_id".into(), Value::from(self.id.0));
        Value::Object(body)
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.body.len() + 1))?;
        map.serialize_entry("_id", &self.id)?;
        for (key, value) in &self.body {
            if key != "_id" {
                map.serialize_entry(key, value)?;
            }
        }
        map.end()
    }
}

impl TryFrom<Value> for Document {
    type Error = CrawlTailError;

    fn try_from(value: Value) -> Result<Self> {
        let Value::Object(mut body) = value else {
            return Err(CrawlTailError::validation("document must be a JSON object"));
        };
        let id = match body.remove("_id") {
            Some(Value::Number(n)) => n
                .as_u64()
                .map(DocId)
                .ok_or_else(|| CrawlTailError::validation(format!("bad _id: {n}")))?,
            Some(Value::String(s)) => s.parse()?,
            Some(other) => {
                return Err(CrawlTailError::validation(format!("bad _id: {other}")));
            }
            None => return Err(CrawlTailError::validation("document has no _id")),
        };
        Ok(Self { id, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn doc_id_literal_roundtrip() {
        let id = DocId(42);
        assert_eq!(id.to_literal(), "ObjectId(42)");
        assert!(DocId::is_literal(&id.to_literal()));
        assert_eq!(DocId::parse_literal("ObjectId(42)").unwrap(), id);
        assert_eq!("ObjectId(42)".parse::<DocId>().unwrap(), id);
        assert_eq!("42".parse::<DocId>().unwrap(), id);
    }

    #[test]
    fn doc_id_rejects_garbage() {
        let err = DocId::parse_literal("ObjectId(zz)").unwrap_err();
        assert!(matches!(err, CrawlTailError::MalformedCriteria { .. }));
        assert!("not-an-id".parse::<DocId>().is_err());
    }

    #[test]
    fn doc_id_ordering_and_sentinel() {
        assert!(DocId(1) < DocId(2));
        assert!(DocId::BEGINNING.is_beginning());
        assert_eq!(DocId(5).prev(), DocId(4));
        assert_eq!(DocId(0).prev(), DocId(0));
    }

    #[test]
    fn event_kind_wire_names() {
        assert_eq!(EventKind::StatsChanged.as_str(), "stats:changed");
        assert_eq!(
            serde_json::to_string(&EventKind::PagesTailed).unwrap(),
            "\"pages.tailed\""
        );
        assert!(EventKind::JobState.is_job_scoped());
        assert!(!EventKind::JobsTailed.is_job_scoped());
    }

    #[test]
    fn document_serializes_with_id() {
        let doc = Document::try_from(json!({"_id": 7, "id": "job-1", "urls": ["a.com"]}))
            .expect("document");
        assert_eq!(doc.id, DocId(7));
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["_id"], 7);
        assert_eq!(value["id"], "job-1");
        assert_eq!(doc.to_json(), value);
    }

    #[test]
    fn tailed_job_id_falls_back_to_store_id() {
        let with_id = Document::try_from(json!({"_id": 3, "id": 99})).unwrap();
        assert_eq!(JobId::of_tailed(&with_id.to_json()), Some(JobId::from("99")));

        let without = Document::try_from(json!({"_id": 3, "url": "x"})).unwrap();
        assert_eq!(JobId::of_tailed(&without.to_json()), Some(JobId::from("3")));

        assert_eq!(JobId::of_tailed(&json!({"url": "x"})), None);
    }

    #[test]
    fn document_field_paths_and_projection() {
        let doc = Document::try_from(json!({
            "_id": 1,
            "url": "http://a.com/x",
            "stats": {"pages": 4},
            "body": "<html>"
        }))
        .unwrap();
        assert_eq!(doc.field("stats.pages"), Some(json!(4)));
        assert_eq!(doc.field("_id"), Some(json!(1)));
        assert_eq!(doc.field("missing.path"), None);

        let projected = doc.project(&["url".to_string()]);
        assert_eq!(projected.body.len(), 1);
        assert_eq!(projected.id, DocId(1));
    }

    #[test]
    fn document_requires_object_with_id() {
        assert!(Document::try_from(json!([1, 2])).is_err());
        assert!(Document::try_from(json!({"url": "x"})).is_err());
        let doc = Document::try_from(json!({"_id": "ObjectId(12)"})).unwrap();
        assert_eq!(doc.id, DocId(12));
    }

    #[test]
    fn collection_names() {
        assert_eq!(Collection::Pages.as_str(), "items");
        assert_eq!("pages".parse::<Collection>().unwrap(), Collection::Pages);
        assert!("sites".parse::<Collection>().is_err());
    }
}
