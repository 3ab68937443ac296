//! Store-agnostic boolean predicate tree.
//!
//! A [`Predicate`] is built once per subscription and handed to the document
//! store, which is responsible for evaluating it. The JSON rendering
//! ([`Predicate::to_json`]) follows the familiar `$and` / `$or` / `$regex` /
//! `$gt` operator shape so filters read naturally in logs.

use std::collections::BTreeMap;

use crawltail_shared::DocId;
use serde::{Serialize, Serializer};
use serde_json::json;

/// Field name that resolves to a document's native identifier.
pub const ID_FIELD: &str = "_id";

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A comparison operand, possibly nested.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Native store identifier.
    Id(DocId),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// JSON rendering; identifiers become `ObjectId(..)` literals.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Id(id) => serde_json::Value::String(id.to_literal()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<DocId> for Value {
    fn from(id: DocId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// Boolean filter over document fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// The empty predicate: matches every document.
    All,
    /// `field == value`.
    Equals { field: String, value: Value },
    /// `field` matches the regular expression `pattern` (unanchored search).
    Matches { field: String, pattern: String },
    /// `field` does not contain a match for `pattern`.
    NotMatches { field: String, pattern: String },
    /// `field > value`.
    GreaterThan { field: String, value: Value },
    /// Every child holds.
    And(Vec<Predicate>),
    /// At least one child holds.
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Matches {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    pub fn not_matches(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::NotMatches {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    pub fn greater_than(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::GreaterThan {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `_id > id`.
    pub fn id_after(id: DocId) -> Self {
        Self::greater_than(ID_FIELD, id)
    }

    /// Conjunction that never wraps fewer than two conditions.
    ///
    /// Zero conditions give [`Predicate::All`], one gives the bare condition.
    pub fn all_of(mut conditions: Vec<Predicate>) -> Self {
        match conditions.len() {
            0 => Self::All,
            1 => conditions.remove(0),
            _ => Self::And(conditions),
        }
    }

    /// Disjunction that never wraps fewer than two conditions.
    pub fn any_of(mut conditions: Vec<Predicate>) -> Self {
        match conditions.len() {
            0 => Self::All,
            1 => conditions.remove(0),
            _ => Self::Or(conditions),
        }
    }

    /// Conjoin `other`, dropping empty predicates on either side.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Self::All, p) | (p, Self::All) => p,
            (a, b) => Self::And(vec![a, b]),
        }
    }

    /// Lower identifier bound implied by a top-level `_id > n` conjunct.
    ///
    /// Stores use this to skip rows cheaply before evaluating the rest.
    pub fn id_lower_bound(&self) -> Option<DocId> {
        match self {
            Self::GreaterThan { field, value: Value::Id(id) } if field == ID_FIELD => Some(*id),
            Self::GreaterThan { field, value: Value::Int(n) } if field == ID_FIELD => {
                u64::try_from(*n).ok().map(DocId)
            }
            Self::And(children) => children.iter().filter_map(Self::id_lower_bound).max(),
            _ => None,
        }
    }

    /// JSON rendering in `$and` / `$or` operator form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::All => json!({}),
            Self::Equals { field, value } => json!({ field.as_str(): value.to_json() }),
            Self::Matches { field, pattern } => json!({ field.as_str(): { "$regex": pattern } }),
            Self::NotMatches { field, pattern } => {
                json!({ field.as_str(): { "$not": { "$regex": pattern } } })
            }
            Self::GreaterThan { field, value } => {
                json!({ field.as_str(): { "$gt": value.to_json() } })
            }
            Self::And(children) => {
                json!({ "$and": children.iter().map(Self::to_json).collect::<Vec<_>>() })
            }
            Self::Or(children) => {
                json!({ "$or": children.iter().map(Self::to_json).collect::<Vec<_>>() })
            }
        }
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Self::All
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
