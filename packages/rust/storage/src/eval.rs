//! Store-side predicate evaluation.
//!
//! Semantics follow the usual document-store conventions:
//! - `_id` resolves to the document identifier, dotted paths descend objects
//! - a condition on an array field holds if it holds for any element
//! - a missing field satisfies `NotMatches` and nothing else
//! - comparisons between incompatible types are false

use std::cmp::Ordering;
use std::collections::HashMap;

use crawltail_query::{Predicate, Value};
use crawltail_shared::{CrawlTailError, DocId, Document, Result};
use regex::Regex;
use serde_json::Value as Json;

/// Evaluates predicates against documents, caching compiled patterns.
#[derive(Debug, Default)]
pub struct Evaluator {
    patterns: HashMap<String, Regex>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `doc` satisfies `predicate`.
    pub fn matches(&mut self, predicate: &Predicate, doc: &Document) -> Result<bool> {
        match predicate {
            Predicate::All => Ok(true),
            Predicate::Equals { field, value } => Ok(doc
                .field(field)
                .is_some_and(|json| any_element(&json, value, |o| o == Ordering::Equal))),
            Predicate::GreaterThan { field, value } => Ok(doc
                .field(field)
                .is_some_and(|json| any_element(&json, value, |o| o == Ordering::Greater))),
            Predicate::Matches { field, pattern } => {
                let Some(json) = doc.field(field) else {
                    return Ok(false);
                };
                let regex = self.compile(pattern)?;
                Ok(text_matches(regex, &json))
            }
            Predicate::NotMatches { field, pattern } => {
                let Some(json) = doc.field(field) else {
                    return Ok(true);
                };
                let regex = self.compile(pattern)?;
                Ok(!text_matches(regex, &json))
            }
            Predicate::And(children) => {
                for child in children {
                    if !self.matches(child, doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(children) => {
                for child in children {
                    if self.matches(child, doc)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn compile(&mut self, pattern: &str) -> Result<&Regex> {
        if !self.patterns.contains_key(pattern) {
            let regex = Regex::new(pattern).map_err(|e| {
                CrawlTailError::malformed(format!("invalid pattern '{pattern}': {e}"))
            })?;
            self.patterns.insert(pattern.to_string(), regex);
        }
        self.patterns
            .get(pattern)
            .ok_or_else(|| CrawlTailError::Storage(format!("pattern cache miss for '{pattern}'")))
    }
}

fn text_matches(regex: &Regex, json: &Json) -> bool {
    match json {
        Json::String(s) => regex.is_match(s),
        Json::Array(items) => items
            .iter()
            .any(|item| item.as_str().is_some_and(|s| regex.is_match(s))),
        _ => false,
    }
}

/// Apply `accept` to the comparison of `json` with `value`, fanning out over arrays.
fn any_element(json: &Json, value: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    if compare(json, value).is_some_and(&accept) {
        return true;
    }
    match (json, value) {
        (Json::Array(items), v) if !matches!(v, Value::List(_)) => items
            .iter()
            .any(|item| compare(item, value).is_some_and(&accept)),
        _ => false,
    }
}

fn compare(json: &Json, value: &Value) -> Option<Ordering> {
    match (json, value) {
        (Json::Null, Value::Null) => Some(Ordering::Equal),
        (Json::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Json::Number(n), Value::Int(i)) => match n.as_i64() {
            Some(a) => Some(a.cmp(i)),
            None => n.as_f64()?.partial_cmp(&(*i as f64)),
        },
        (Json::Number(n), Value::Float(f)) => n.as_f64()?.partial_cmp(f),
        (Json::Number(n), Value::Id(id)) => n.as_u64().map(|a| a.cmp(&id.0)),
        (Json::String(s), Value::Id(id)) => s.parse::<DocId>().ok().map(|a| a.cmp(id)),
        (Json::String(a), Value::Str(b)) => Some(a.as_str().cmp(b.as_str())),
        (Json::Array(items), Value::List(values)) => {
            let equal = items.len() == values.len()
                && items
                    .iter()
                    .zip(values)
                    .all(|(a, b)| compare(a, b) == Some(Ordering::Equal));
            equal.then_some(Ordering::Equal)
        }
        (Json::Object(map), Value::Map(values)) => {
            let equal = map.len() == values.len()
                && values.iter().all(|(k, v)| {
                    map.get(k)
                        .is_some_and(|a| compare(a, v) == Some(Ordering::Equal))
                });
            equal.then_some(Ordering::Equal)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Json) -> Document {
        Document::try_from(value).expect("document")
    }

    #[test]
    fn regex_on_string_and_array_fields() {
        let mut eval = Evaluator::new();
        let job = doc(json!({"_id": 1, "urls": ["http://foo.com", "http://bar.com"]}));
        assert!(eval.matches(&Predicate::matches("urls", "foo"), &job).unwrap());
        assert!(!eval.matches(&Predicate::matches("urls", "baz"), &job).unwrap());
        assert!(!eval.matches(&Predicate::not_matches("urls", "bar"), &job).unwrap());
        assert!(eval.matches(&Predicate::not_matches("urls", "baz"), &job).unwrap());

        let page = doc(json!({"_id": 2, "url": "http://foo.com/a"}));
        assert!(eval.matches(&Predicate::matches("url", r"^http://foo\.com"), &page).unwrap());
    }

    #[test]
    fn missing_fields() {
        let mut eval = Evaluator::new();
        let d = doc(json!({"_id": 1}));
        assert!(!eval.matches(&Predicate::matches("url", "x"), &d).unwrap());
        assert!(eval.matches(&Predicate::not_matches("url", "x"), &d).unwrap());
        assert!(!eval.matches(&Predicate::equals("url", "x"), &d).unwrap());
    }

    #[test]
    fn id_comparisons() {
        let mut eval = Evaluator::new();
        let d = doc(json!({"_id": 10, "parent": "ObjectId(4)"}));
        assert!(eval.matches(&Predicate::id_after(DocId(9)), &d).unwrap());
        assert!(!eval.matches(&Predicate::id_after(DocId(10)), &d).unwrap());
        assert!(eval.matches(&Predicate::equals("parent", DocId(4)), &d).unwrap());
    }

    #[test]
    fn scalar_comparisons() {
        let mut eval = Evaluator::new();
        let d = doc(json!({"_id": 1, "n": 5, "ratio": 0.5, "name": "b", "tags": ["x", "y"]}));
        assert!(eval.matches(&Predicate::greater_than("n", 4i64), &d).unwrap());
        assert!(!eval.matches(&Predicate::greater_than("n", 5i64), &d).unwrap());
        assert!(eval.matches(&Predicate::greater_than("ratio", Value::Float(0.25)), &d).unwrap());
        assert!(eval.matches(&Predicate::greater_than("name", "a"), &d).unwrap());
        assert!(eval.matches(&Predicate::equals("tags", "y"), &d).unwrap());
        assert!(!eval.matches(&Predicate::greater_than("name", 1i64), &d).unwrap());
    }

    #[test]
    fn boolean_combinators() {
        let mut eval = Evaluator::new();
        let d = doc(json!({"_id": 3, "url": "http://a.com"}));
        let both = Predicate::And(vec![
            Predicate::matches("url", "a"),
            Predicate::id_after(DocId(2)),
        ]);
        let neither = Predicate::Or(vec![
            Predicate::matches("url", "zzz"),
            Predicate::id_after(DocId(3)),
        ]);
        assert!(eval.matches(&both, &d).unwrap());
        assert!(!eval.matches(&neither, &d).unwrap());
        assert!(eval.matches(&Predicate::All, &d).unwrap());
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let mut eval = Evaluator::new();
        let d = doc(json!({"_id": 1, "url": "x"}));
        assert!(eval.matches(&Predicate::matches("url", "("), &d).is_err());
    }
}
