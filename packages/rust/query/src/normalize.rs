//! Identifier literal normalization.
//!
//! Clients refer to documents with textual `ObjectId(<n>)` literals. Before a
//! predicate reaches the store, every such literal is rewritten into a native
//! [`DocId`] so comparisons use identifier ordering rather than string ordering.
//!
//! Traversal uses an explicit stack, so arbitrarily deep structures cannot
//! exhaust the call stack.

use crawltail_shared::{DocId, Result};

use crate::predicate::{Predicate, Value};

enum Node<'a> {
    Pred(&'a mut Predicate),
    Val(&'a mut Value),
}

/// Rewrite identifier literals inside `value` in place.
///
/// Returns the number of literals replaced. Fails with `MalformedCriteria`
/// when a literal's payload is not a valid identifier; in that case `value`
/// may be partially rewritten and should be discarded.
pub fn normalize_value(value: &mut Value) -> Result<usize> {
    walk(vec![Node::Val(value)])
}

/// Rewrite identifier literals in every operand of `predicate` in place.
pub fn normalize_predicate(predicate: &mut Predicate) -> Result<usize> {
    walk(vec![Node::Pred(predicate)])
}

fn walk(mut stack: Vec<Node<'_>>) -> Result<usize> {
    let mut replaced = 0;

    while let Some(node) = stack.pop() {
        match node {
            Node::Pred(pred) => match pred {
                Predicate::And(children) | Predicate::Or(children) => {
                    stack.extend(children.iter_mut().map(Node::Pred));
                }
                Predicate::Equals { value, .. } | Predicate::GreaterThan { value, .. } => {
                    stack.push(Node::Val(value));
                }
                Predicate::All | Predicate::Matches { .. } | Predicate::NotMatches { .. } => {}
            },
            Node::Val(value) => {
                if let Value::Str(text) = &*value {
                    if DocId::is_literal(text) {
                        let id = DocId::parse_literal(text)?;
                        *value = Value::Id(id);
                        replaced += 1;
                    }
                    continue;
                }
                match value {
                    Value::List(items) => stack.extend(items.iter_mut().map(Node::Val)),
                    Value::Map(map) => stack.extend(map.values_mut().map(Node::Val)),
                    _ => {}
                }
            }
        }
    }

    Ok(replaced)
}
