//! # Filter Conditions
//!
//! Document predicates attached to graph nodes, written in the query
//! language accepted by `graph_conditions`:
//!
//! ```json
//! {"$or": [{"tags__key": {"$eq": 5}}, {"text": {"$regex": "^hello"}}]}
//! ```
//!
//! Field paths use `__` or `.` as separator. A bare value is shorthand for
//! `$eq`, and several fields in one object must all match.

use crate::message::document::split_path;
use crate::message::{DocBatch, Document};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

/// A parsed condition.
#[derive(Debug, Clone)]
pub enum Filter {
  /// Every condition matches.
  And(Vec<Filter>),
  /// At least one condition matches.
  Or(Vec<Filter>),
  /// The condition does not match.
  Not(Box<Filter>),
  /// A field satisfies an operator.
  Field {
    /// Path of the field.
    path: Vec<String>,
    /// Operator applied to the field value.
    op: FieldOp,
  },
}

/// Operator applied to one field.
#[derive(Debug, Clone)]
pub enum FieldOp {
  /// Equal.
  Eq(Value),
  /// Not equal.
  Neq(Value),
  /// Greater than.
  Gt(Value),
  /// Greater than or equal.
  Gte(Value),
  /// Less than.
  Lt(Value),
  /// Less than or equal.
  Lte(Value),
  /// Member of the list.
  In(Vec<Value>),
  /// Not a member of the list.
  Nin(Vec<Value>),
  /// String matching a regular expression.
  Regex(Regex),
  /// Field presence.
  Exists(bool),
  /// Length of an array, string or object.
  Size(usize),
}

impl Filter {
  /// Parses a condition.
  ///
  /// # Errors
  ///
  /// Returns a description of the first invalid clause.
  pub fn parse(condition: &Value) -> Result<Self, String> {
    let Value::Object(map) = condition else {
      return Err(format!("condition must be an object, got {condition}"));
    };
    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
      clauses.push(match key.as_str() {
        "$and" => Filter::And(parse_list(key, value)?),
        "$or" => Filter::Or(parse_list(key, value)?),
        "$not" => Filter::Not(Box::new(Filter::parse(value)?)),
        op if op.starts_with('$') => return Err(format!("unknown logical operator `{op}`")),
        field => parse_field(field, value)?,
      });
    }
    Ok(if clauses.len() == 1 {
      clauses.remove(0)
    } else {
      Filter::And(clauses)
    })
  }

  /// Whether `doc` satisfies the condition.
  pub fn matches(&self, doc: &Document) -> bool {
    match self {
      Filter::And(all) => all.iter().all(|f| f.matches(doc)),
      Filter::Or(any) => any.iter().any(|f| f.matches(doc)),
      Filter::Not(inner) => !inner.matches(doc),
      Filter::Field { path, op } => op.matches(doc.get_path(path).as_ref()),
    }
  }

  /// Keeps the matching documents of `docs`, in order.
  pub fn apply(&self, docs: &mut DocBatch) {
    docs.retain(|doc| self.matches(doc));
  }
}

fn parse_list(key: &str, value: &Value) -> Result<Vec<Filter>, String> {
  let Value::Array(items) = value else {
    return Err(format!("`{key}` expects a list of conditions"));
  };
  items.iter().map(Filter::parse).collect()
}

fn parse_field(field: &str, value: &Value) -> Result<Filter, String> {
  let path = split_path(field);
  let ops = match value {
    Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => map,
    other => {
      return Ok(Filter::Field {
        path,
        op: FieldOp::Eq(other.clone()),
      });
    }
  };
  let mut clauses = Vec::with_capacity(ops.len());
  for (op, operand) in ops {
    let op = match op.as_str() {
      "$eq" => FieldOp::Eq(operand.clone()),
      "$neq" | "$ne" => FieldOp::Neq(operand.clone()),
      "$gt" => FieldOp::Gt(operand.clone()),
      "$gte" => FieldOp::Gte(operand.clone()),
      "$lt" => FieldOp::Lt(operand.clone()),
      "$lte" => FieldOp::Lte(operand.clone()),
      "$in" => FieldOp::In(operand_list(op, operand)?),
      "$nin" => FieldOp::Nin(operand_list(op, operand)?),
      "$regex" => {
        let pattern = operand
          .as_str()
          .ok_or_else(|| format!("`$regex` on `{field}` expects a string"))?;
        FieldOp::Regex(Regex::new(pattern).map_err(|e| e.to_string())?)
      }
      "$exists" => FieldOp::Exists(
        operand
          .as_bool()
          .ok_or_else(|| format!("`$exists` on `{field}` expects a boolean"))?,
      ),
      "$size" => FieldOp::Size(
        operand
          .as_u64()
          .ok_or_else(|| format!("`$size` on `{field}` expects a non-negative integer"))?
          as usize,
      ),
      other => return Err(format!("unknown operator `{other}` on `{field}`")),
    };
    clauses.push(Filter::Field {
      path: path.clone(),
      op,
    });
  }
  Ok(if clauses.len() == 1 {
    clauses.remove(0)
  } else {
    Filter::And(clauses)
  })
}

fn operand_list(op: &str, operand: &Value) -> Result<Vec<Value>, String> {
  match operand {
    Value::Array(items) => Ok(items.clone()),
    _ => Err(format!("`{op}` expects a list")),
  }
}

impl FieldOp {
  fn matches(&self, value: Option<&Value>) -> bool {
    match self {
      FieldOp::Exists(expected) => value.is_some_and(|v| !v.is_null()) == *expected,
      FieldOp::Neq(operand) => !value.is_some_and(|v| loose_eq(v, operand)),
      FieldOp::Nin(list) => !value.is_some_and(|v| list.iter().any(|o| loose_eq(v, o))),
      _ => {
        let Some(value) = value else {
          return false;
        };
        match self {
          FieldOp::Eq(operand) => loose_eq(value, operand),
          FieldOp::Gt(operand) => compare(value, operand) == Some(Ordering::Greater),
          FieldOp::Gte(operand) => {
            matches!(compare(value, operand), Some(Ordering::Greater | Ordering::Equal))
          }
          FieldOp::Lt(operand) => compare(value, operand) == Some(Ordering::Less),
          FieldOp::Lte(operand) => {
            matches!(compare(value, operand), Some(Ordering::Less | Ordering::Equal))
          }
          FieldOp::In(list) => list.iter().any(|o| loose_eq(value, o)),
          FieldOp::Regex(re) => value.as_str().is_some_and(|s| re.is_match(s)),
          FieldOp::Size(n) => match value {
            Value::Array(items) => items.len() == *n,
            Value::String(s) => s.chars().count() == *n,
            Value::Object(map) => map.len() == *n,
            _ => false,
          },
          FieldOp::Exists(_) | FieldOp::Neq(_) | FieldOp::Nin(_) => false,
        }
      }
    }
  }
}

/// Equality where `5` and `5.0` are equal.
fn loose_eq(left: &Value, right: &Value) -> bool {
  match (left.as_f64(), right.as_f64()) {
    (Some(l), Some(r)) => l == r,
    _ => left == right,
  }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
  if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
    return l.partial_cmp(&r);
  }
  match (left, right) {
    (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn doc(tags: Value) -> Document {
    Document::with_id("d").with_field("tags", tags)
  }

  #[test]
  fn test_shorthand_and_eq_on_nested_path() {
    let filter = Filter::parse(&json!({"tags__key": 5})).unwrap();
    assert!(filter.matches(&doc(json!({"key": 5.0}))));
    assert!(!filter.matches(&doc(json!({"key": 4}))));

    let dotted = Filter::parse(&json!({"tags.key": {"$eq": 5}})).unwrap();
    assert!(dotted.matches(&doc(json!({"key": 5}))));
  }

  #[test]
  fn test_comparisons_and_membership() {
    let filter = Filter::parse(&json!({"tags__n": {"$gte": 2, "$lt": 5}})).unwrap();
    assert!(filter.matches(&doc(json!({"n": 2}))));
    assert!(!filter.matches(&doc(json!({"n": 5}))));

    let within = Filter::parse(&json!({"tags__c": {"$in": ["red", "blue"]}})).unwrap();
    assert!(within.matches(&doc(json!({"c": "red"}))));
    let outside = Filter::parse(&json!({"tags__c": {"$nin": ["red"]}})).unwrap();
    assert!(outside.matches(&doc(json!({}))));
  }

  #[test]
  fn test_logical_operators() {
    let filter = Filter::parse(&json!({
      "$or": [{"tags__a": 1}, {"$not": {"tags__b": {"$exists": true}}}]
    }))
    .unwrap();
    assert!(filter.matches(&doc(json!({"a": 1, "b": 0}))));
    assert!(filter.matches(&doc(json!({"a": 2}))));
    assert!(!filter.matches(&doc(json!({"a": 2, "b": 0}))));
  }

  #[test]
  fn test_regex_size_and_id() {
    let filter = Filter::parse(&json!({"text": {"$regex": "^hel"}, "tags__l": {"$size": 2}})).unwrap();
    let d = Document::with_id("x")
      .with_field("text", "hello")
      .with_field("tags", json!({"l": [1, 2]}));
    assert!(filter.matches(&d));

    let by_id = Filter::parse(&json!({"id": "x"})).unwrap();
    assert!(by_id.matches(&d));
  }

  #[test]
  fn test_invalid_conditions_are_rejected() {
    assert!(Filter::parse(&json!([1])).is_err());
    assert!(Filter::parse(&json!({"$xor": []})).is_err());
    assert!(Filter::parse(&json!({"a": {"$near": 1}})).is_err());
    assert!(Filter::parse(&json!({"a": {"$regex": "("}})).is_err());
  }

  #[test]
  fn test_apply_keeps_order() {
    let filter = Filter::parse(&json!({"tags__k": {"$lt": 3}})).unwrap();
    let mut docs: DocBatch = (0..5)
      .map(|i| Document::with_id(i.to_string()).with_field("tags", json!({"k": i})))
      .collect();
    filter.apply(&mut docs);
    assert_eq!(docs.ids(), vec!["0", "1", "2"]);
  }
}
