//! # Reducer
//!
//! Merges N partial responses of the same request into one.
//!
//! The first response is the base. Documents of every other response are
//! merged into it by id: unknown ids are appended, known ids have their fields
//! merged according to the field kind:
//!
//! | Kind | Merge |
//! |---|---|
//! | scalar | left value wins unless it is absent or null |
//! | list | concatenation |
//! | set | union, left order first |
//! | map | update with left precedence |
//! | nested document | recursive merge |
//! | nested document list | recursive merge by id |
//!
//! The header of the base, status included, is left untouched. The `id` of
//! a document is never overwritten. Field kinds come from the
//! endpoint's [`DocSchema`] when discovery provided one and are inferred from
//! the JSON values otherwise.

use crate::message::{DataRequest, DocBatch, DocSchema, Document, FieldKind, Route};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Reduces `requests` into the first one.
///
/// # Returns
///
/// `None` when `requests` is empty.
pub fn reduce_requests(requests: Vec<DataRequest>, schema: Option<&DocSchema>) -> Option<DataRequest> {
  let mut iter = requests.into_iter();
  let mut base = iter.next()?;
  for other in iter {
    merge_request_into(&mut base, other, schema);
  }
  Some(base)
}

/// Merges `other` into `base`.
pub fn merge_request_into(base: &mut DataRequest, other: DataRequest, schema: Option<&DocSchema>) {
  let DataRequest {
    routes,
    data,
    results,
    ..
  } = other;

  reduce_docs(base.docs_mut(), data.docs, schema);

  for (key, value) in results {
    base.results.insert(key, value);
  }

  base.routes = dedup_routes(std::mem::take(&mut base.routes), routes);
}

/// Concatenates `left` and `right`, keeping the first route of every
/// `(executor, pod_id)` pair.
pub fn dedup_routes(left: Vec<Route>, right: Vec<Route>) -> Vec<Route> {
  let mut seen = HashSet::new();
  let mut out = Vec::with_capacity(left.len() + right.len());
  for route in left.into_iter().chain(right) {
    if seen.insert((route.executor.clone(), route.pod_id.clone())) {
      out.push(route);
    }
  }
  out
}

/// Merges `right` into `left` by document id.
pub fn reduce_docs(left: &mut DocBatch, right: DocBatch, schema: Option<&DocSchema>) {
  let mut positions: HashMap<String, usize> =
    left.iter().enumerate().map(|(i, d)| (d.id.clone(), i)).collect();
  let mut merged: Vec<Document> = std::mem::take(left).into_inner();
  for doc in right {
    match positions.get(&doc.id) {
      Some(&idx) => merge_document(&mut merged[idx], doc, schema),
      None => {
        positions.insert(doc.id.clone(), merged.len());
        merged.push(doc);
      }
    }
  }
  *left = DocBatch::from(merged);
}

/// Merges the fields of `right` into `left`.
pub fn merge_document(left: &mut Document, right: Document, schema: Option<&DocSchema>) {
  merge_fields(&mut left.fields, right.fields, schema);
}

fn merge_fields(left: &mut Map<String, Value>, right: Map<String, Value>, schema: Option<&DocSchema>) {
  for (key, right_value) in right {
    if key == "id" {
      continue;
    }
    if left.get(&key).is_none_or(Value::is_null) {
      left.insert(key, right_value);
      continue;
    }
    if right_value.is_null() {
      continue;
    }
    let Some(left_value) = left.get_mut(&key) else {
      continue;
    };
    let declared = schema.and_then(|s| s.kind(&key)).cloned();
    let kind = declared.unwrap_or_else(|| infer_kind(left_value, &right_value));
    merge_value(left_value, right_value, &kind);
  }
}

fn merge_value(left: &mut Value, right: Value, kind: &FieldKind) {
  match (kind, left, right) {
    (FieldKind::List, Value::Array(l), Value::Array(r)) => l.extend(r),
    (FieldKind::Set, Value::Array(l), Value::Array(r)) => {
      for item in r {
        if !l.contains(&item) {
          l.push(item);
        }
      }
    }
    (FieldKind::Map, Value::Object(l), Value::Object(r)) => {
      for (k, v) in r {
        l.entry(k).or_insert(v);
      }
    }
    (FieldKind::Doc(nested), Value::Object(l), Value::Object(r)) => {
      merge_fields(l, r, Some(nested));
    }
    (FieldKind::DocList(nested), Value::Array(l), Value::Array(r)) => {
      merge_doc_list(l, r, nested);
    }
    _ => {}
  }
}

fn merge_doc_list(left: &mut Vec<Value>, right: Vec<Value>, schema: &DocSchema) {
  let mut positions: HashMap<String, usize> = HashMap::new();
  for (i, item) in left.iter().enumerate() {
    if let Some(id) = item.get("id").and_then(Value::as_str) {
      positions.insert(id.to_string(), i);
    }
  }
  for item in right {
    let id = item.get("id").and_then(Value::as_str).map(str::to_string);
    match id.as_ref().and_then(|id| positions.get(id)) {
      Some(&idx) => {
        if let (Value::Object(l), Value::Object(r)) = (&mut left[idx], item) {
          merge_fields(l, r, Some(schema));
        }
      }
      None => {
        if let Some(id) = id {
          positions.insert(id, left.len());
        }
        left.push(item);
      }
    }
  }
}

fn infer_kind(left: &Value, right: &Value) -> FieldKind {
  match (left, right) {
    (Value::Array(l), Value::Array(r)) => {
      if l.iter().chain(r.iter()).all(is_nested_doc) && !(l.is_empty() && r.is_empty()) {
        FieldKind::DocList(DocSchema::default())
      } else {
        FieldKind::List
      }
    }
    (Value::Object(l), Value::Object(_)) if l.contains_key("id") => FieldKind::Doc(DocSchema::default()),
    (Value::Object(_), Value::Object(_)) => FieldKind::Map,
    _ => FieldKind::Scalar,
  }
}

fn is_nested_doc(value: &Value) -> bool {
  value.as_object().is_some_and(|o| o.contains_key("id"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::DataRequest;
  use serde_json::json;

  fn doc(id: &str, fields: Value) -> Document {
    let mut d = Document::with_id(id);
    d.fields = fields.as_object().cloned().unwrap();
    d
  }

  #[test]
  fn test_new_ids_are_appended_in_order() {
    let left = DataRequest::new().with_docs(vec![doc("a", json!({})), doc("b", json!({}))]);
    let right = DataRequest::new().with_docs(vec![doc("c", json!({})), doc("a", json!({}))]);
    let out = reduce_requests(vec![left, right], None).unwrap();
    assert_eq!(out.docs().ids(), vec!["a", "b", "c"]);
  }

  #[test]
  fn test_inferred_field_merge() {
    let mut left = doc(
      "a",
      json!({"text": "left", "scores": [1], "tags": {"x": 1}, "empty": null}),
    );
    let right = doc(
      "a",
      json!({"text": "right", "scores": [2], "tags": {"x": 2, "y": 3}, "empty": "filled", "extra": true}),
    );
    merge_document(&mut left, right, None);

    assert_eq!(left.fields["text"], json!("left"));
    assert_eq!(left.fields["scores"], json!([1, 2]));
    assert_eq!(left.fields["tags"], json!({"x": 1, "y": 3}));
    assert_eq!(left.fields["empty"], json!("filled"));
    assert_eq!(left.fields["extra"], json!(true));
    assert_eq!(left.id, "a");
  }

  #[test]
  fn test_schema_declared_set_union() {
    let schema = DocSchema::default().with_field("labels", FieldKind::Set);
    let mut left = doc("a", json!({"labels": ["x", "y"]}));
    merge_document(&mut left, doc("a", json!({"labels": ["y", "z"]})), Some(&schema));
    assert_eq!(left.fields["labels"], json!(["x", "y", "z"]));
  }

  #[test]
  fn test_nested_doc_lists_merge_by_id() {
    let mut left = doc("a", json!({"matches": [{"id": "m1", "score": 1}]}));
    let right = doc(
      "a",
      json!({"matches": [{"id": "m1", "score": 9, "label": "l"}, {"id": "m2", "score": 2}]}),
    );
    merge_document(&mut left, right, None);
    assert_eq!(
      left.fields["matches"],
      json!([{"id": "m1", "score": 1, "label": "l"}, {"id": "m2", "score": 2}])
    );
  }

  #[test]
  fn test_nested_doc_id_is_not_overwritten() {
    let mut left = doc("a", json!({"image": {"id": "i1", "uri": null}}));
    merge_document(&mut left, doc("a", json!({"image": {"id": "i2", "uri": "u"}})), None);
    assert_eq!(left.fields["image"], json!({"id": "i1", "uri": "u"}));
  }

  #[test]
  fn test_routes_deduplicated_and_results_merged() {
    let mut left = DataRequest::new();
    left.add_route("gateway");
    left.add_route("a");
    left.results.insert("a".into(), json!(1));
    let mut right = DataRequest::new();
    right.routes = left.routes.clone();
    right.add_route("b");
    right.results.insert("b".into(), json!(2));

    let out = reduce_requests(vec![left, right], None).unwrap();
    let executors: Vec<&str> = out.routes.iter().map(|r| r.executor.as_str()).collect();
    assert_eq!(executors, vec!["gateway", "a", "b"]);
    assert_eq!(out.results.len(), 2);
  }

  #[test]
  fn test_status_of_the_base_is_kept() {
    use crate::error::ExecutorError;
    use crate::message::Status;

    let ok = DataRequest::new().with_docs(vec![doc("a", json!({}))]);
    let mut failed = DataRequest::new().with_docs(vec![doc("b", json!({}))]);
    failed.header.status = Status::error(ExecutorError::new("ValueError", "shard down"));

    let out = reduce_requests(vec![ok, failed], None).unwrap();
    assert!(!out.is_error());
    assert_eq!(out.docs().ids(), vec!["a", "b"]);
  }

  #[test]
  fn test_empty_input() {
    assert!(reduce_requests(Vec::new(), None).is_none());
  }
}
