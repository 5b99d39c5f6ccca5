//! # Documents
//!
//! [`Document`] is the unit of data flowing through the graph. Apart from its
//! `id` it is an open bag of JSON fields: the gateway never interprets the
//! payload except for filtering, reduction and schema validation, so unknown
//! fields are carried through untouched.
//!
//! [`DocBatch`] is the ordered sequence carried by a request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::{Index, Range};

/// Separator for nested field paths, e.g. `tags__color`.
pub const PATH_SEPARATOR: &str = "__";

/// Generates a fresh 32 character lowercase hex identifier.
pub fn new_id() -> String {
  format!("{:032x}", rand::random::<u128>())
}

/// A single document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  /// Stable identifier, generated when absent on the wire.
  #[serde(default = "new_id")]
  pub id: String,
  /// Every other field.
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Default for Document {
  fn default() -> Self {
    Self::new()
  }
}

impl Document {
  /// Creates an empty document with a generated id.
  pub fn new() -> Self {
    Self::with_id(new_id())
  }

  /// Creates an empty document with the given id.
  pub fn with_id(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      fields: Map::new(),
    }
  }

  /// Sets a top-level field, builder style.
  #[must_use]
  pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.fields.insert(key.into(), value.into());
    self
  }

  /// Returns a top-level field.
  pub fn get(&self, key: &str) -> Option<&Value> {
    if key == "id" {
      return None;
    }
    self.fields.get(key)
  }

  /// Sets a top-level field, returning the previous value.
  pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
    self.fields.insert(key.into(), value.into())
  }

  /// Resolves a nested path such as `tags__key` or `tags.key`.
  ///
  /// The path `id` resolves to the document id.
  pub fn get_path(&self, path: &[String]) -> Option<Value> {
    let (first, rest) = path.split_first()?;
    if first == "id" && rest.is_empty() {
      return Some(Value::String(self.id.clone()));
    }
    let mut current = self.fields.get(first)?;
    for segment in rest {
      current = match current {
        Value::Object(map) => map.get(segment)?,
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
        _ => return None,
      };
    }
    Some(current.clone())
  }

  /// Converts the document into a flat JSON object including its id.
  pub fn to_value(&self) -> Value {
    let mut map = Map::with_capacity(self.fields.len() + 1);
    map.insert("id".to_string(), Value::String(self.id.clone()));
    for (k, v) in &self.fields {
      map.insert(k.clone(), v.clone());
    }
    Value::Object(map)
  }

  /// Builds a document from a JSON object. A missing id is generated.
  pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
    serde_json::from_value(value)
  }
}

/// Splits a field path on `__` or `.`.
pub fn split_path(path: &str) -> Vec<String> {
  if path.contains(PATH_SEPARATOR) {
    path.split(PATH_SEPARATOR).map(str::to_string).collect()
  } else {
    path.split('.').map(str::to_string).collect()
  }
}

/// An ordered batch of documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocBatch(Vec<Document>);

impl DocBatch {
  /// Creates an empty batch.
  pub fn new() -> Self {
    Self(Vec::new())
  }

  /// Number of documents.
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Whether the batch has no documents.
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Appends a document.
  pub fn push(&mut self, doc: Document) {
    self.0.push(doc);
  }

  /// Iterates over the documents.
  pub fn iter(&self) -> std::slice::Iter<'_, Document> {
    self.0.iter()
  }

  /// Iterates mutably over the documents.
  pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Document> {
    self.0.iter_mut()
  }

  /// Ids in batch order.
  pub fn ids(&self) -> Vec<String> {
    self.0.iter().map(|d| d.id.clone()).collect()
  }

  /// Finds a document by id.
  pub fn get_by_id(&self, id: &str) -> Option<&Document> {
    self.0.iter().find(|d| d.id == id)
  }

  /// Copies a contiguous range into a new batch.
  pub fn slice(&self, range: Range<usize>) -> DocBatch {
    DocBatch(self.0[range].to_vec())
  }

  /// Removes the documents in `range` and returns them.
  pub fn drain(&mut self, range: Range<usize>) -> DocBatch {
    DocBatch(self.0.drain(range).collect())
  }

  /// Keeps only the documents for which `f` returns true.
  pub fn retain<F: FnMut(&Document) -> bool>(&mut self, f: F) {
    self.0.retain(f);
  }

  /// Sorts in place with a stable sort on the given key.
  pub fn sort_by_key<K: Ord, F: FnMut(&Document) -> K>(&mut self, f: F) {
    self.0.sort_by_key(f);
  }

  /// Borrows the underlying slice.
  pub fn as_slice(&self) -> &[Document] {
    &self.0
  }

  /// Consumes the batch.
  pub fn into_inner(self) -> Vec<Document> {
    self.0
  }
}

impl From<Vec<Document>> for DocBatch {
  fn from(docs: Vec<Document>) -> Self {
    Self(docs)
  }
}

impl FromIterator<Document> for DocBatch {
  fn from_iter<I: IntoIterator<Item = Document>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl Extend<Document> for DocBatch {
  fn extend<I: IntoIterator<Item = Document>>(&mut self, iter: I) {
    self.0.extend(iter);
  }
}

impl IntoIterator for DocBatch {
  type Item = Document;
  type IntoIter = std::vec::IntoIter<Document>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.into_iter()
  }
}

impl<'a> IntoIterator for &'a DocBatch {
  type Item = &'a Document;
  type IntoIter = std::slice::Iter<'a, Document>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.iter()
  }
}

impl Index<usize> for DocBatch {
  type Output = Document;

  fn index(&self, index: usize) -> &Document {
    &self.0[index]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_missing_id_is_generated() {
    let doc: Document = serde_json::from_value(json!({"text": "hello"})).unwrap();
    assert_eq!(doc.id.len(), 32);
    assert!(doc.id.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(doc.get("text"), Some(&json!("hello")));
  }

  #[test]
  fn test_flattened_fields_serialize_next_to_id() {
    let doc = Document::with_id("d1").with_field("text", "hi");
    let value = serde_json::to_value(&doc).unwrap();
    assert_eq!(value, json!({"id": "d1", "text": "hi"}));
  }

  #[test]
  fn test_get_path_nested() {
    let doc = Document::with_id("d1").with_field("tags", json!({"key": 5, "list": [1, 2]}));
    assert_eq!(doc.get_path(&split_path("tags__key")), Some(json!(5)));
    assert_eq!(doc.get_path(&split_path("tags.list.1")), Some(json!(2)));
    assert_eq!(doc.get_path(&split_path("id")), Some(json!("d1")));
    assert_eq!(doc.get_path(&split_path("tags__missing")), None);
  }

  #[test]
  fn test_batch_drain_and_slice() {
    let mut batch: DocBatch = (0..5).map(|i| Document::with_id(i.to_string())).collect();
    let head = batch.drain(0..2);
    assert_eq!(head.ids(), vec!["0", "1"]);
    assert_eq!(batch.slice(1..3).ids(), vec!["3", "4"]);
    assert_eq!(batch.len(), 3);
  }
}
