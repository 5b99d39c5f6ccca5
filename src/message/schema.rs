//! # Endpoint Schemas
//!
//! Descriptors returned by endpoint discovery. Every endpoint advertises the
//! JSON schema of its input documents, output documents and parameters. The
//! gateway uses them for three things: compatibility checks between adjacent
//! deployments, validation of HTTP payloads, and typed merging in the
//! reducer through [`DocSchema`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The default endpoint every executor may bind.
pub const DEFAULT_ENDPOINT: &str = "/default";

/// A named JSON schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelSchema {
  /// Model name, e.g. `TextDoc`.
  pub name: String,
  /// JSON schema of one instance.
  #[serde(default)]
  pub schema: Value,
}

impl ModelSchema {
  /// Creates a model schema.
  pub fn new(name: impl Into<String>, schema: Value) -> Self {
    Self {
      name: name.into(),
      schema,
    }
  }

  /// Whether two models describe the same structure.
  ///
  /// Titles, descriptions, defaults and examples are ignored.
  pub fn structurally_matches(&self, other: &ModelSchema) -> bool {
    if self.schema.is_null() || other.schema.is_null() {
      return self.name == other.name;
    }
    strip_annotations(&self.schema) == strip_annotations(&other.schema)
  }

  /// Field kinds of the model, for typed reduction.
  pub fn doc_schema(&self) -> DocSchema {
    DocSchema::from_json_schema(&self.schema)
  }
}

fn strip_annotations(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut out = Map::new();
      for (k, v) in map {
        if matches!(k.as_str(), "title" | "description" | "default" | "examples") {
          continue;
        }
        out.insert(k.clone(), strip_annotations(v));
      }
      Value::Object(out)
    }
    Value::Array(items) => Value::Array(items.iter().map(strip_annotations).collect()),
    other => other.clone(),
  }
}

/// I/O descriptor of one endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EndpointSchema {
  /// Input document model.
  pub input: ModelSchema,
  /// Output document model.
  pub output: ModelSchema,
  /// Parameters model, when declared.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parameters: Option<ModelSchema>,
  /// Whether the endpoint streams documents back.
  #[serde(default)]
  pub is_generator: bool,
  /// Whether the endpoint takes a single document.
  #[serde(default)]
  pub is_singleton_doc: bool,
}

/// Result of an endpoint discovery call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EndpointsInfo {
  /// Bound endpoints.
  #[serde(default)]
  pub endpoints: Vec<String>,
  /// Schemas by endpoint, possibly a subset of `endpoints`.
  #[serde(default)]
  pub schemas: BTreeMap<String, EndpointSchema>,
}

impl EndpointsInfo {
  /// Whether `endpoint` is bound.
  pub fn binds(&self, endpoint: &str) -> bool {
    self.endpoints.iter().any(|e| e == endpoint)
  }

  /// Whether `endpoint` is bound directly or through the default endpoint.
  pub fn accepts(&self, endpoint: &str) -> bool {
    self.binds(endpoint) || self.binds(DEFAULT_ENDPOINT)
  }

  /// Schema used for `endpoint`, falling back to the default endpoint.
  pub fn schema_for(&self, endpoint: &str) -> Option<&EndpointSchema> {
    self
      .schemas
      .get(endpoint)
      .or_else(|| self.schemas.get(DEFAULT_ENDPOINT))
  }

  /// Merges another discovery result into this one, keeping existing schemas.
  pub fn merge(&mut self, other: EndpointsInfo) {
    for endpoint in other.endpoints {
      if !self.binds(&endpoint) {
        self.endpoints.push(endpoint);
      }
    }
    for (endpoint, schema) in other.schemas {
      self.schemas.entry(endpoint).or_insert(schema);
    }
  }
}

/// How a field merges during reduction.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
  /// Plain value, left precedence.
  Scalar,
  /// Ordered list, concatenated.
  List,
  /// Set of values, union.
  Set,
  /// Free-form map, update with left precedence.
  Map,
  /// Nested document, merged recursively.
  Doc(DocSchema),
  /// Nested document list, merged by id.
  DocList(DocSchema),
}

/// Field kinds of one document type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocSchema {
  fields: BTreeMap<String, FieldKind>,
}

impl DocSchema {
  /// Derives field kinds from a JSON schema.
  pub fn from_json_schema(schema: &Value) -> Self {
    Self::from_object(schema, schema, 0)
  }

  /// Kind of `field`, if declared.
  pub fn kind(&self, field: &str) -> Option<&FieldKind> {
    self.fields.get(field)
  }

  /// Declares a field kind.
  #[must_use]
  pub fn with_field(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
    self.fields.insert(field.into(), kind);
    self
  }

  /// Declared field names, in schema order.
  pub fn field_names(schema: &Value) -> Vec<String> {
    schema
      .get("properties")
      .and_then(Value::as_object)
      .map(|props| props.keys().filter(|k| *k != "id").cloned().collect())
      .unwrap_or_default()
  }

  fn from_object(root: &Value, schema: &Value, depth: usize) -> Self {
    let mut out = DocSchema::default();
    let schema = resolve(root, schema);
    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
      return out;
    };
    for (name, prop) in props {
      out.fields.insert(name.clone(), field_kind(root, prop, depth));
    }
    out
  }
}

const MAX_DEPTH: usize = 16;

fn field_kind(root: &Value, prop: &Value, depth: usize) -> FieldKind {
  if depth > MAX_DEPTH {
    return FieldKind::Scalar;
  }
  let prop = resolve(root, unwrap_optional(prop));
  match prop.get("type").and_then(Value::as_str) {
    Some("array") => {
      if prop.get("uniqueItems").and_then(Value::as_bool) == Some(true) {
        return FieldKind::Set;
      }
      match prop.get("items") {
        Some(items) if is_document(root, items) => {
          FieldKind::DocList(DocSchema::from_object(root, items, depth + 1))
        }
        _ => FieldKind::List,
      }
    }
    Some("object") if prop.get("properties").is_some() => {
      FieldKind::Doc(DocSchema::from_object(root, prop, depth + 1))
    }
    Some("object") => FieldKind::Map,
    None if prop.get("properties").is_some() => {
      FieldKind::Doc(DocSchema::from_object(root, prop, depth + 1))
    }
    _ => FieldKind::Scalar,
  }
}

fn is_document(root: &Value, schema: &Value) -> bool {
  resolve(root, unwrap_optional(schema))
    .get("properties")
    .is_some()
}

/// `anyOf: [X, {type: null}]` is how optional fields are written.
fn unwrap_optional(prop: &Value) -> &Value {
  for key in ["anyOf", "oneOf", "allOf"] {
    if let Some(variants) = prop.get(key).and_then(Value::as_array) {
      let non_null: Vec<&Value> = variants
        .iter()
        .filter(|v| v.get("type").and_then(Value::as_str) != Some("null"))
        .collect();
      if non_null.len() == 1 {
        return non_null[0];
      }
    }
  }
  prop
}

/// Follows a local `$ref` such as `#/definitions/Doc` or `#/$defs/Doc`.
fn resolve<'a>(root: &'a Value, schema: &'a Value) -> &'a Value {
  let Some(reference) = schema.get("$ref").and_then(Value::as_str) else {
    return schema;
  };
  let Some(path) = reference.strip_prefix("#/") else {
    return schema;
  };
  let mut current = root;
  for segment in path.split('/') {
    match current.get(segment) {
      Some(next) => current = next,
      None => return schema,
    }
  }
  current
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn nested_schema() -> Value {
    json!({
      "title": "Outer",
      "type": "object",
      "properties": {
        "text": {"type": "string"},
        "tags": {"type": "object", "additionalProperties": true},
        "labels": {"type": "array", "uniqueItems": true, "items": {"type": "string"}},
        "scores": {"type": "array", "items": {"type": "number"}},
        "chunks": {"type": "array", "items": {"$ref": "#/definitions/Chunk"}},
        "image": {"anyOf": [{"$ref": "#/definitions/Chunk"}, {"type": "null"}]}
      },
      "definitions": {
        "Chunk": {"type": "object", "properties": {"id": {"type": "string"}, "text": {"type": "string"}}}
      }
    })
  }

  #[test]
  fn test_field_kinds_from_schema() {
    let schema = DocSchema::from_json_schema(&nested_schema());
    assert_eq!(schema.kind("text"), Some(&FieldKind::Scalar));
    assert_eq!(schema.kind("tags"), Some(&FieldKind::Map));
    assert_eq!(schema.kind("labels"), Some(&FieldKind::Set));
    assert_eq!(schema.kind("scores"), Some(&FieldKind::List));
    assert!(matches!(schema.kind("chunks"), Some(FieldKind::DocList(_))));
    assert!(matches!(schema.kind("image"), Some(FieldKind::Doc(_))));
  }

  #[test]
  fn test_structural_match_ignores_titles() {
    let a = ModelSchema::new("A", json!({"title": "A", "properties": {"x": {"type": "string", "title": "X"}}}));
    let b = ModelSchema::new("B", json!({"title": "B", "properties": {"x": {"type": "string"}}}));
    let c = ModelSchema::new("C", json!({"properties": {"x": {"type": "integer"}}}));
    assert!(a.structurally_matches(&b));
    assert!(!a.structurally_matches(&c));
  }

  #[test]
  fn test_endpoints_info_default_fallback() {
    let info = EndpointsInfo {
      endpoints: vec!["/default".into()],
      schemas: BTreeMap::new(),
    };
    assert!(info.accepts("/search"));
    assert!(!info.binds("/search"));
  }
}
