//! `text/csv` request bodies.
//!
//! Lines carry no header: the fields follow the declared order of the input
//! model and every declared field must be present. There is no quoting; a
//! backslash escapes the next character.

use crate::message::Document;
use serde_json::Value;
use thiserror::Error;

/// A CSV body that does not fit the input model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsvError {
  /// The input model declares no field.
  #[error("the input model declares no field")]
  NoFields,
  /// A line has the wrong number of fields.
  #[error("invalid CSV format: line {line} has {found} fields, expected the field order {expected:?}")]
  FieldCount {
    /// One-based line number.
    line: usize,
    /// Fields found on the line.
    found: usize,
    /// Declared fields.
    expected: Vec<String>,
  },
}

/// Parses `body` into one document per non-empty line.
pub fn parse_csv(body: &str, schema: &Value) -> Result<Vec<Document>, CsvError> {
  let fields: Vec<String> = schema
    .get("properties")
    .and_then(Value::as_object)
    .map(|props| props.keys().cloned().collect())
    .unwrap_or_default();
  if fields.is_empty() {
    return Err(CsvError::NoFields);
  }

  let mut docs = Vec::new();
  for (index, line) in body.lines().enumerate() {
    let line = line.trim_end_matches('\r');
    if line.is_empty() {
      continue;
    }
    let values = split_line(line);
    if values.len() != fields.len() {
      return Err(CsvError::FieldCount {
        line: index + 1,
        found: values.len(),
        expected: fields,
      });
    }

    let mut doc = Document::new();
    for (field, raw) in fields.iter().zip(values) {
      let value = typed_value(schema, field, raw);
      if field == "id" {
        if let Value::String(id) = &value {
          doc.id = id.clone();
          continue;
        }
      }
      doc.set(field.clone(), value);
    }
    docs.push(doc);
  }
  Ok(docs)
}

fn split_line(line: &str) -> Vec<String> {
  let mut fields = Vec::new();
  let mut current = String::new();
  let mut chars = line.chars();
  while let Some(c) = chars.next() {
    match c {
      '\\' => {
        if let Some(escaped) = chars.next() {
          current.push(escaped);
        }
      }
      ',' => fields.push(std::mem::take(&mut current)),
      other => current.push(other),
    }
  }
  fields.push(current);
  fields
}

/// Strings stay strings; anything else is read as JSON when it parses.
fn typed_value(schema: &Value, field: &str, raw: String) -> Value {
  let declared = schema
    .get("properties")
    .and_then(|p| p.get(field))
    .and_then(|p| p.get("type"))
    .and_then(Value::as_str);
  if declared == Some("string") {
    return Value::String(raw);
  }
  serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}
