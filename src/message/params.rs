//! # Request Parameters
//!
//! Parameters are a free-form JSON map. A key of the form
//! `deployment__name` is scoped to one deployment: when the request reaches
//! that deployment the key is renamed to `name`, every other deployment never
//! sees it. A nested object under the deployment's own name is merged in as
//! well.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Request parameters.
pub type Parameters = Map<String, Value>;

const SCOPE_SEPARATOR: &str = "__";

/// Whether `key` targets one specific deployment.
pub fn is_scoped_key(key: &str) -> bool {
  key.contains(SCOPE_SEPARATOR)
    && !key.starts_with(SCOPE_SEPARATOR)
    && !key.ends_with(SCOPE_SEPARATOR)
}

/// Splits `deployment__name` into `(name, deployment)`.
///
/// Everything before the last separator is the deployment name, so nested
/// names such as `a__b__key` yield `("key", "a__b")`.
pub fn split_scoped_key(key: &str) -> (&str, &str) {
  match key.rfind(SCOPE_SEPARATOR) {
    Some(pos) => (&key[pos + SCOPE_SEPARATOR.len()..], &key[..pos]),
    None => (key, ""),
  }
}

/// Returns the view of `parameters` seen by `deployment`.
///
/// # Arguments
///
/// * `parameters` - The parameters as sent by the client.
/// * `deployment` - Name of the receiving deployment.
///
/// # Returns
///
/// A copy where keys scoped to `deployment` are unscoped, keys scoped to any
/// other deployment are removed, and `parameters[deployment]` (when it is an
/// object) is merged on top.
pub fn scope_parameters(parameters: &Parameters, deployment: &str) -> Parameters {
  let mut scoped = parameters.clone();
  for (key, value) in parameters {
    if !is_scoped_key(key) {
      continue;
    }
    let (name, target) = split_scoped_key(key);
    scoped.remove(key);
    if target == deployment {
      scoped.insert(name.to_string(), value.clone());
    }
  }
  if let Some(Value::Object(specific)) = parameters.get(deployment) {
    for (k, v) in specific {
      scoped.insert(k.clone(), v.clone());
    }
  }
  scoped
}

/// Stable hex fingerprint of a parameter set.
///
/// Keys are sorted recursively before hashing so insertion order does not
/// matter.
pub fn fingerprint(parameters: &Parameters) -> String {
  let canonical = canonicalize(&Value::Object(parameters.clone()));
  let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
  let digest = Sha256::digest(&bytes);
  digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn canonicalize(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      let mut sorted = Map::with_capacity(map.len());
      for key in keys {
        sorted.insert(key.clone(), canonicalize(&map[key]));
      }
      Value::Object(sorted)
    }
    Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
    other => other.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn params(value: Value) -> Parameters {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_scoped_key_detection() {
    assert!(is_scoped_key("encoder__top_k"));
    assert!(!is_scoped_key("__results__"));
    assert!(!is_scoped_key("top_k"));
    assert!(!is_scoped_key("encoder__"));
    assert_eq!(split_scoped_key("a__b__key"), ("key", "a__b"));
  }

  #[test]
  fn test_scope_parameters_renames_and_drops() {
    let p = params(json!({
      "top_k": 3,
      "encoder__top_k": 10,
      "indexer__limit": 1,
      "encoder": {"model": "small"}
    }));

    let encoder = scope_parameters(&p, "encoder");
    assert_eq!(encoder["top_k"], json!(10));
    assert_eq!(encoder["model"], json!("small"));
    assert!(!encoder.contains_key("indexer__limit"));
    assert!(!encoder.contains_key("limit"));

    let indexer = scope_parameters(&p, "indexer");
    assert_eq!(indexer["top_k"], json!(3));
    assert_eq!(indexer["limit"], json!(1));
  }

  #[test]
  fn test_fingerprint_ignores_key_order() {
    let a = params(json!({"a": 1, "b": {"x": 1, "y": 2}}));
    let b = params(json!({"b": {"y": 2, "x": 1}, "a": 1}));
    let c = params(json!({"a": 2}));
    assert_eq!(fingerprint(&a), fingerprint(&b));
    assert_ne!(fingerprint(&a), fingerprint(&c));
    assert_eq!(fingerprint(&a).len(), 64);
  }
}
