//! Shard polling per endpoint.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Key matching every endpoint without an explicit entry.
pub const WILDCARD: &str = "*";

/// How a request is spread over the shards of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollingType {
  /// One shard handles the request.
  Any,
  /// Every shard handles the request.
  All,
}

impl PollingType {
  /// Upper-case name.
  pub fn as_str(self) -> &'static str {
    match self {
      PollingType::Any => "ANY",
      PollingType::All => "ALL",
    }
  }
}

impl FromStr for PollingType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "ANY" => Ok(PollingType::Any),
      "ALL" => Ok(PollingType::All),
      other => Err(format!("unknown polling type `{other}`")),
    }
  }
}

/// Polling by endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
  default: PollingType,
  per_endpoint: BTreeMap<String, PollingType>,
}

impl Default for PollingConfig {
  /// `/search` broadcasts, `/index` and everything else goes to one shard.
  fn default() -> Self {
    let mut per_endpoint = BTreeMap::new();
    per_endpoint.insert("/search".to_string(), PollingType::All);
    per_endpoint.insert("/index".to_string(), PollingType::Any);
    Self {
      default: PollingType::Any,
      per_endpoint,
    }
  }
}

impl PollingConfig {
  /// Same polling for every endpoint.
  pub fn uniform(polling: PollingType) -> Self {
    Self {
      default: polling,
      per_endpoint: BTreeMap::new(),
    }
  }

  /// Overrides the polling of one endpoint.
  #[must_use]
  pub fn with_endpoint(mut self, endpoint: impl Into<String>, polling: PollingType) -> Self {
    self.per_endpoint.insert(endpoint.into(), polling);
    self
  }

  /// Polling of `endpoint`.
  pub fn for_endpoint(&self, endpoint: &str) -> PollingType {
    self.per_endpoint.get(endpoint).copied().unwrap_or(self.default)
  }

  /// Parses `ANY`, `ALL`, or a JSON object such as
  /// `{"/index": "ANY", "*": "ALL"}`.
  pub fn parse(raw: &str) -> Result<Self, String> {
    if let Ok(polling) = raw.parse::<PollingType>() {
      return Ok(Self::uniform(polling));
    }
    let value: Value =
      serde_json::from_str(raw).map_err(|e| format!("invalid polling `{raw}`: {e}"))?;
    Self::from_value(&value)
  }

  fn from_value(value: &Value) -> Result<Self, String> {
    match value {
      Value::String(s) => s.parse().map(Self::uniform),
      Value::Object(map) => {
        let mut config = Self::uniform(PollingType::Any);
        for (endpoint, polling) in map {
          let polling = polling
            .as_str()
            .ok_or_else(|| format!("polling of `{endpoint}` must be a string"))?
            .parse()?;
          if endpoint == WILDCARD {
            config.default = polling;
          } else {
            config.per_endpoint.insert(endpoint.clone(), polling);
          }
        }
        Ok(config)
      }
      other => Err(format!("invalid polling value {other}")),
    }
  }
}

impl Serialize for PollingConfig {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map: BTreeMap<&str, &str> = BTreeMap::new();
    map.insert(WILDCARD, self.default.as_str());
    for (endpoint, polling) in &self.per_endpoint {
      map.insert(endpoint.as_str(), polling.as_str());
    }
    map.serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for PollingConfig {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let value = Value::deserialize(deserializer)?;
    match &value {
      Value::Null => Ok(Self::default()),
      Value::String(s) if s.trim_start().starts_with('{') => {
        Self::parse(s).map_err(serde::de::Error::custom)
      }
      _ => Self::from_value(&value).map_err(serde::de::Error::custom),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let cfg = PollingConfig::default();
    assert_eq!(cfg.for_endpoint("/search"), PollingType::All);
    assert_eq!(cfg.for_endpoint("/index"), PollingType::Any);
    assert_eq!(cfg.for_endpoint("/foo"), PollingType::Any);
  }

  #[test]
  fn test_parse_uniform_and_map() {
    assert_eq!(
      PollingConfig::parse("all").unwrap().for_endpoint("/index"),
      PollingType::All
    );
    let cfg = PollingConfig::parse(r#"{"/index": "ANY", "*": "ALL"}"#).unwrap();
    assert_eq!(cfg.for_endpoint("/index"), PollingType::Any);
    assert_eq!(cfg.for_endpoint("/other"), PollingType::All);
    assert!(PollingConfig::parse("SOME").is_err());
  }

  #[test]
  fn test_serde_round_trip() {
    let cfg = PollingConfig::uniform(PollingType::All).with_endpoint("/x", PollingType::Any);
    let back: PollingConfig = serde_json::from_value(serde_json::to_value(&cfg).unwrap()).unwrap();
    assert_eq!(back, cfg);
  }
}
