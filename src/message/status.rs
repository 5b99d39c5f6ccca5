//! Request status and route records.

use crate::error::ExecutorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a request or of one hop of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
  /// Processed normally.
  #[default]
  Success,
  /// An executor or the network failed.
  Error,
}

/// Status attached to a header or a route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
  /// Success or error.
  #[serde(default)]
  pub code: StatusCode,
  /// Free text description.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub description: String,
  /// Structured failure, present when `code` is `Error`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub exception: Option<ExecutorError>,
}

impl Status {
  /// Successful status.
  pub fn success() -> Self {
    Self::default()
  }

  /// Error status carrying `exception`.
  pub fn error(exception: ExecutorError) -> Self {
    Self {
      code: StatusCode::Error,
      description: exception.to_string(),
      exception: Some(exception),
    }
  }

  /// Whether this status reports a failure.
  pub fn is_error(&self) -> bool {
    self.code == StatusCode::Error
  }
}

/// One hop of a request through the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
  /// Deployment (or `gateway`) that handled the hop.
  pub executor: String,
  /// Replica identity, used to dedupe routes after a reduce.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub pod_id: String,
  /// When the hop started.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_time: Option<DateTime<Utc>>,
  /// When the hop ended. Set once.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_time: Option<DateTime<Utc>>,
  /// Failure status of the hop.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<Status>,
}

impl Route {
  /// Starts a route for `executor` now.
  pub fn start(executor: impl Into<String>) -> Self {
    Self {
      executor: executor.into(),
      pod_id: String::new(),
      start_time: Some(Utc::now()),
      end_time: None,
      status: None,
    }
  }

  /// Sets the end time unless it is already set.
  pub fn finish(&mut self) {
    self.finish_at(Utc::now());
  }

  /// Sets the end time to `at` unless it is already set.
  pub fn finish_at(&mut self, at: DateTime<Utc>) {
    if self.end_time.is_none() {
      self.end_time = Some(at);
    }
  }
}
