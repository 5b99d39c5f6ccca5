//! Request and response bodies of the HTTP gateway.

use crate::error::{ExecutorError, GatewayError};
use crate::message::{
  DataRequest, DocBatch, Document, Parameters, SingleDocumentRequest, Status, request_from_parts,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Endpoint used by the connectivity probe.
pub const DRY_RUN_ENDPOINT: &str = "_jina_dry_run_";

/// One document or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocsPayload {
  /// A list of documents.
  Many(Vec<Value>),
  /// A single document.
  One(Value),
}

/// Header fields a client may set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderInput {
  /// Request id to reuse.
  #[serde(default)]
  pub request_id: Option<String>,
  /// Regex selecting the deployments that process the request.
  #[serde(default)]
  pub target_executor: Option<String>,
}

/// Body of `POST /<endpoint>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointInput {
  /// Documents to process.
  #[serde(default)]
  pub data: Option<DocsPayload>,
  /// Request parameters.
  #[serde(default)]
  pub parameters: Option<Parameters>,
  /// Header overrides.
  #[serde(default)]
  pub header: Option<HeaderInput>,
}

/// Body of `POST /post`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostInput {
  /// Endpoint to call, `/default` when missing.
  #[serde(default)]
  pub exec_endpoint: Option<String>,
  /// The rest of the envelope.
  #[serde(flatten)]
  pub body: EndpointInput,
}

impl EndpointInput {
  /// Documents of the body, each one as a JSON value.
  pub fn doc_values(&self) -> Vec<Value> {
    match &self.data {
      None => Vec::new(),
      Some(DocsPayload::Many(docs)) => docs.clone(),
      Some(DocsPayload::One(doc)) => vec![doc.clone()],
    }
  }

  /// Builds the request sent through the flow.
  ///
  /// A single posted document without a header gives its id to the request.
  ///
  /// # Errors
  ///
  /// A posted document that is not a JSON object.
  pub fn into_request(self, endpoint: &str) -> Result<DataRequest, GatewayError> {
    let single = matches!(self.data, Some(DocsPayload::One(_)));
    let docs = self
      .doc_values()
      .into_iter()
      .map(Document::from_value)
      .collect::<Result<Vec<_>, _>>()?;
    let header = self.header.unwrap_or_default();
    let request_id = match header.request_id {
      Some(id) => Some(id),
      None if single => docs.first().map(|d| d.id.clone()),
      None => None,
    };
    Ok(request_from_parts(
      DocBatch::from(docs),
      self.parameters,
      endpoint,
      request_id,
      header.target_executor,
    ))
  }

  /// Builds the streaming request of a generator endpoint from the first
  /// posted document.
  ///
  /// # Errors
  ///
  /// A posted document that is not a JSON object.
  pub fn into_single_request(self, endpoint: &str) -> Result<SingleDocumentRequest, GatewayError> {
    let doc = match self.doc_values().into_iter().next() {
      Some(value) => Document::from_value(value)?,
      None => Document::new(),
    };
    let mut request = SingleDocumentRequest::new(doc).with_endpoint(endpoint);
    request.parameters = self.parameters.unwrap_or_default();
    let header = self.header.unwrap_or_default();
    if let Some(id) = header.request_id.filter(|id| !id.is_empty()) {
      request.header.request_id = id;
    }
    if let Some(target) = header.target_executor {
      request.header.target_executor = target;
    }
    Ok(request)
  }
}

/// Body answered for a processed request.
pub fn response_body(response: &DataRequest, singleton: bool) -> Value {
  let docs: Vec<Value> = response.docs().iter().map(Document::to_value).collect();
  let data = match (singleton, docs.len()) {
    (true, 1) => docs.into_iter().next().unwrap_or(Value::Null),
    _ => Value::Array(docs),
  };
  let mut body = json!({
    "data": data,
    "parameters": response.parameters,
    "header": {
      "request_id": response.request_id(),
      "status": response.header.status,
    },
  });
  if !response.results.is_empty() {
    body["results"] = json!(response.results);
  }
  body
}

/// Mirrors the posted body with the failure attached to its header.
pub fn error_body(mut body: Value, err: &GatewayError, request_id: &str) -> Value {
  let exception = match err {
    GatewayError::Executor(e) => e.clone(),
    other => ExecutorError::new(other.kind_name(), other.to_string()),
  };
  let header = json!({
    "request_id": request_id,
    "status": Status::error(exception),
  });
  match body.as_object_mut() {
    Some(object) => {
      object.insert("header".into(), header);
    }
    None => {
      let mut object = Map::new();
      object.insert("data".into(), body);
      object.insert("header".into(), header);
      body = Value::Object(object);
    }
  }
  body
}

/// Status envelope answered by `/dry_run`.
pub fn dry_run_body(result: &Result<DataRequest, GatewayError>) -> Value {
  let status = match result {
    Ok(response) => response.header.status.clone(),
    Err(err) => Status::error(ExecutorError::new(err.kind_name(), err.to_string())),
  };
  json!(status)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_single_document_names_the_request() {
    let input: EndpointInput =
      serde_json::from_value(json!({"data": {"id": "doc-1", "text": "hi"}})).unwrap();
    let request = input.into_request("/foo").unwrap();
    assert_eq!(request.request_id(), "doc-1");
    assert_eq!(request.endpoint(), "/foo");
    assert_eq!(request.docs().len(), 1);
  }

  #[test]
  fn test_header_request_id_wins() {
    let input: EndpointInput = serde_json::from_value(json!({
      "data": [{"id": "a"}, {"id": "b"}],
      "parameters": {"k": 1},
      "header": {"request_id": "r-1", "target_executor": "enc.*"},
    }))
    .unwrap();
    let request = input.into_request("/foo").unwrap();
    assert_eq!(request.request_id(), "r-1");
    assert_eq!(request.header.target_executor, "enc.*");
    assert_eq!(request.parameters.get("k"), Some(&json!(1)));
  }

  #[test]
  fn test_generator_body_keeps_parameters_and_header() {
    let input: EndpointInput = serde_json::from_value(json!({
      "data": {"id": "q", "text": "hi"},
      "parameters": {"prefix": ">"},
      "header": {"request_id": "r-2", "target_executor": "gen"},
    }))
    .unwrap();
    let request = input.into_single_request("/generate").unwrap();
    assert_eq!(request.endpoint(), "/generate");
    assert_eq!(request.header.request_id, "r-2");
    assert_eq!(request.header.target_executor, "gen");
    assert_eq!(request.parameters.get("prefix"), Some(&json!(">")));
    assert_eq!(request.data.doc.map(|d| d.id), Some("q".to_string()));
  }

  #[test]
  fn test_post_envelope_carries_the_endpoint() {
    let input: PostInput = serde_json::from_value(json!({
      "exec_endpoint": "/index",
      "data": [{"id": "a"}],
    }))
    .unwrap();
    assert_eq!(input.exec_endpoint.as_deref(), Some("/index"));
    assert_eq!(input.body.doc_values().len(), 1);
  }

  #[test]
  fn test_error_body_mirrors_the_request() {
    let err = GatewayError::Config("broken".into());
    let body = error_body(json!({"data": [{"id": "a"}]}), &err, "r-9");
    assert_eq!(body["data"][0]["id"], json!("a"));
    assert_eq!(body["header"]["request_id"], json!("r-9"));
    assert_eq!(body["header"]["status"]["exception"]["name"], json!("ConfigError"));
  }
}
