//! # HTTP Gateway
//!
//! Client-facing HTTP surface of the gateway:
//!
//! | Route | Answer |
//! |---|---|
//! | `GET /dry_run` | status of an empty request sent through the flow |
//! | `GET /status` | version and environment |
//! | `GET /ping` | liveness, in managed-inference mode |
//! | `GET /ws` | WebSocket upgrade |
//! | `POST /post` | full request envelope with `exec_endpoint` |
//! | `POST /<endpoint>` | documents processed by the flow |
//! | `GET`/`POST /<endpoint>` | server-sent events, for generator endpoints |
//!
//! Failures mirror the posted body with the error attached to its header.
//! Transport failures answer 503 or 504, executor failures 499, anything
//! else 500.

use super::csv::parse_csv;
use super::models::{
  DRY_RUN_ENDPOINT, DocsPayload, EndpointInput, PostInput, dry_run_body, error_body, response_body,
};
use super::sse::{EVENT_STREAM, event_stream};
use crate::config::HttpServerConfig;
use crate::error::GatewayError;
use crate::gateway::streamer::GatewayStreamer;
use crate::gateway::websocket;
use crate::graph::EndpointModels;
use crate::message::{DEFAULT_ENDPOINT, DataRequest, Document, SingleDocumentRequest, StatusInfo};
use crate::networking::serve_with;
use crate::networking::wire::{RpcBody, full, streaming};
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use jsonschema::JSONSchema;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Status answered when the executor reported a failure.
const EXECUTOR_ERROR_STATUS: u16 = 499;

/// HTTP front of a [`GatewayStreamer`].
pub struct HttpGateway {
  streamer: Arc<GatewayStreamer>,
  config: HttpServerConfig,
}

impl HttpGateway {
  /// Creates the HTTP surface of `streamer`.
  pub fn new(streamer: Arc<GatewayStreamer>, config: HttpServerConfig) -> Self {
    Self { streamer, config }
  }

  /// Serves on `listener` until `shutdown` fires.
  pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
    serve_with(listener, shutdown, "http", move |request| {
      Arc::clone(&self).handle(request)
    })
    .await
  }

  /// Answers one HTTP request.
  pub async fn handle(self: Arc<Self>, request: Request<Incoming>) -> Result<Response<RpcBody>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    debug!(%method, %path, "http request");

    let response = match (&method, path.as_str()) {
      (&Method::GET, "/dry_run") => self.dry_run().await,
      (&Method::GET, "/status") => json_response(StatusCode::OK, &json!(StatusInfo::current())),
      (&Method::GET, "/ping") if self.config.managed_inference => json_response(StatusCode::OK, &json!({})),
      (&Method::GET, "/ws") if websocket::is_upgrade_request(&request) => {
        match websocket::accept(Arc::clone(&self.streamer), request) {
          Ok(response) => response,
          Err(err) => detail_response(StatusCode::BAD_REQUEST, err.to_string()),
        }
      }
      (&Method::POST, "/post") => self.post_envelope(request).await,
      _ => self.endpoint(method, path, request).await,
    };
    Ok(response)
  }

  async fn dry_run(&self) -> Response<RpcBody> {
    let request = DataRequest::new().with_endpoint(DRY_RUN_ENDPOINT);
    let result = self.streamer.process_single_data(request).await;
    if let Err(err) = &result {
      warn!(error = %err, "dry run failed");
    }
    json_response(StatusCode::OK, &dry_run_body(&result))
  }

  async fn post_envelope(&self, request: Request<Incoming>) -> Response<RpcBody> {
    let raw = match read_json(request).await {
      Ok(raw) => raw,
      Err(response) => return response,
    };
    let input: PostInput = match serde_json::from_value(raw.clone()) {
      Ok(input) => input,
      Err(err) => return detail_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
    };
    let endpoint = input
      .exec_endpoint
      .clone()
      .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    match input.body.into_request(&endpoint) {
      Ok(request) => self.process(request, raw, false).await,
      Err(err) => detail_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
    }
  }

  async fn endpoint(&self, method: Method, path: String, request: Request<Incoming>) -> Response<RpcBody> {
    let models = match self.streamer.endpoints_models().await {
      Ok(models) => models,
      Err(err) => {
        error!(error = %err, "endpoint discovery failed");
        let status = status_code(err.http_status());
        return json_response(status, &error_body(json!({}), &err, ""));
      }
    };
    let Some(model) = models.get(&path).cloned() else {
      return detail_response(StatusCode::NOT_FOUND, "Not Found".into());
    };

    if model.is_generator {
      return self.event_stream(method, path, request).await;
    }
    if method != Method::POST {
      return detail_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".into());
    }

    let csv = content_type(&request).is_some_and(|t| t == "text/csv" || t == "application/csv");
    let (request, raw) = if csv {
      match self.csv_request(request, &path, &model).await {
        Ok(parsed) => parsed,
        Err(response) => return response,
      }
    } else {
      let raw = match read_json(request).await {
        Ok(raw) => raw,
        Err(response) => return response,
      };
      let input: EndpointInput = match serde_json::from_value(raw.clone()) {
        Ok(input) => input,
        Err(err) => return detail_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
      };
      if self.config.validate_input {
        if let Err(messages) = validate_docs(&model.input.schema, &input.doc_values()) {
          return json_response(StatusCode::UNPROCESSABLE_ENTITY, &json!({ "detail": messages }));
        }
      }
      match input.into_request(&path) {
        Ok(request) => (request, raw),
        Err(err) => return detail_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
      }
    };
    self.process(request, raw, model.is_singleton_doc).await
  }

  async fn csv_request(
    &self,
    request: Request<Incoming>,
    endpoint: &str,
    model: &EndpointModels,
  ) -> Result<(DataRequest, Value), Response<RpcBody>> {
    if !self.config.managed_inference {
      return Err(detail_response(
        StatusCode::BAD_REQUEST,
        "Invalid content-type: text/csv. Please use application/json.".into(),
      ));
    }
    let body = read_body(request).await?;
    let text = String::from_utf8(body.to_vec())
      .map_err(|_| detail_response(StatusCode::BAD_REQUEST, "CSV body is not UTF-8".into()))?;
    let docs = parse_csv(&text, &model.input.schema)
      .map_err(|err| detail_response(StatusCode::BAD_REQUEST, err.to_string()))?;
    let raw = json!({ "data": docs.iter().map(Document::to_value).collect::<Vec<_>>() });
    let request = DataRequest::new().with_endpoint(endpoint).with_docs(docs);
    Ok((request, raw))
  }

  async fn process(&self, request: DataRequest, raw: Value, singleton: bool) -> Response<RpcBody> {
    let request_id = request.request_id().to_string();
    match self.streamer.process_single_data(request).await {
      Ok(response) if response.is_error() => {
        json_response(status_code(EXECUTOR_ERROR_STATUS), &response_body(&response, singleton))
      }
      Ok(response) => json_response(StatusCode::OK, &response_body(&response, singleton)),
      Err(err) => {
        error!(%request_id, error = %err, "error while getting responses from deployments");
        json_response(status_code(err.http_status()), &error_body(raw, &err, &request_id))
      }
    }
  }

  async fn event_stream(&self, method: Method, endpoint: String, request: Request<Incoming>) -> Response<RpcBody> {
    let single = if method == Method::GET {
      query_document(request.uri().query())
        .map(|doc| SingleDocumentRequest::new(doc).with_endpoint(endpoint.as_str()))
    } else {
      match read_json(request).await {
        Ok(raw) => generator_input(raw).and_then(|input| input.into_single_request(&endpoint)),
        Err(response) => return response,
      }
    };
    let single = match single {
      Ok(single) => single,
      Err(err) => return detail_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
    };
    let request_id = single.header.request_id.clone();

    match self.streamer.rpc_stream_doc(single).await {
      Ok(docs) => {
        let mut response = Response::new(streaming(event_stream(docs, self.config.sse_keepalive)));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
      }
      Err(err) => json_response(status_code(err.http_status()), &error_body(json!({}), &err, &request_id)),
    }
  }
}

/// Parses the body of a generator POST; a body without `data` is the
/// document itself.
fn generator_input(raw: Value) -> Result<EndpointInput, GatewayError> {
  if raw.get("data").is_some() {
    Ok(serde_json::from_value(raw)?)
  } else {
    Ok(EndpointInput {
      data: Some(DocsPayload::One(raw)),
      ..EndpointInput::default()
    })
  }
}

/// Validates every posted document against the endpoint's input schema.
///
/// A schema that does not describe anything, or fails to compile, accepts
/// every document.
fn validate_docs(schema: &Value, docs: &[Value]) -> Result<(), Vec<String>> {
  let describes = schema
    .as_object()
    .is_some_and(|object| object.contains_key("properties") || object.contains_key("type"));
  if !describes {
    return Ok(());
  }
  let compiled = match JSONSchema::compile(schema) {
    Ok(compiled) => compiled,
    Err(err) => {
      warn!(error = %err, "input schema does not compile, skipping validation");
      return Ok(());
    }
  };
  let mut messages = Vec::new();
  for (index, doc) in docs.iter().enumerate() {
    if let Err(errors) = compiled.validate(doc) {
      messages.extend(errors.map(|err| format!("data[{index}]{}: {err}", err.instance_path)));
    }
  }
  if messages.is_empty() { Ok(()) } else { Err(messages) }
}

/// Builds the input document of a generator endpoint from query parameters.
fn query_document(query: Option<&str>) -> Result<Document, GatewayError> {
  let params: HashMap<String, String> = match query {
    Some(query) => {
      serde_urlencoded::from_str(query).map_err(|err| GatewayError::Serialization(err.to_string()))?
    }
    None => HashMap::new(),
  };
  let mut fields = Map::new();
  for (key, raw) in params {
    let value = match key.as_str() {
      "id" => Value::String(raw),
      _ => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
    };
    fields.insert(key, value);
  }
  Ok(Document::from_value(Value::Object(fields))?)
}

fn content_type(request: &Request<Incoming>) -> Option<String> {
  let value = request.headers().get(CONTENT_TYPE)?.to_str().ok()?;
  Some(value.split(';').next().unwrap_or(value).trim().to_ascii_lowercase())
}

async fn read_body(request: Request<Incoming>) -> Result<Bytes, Response<RpcBody>> {
  request
    .into_body()
    .collect()
    .await
    .map(|collected| collected.to_bytes())
    .map_err(|err| detail_response(StatusCode::BAD_REQUEST, format!("cannot read body: {err}")))
}

async fn read_json(request: Request<Incoming>) -> Result<Value, Response<RpcBody>> {
  let body = read_body(request).await?;
  if body.is_empty() {
    return Ok(json!({}));
  }
  serde_json::from_slice(&body)
    .map_err(|err| detail_response(StatusCode::UNPROCESSABLE_ENTITY, format!("malformed JSON body: {err}")))
}

fn status_code(code: u16) -> StatusCode {
  StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn detail_response(status: StatusCode, detail: String) -> Response<RpcBody> {
  json_response(status, &json!({ "detail": detail }))
}

fn json_response(status: StatusCode, body: &Value) -> Response<RpcBody> {
  let mut response = Response::new(full(body.to_string()));
  *response.status_mut() = status;
  response.headers_mut().insert(
    CONTENT_TYPE,
    HeaderValue::from_static(mime::APPLICATION_JSON.as_ref()),
  );
  response
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_validation_reports_each_document() {
    let schema = json!({
      "type": "object",
      "properties": {"text": {"type": "string"}},
      "required": ["text"],
    });
    let docs = vec![json!({"text": "ok"}), json!({"text": 3}), json!({})];
    let messages = validate_docs(&schema, &docs).unwrap_err();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].starts_with("data[1]"));
    assert!(messages[1].starts_with("data[2]"));
  }

  #[test]
  fn test_empty_schema_accepts_anything() {
    assert!(validate_docs(&json!({}), &[json!({"x": 1})]).is_ok());
  }

  #[test]
  fn test_query_parameters_become_fields() {
    let doc = query_document(Some("id=q1&text=hello&k=3")).unwrap();
    assert_eq!(doc.id, "q1");
    assert_eq!(doc.get("text"), Some(&json!("hello")));
    assert_eq!(doc.get("k"), Some(&json!(3)));
  }

  #[test]
  fn test_malformed_escapes_are_kept_verbatim() {
    let doc = query_document(Some("id=q2&text=50%ZZoff")).unwrap();
    assert_eq!(doc.id, "q2");
    assert_eq!(doc.get("text"), Some(&json!("50%ZZoff")));
  }

  #[test]
  fn test_generator_body_without_data_is_the_document() {
    let input = generator_input(json!({"id": "q", "text": "hi"})).unwrap();
    let request = input.into_single_request("/generate").unwrap();
    let doc = request.data.doc.unwrap();
    assert_eq!(doc.id, "q");
    assert_eq!(doc.get("text"), Some(&json!("hi")));
    assert!(request.parameters.is_empty());
  }

  #[test]
  fn test_generator_body_with_bad_data_is_rejected() {
    let err = generator_input(json!({"data": 7, "parameters": "nope"})).unwrap_err();
    assert_eq!(err.kind_name(), "SerializationError");
  }
}
