//! # Envelope Test Suite
//!
//! Serialization round trips of every envelope plus the header helpers.

use crate::error::ExecutorError;
use crate::message::{
  ControlCommand, ControlRequest, DataRequest, Document, RelatedEntity, Route,
  SingleDocumentRequest, StatusCode, StatusInfo,
};
use serde_json::json;

fn sample_request() -> DataRequest {
  let mut req = DataRequest::new()
    .with_endpoint("/search")
    .with_target_executor("enc.*")
    .with_parameters(json!({"top_k": 3}).as_object().cloned().unwrap())
    .with_docs(vec![
      Document::with_id("a").with_field("text", "hello"),
      Document::with_id("b").with_field("tags", json!({"key": 5})),
    ]);
  req.add_route("gateway").finish();
  req.results.insert("encoder".into(), json!({"took": 1}));
  req
}

#[test]
fn test_data_request_round_trip() {
  let req = sample_request();
  let json = serde_json::to_string(&req).unwrap();
  let back: DataRequest = serde_json::from_str(&json).unwrap();
  assert_eq!(back, req);
  assert_eq!(serde_json::to_string(&back).unwrap(), json);
}

#[test]
fn test_single_document_request_round_trip() {
  let req = SingleDocumentRequest::new(Document::with_id("x").with_field("n", 1)).with_endpoint("/gen");
  let back: SingleDocumentRequest = serde_json::from_value(serde_json::to_value(&req).unwrap()).unwrap();
  assert_eq!(back, req);
  assert_eq!(back.endpoint(), "/gen");
}

#[test]
fn test_control_request_round_trip() {
  let mut req = ControlRequest::new(ControlCommand::Activate);
  req.related_entities.push(RelatedEntity {
    id: "w0".into(),
    address: "127.0.0.1".into(),
    port: 9000,
    shard_id: Some(1),
  });
  let value = serde_json::to_value(&req).unwrap();
  assert_eq!(value["command"], "ACTIVATE");
  let back: ControlRequest = serde_json::from_value(value).unwrap();
  assert_eq!(back, req);
  assert_eq!(back.related_entities[0].host_port(), "127.0.0.1:9000");
}

#[test]
fn test_status_info_wire_names() {
  let info = StatusInfo::current();
  let value = serde_json::to_value(&info).unwrap();
  assert!(value.get("jina_version_info").is_some());
  assert!(value.get("env_info").is_some());
}

#[test]
fn test_empty_endpoint_is_default() {
  let req = DataRequest::new();
  assert_eq!(req.endpoint(), "/default");
  assert_eq!(req.request_id().len(), 32);
}

#[test]
fn test_add_exception_marks_route_and_header() {
  let mut req = DataRequest::new();
  req.add_route("encoder");
  req.add_exception(ExecutorError::new("ValueError", "bad input").with_executor("encoder"));

  assert!(req.is_error());
  assert_eq!(req.header.status.code, StatusCode::Error);
  assert!(req.routes[0].status.as_ref().unwrap().is_error());
  let err = req.executor_error().unwrap();
  assert_eq!(err.name, "ValueError");
  assert_eq!(err.executor, "encoder");
}

#[test]
fn test_route_end_time_is_set_once() {
  let mut route = Route::start("a");
  route.finish();
  let first = route.end_time;
  std::thread::sleep(std::time::Duration::from_millis(2));
  route.finish();
  assert_eq!(route.end_time, first);
}
