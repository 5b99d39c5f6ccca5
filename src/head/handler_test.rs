//! # Head Request Handler Test Suite
//!
//! Shards, `uses_before` and `uses_after` are stub services served over the
//! in-process transport.

use crate::config::HeadConfig;
use crate::error::{ExecutorError, RpcCode, RpcError};
use crate::head::{HeadRequestHandler, PollingConfig, PollingType};
use crate::message::{
  ControlCommand, ControlRequest, DataRequest, Document, EndpointSchema, EndpointsInfo,
  ModelSchema, RelatedEntity,
};
use crate::networking::{ENDPOINT_KEY, LocalChannelFactory, Metadata, RpcService};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Appends a document named after itself and reports itself in the trailing
/// metadata.
struct Stub {
  name: &'static str,
  fails: bool,
}

impl Stub {
  fn ok(name: &'static str) -> Arc<Self> {
    Arc::new(Self { name, fails: false })
  }

  fn failing(name: &'static str) -> Arc<Self> {
    Arc::new(Self { name, fails: true })
  }
}

#[async_trait]
impl RpcService for Stub {
  async fn process_data(
    &self,
    requests: Vec<DataRequest>,
    _metadata: Metadata,
  ) -> Result<(DataRequest, Metadata), RpcError> {
    let parts = requests.len();
    let mut request = requests.into_iter().next().unwrap_or_default();
    request
      .docs_mut()
      .push(Document::with_id(self.name).with_field("parts", parts));
    request.add_route(self.name).finish();
    if self.fails {
      request.add_exception(ExecutorError::new("ValueError", "bad input").with_executor(self.name));
    }
    let mut metadata = Metadata::new();
    metadata.insert(self.name.to_string(), "seen".to_string());
    Ok((request, metadata))
  }

  async fn endpoint_discovery(&self) -> Result<EndpointsInfo, RpcError> {
    let mut info = EndpointsInfo::default();
    info.endpoints.push(format!("/{}", self.name));
    info.schemas.insert(
      format!("/{}", self.name),
      EndpointSchema {
        input: ModelSchema::new("Doc", json!({"type": "object"})),
        output: ModelSchema::new("Doc", json!({"type": "object"})),
        ..EndpointSchema::default()
      },
    );
    Ok(info)
  }
}

fn ids(request: &DataRequest) -> Vec<String> {
  request.docs().ids()
}

fn search_request() -> DataRequest {
  DataRequest::new()
    .with_endpoint("/search")
    .with_docs(vec![Document::with_id("q")])
}

fn endpoint_metadata(endpoint: &str) -> Metadata {
  let mut metadata = Metadata::new();
  metadata.insert(ENDPOINT_KEY.to_string(), endpoint.to_string());
  metadata
}

async fn head(factory: &LocalChannelFactory, config: HeadConfig) -> HeadRequestHandler {
  HeadRequestHandler::new(config, Arc::new(factory.clone()))
    .await
    .unwrap()
}

#[tokio::test]
async fn test_search_broadcasts_and_reduces() {
  let factory = LocalChannelFactory::new();
  factory.register("s0:1", Stub::ok("s0"));
  factory.register("s1:1", Stub::ok("s1"));
  let config = HeadConfig::new("dep")
    .with_shard_replica(0, "s0:1")
    .with_shard_replica(1, "s1:1");
  let head = head(&factory, config).await;

  let (response, metadata) = head
    .process_data(vec![search_request()], endpoint_metadata("/search"))
    .await
    .unwrap();
  assert_eq!(ids(&response), vec!["q", "s0", "s1"]);
  assert_eq!(metadata["total_shards"], "2");
  assert_eq!(metadata["failed_shards"], "0");
  assert_eq!(metadata["s0"], "seen");
  assert_eq!(metadata["s1"], "seen");
  assert_eq!(factory.total_calls(), 2);
}

#[tokio::test]
async fn test_index_goes_to_one_shard() {
  let factory = LocalChannelFactory::new();
  factory.register("s0:1", Stub::ok("s0"));
  factory.register("s1:1", Stub::ok("s1"));
  let config = HeadConfig::new("dep")
    .with_shard_replica(0, "s0:1")
    .with_shard_replica(1, "s1:1");
  let head = head(&factory, config).await;

  let (_, metadata) = head
    .process_data(
      vec![DataRequest::new().with_endpoint("/index")],
      endpoint_metadata("/index"),
    )
    .await
    .unwrap();
  assert_eq!(metadata["total_shards"], "1");
  assert_eq!(factory.total_calls(), 1);
}

#[tokio::test]
async fn test_without_reduce_docs_concatenate_in_shard_order() {
  let factory = LocalChannelFactory::new();
  factory.register("s0:1", Stub::ok("s0"));
  factory.register("s1:1", Stub::ok("s1"));
  let config = HeadConfig::new("dep")
    .with_shard_replica(1, "s1:1")
    .with_shard_replica(0, "s0:1")
    .with_polling(PollingConfig::uniform(PollingType::All))
    .with_reduce(false);
  let head = head(&factory, config).await;

  let (response, _) = head
    .process_data(vec![search_request()], Metadata::new())
    .await
    .unwrap();
  assert_eq!(ids(&response), vec!["q", "s0", "q", "s1"]);
}

#[tokio::test]
async fn test_first_successful_shard_response_is_kept() {
  let factory = LocalChannelFactory::new();
  factory.register("s0:1", Stub::failing("s0"));
  factory.register("s1:1", Stub::ok("s1"));
  let config = HeadConfig::new("dep")
    .with_shard_replica(0, "s0:1")
    .with_shard_replica(1, "s1:1");
  let head = head(&factory, config).await;

  let (response, _) = head
    .process_data(vec![search_request()], endpoint_metadata("/search"))
    .await
    .unwrap();
  assert!(!response.is_error());
  assert_eq!(ids(&response), vec!["q", "s1", "s0"]);
}

#[tokio::test]
async fn test_failed_shards_are_counted() {
  let factory = LocalChannelFactory::new();
  factory.register("s0:1", Stub::ok("s0"));
  factory.fail("s1:1", RpcCode::Unavailable, None);
  let mut config = HeadConfig::new("dep")
    .with_shard_replica(0, "s0:1")
    .with_shard_replica(1, "s1:1");
  config.retries = 0;
  let head = head(&factory, config).await;

  let (response, metadata) = head
    .process_data(vec![search_request()], endpoint_metadata("/search"))
    .await
    .unwrap();
  assert_eq!(ids(&response), vec!["q", "s0"]);
  assert_eq!(metadata["total_shards"], "2");
  assert_eq!(metadata["failed_shards"], "1");
}

#[tokio::test]
async fn test_all_shards_failing_propagates_the_transport_error() {
  let factory = LocalChannelFactory::new();
  factory.fail("s0:1", RpcCode::DeadlineExceeded, None);
  let config = HeadConfig::new("dep").with_shard_replica(0, "s0:1");
  let head = head(&factory, config).await;

  let request = search_request().with_request_id("r-7");
  let err = head
    .process_data(vec![request], endpoint_metadata("/search"))
    .await
    .unwrap_err();
  assert_eq!(err.code, RpcCode::DeadlineExceeded);
  assert_eq!(err.request_id.as_deref(), Some("r-7"));
}

#[tokio::test]
async fn test_uses_before_and_after() {
  let factory = LocalChannelFactory::new();
  factory.register("before:1", Stub::ok("before"));
  factory.register("after:1", Stub::ok("after"));
  factory.register("s0:1", Stub::ok("s0"));
  factory.register("s1:1", Stub::ok("s1"));
  let config = HeadConfig::new("dep")
    .with_shard_replica(0, "s0:1")
    .with_shard_replica(1, "s1:1")
    .with_uses_before("before:1")
    .with_uses_after("after:1");
  let head = head(&factory, config).await;

  let (response, metadata) = head
    .process_data(vec![search_request()], endpoint_metadata("/search"))
    .await
    .unwrap();
  // uses_after answers with the first shard response plus its own document.
  assert_eq!(ids(&response), vec!["q", "before", "s0", "after"]);
  let after = response.docs().get_by_id("after").unwrap();
  assert_eq!(after.get("parts"), Some(&json!(2)));
  for key in ["before", "s0", "s1", "after"] {
    assert_eq!(metadata[key], "seen");
  }
}

#[tokio::test]
async fn test_partial_requests_merge_routes() {
  let factory = LocalChannelFactory::new();
  factory.register("s0:1", Stub::ok("s0"));
  let config = HeadConfig::new("dep").with_shard_replica(0, "s0:1");
  let head = head(&factory, config).await;

  let mut left = DataRequest::new();
  left.add_route("gateway").finish();
  left.add_route("a").finish();
  let mut right = DataRequest::new();
  right.add_route("gateway").finish();
  right.add_route("b").finish();

  let (response, _) = head
    .process_data(vec![left, right], endpoint_metadata("/index"))
    .await
    .unwrap();
  let executors: Vec<&str> = response.routes.iter().map(|r| r.executor.as_str()).collect();
  assert_eq!(executors, vec!["gateway", "a", "b", "s0"]);
}

#[tokio::test]
async fn test_activate_and_deactivate_shards() {
  let factory = LocalChannelFactory::new();
  factory.register("s0:1", Stub::ok("s0"));
  let head = head(&factory, HeadConfig::new("dep")).await;

  let mut activate = ControlRequest::new(ControlCommand::Activate);
  activate.related_entities.push(RelatedEntity {
    id: "w0".into(),
    address: "s0".into(),
    port: 1,
    shard_id: Some(0),
  });
  head.process_control(&activate).await.unwrap();
  assert!(
    head
      .process_data(vec![search_request()], endpoint_metadata("/search"))
      .await
      .is_ok()
  );

  let mut deactivate = activate.clone();
  deactivate.command = ControlCommand::Deactivate;
  head.process_control(&deactivate).await.unwrap();
  assert!(head.pool().deployments().await.is_empty());
}

#[tokio::test]
async fn test_endpoint_discovery_merges_every_stage() {
  let factory = LocalChannelFactory::new();
  factory.register("before:1", Stub::ok("before"));
  factory.register("s0:1", Stub::ok("s0"));
  let config = HeadConfig::new("dep")
    .with_shard_replica(0, "s0:1")
    .with_uses_before("before:1");
  let head = head(&factory, config).await;

  let info = head.endpoint_discovery().await.unwrap();
  assert!(info.binds("/before"));
  assert!(info.binds("/s0"));
  assert!(info.schemas.contains_key("/s0"));
  assert!(!info.schemas.contains_key("/before"));
}
