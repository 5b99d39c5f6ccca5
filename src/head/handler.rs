//! # Head Request Handler
//!
//! Entry point of one deployment. A request goes through three stages:
//!
//! 1. `uses_before`, when configured, sees the partial requests first and its
//!    answer replaces them.
//! 2. The shards receive the request according to the endpoint's polling.
//! 3. `uses_after`, when configured, receives every shard response and its
//!    answer is the result. Otherwise shard responses are reduced, or their
//!    documents concatenated in shard order when reduction is disabled.
//!
//! Trailing metadata of every stage are merged, with `total_shards` and
//! `failed_shards` counters added.

use crate::config::{ConnectionPoolConfig, HeadConfig};
use crate::error::{GatewayError, RpcError};
use crate::message::{
  ControlCommand, ControlRequest, DataRequest, DocBatch, DocSchema, EndpointsInfo,
  SingleDocumentRequest,
};
use crate::networking::{
  ChannelFactory, ConnectionPool, DocStream, ENDPOINT_KEY, IS_ERROR_KEY, Metadata, Role,
  RpcService, SendOptions,
};
use crate::reduce::reduce_requests;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pool deployment name of the `uses_before` executor.
pub const USES_BEFORE: &str = "uses_before";

/// Pool deployment name of the `uses_after` executor.
pub const USES_AFTER: &str = "uses_after";

/// Metadata key counting the shards a request was sent to.
pub const TOTAL_SHARDS_KEY: &str = "total_shards";

/// Metadata key counting the shards that failed.
pub const FAILED_SHARDS_KEY: &str = "failed_shards";

/// Head of one deployment.
pub struct HeadRequestHandler {
  config: HeadConfig,
  pool: ConnectionPool,
  worker_endpoints: OnceCell<EndpointsInfo>,
}

impl HeadRequestHandler {
  /// Creates a head connected to every configured shard replica.
  ///
  /// # Errors
  ///
  /// Fails when the factory cannot create a channel for an address.
  pub async fn new(config: HeadConfig, factory: Arc<dyn ChannelFactory>) -> Result<Self, RpcError> {
    let pool_config = ConnectionPoolConfig::default()
      .with_compression(config.compression)
      .with_retries(config.retries);
    let pool = ConnectionPool::new(format!("head/{}", config.name), factory, pool_config);

    for (shard_id, addresses) in &config.connection_list {
      for address in addresses {
        pool
          .add_connection(&config.name, address, Role::Worker, Some(*shard_id))
          .await?;
      }
    }
    if let Some(address) = &config.uses_before {
      pool.add_connection(USES_BEFORE, address, Role::Worker, None).await?;
    }
    if let Some(address) = &config.uses_after {
      pool.add_connection(USES_AFTER, address, Role::Worker, None).await?;
    }
    info!(
      deployment = %config.name,
      shards = config.connection_list.len(),
      "head ready"
    );

    Ok(Self {
      config,
      pool,
      worker_endpoints: OnceCell::new(),
    })
  }

  /// Deployment name.
  pub fn name(&self) -> &str {
    &self.config.name
  }

  /// The pool reaching the shards.
  pub fn pool(&self) -> &ConnectionPool {
    &self.pool
  }

  fn send_options(&self, endpoint: &str) -> SendOptions {
    SendOptions::worker(None)
      .with_endpoint(endpoint)
      .with_timeout(self.config.timeout())
      .with_retries(self.config.retries)
  }

  /// Runs the partial requests of one logical request through the deployment.
  ///
  /// # Errors
  ///
  /// Transport failures of `uses_before`, of `uses_after`, or of every shard.
  pub async fn handle(
    &self,
    mut requests: Vec<DataRequest>,
    endpoint: &str,
  ) -> Result<(DataRequest, Metadata), GatewayError> {
    if requests.is_empty() {
      return Err(RpcError::invalid_argument("no request to process").into());
    }
    merge_routes(&mut requests);

    let mut before_metadata = None;
    if self.config.uses_before.is_some() {
      let (response, metadata) = self
        .pool
        .send_requests_once(requests, USES_BEFORE, self.send_options(endpoint))
        .await?;
      requests = vec![response];
      before_metadata = Some(metadata);
    }

    let polling = self.config.polling.for_endpoint(endpoint);
    let tasks = self
      .pool
      .send_requests(requests, &self.config.name, polling, self.send_options(endpoint))
      .await;
    let total_shards = tasks.len();

    let mut responses = Vec::with_capacity(total_shards);
    let mut shard_metadata = Vec::with_capacity(total_shards);
    let mut failures = Vec::new();
    for result in join_all(tasks).await {
      match result {
        Ok((response, metadata)) => {
          responses.push(response);
          shard_metadata.push(metadata);
        }
        Err(err) => failures.push(err),
      }
    }
    let failed_shards = failures.len();
    if failed_shards > 0 {
      warn!(
        deployment = %self.config.name,
        failed_shards,
        total_shards,
        "some shards failed"
      );
    }
    if responses.is_empty() {
      return Err(match failures.into_iter().next() {
        Some(err) => err.into(),
        None => GatewayError::NoResponse(format!(
          "head `{}` did not receive a response from its shards",
          self.config.name
        )),
      });
    }

    let mut after_metadata = None;
    let response = if self.config.uses_after.is_some() {
      let (response, metadata) = self
        .pool
        .send_requests_once(responses, USES_AFTER, self.send_options(endpoint))
        .await?;
      after_metadata = Some(metadata);
      response
    } else if responses.len() > 1 && self.config.reduce {
      let schema = self.output_schema(endpoint).await;
      let first_success = responses.iter().position(|r| !r.is_error()).unwrap_or(0);
      responses.swap(0, first_success);
      reduce_requests(responses, schema.as_ref())
        .ok_or_else(|| GatewayError::NoResponse("nothing to reduce".to_string()))?
    } else if responses.len() > 1 {
      let first_success = responses.iter().position(|r| !r.is_error()).unwrap_or(0);
      let docs: DocBatch = responses
        .iter()
        .flat_map(|r| r.docs().iter().cloned())
        .collect();
      let mut response = responses.swap_remove(first_success);
      response.replace_docs(docs);
      response
    } else {
      responses.swap_remove(0)
    };

    let mut metadata = before_metadata.unwrap_or_default();
    for shard in shard_metadata {
      metadata.extend(shard);
    }
    metadata.extend(after_metadata.unwrap_or_default());
    metadata.insert(TOTAL_SHARDS_KEY.to_string(), total_shards.to_string());
    metadata.insert(FAILED_SHARDS_KEY.to_string(), failed_shards.to_string());
    Ok((response, metadata))
  }

  async fn workers_endpoints(&self) -> Result<&EndpointsInfo, RpcError> {
    self
      .worker_endpoints
      .get_or_try_init(|| async {
        self
          .pool
          .send_discover_endpoint(
            &self.config.name,
            Role::Worker,
            None,
            self.config.timeout(),
            Some(self.config.retries),
          )
          .await
      })
      .await
  }

  /// Output schema of `endpoint` as discovered from the workers.
  async fn output_schema(&self, endpoint: &str) -> Option<DocSchema> {
    match self.workers_endpoints().await {
      Ok(info) => info.schema_for(endpoint).map(|s| s.output.doc_schema()),
      Err(err) => {
        debug!(deployment = %self.config.name, error = %err, "reducing without worker schema");
        None
      }
    }
  }

  /// Applies a membership command. `ACTIVATE` adds the related entities as
  /// shard replicas and `DEACTIVATE` removes them.
  ///
  /// # Errors
  ///
  /// Fails when a channel cannot be created for an activated entity.
  pub async fn process_control(&self, request: &ControlRequest) -> Result<(), RpcError> {
    match request.command {
      ControlCommand::Activate => {
        for entity in &request.related_entities {
          self
            .pool
            .add_connection(&self.config.name, &entity.host_port(), Role::Worker, entity.shard_id)
            .await?;
        }
      }
      ControlCommand::Deactivate => {
        for entity in &request.related_entities {
          self
            .pool
            .remove_connection(&self.config.name, &entity.host_port(), Role::Worker, entity.shard_id)
            .await;
        }
      }
      ControlCommand::Status | ControlCommand::Terminate => {}
    }
    Ok(())
  }

  /// Warms up the channels of every shard and of `uses_before`/`uses_after`.
  pub async fn warmup(&self, cancel: CancellationToken) {
    let mut deployments = vec![self.config.name.as_str()];
    if self.config.uses_before.is_some() {
      deployments.push(USES_BEFORE);
    }
    if self.config.uses_after.is_some() {
      deployments.push(USES_AFTER);
    }
    join_all(
      deployments
        .into_iter()
        .map(|deployment| self.pool.warmup(deployment, cancel.clone())),
    )
    .await;
  }

  /// Closes every channel.
  pub async fn close(&self) {
    debug!(deployment = %self.config.name, "closing head");
    self.pool.close().await;
  }
}

/// Appends to the first request the routes of the other ones whose executor it
/// does not know yet.
pub fn merge_routes(requests: &mut [DataRequest]) {
  let Some((first, rest)) = requests.split_first_mut() else {
    return;
  };
  let mut known: HashSet<String> = first.routes.iter().map(|r| r.executor.clone()).collect();
  for request in rest {
    for route in &request.routes {
      if known.insert(route.executor.clone()) {
        first.routes.push(route.clone());
      }
    }
  }
}

#[async_trait]
impl RpcService for HeadRequestHandler {
  async fn process_data(
    &self,
    requests: Vec<DataRequest>,
    metadata: Metadata,
  ) -> Result<(DataRequest, Metadata), RpcError> {
    let Some(first) = requests.first() else {
      return Err(RpcError::invalid_argument("no request to process"));
    };
    let endpoint = metadata
      .get(ENDPOINT_KEY)
      .cloned()
      .unwrap_or_else(|| first.endpoint().to_string());
    let mut fallback = first.clone();
    debug!(deployment = %self.config.name, %endpoint, parts = requests.len(), "head received request");

    match self.handle(requests, &endpoint).await {
      Ok(result) => Ok(result),
      Err(GatewayError::Rpc(err)) => {
        error!(deployment = %self.config.name, error = %err, "shards unreachable");
        Err(err.with_request_id(fallback.request_id().to_string()))
      }
      Err(err) => {
        error!(deployment = %self.config.name, error = %err, "head failed to process request");
        fallback.add_error(&err, &self.config.name);
        let mut metadata = Metadata::new();
        metadata.insert(IS_ERROR_KEY.to_string(), "true".to_string());
        Ok((fallback, metadata))
      }
    }
  }

  async fn stream_single_document(
    &self,
    request: SingleDocumentRequest,
    _metadata: Metadata,
  ) -> Result<DocStream, RpcError> {
    let endpoint = request.endpoint().to_string();
    self
      .pool
      .send_single_document_request(request, &self.config.name, self.send_options(&endpoint))
      .await
  }

  async fn endpoint_discovery(&self) -> Result<EndpointsInfo, RpcError> {
    let mut info = EndpointsInfo::default();
    for (configured, deployment) in [
      (self.config.uses_before.is_some(), USES_BEFORE),
      (self.config.uses_after.is_some(), USES_AFTER),
    ] {
      if configured {
        let other = self
          .pool
          .send_discover_endpoint(deployment, Role::Worker, None, self.config.timeout(), None)
          .await?;
        info.endpoints.extend(other.endpoints);
      }
    }
    let workers = self.workers_endpoints().await?.clone();
    info.merge(workers);
    Ok(info)
  }
}
