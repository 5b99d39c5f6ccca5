//! # Connection Pool
//!
//! Long-lived channels to every deployment, keyed by deployment, role and
//! shard. Each call picks a replica round-robin and retries transient
//! failures on the next replica that was not tried yet.
//!
//! ## Retry policy
//!
//! - Only `Unavailable` is retried; every other code propagates at once.
//! - A negative budget means `max(3, replicas)` retries.
//! - After a retryable failure the replica's channel is recreated in place.
//! - The final error lists every address that was tried.

use super::channel::{CallOptions, ChannelFactory, DocStream, Metadata};
use super::pool_map::{ConnectionPoolMap, Role};
use super::replica_list::{Replica, ReplicaList};
use crate::config::ConnectionPoolConfig;
use crate::error::RpcError;
use crate::head::PollingType;
use crate::message::{DataRequest, EndpointsInfo, SingleDocumentRequest};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one send: the response and its trailing metadata.
pub type SendResult = Result<(DataRequest, Metadata), RpcError>;

/// A send that has been prepared but not awaited yet.
pub type SendTask = BoxFuture<'static, SendResult>;

const WARMUP_STATUS_TIMEOUT: Duration = Duration::from_millis(500);
const WARMUP_ROUND_DELAY: Duration = Duration::from_millis(200);

/// Options of a pool send.
#[derive(Debug, Clone)]
pub struct SendOptions {
  /// Role of the destination.
  pub role: Role,
  /// Shard to send to. `None` rotates through the shards.
  pub shard_id: Option<u32>,
  /// Endpoint forwarded as call metadata.
  pub endpoint: Option<String>,
  /// Extra call metadata.
  pub metadata: Metadata,
  /// Deadline of each attempt.
  pub timeout: Option<Duration>,
  /// Retry budget, overriding the pool default.
  pub retries: Option<i32>,
}

impl Default for SendOptions {
  fn default() -> Self {
    Self {
      role: Role::Head,
      shard_id: None,
      endpoint: None,
      metadata: Metadata::new(),
      timeout: None,
      retries: None,
    }
  }
}

impl SendOptions {
  /// Options for a worker of the given shard.
  pub fn worker(shard_id: Option<u32>) -> Self {
    Self {
      role: Role::Worker,
      shard_id,
      ..Self::default()
    }
  }

  /// Sets the endpoint.
  #[must_use]
  pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.endpoint = Some(endpoint.into());
    self
  }

  /// Sets the deadline.
  #[must_use]
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  /// Sets the retry budget.
  #[must_use]
  pub fn with_retries(mut self, retries: i32) -> Self {
    self.retries = Some(retries);
    self
  }

  /// Sets the call metadata.
  #[must_use]
  pub fn with_metadata(mut self, metadata: Metadata) -> Self {
    self.metadata = metadata;
    self
  }
}

#[derive(Clone)]
struct RetryPolicy {
  retries: i32,
  delay: Duration,
}

/// Pool of channels to every deployment.
pub struct ConnectionPool {
  runtime_name: String,
  config: ConnectionPoolConfig,
  connections: ConnectionPoolMap,
}

impl ConnectionPool {
  /// Creates an empty pool.
  #[must_use]
  pub fn new(
    runtime_name: impl Into<String>,
    factory: Arc<dyn ChannelFactory>,
    config: ConnectionPoolConfig,
  ) -> Self {
    Self {
      runtime_name: runtime_name.into(),
      config,
      connections: ConnectionPoolMap::new(factory),
    }
  }

  /// Pool configuration.
  pub fn config(&self) -> &ConnectionPoolConfig {
    &self.config
  }

  /// Adds a replica. Idempotent.
  pub async fn add_connection(
    &self,
    deployment: &str,
    address: &str,
    role: Role,
    shard_id: Option<u32>,
  ) -> Result<(), RpcError> {
    debug!(runtime = %self.runtime_name, %deployment, %address, ?role, ?shard_id, "adding connection");
    self
      .connections
      .add_connection(deployment, address, role, shard_id)
      .await
  }

  /// Removes a replica and closes its channel within the grace period.
  pub async fn remove_connection(
    &self,
    deployment: &str,
    address: &str,
    role: Role,
    shard_id: Option<u32>,
  ) {
    if let Some(channel) = self
      .connections
      .remove_connection(deployment, address, role, shard_id)
      .await
    {
      debug!(runtime = %self.runtime_name, %deployment, %address, "removing connection");
      channel.close(self.config.close_grace).await;
    }
  }

  fn policy(&self, retries: Option<i32>) -> RetryPolicy {
    RetryPolicy {
      retries: retries.unwrap_or(self.config.retries),
      delay: self.config.retry_delay,
    }
  }

  fn call_options(&self, options: &SendOptions) -> CallOptions {
    CallOptions {
      endpoint: options.endpoint.clone(),
      metadata: options.metadata.clone(),
      timeout: options.timeout,
      compression: self.config.compression,
    }
  }

  async fn replicas_for(
    &self,
    deployment: &str,
    role: Role,
    shard_id: Option<u32>,
  ) -> Result<Arc<ReplicaList>, RpcError> {
    self
      .connections
      .get_replicas(deployment, role, shard_id, true)
      .await
      .ok_or_else(|| no_connections(deployment, role, shard_id))
  }

  /// Sends `requests` to one replica of `deployment` and awaits the answer.
  pub async fn send_requests_once(
    &self,
    requests: Vec<DataRequest>,
    deployment: &str,
    options: SendOptions,
  ) -> SendResult {
    let replicas = self.replicas_for(deployment, options.role, options.shard_id).await?;
    send_to_replicas(
      replicas,
      requests,
      self.call_options(&options),
      self.policy(options.retries),
    )
    .await
  }

  /// Prepares the sends of one request according to `polling`.
  ///
  /// `ALL` yields one task per shard in shard order, `ANY` a single task to
  /// the requested shard or to the next one in rotation.
  pub async fn send_requests(
    &self,
    requests: Vec<DataRequest>,
    deployment: &str,
    polling: PollingType,
    options: SendOptions,
  ) -> Vec<SendTask> {
    let call_options = self.call_options(&options);
    let policy = self.policy(options.retries);
    let lists = match (polling, options.shard_id) {
      (PollingType::All, None) => self.connections.get_replicas_all_shards(deployment).await,
      _ => match self.replicas_for(deployment, options.role, options.shard_id).await {
        Ok(list) => vec![list],
        Err(err) => return vec![futures::future::ready(Err(err)).boxed()],
      },
    };
    if lists.is_empty() {
      let err = no_connections(deployment, options.role, None);
      return vec![futures::future::ready(Err(err)).boxed()];
    }
    lists
      .into_iter()
      .map(|list| send_to_replicas(list, requests.clone(), call_options.clone(), policy.clone()).boxed())
      .collect()
  }

  /// Asks one replica of `deployment` for its endpoints.
  pub async fn send_discover_endpoint(
    &self,
    deployment: &str,
    role: Role,
    shard_id: Option<u32>,
    timeout: Option<Duration>,
    retries: Option<i32>,
  ) -> Result<EndpointsInfo, RpcError> {
    let replicas = self
      .connections
      .get_replicas(deployment, role, shard_id, false)
      .await
      .ok_or_else(|| no_connections(deployment, role, shard_id))?;
    with_retries(replicas, self.policy(retries), String::new(), move |replica| async move {
      replica.channel.send_discover_endpoint(timeout).await
    })
    .await
  }

  /// Opens a document stream on one replica of `deployment`.
  ///
  /// The retry policy applies until the stream is opened.
  pub async fn send_single_document_request(
    &self,
    request: SingleDocumentRequest,
    deployment: &str,
    options: SendOptions,
  ) -> Result<DocStream, RpcError> {
    let replicas = self.replicas_for(deployment, options.role, options.shard_id).await?;
    let call_options = self.call_options(&options);
    let request_id = request.header.request_id.clone();
    with_retries(replicas, self.policy(options.retries), request_id, move |replica| {
      let request = request.clone();
      let call_options = call_options.clone();
      async move { replica.channel.send_single_document(request, &call_options).await }
    })
    .await
  }

  /// Warms up every replica of `deployment` by exchanging `status` calls until
  /// each replica answered, the warmup timeout elapsed, or `cancel` fired.
  pub async fn warmup(&self, deployment: &str, cancel: CancellationToken) {
    let deadline = Instant::now() + self.config.warmup_timeout;
    let mut pending: Vec<Replica> = self
      .connections
      .all_replica_lists(deployment)
      .await
      .iter()
      .flat_map(|list| list.all_connections())
      .collect();

    while !pending.is_empty() && Instant::now() < deadline && !cancel.is_cancelled() {
      let round = join_all(
        pending
          .iter()
          .map(|replica| replica.channel.send_status(Some(WARMUP_STATUS_TIMEOUT))),
      );
      let results = tokio::select! {
        results = round => results,
        _ = cancel.cancelled() => break,
      };
      pending = pending
        .into_iter()
        .zip(results)
        .filter_map(|(replica, result)| result.is_err().then_some(replica))
        .collect();
      if pending.is_empty() {
        break;
      }
      tokio::select! {
        _ = tokio::time::sleep(WARMUP_ROUND_DELAY) => {}
        _ = cancel.cancelled() => break,
      }
    }

    if pending.is_empty() {
      info!(runtime = %self.runtime_name, %deployment, "warmup finished");
    } else {
      debug!(runtime = %self.runtime_name, %deployment, pending = pending.len(), "warmup stopped early");
    }
  }

  /// Names of the deployments with at least one connection.
  pub async fn deployments(&self) -> Vec<String> {
    self.connections.deployments().await
  }

  /// Closes every channel.
  pub async fn close(&self) {
    self.connections.close(self.config.close_grace).await;
  }
}

fn no_connections(deployment: &str, role: Role, shard_id: Option<u32>) -> RpcError {
  let target = match shard_id {
    Some(id) => format!("shard {id} of `{deployment}`"),
    None => format!("`{deployment}`"),
  };
  let role = match role {
    Role::Head => "head",
    Role::Worker => "worker",
  };
  RpcError::unavailable(format!("no {role} connections available for {target}"))
}

async fn send_to_replicas(
  replicas: Arc<ReplicaList>,
  requests: Vec<DataRequest>,
  options: CallOptions,
  policy: RetryPolicy,
) -> SendResult {
  let request_id = requests
    .first()
    .map(|r| r.header.request_id.clone())
    .unwrap_or_default();
  with_retries(replicas, policy, request_id, move |replica| {
    let requests = requests.clone();
    let options = options.clone();
    async move { replica.channel.send_requests(requests, &options).await }
  })
  .await
}

async fn with_retries<T, F, Fut>(
  replicas: Arc<ReplicaList>,
  policy: RetryPolicy,
  request_id: String,
  mut call: F,
) -> Result<T, RpcError>
where
  F: FnMut(Replica) -> Fut,
  Fut: Future<Output = Result<T, RpcError>>,
{
  let budget = if policy.retries < 0 {
    replicas.len().max(3)
  } else {
    policy.retries as usize
  };
  let mut tried: Vec<String> = Vec::new();
  let mut attempt = 0usize;

  loop {
    let Some(replica) = replicas.next_untried(&tried) else {
      return Err(
        RpcError::unavailable(format!("no replicas left for `{}`", replicas.deployment()))
          .with_dest_addr(tried)
          .with_request_id(request_id),
      );
    };
    if !tried.contains(&replica.address) {
      tried.push(replica.address.clone());
    }

    let err = match call(replica.clone()).await {
      Ok(value) => return Ok(value),
      Err(err) => err,
    };

    if !err.code.is_retryable() {
      return Err(err.with_dest_addr(tried).with_request_id(request_id));
    }

    replicas.reset_connection(&replica.address);
    if attempt >= budget {
      warn!(
        deployment = %replicas.deployment(),
        address = %replica.address,
        attempts = attempt + 1,
        error = %err,
        "giving up after retries"
      );
      let attempts = attempt + 1;
      return Err(
        err
          .with_context(format!(" after {attempts} attempt(s)"))
          .with_dest_addr(tried)
          .with_request_id(request_id),
      );
    }
    debug!(
      deployment = %replicas.deployment(),
      address = %replica.address,
      attempt,
      error = %err,
      "retrying transient failure"
    );
    attempt += 1;
    if !policy.delay.is_zero() {
      tokio::time::sleep(policy.delay).await;
    }
  }
}
