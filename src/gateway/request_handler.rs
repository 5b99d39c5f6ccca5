//! # Gateway Request Handler
//!
//! Runs one client request through the topology graph. Endpoint discovery
//! happens on the first request and is shared by every later one. Floating
//! leaves are spawned on a task tracker so that they outlive the client and
//! can be awaited when the gateway closes.

use crate::error::GatewayError;
use crate::graph::{GraphRun, TopologyGraph};
use crate::message::{DataRequest, GATEWAY_ROUTE};
use crate::networking::ConnectionPool;
use crate::stream::{RequestHandler, StreamItem};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Executes requests over the topology graph.
pub struct GatewayRequestHandler {
  graph: Arc<TopologyGraph>,
  pool: Arc<ConnectionPool>,
  floating: TaskTracker,
}

impl GatewayRequestHandler {
  /// Creates a handler sending through `pool`.
  pub fn new(graph: Arc<TopologyGraph>, pool: Arc<ConnectionPool>) -> Self {
    Self {
      graph,
      pool,
      floating: TaskTracker::new(),
    }
  }

  /// The topology graph.
  pub fn graph(&self) -> &Arc<TopologyGraph> {
    &self.graph
  }

  /// The connection pool.
  pub fn pool(&self) -> &Arc<ConnectionPool> {
    &self.pool
  }

  /// Runs `request` through the graph.
  ///
  /// # Errors
  ///
  /// Discovery failures, an invalid target pattern and transport failures of
  /// the responding deployments. Executor failures come back as a response
  /// whose status is an error.
  pub async fn execute(&self, mut request: DataRequest) -> Result<DataRequest, GatewayError> {
    request.ensure_request_id();
    let request_id = request.request_id().to_string();
    let discovered = self.graph.discover(&self.pool).await?;

    let mut run = GraphRun::new(
      Arc::clone(&self.graph),
      Arc::clone(&self.pool),
      discovered,
      request,
    )?;
    for task in run.take_floating() {
      self.floating.spawn(task);
    }
    let response = run
      .finish()
      .await
      .map_err(|err| attach_request_id(err, &request_id))?;
    debug!(%request_id, docs = response.docs().len(), "request executed");
    Ok(response)
  }

  /// Runs `request` and folds any failure into the returned envelope.
  pub async fn execute_enveloped(&self, request: DataRequest) -> DataRequest {
    let mut fallback = request.clone();
    match self.execute(request).await {
      Ok(response) => response,
      Err(err) => {
        warn!(request_id = %fallback.request_id(), error = %err, "request failed");
        fallback.add_error(&err, GATEWAY_ROUTE);
        fallback
      }
    }
  }

  /// Number of floating tasks still running.
  pub fn floating_tasks(&self) -> usize {
    self.floating.len()
  }

  /// Waits for every floating task spawned so far.
  pub async fn close(&self) {
    self.floating.close();
    let pending = self.floating.len();
    if pending > 0 {
      info!(pending, "waiting for floating deployments");
    }
    self.floating.wait().await;
  }
}

fn attach_request_id(err: GatewayError, request_id: &str) -> GatewayError {
  match err {
    GatewayError::Rpc(rpc) if rpc.request_id.is_none() => GatewayError::Rpc(rpc.with_request_id(request_id)),
    other => other,
  }
}

#[async_trait]
impl RequestHandler for GatewayRequestHandler {
  async fn handle(&self, request: DataRequest) -> StreamItem {
    self.execute(request).await
  }
}
