//! # Graph Execution
//!
//! Runs one request through a compiled [`TopologyGraph`].
//!
//! Every reachable deployment becomes a shared future that awaits the
//! responses of its upstream nodes, prepares the partial requests and sends
//! them to the deployment's head. Node futures are built in topological
//! order, so each one only has to clone the shared futures of its
//! predecessors; a node with several downstream nodes is still sent once.
//!
//! ## Node step
//!
//! 1. A part whose metadata reports `is-error` is passed through untouched.
//! 2. A node that does not serve the endpoint, or is not matched by the
//!    request's `target_executor` pattern, passes its reduced input through.
//! 3. The node's filter condition is applied to every part, then the parts
//!    are reduced unless the node opted out.
//! 4. Parameters are scoped to the deployment, the request is sent, and the
//!    client parameters are restored on the response.
//!
//! ## Response
//!
//! The response is the first response among the nodes feeding
//! `end-gateway` and the non-floating leaves. Floating leaves run detached
//! and are handed back to the caller to spawn.

use super::graph::{DiscoveredEndpoints, TopologyGraph, Upstream};
use super::node::NodeId;
use crate::error::{GatewayError, GraphError, RpcCode, RpcError};
use crate::message::params::scope_parameters;
use crate::message::{DataRequest, GATEWAY_ROUTE, Parameters, Route, Status};
use crate::networking::{ConnectionPool, IS_ERROR_KEY, Metadata, Role, SendOptions};
use crate::reduce::reduce_requests;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared, try_join_all};
use futures::FutureExt;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Response of one node and its trailing metadata.
pub type NodeResult = Result<(DataRequest, Metadata), GatewayError>;

type NodeTask = Shared<BoxFuture<'static, NodeResult>>;

/// What happened to one node while serving a request.
#[derive(Debug, Clone, Default)]
struct NodeState {
  start: Option<DateTime<Utc>>,
  end: Option<DateTime<Utc>>,
  status: Option<Status>,
  results: BTreeMap<String, Value>,
}

struct RunContext {
  graph: Arc<TopologyGraph>,
  pool: Arc<ConnectionPool>,
  discovered: Arc<DiscoveredEndpoints>,
  endpoint: String,
  target: Option<Regex>,
  parameters: Parameters,
  states: Mutex<Vec<NodeState>>,
}

impl RunContext {
  fn update(&self, id: NodeId, f: impl FnOnce(&mut NodeState)) {
    if let Ok(mut states) = self.states.lock() {
      f(&mut states[id]);
    }
  }

  fn serves(&self, name: &str) -> bool {
    let accepted = self
      .discovered
      .get(name)
      .is_none_or(|info| info.accepts(&self.endpoint));
    let targeted = self.target.as_ref().is_none_or(|re| re.is_match(name));
    accepted && targeted
  }
}

/// One request in flight through the graph.
pub struct GraphRun {
  context: Arc<RunContext>,
  request: DataRequest,
  responding: Vec<NodeTask>,
  floating: Vec<(String, NodeTask)>,
  initial_ids: Vec<String>,
}

/// Compiles the target-executor pattern of a request, anchored at the start
/// of the deployment name.
///
/// # Errors
///
/// [`GraphError::InvalidPattern`] when the pattern does not compile.
pub fn target_pattern(pattern: &str) -> Result<Option<Regex>, GraphError> {
  if pattern.is_empty() {
    return Ok(None);
  }
  Regex::new(&format!("^(?:{pattern})"))
    .map(Some)
    .map_err(|err| GraphError::InvalidPattern {
      pattern: pattern.to_string(),
      reason: err.to_string(),
    })
}

impl GraphRun {
  /// Prepares the execution of `request`. Nothing is sent until the run is
  /// awaited with [`GraphRun::finish`] or its floating tasks are spawned.
  ///
  /// # Errors
  ///
  /// An invalid `target_executor` pattern.
  pub fn new(
    graph: Arc<TopologyGraph>,
    pool: Arc<ConnectionPool>,
    discovered: Arc<DiscoveredEndpoints>,
    mut request: DataRequest,
  ) -> Result<Self, GraphError> {
    request.add_route(GATEWAY_ROUTE);
    let target = target_pattern(&request.header.target_executor)?;
    request.header.target_executor.clear();

    let initial_ids = if graph.has_filter_conditions() {
      request.docs().ids()
    } else {
      Vec::new()
    };

    let context = Arc::new(RunContext {
      endpoint: request.endpoint().to_string(),
      target,
      parameters: request.parameters.clone(),
      states: Mutex::new(vec![NodeState::default(); graph.nodes().len()]),
      graph,
      pool,
      discovered,
    });

    let tasks = build_tasks(&context, &request);
    let graph = &context.graph;
    let mut responding = Vec::new();
    let mut floating = Vec::new();
    let feeds_end: HashSet<NodeId> = graph
      .end()
      .map(|end| {
        graph
          .upstreams(end)
          .iter()
          .filter_map(|up| match up {
            Upstream::Node(id) => Some(*id),
            Upstream::Gateway => None,
          })
          .collect()
      })
      .unwrap_or_default();

    for id in graph.depth_first() {
      let Some(task) = tasks[id].clone() else {
        continue;
      };
      let node = graph.node(id);
      if node.floating {
        floating.push((node.name.clone(), task));
      } else if feeds_end.contains(&id) || node.is_leaf() {
        responding.push(task);
      }
    }

    Ok(Self {
      context,
      request,
      responding,
      floating,
      initial_ids,
    })
  }

  /// Takes the floating leaves of the run. Their responses are discarded and
  /// their failures only logged.
  pub fn take_floating(&mut self) -> Vec<BoxFuture<'static, ()>> {
    std::mem::take(&mut self.floating)
      .into_iter()
      .map(|(name, task)| {
        async move {
          if let Err(err) = task.await {
            warn!(deployment = %name, error = %err, "floating deployment failed");
          }
        }
        .boxed()
      })
      .collect()
  }

  /// Awaits the responding nodes and assembles the response.
  ///
  /// # Errors
  ///
  /// The first transport failure among the responding nodes.
  pub async fn finish(self) -> Result<DataRequest, GatewayError> {
    let Self {
      context,
      request,
      responding,
      initial_ids,
      ..
    } = self;

    if responding.is_empty() {
      let mut request = request;
      if let Some(route) = request.routes.first_mut() {
        route.finish();
      }
      return Ok(request);
    }

    let responses = try_join_all(responding).await?;
    let mut response = responses
      .into_iter()
      .next()
      .map(|(response, _)| response)
      .unwrap_or(request);

    let states = context
      .states
      .lock()
      .map(|states| states.clone())
      .unwrap_or_default();
    merge_routes(&context.graph, &states, &mut response);

    if !initial_ids.is_empty() {
      let position: HashMap<&str, usize> = initial_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
      response
        .docs_mut()
        .sort_by_key(|doc| position.get(doc.id.as_str()).copied().unwrap_or(usize::MAX));
    }

    for state in &states {
      for (key, value) in &state.results {
        response.results.insert(key.clone(), value.clone());
      }
    }
    Ok(response)
  }
}

fn build_tasks(context: &Arc<RunContext>, request: &DataRequest) -> Vec<Option<NodeTask>> {
  let graph = &context.graph;
  let mut tasks: Vec<Option<NodeTask>> = vec![None; graph.nodes().len()];

  for &id in graph.topological_order() {
    let node = graph.node(id);
    let upstreams = graph.upstreams(id);
    if node.is_end || upstreams.is_empty() {
      continue;
    }
    let inputs: Option<Vec<BoxFuture<'static, NodeResult>>> = upstreams
      .iter()
      .map(|up| match up {
        Upstream::Gateway => {
          let request = request.clone();
          Some(async move { Ok((request, Metadata::new())) }.boxed())
        }
        Upstream::Node(prev) => tasks[*prev].clone().map(FutureExt::boxed),
      })
      .collect();
    let Some(inputs) = inputs else {
      debug!(deployment = %node.name, "node is not reachable from the gateway");
      continue;
    };

    let context = Arc::clone(context);
    let task = async move {
      let parts = try_join_all(inputs).await?;
      run_node(&context, id, parts).await
    }
    .boxed()
    .shared();
    tasks[id] = Some(task);
  }
  tasks
}

async fn run_node(context: &RunContext, id: NodeId, parts: Vec<(DataRequest, Metadata)>) -> NodeResult {
  let node = context.graph.node(id);

  if let Some(failed) = parts
    .iter()
    .find(|(_, metadata)| metadata.get(IS_ERROR_KEY).is_some_and(|v| v == "true"))
  {
    debug!(deployment = %node.name, "forwarding failed request");
    return Ok(failed.clone());
  }

  let mut requests: Vec<DataRequest> = parts.into_iter().map(|(request, _)| request).collect();

  if !context.serves(&node.name) {
    debug!(deployment = %node.name, endpoint = %context.endpoint, "skipping deployment");
    let request = reduce_requests(requests, None).unwrap_or_default();
    return Ok((request, Metadata::new()));
  }

  if let Some(filter) = &node.filter {
    for request in &mut requests {
      filter.apply(request.docs_mut());
    }
  }

  if node.reduce && requests.len() > 1 {
    let schema = context
      .discovered
      .get(&node.name)
      .and_then(|info| info.schema_for(&context.endpoint))
      .map(|schema| schema.input.doc_schema());
    requests = reduce_requests(requests, schema.as_ref()).into_iter().collect();
  }

  for request in &mut requests {
    request.parameters = scope_parameters(&context.parameters, &node.name);
  }

  context.update(id, |state| state.start = Some(Utc::now()));
  let options = SendOptions {
    role: Role::Head,
    shard_id: None,
    endpoint: Some(context.endpoint.clone()),
    metadata: node.metadata.clone(),
    timeout: node.timeout_send,
    retries: Some(node.retries),
  };
  let (mut response, metadata) = context
    .pool
    .send_requests_once(requests, &node.name, options)
    .await
    .map_err(|err| with_gateway_context(err, &node.name))?;

  let failed = metadata.get(IS_ERROR_KEY).is_some_and(|v| v == "true");
  context.update(id, |state| {
    state.results = response.results.clone();
    state.end = Some(Utc::now());
    if failed {
      state.status = Some(response.header.status.clone());
    }
  });
  response.parameters = context.parameters.clone();
  Ok((response, metadata))
}

fn with_gateway_context(err: RpcError, deployment: &str) -> RpcError {
  match err.code {
    RpcCode::Unavailable | RpcCode::DeadlineExceeded => {
      let addresses = err.dest_addr.join(", ");
      err.with_context(format!(
        " |Gateway: Communication error with deployment `{deployment}` at address(es) [{addresses}]. Head or worker(s) may be down."
      ))
    }
    _ => err,
  }
}

/// Keeps the first gateway route and appends one route per sent node that
/// is not already listed, in depth-first order.
fn merge_routes(graph: &TopologyGraph, states: &[NodeState], response: &mut DataRequest) {
  let mut seen_gateway = false;
  response.routes.retain(|route| {
    if route.executor != GATEWAY_ROUTE {
      return true;
    }
    let keep = !seen_gateway;
    seen_gateway = true;
    keep
  });
  if let Some(gateway) = response
    .routes
    .iter_mut()
    .find(|route| route.executor == GATEWAY_ROUTE)
  {
    gateway.finish();
  }

  for id in graph.depth_first() {
    let name = &graph.node(id).name;
    let state = &states[id];
    if state.start.is_none() || response.routes.iter().any(|r| &r.executor == name) {
      continue;
    }
    response.routes.push(Route {
      executor: name.clone(),
      pod_id: String::new(),
      start_time: state.start,
      end_time: state.end,
      status: state.status.clone(),
    });
  }
}
