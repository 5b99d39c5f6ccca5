//! # Topology Graph
//!
//! Compiled form of `graph_representation`: an arena of [`NodeSpec`]s indexed
//! by [`NodeId`], plus the upstream lists and a topological order used by the
//! per-request execution.
//!
//! The compiled graph is immutable and shared by every request. The only
//! state written after construction is the result of endpoint discovery,
//! which is computed once behind a one-flight guard.

use super::compatibility::validate_compatibility;
use super::filter::Filter;
use super::node::{END_GATEWAY, END_GATEWAY_NODE, NodeId, NodeSpec, START_GATEWAY};
use crate::config::GatewayStreamerConfig;
use crate::error::{GatewayError, GraphError};
use crate::message::EndpointsInfo;
use crate::networking::{ConnectionPool, Role};
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Endpoints discovered for every deployment, by deployment name.
pub type DiscoveredEndpoints = HashMap<String, EndpointsInfo>;

/// Where a part of a node's input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
  /// The client request, for origin nodes.
  Gateway,
  /// The response of another node.
  Node(NodeId),
}

/// Compiled topology of a flow.
#[derive(Debug)]
pub struct TopologyGraph {
  nodes: Vec<NodeSpec>,
  index: HashMap<String, NodeId>,
  origins: Vec<NodeId>,
  upstreams: Vec<Vec<Upstream>>,
  order: Vec<NodeId>,
  end: Option<NodeId>,
  has_filters: bool,
  endpoints: OnceCell<Arc<DiscoveredEndpoints>>,
}

impl TopologyGraph {
  /// Compiles the graph of a gateway configuration.
  ///
  /// # Errors
  ///
  /// See [`TopologyGraph::new`].
  pub fn from_config(config: &GatewayStreamerConfig) -> Result<Self, GraphError> {
    Self::new(
      &config.graph_representation,
      &config.graph_conditions,
      &config.deployments_metadata,
      &config.deployments_no_reduce,
      config.timeout(),
      config.retries,
    )
  }

  /// Compiles a graph.
  ///
  /// # Arguments
  ///
  /// * `representation` - `node -> [downstream nodes]`, using
  ///   `start-gateway` and `end-gateway` as sentinels. A node declared with
  ///   an empty list is floating.
  /// * `conditions` - Filter condition by node.
  /// * `metadata` - Call metadata by node.
  /// * `no_reduce` - Nodes that forward their partial requests unreduced.
  /// * `timeout_send` - Deadline of every call.
  /// * `retries` - Retry budget of every call.
  ///
  /// # Errors
  ///
  /// Reserved or duplicate edges, unknown nodes in the options, invalid
  /// conditions, and cycles.
  pub fn new(
    representation: &BTreeMap<String, Vec<String>>,
    conditions: &BTreeMap<String, Value>,
    metadata: &BTreeMap<String, BTreeMap<String, String>>,
    no_reduce: &[String],
    timeout_send: Option<Duration>,
    retries: i32,
  ) -> Result<Self, GraphError> {
    let is_sentinel = |name: &str| name == START_GATEWAY || name == END_GATEWAY;

    let mut names = BTreeSet::new();
    let mut floating = HashSet::new();
    for (node, outgoing) in representation {
      if node == END_GATEWAY_NODE || outgoing.iter().any(|o| o == END_GATEWAY_NODE) {
        return Err(GraphError::ReservedName(END_GATEWAY_NODE.to_string()));
      }
      let mut seen = HashSet::new();
      for out in outgoing {
        if !seen.insert(out.as_str()) {
          return Err(GraphError::DuplicateEdge {
            from: node.clone(),
            to: out.clone(),
          });
        }
        if !is_sentinel(out) {
          names.insert(out.clone());
        }
      }
      if !is_sentinel(node) {
        names.insert(node.clone());
        if outgoing.is_empty() {
          floating.insert(node.clone());
        }
      }
    }

    for name in conditions
      .keys()
      .chain(metadata.keys())
      .chain(no_reduce.iter())
    {
      if !names.contains(name) {
        return Err(GraphError::UnknownNode(name.clone()));
      }
    }

    let mut nodes = Vec::with_capacity(names.len() + 1);
    let mut index = HashMap::with_capacity(names.len() + 1);
    for name in &names {
      let filter = conditions
        .get(name)
        .map(Filter::parse)
        .transpose()
        .map_err(|reason| GraphError::InvalidFilter {
          node: name.clone(),
          reason,
        })?;
      let mut spec = NodeSpec::new(name.clone());
      spec.floating = floating.contains(name);
      spec.filter = filter;
      spec.metadata = metadata.get(name).cloned().unwrap_or_default();
      spec.reduce = !no_reduce.contains(name);
      spec.timeout_send = timeout_send;
      spec.retries = retries;
      index.insert(name.clone(), nodes.len());
      nodes.push(spec);
    }

    let mut upstreams: Vec<Vec<Upstream>> = vec![Vec::new(); nodes.len()];
    let mut origins = Vec::new();
    let mut end = None;

    for (node, outgoing) in representation {
      if node == END_GATEWAY {
        continue;
      }
      let from = index.get(node).copied();
      for out in outgoing {
        let to = match out.as_str() {
          END_GATEWAY => {
            if from.is_none() {
              debug!("ignoring edge from start-gateway straight to end-gateway");
              continue;
            }
            *end.get_or_insert_with(|| {
              nodes.push(NodeSpec::end());
              upstreams.push(Vec::new());
              nodes.len() - 1
            })
          }
          START_GATEWAY => {
            debug!(node = %node, "ignoring edge back into start-gateway");
            continue;
          }
          name => index[name],
        };
        match from {
          Some(from) => {
            nodes[from].outgoing.push(to);
            upstreams[to].push(Upstream::Node(from));
          }
          None => {
            origins.push(to);
            upstreams[to].push(Upstream::Gateway);
          }
        }
      }
    }

    for (spec, ups) in nodes.iter_mut().zip(&upstreams) {
      spec.number_of_parts = ups.len().max(1);
    }

    let order = topological_order(&nodes, &upstreams)?;
    let has_filters = !conditions.is_empty();
    info!(
      nodes = names.len(),
      origins = origins.len(),
      floating = floating.len(),
      "topology graph compiled"
    );

    Ok(Self {
      nodes,
      index,
      origins,
      upstreams,
      order,
      end,
      has_filters,
      endpoints: OnceCell::new(),
    })
  }

  /// Every node, terminal node included.
  pub fn nodes(&self) -> &[NodeSpec] {
    &self.nodes
  }

  /// Node `id`.
  pub fn node(&self, id: NodeId) -> &NodeSpec {
    &self.nodes[id]
  }

  /// Id of the node named `name`.
  pub fn node_id(&self, name: &str) -> Option<NodeId> {
    self.index.get(name).copied()
  }

  /// Nodes receiving the client request, in declaration order.
  pub fn origins(&self) -> &[NodeId] {
    &self.origins
  }

  /// Inputs of node `id`, one per incoming edge.
  pub fn upstreams(&self, id: NodeId) -> &[Upstream] {
    &self.upstreams[id]
  }

  /// Every node after all of its upstream nodes.
  pub fn topological_order(&self) -> &[NodeId] {
    &self.order
  }

  /// The terminal node, when some edge reaches `end-gateway`.
  pub fn end(&self) -> Option<NodeId> {
    self.end
  }

  /// Whether some node filters documents.
  pub fn has_filter_conditions(&self) -> bool {
    self.has_filters
  }

  /// Deployment names, terminal node excluded.
  pub fn deployments(&self) -> impl Iterator<Item = &str> {
    self.nodes.iter().filter(|n| !n.is_end).map(|n| n.name.as_str())
  }

  /// Deployments reachable from the origins, in depth-first order.
  pub fn depth_first(&self) -> Vec<NodeId> {
    let mut visited = vec![false; self.nodes.len()];
    let mut out = Vec::new();
    let mut stack: Vec<NodeId> = self.origins.iter().rev().copied().collect();
    while let Some(id) = stack.pop() {
      if visited[id] {
        continue;
      }
      visited[id] = true;
      if !self.nodes[id].is_end {
        out.push(id);
      }
      stack.extend(self.nodes[id].outgoing.iter().rev().copied());
    }
    out
  }

  /// Edges between two deployments, as `(upstream, downstream)`.
  pub fn deployment_edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
    self.nodes.iter().enumerate().flat_map(move |(from, spec)| {
      spec
        .outgoing
        .iter()
        .filter(move |to| !self.nodes[**to].is_end)
        .map(move |to| (from, *to))
    })
  }

  /// Discovered endpoints, if discovery already ran.
  pub fn discovered(&self) -> Option<Arc<DiscoveredEndpoints>> {
    self.endpoints.get().cloned()
  }

  /// Discovers the endpoints of every deployment and validates the schemas of
  /// adjacent deployments. Runs once; concurrent callers share the outcome.
  ///
  /// # Errors
  ///
  /// Transport failures of any discovery call and schema mismatches.
  pub async fn discover(&self, pool: &ConnectionPool) -> Result<Arc<DiscoveredEndpoints>, GatewayError> {
    self
      .endpoints
      .get_or_try_init(|| async {
        let calls = self.nodes.iter().filter(|n| !n.is_end).map(|node| async move {
          let info = pool
            .send_discover_endpoint(
              &node.name,
              Role::Head,
              None,
              node.timeout_send,
              Some(node.retries),
            )
            .await
            .map_err(|err| {
              err.with_context(format!(
                " |Gateway: Communication error while gathering endpoints of `{}`",
                node.name
              ))
            })?;
          Ok::<_, GatewayError>((node.name.clone(), info))
        });
        let discovered: DiscoveredEndpoints = try_join_all(calls).await?.into_iter().collect();
        for warning in validate_compatibility(self, &discovered)? {
          warn!("{warning}");
        }
        debug!(deployments = discovered.len(), "endpoint discovery finished");
        Ok(Arc::new(discovered))
      })
      .await
      .cloned()
  }
}

/// Kahn's algorithm over the compiled nodes.
fn topological_order(nodes: &[NodeSpec], upstreams: &[Vec<Upstream>]) -> Result<Vec<NodeId>, GraphError> {
  let mut in_degree: Vec<usize> = upstreams
    .iter()
    .map(|ups| ups.iter().filter(|u| matches!(u, Upstream::Node(_))).count())
    .collect();

  let mut queue: VecDeque<NodeId> = (0..nodes.len()).filter(|id| in_degree[*id] == 0).collect();
  let mut order = Vec::with_capacity(nodes.len());
  while let Some(id) = queue.pop_front() {
    order.push(id);
    for &next in &nodes[id].outgoing {
      in_degree[next] -= 1;
      if in_degree[next] == 0 {
        queue.push_back(next);
      }
    }
  }

  if order.len() != nodes.len() {
    let cycle = (0..nodes.len())
      .filter(|id| in_degree[*id] > 0)
      .map(|id| nodes[id].name.clone())
      .collect();
    return Err(GraphError::Cycle(cycle));
  }
  Ok(order)
}
