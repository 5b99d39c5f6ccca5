//! Graph vertices.

use super::filter::Filter;
use crate::networking::Metadata;
use std::time::Duration;

/// Index of a node in the graph arena.
pub type NodeId = usize;

/// Sentinel naming the gateway as the source of a graph.
pub const START_GATEWAY: &str = "start-gateway";

/// Sentinel naming the gateway as the sink of a graph.
pub const END_GATEWAY: &str = "end-gateway";

/// Name of the terminal node every edge into [`END_GATEWAY`] points to.
pub const END_GATEWAY_NODE: &str = "__end_gateway__";

/// A deployment, or the terminal node, in a compiled topology.
#[derive(Debug, Clone)]
pub struct NodeSpec {
  /// Deployment name.
  pub name: String,
  /// Downstream nodes, in declaration order.
  pub outgoing: Vec<NodeId>,
  /// Number of incoming edges, at least one.
  pub number_of_parts: usize,
  /// Whether the node's response is discarded.
  pub floating: bool,
  /// Documents reaching the deployment must match this condition.
  pub filter: Option<Filter>,
  /// Metadata attached to every call to the deployment.
  pub metadata: Metadata,
  /// Whether partial requests are reduced before sending.
  pub reduce: bool,
  /// Deadline of each call.
  pub timeout_send: Option<Duration>,
  /// Retry budget of each call.
  pub retries: i32,
  /// Whether this is the terminal node.
  pub is_end: bool,
}

impl NodeSpec {
  /// Creates a deployment node with one part and no options.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      outgoing: Vec::new(),
      number_of_parts: 1,
      floating: false,
      filter: None,
      metadata: Metadata::new(),
      reduce: true,
      timeout_send: None,
      retries: -1,
      is_end: false,
    }
  }

  /// The terminal node.
  pub fn end() -> Self {
    Self {
      is_end: true,
      ..Self::new(END_GATEWAY_NODE)
    }
  }

  /// Whether the node has no downstream node.
  pub fn is_leaf(&self) -> bool {
    self.outgoing.is_empty()
  }
}
