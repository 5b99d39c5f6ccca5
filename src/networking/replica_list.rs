//! # Replica Lists
//!
//! The replicas of one shard (or of one head), with a round-robin cursor.
//! Channels are created through the pool's [`ChannelFactory`] when a replica is
//! added and can be reset in place after a transient failure.

use super::channel::{ChannelFactory, RpcChannel, host_port};
use crate::error::RpcError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// One replica and its channel.
#[derive(Clone)]
pub struct Replica {
  /// `host:port` identity of the replica.
  pub address: String,
  /// Channel to the replica.
  pub channel: Arc<dyn RpcChannel>,
}

impl std::fmt::Debug for Replica {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Replica").field("address", &self.address).finish()
  }
}

#[derive(Default)]
struct ReplicaState {
  replicas: Vec<Replica>,
  rr_counter: usize,
}

/// Replicas of one shard or head.
pub struct ReplicaList {
  deployment: String,
  factory: Arc<dyn ChannelFactory>,
  state: Mutex<ReplicaState>,
}

impl ReplicaList {
  /// Creates an empty list for `deployment`.
  pub fn new(deployment: impl Into<String>, factory: Arc<dyn ChannelFactory>) -> Self {
    Self {
      deployment: deployment.into(),
      factory,
      state: Mutex::new(ReplicaState::default()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, ReplicaState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Deployment the replicas belong to.
  pub fn deployment(&self) -> &str {
    &self.deployment
  }

  /// Adds a replica. Adding a known address is a no-op.
  pub fn add_connection(&self, address: &str) -> Result<(), RpcError> {
    let address = host_port(address).to_string();
    let mut state = self.lock();
    if state.replicas.iter().any(|r| r.address == address) {
      return Ok(());
    }
    let channel = self.factory.create(&address, &self.deployment)?;
    debug!(deployment = %self.deployment, %address, "adding replica");
    state.replicas.push(Replica { address, channel });
    Ok(())
  }

  /// Removes a replica and returns its channel so the caller can close it.
  ///
  /// The round-robin cursor is reduced modulo the new size.
  pub fn remove_connection(&self, address: &str) -> Option<Arc<dyn RpcChannel>> {
    let address = host_port(address);
    let mut state = self.lock();
    let idx = state.replicas.iter().position(|r| r.address == address)?;
    let removed = state.replicas.remove(idx);
    let len = state.replicas.len();
    state.rr_counter = if len == 0 { 0 } else { state.rr_counter % len };
    debug!(deployment = %self.deployment, %address, "removed replica");
    Some(removed.channel)
  }

  /// Replaces the channel of `address` with a fresh one, returning the old
  /// channel.
  pub fn reset_connection(&self, address: &str) -> Option<Arc<dyn RpcChannel>> {
    let address = host_port(address);
    let fresh = match self.factory.create(address, &self.deployment) {
      Ok(channel) => channel,
      Err(err) => {
        debug!(deployment = %self.deployment, %address, error = %err, "could not reset channel");
        return None;
      }
    };
    let mut state = self.lock();
    let replica = state.replicas.iter_mut().find(|r| r.address == address)?;
    debug!(deployment = %self.deployment, %address, "resetting channel");
    Some(std::mem::replace(&mut replica.channel, fresh))
  }

  /// Next replica in round-robin order.
  pub fn next_connection(&self) -> Option<Replica> {
    let mut state = self.lock();
    let len = state.replicas.len();
    if len == 0 {
      return None;
    }
    let idx = state.rr_counter % len;
    state.rr_counter = (idx + 1) % len;
    Some(state.replicas[idx].clone())
  }

  /// Next replica whose address is not in `tried`, or the next replica when
  /// every one was tried.
  pub fn next_untried(&self, tried: &[String]) -> Option<Replica> {
    let len = self.len();
    for _ in 0..len {
      let replica = self.next_connection()?;
      if !tried.contains(&replica.address) {
        return Some(replica);
      }
    }
    self.next_connection()
  }

  /// Snapshot of every replica.
  pub fn all_connections(&self) -> Vec<Replica> {
    self.lock().replicas.clone()
  }

  /// Whether `address` is a replica.
  pub fn has_connection(&self, address: &str) -> bool {
    let address = host_port(address);
    self.lock().replicas.iter().any(|r| r.address == address)
  }

  /// Number of replicas.
  pub fn len(&self) -> usize {
    self.lock().replicas.len()
  }

  /// Whether the list is empty.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Closes every channel and empties the list.
  pub async fn close(&self, grace: Duration) {
    let replicas = {
      let mut state = self.lock();
      state.rr_counter = 0;
      std::mem::take(&mut state.replicas)
    };
    for replica in replicas {
      replica.channel.close(grace).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::networking::LocalChannelFactory;

  fn list() -> ReplicaList {
    ReplicaList::new("dep", Arc::new(LocalChannelFactory::new()))
  }

  #[test]
  fn test_round_robin_cycles() {
    let replicas = list();
    for addr in ["a:1", "b:1", "c:1"] {
      replicas.add_connection(addr).unwrap();
    }
    let picked: Vec<String> = (0..4)
      .map(|_| replicas.next_connection().unwrap().address)
      .collect();
    assert_eq!(picked, vec!["a:1", "b:1", "c:1", "a:1"]);
  }

  #[test]
  fn test_add_is_idempotent_and_strips_scheme() {
    let replicas = list();
    replicas.add_connection("grpc://a:1").unwrap();
    replicas.add_connection("a:1").unwrap();
    assert_eq!(replicas.len(), 1);
    assert!(replicas.has_connection("http://a:1"));
  }

  #[test]
  fn test_remove_keeps_cursor_in_range() {
    let replicas = list();
    for addr in ["a:1", "b:1", "c:1"] {
      replicas.add_connection(addr).unwrap();
    }
    replicas.next_connection();
    replicas.next_connection();
    assert!(replicas.remove_connection("c:1").is_some());
    assert!(replicas.remove_connection("c:1").is_none());
    let next = replicas.next_connection().unwrap();
    assert_eq!(next.address, "a:1");
  }

  #[test]
  fn test_next_untried_skips_tried_addresses() {
    let replicas = list();
    for addr in ["a:1", "b:1"] {
      replicas.add_connection(addr).unwrap();
    }
    let tried = vec!["a:1".to_string()];
    assert_eq!(replicas.next_untried(&tried).unwrap().address, "b:1");
    let all = vec!["a:1".to_string(), "b:1".to_string()];
    assert!(replicas.next_untried(&all).is_some());
  }

  #[tokio::test]
  async fn test_close_empties_the_list() {
    let replicas = list();
    replicas.add_connection("a:1").unwrap();
    replicas.close(Duration::ZERO).await;
    assert!(replicas.is_empty());
    assert!(replicas.next_connection().is_none());
  }
}
