//! Three-level map `deployment -> {heads | shards} -> shard id -> replicas`.

use super::channel::{ChannelFactory, RpcChannel};
use super::replica_list::ReplicaList;
use crate::error::RpcError;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Role of the replicas of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
  /// Head of a deployment, addressed by the gateway.
  Head,
  /// Worker of a shard, addressed by a head.
  Worker,
}

#[derive(Default)]
struct DeploymentConnections {
  heads: BTreeMap<u32, Arc<ReplicaList>>,
  shards: BTreeMap<u32, Arc<ReplicaList>>,
  access_count: AtomicUsize,
}

impl DeploymentConnections {
  fn lists(&self, role: Role) -> &BTreeMap<u32, Arc<ReplicaList>> {
    match role {
      Role::Head => &self.heads,
      Role::Worker => &self.shards,
    }
  }

  fn lists_mut(&mut self, role: Role) -> &mut BTreeMap<u32, Arc<ReplicaList>> {
    match role {
      Role::Head => &mut self.heads,
      Role::Worker => &mut self.shards,
    }
  }
}

/// Connections of every deployment.
pub struct ConnectionPoolMap {
  factory: Arc<dyn ChannelFactory>,
  deployments: RwLock<HashMap<String, DeploymentConnections>>,
}

impl ConnectionPoolMap {
  /// Creates an empty map.
  pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
    Self {
      factory,
      deployments: RwLock::new(HashMap::new()),
    }
  }

  /// Adds a replica. Heads always live under entity id 0.
  pub async fn add_connection(
    &self,
    deployment: &str,
    address: &str,
    role: Role,
    shard_id: Option<u32>,
  ) -> Result<(), RpcError> {
    let entity = match role {
      Role::Head => 0,
      Role::Worker => shard_id.unwrap_or(0),
    };
    let mut deployments = self.deployments.write().await;
    let connections = deployments.entry(deployment.to_string()).or_default();
    let list = connections
      .lists_mut(role)
      .entry(entity)
      .or_insert_with(|| Arc::new(ReplicaList::new(deployment, Arc::clone(&self.factory))));
    list.add_connection(address)
  }

  /// Removes a replica, dropping its list when it becomes empty. Returns the
  /// channel to close.
  pub async fn remove_connection(
    &self,
    deployment: &str,
    address: &str,
    role: Role,
    shard_id: Option<u32>,
  ) -> Option<Arc<dyn RpcChannel>> {
    let entity = match role {
      Role::Head => 0,
      Role::Worker => shard_id.unwrap_or(0),
    };
    let mut deployments = self.deployments.write().await;
    let connections = deployments.get_mut(deployment)?;
    let lists = connections.lists_mut(role);
    let channel = lists.get(&entity)?.remove_connection(address);
    if lists.get(&entity).is_some_and(|l| l.is_empty()) {
      lists.remove(&entity);
    }
    if connections.heads.is_empty() && connections.shards.is_empty() {
      deployments.remove(deployment);
    }
    channel
  }

  /// Replica list to send to.
  ///
  /// Without an explicit entity, heads resolve to entity 0 and shards rotate
  /// through the deployment's access counter when `increase_access_count` is
  /// set.
  pub async fn get_replicas(
    &self,
    deployment: &str,
    role: Role,
    entity_id: Option<u32>,
    increase_access_count: bool,
  ) -> Option<Arc<ReplicaList>> {
    let deployments = self.deployments.read().await;
    let connections = deployments.get(deployment)?;
    let lists = connections.lists(role);
    if let Some(id) = entity_id {
      return lists.get(&id).cloned();
    }
    if lists.is_empty() {
      return None;
    }
    let count = if increase_access_count {
      connections.access_count.fetch_add(1, Ordering::Relaxed)
    } else {
      connections.access_count.load(Ordering::Relaxed)
    };
    lists.values().nth(count % lists.len()).cloned()
  }

  /// Replica lists of every shard, in shard order.
  pub async fn get_replicas_all_shards(&self, deployment: &str) -> Vec<Arc<ReplicaList>> {
    let deployments = self.deployments.read().await;
    deployments
      .get(deployment)
      .map(|c| c.shards.values().cloned().collect())
      .unwrap_or_default()
  }

  /// Every replica list of `deployment`, heads first.
  pub async fn all_replica_lists(&self, deployment: &str) -> Vec<Arc<ReplicaList>> {
    let deployments = self.deployments.read().await;
    deployments
      .get(deployment)
      .map(|c| c.heads.values().chain(c.shards.values()).cloned().collect())
      .unwrap_or_default()
  }

  /// Names of the known deployments.
  pub async fn deployments(&self) -> Vec<String> {
    let mut names: Vec<String> = self.deployments.read().await.keys().cloned().collect();
    names.sort();
    names
  }

  /// Closes every channel and forgets every deployment.
  pub async fn close(&self, grace: Duration) {
    let drained: Vec<DeploymentConnections> = {
      let mut deployments = self.deployments.write().await;
      deployments.drain().map(|(_, c)| c).collect()
    };
    for connections in drained {
      for list in connections.heads.values().chain(connections.shards.values()) {
        list.close(grace).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::networking::LocalChannelFactory;

  fn map() -> ConnectionPoolMap {
    ConnectionPoolMap::new(Arc::new(LocalChannelFactory::new()))
  }

  #[tokio::test]
  async fn test_shard_rotation_by_access_count() {
    let pool = map();
    pool.add_connection("d", "a:1", Role::Worker, Some(0)).await.unwrap();
    pool.add_connection("d", "b:1", Role::Worker, Some(1)).await.unwrap();

    let first = pool.get_replicas("d", Role::Worker, None, true).await.unwrap();
    let second = pool.get_replicas("d", Role::Worker, None, true).await.unwrap();
    assert!(first.has_connection("a:1"));
    assert!(second.has_connection("b:1"));
    assert!(pool.get_replicas("d", Role::Worker, Some(7), true).await.is_none());
  }

  #[tokio::test]
  async fn test_remove_collapses_empty_lists() {
    let pool = map();
    pool.add_connection("d", "a:1", Role::Head, None).await.unwrap();
    assert!(pool.remove_connection("d", "a:1", Role::Head, None).await.is_some());
    assert!(pool.get_replicas("d", Role::Head, None, false).await.is_none());
    assert!(pool.deployments().await.is_empty());
  }

  #[tokio::test]
  async fn test_all_shards_in_order() {
    let pool = map();
    pool.add_connection("d", "c:1", Role::Worker, Some(2)).await.unwrap();
    pool.add_connection("d", "a:1", Role::Worker, Some(0)).await.unwrap();
    let shards = pool.get_replicas_all_shards("d").await;
    assert_eq!(shards.len(), 2);
    assert!(shards[0].has_connection("a:1"));
  }
}
