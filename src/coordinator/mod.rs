//! cluster membership, replication groups and distributed locks
pub mod lock;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{info, warn};
use serde::Serialize;
use spin::{Mutex, RwLock};

pub use lock::{LockHolder, LockInfo, LockMode, LockTable, LockType};

use crate::{
    config::FsConfig,
    error::{FsError, FsResult},
    stats::Statistics,
    utils::time_util::{Clock, TimeDurationStruct},
};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Offline,
    Joining,
    Online,
    Leaving,
    Failed,
}

impl NodeState {
    /// states only move forward, a node comes back by joining again
    pub fn can_become(self, to: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, to),
            (Offline, Joining)
                | (Joining, Online)
                | (Joining, Failed)
                | (Joining, Offline)
                | (Online, Leaving)
                | (Online, Failed)
                | (Leaving, Offline)
                | (Failed, Joining)
                | (Failed, Offline)
        )
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub state: NodeState,
    pub last_heartbeat: TimeDurationStruct,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    Strong,
    Eventual,
}

/// nodes holding copies of one or more volumes
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ReplicationGroup {
    pub id: u64,
    pub name: String,
    pub replication_factor: u32,
    pub consistency: ConsistencyLevel,
    pub nodes: Vec<u64>,
    pub volumes: Vec<u64>,
}

/// Membership and locking for one instance.
///
/// Operations that need the cluster to agree first check that at least
/// `quorum_size` nodes are online.
#[derive(Debug)]
pub struct Coordinator {
    local_node: u64,
    quorum_size: usize,
    heartbeat_timeout: Duration,
    clock: Arc<dyn Clock>,
    stats: Arc<Statistics>,
    nodes: RwLock<BTreeMap<u64, Node>>,
    groups: Mutex<BTreeMap<u64, ReplicationGroup>>,
    next_group: AtomicU64,
    locks: LockTable,
}

impl Coordinator {
    /// a coordinator whose only member is the local node, already online
    pub fn new(config: &FsConfig, clock: Arc<dyn Clock>, stats: Arc<Statistics>) -> Self {
        let now = clock.now();
        let local = Node {
            id: config.node_id,
            name: config.node_name.clone(),
            address: config.node_address.clone(),
            port: config.node_port,
            state: NodeState::Online,
            last_heartbeat: now,
        };
        info!(
            "coordinator up on node {} ({}), quorum {}",
            local.id, local.name, config.quorum_size
        );
        Coordinator {
            local_node: config.node_id,
            quorum_size: config.quorum_size,
            heartbeat_timeout: config.heartbeat_timeout(),
            // a holding outlives its node by at most one heartbeat timeout
            locks: LockTable::new(
                clock.clone(),
                config.heartbeat_timeout(),
                config.default_lock_timeout(),
            ),
            clock,
            stats,
            nodes: RwLock::new(BTreeMap::from([(config.node_id, local)])),
            groups: Mutex::new(BTreeMap::new()),
            next_group: AtomicU64::new(1),
        }
    }

    pub fn local_node(&self) -> u64 {
        self.local_node
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    pub fn online_nodes(&self) -> usize {
        self.nodes
            .read()
            .values()
            .filter(|node| node.state == NodeState::Online)
            .count()
    }

    pub fn has_quorum(&self) -> bool {
        self.online_nodes() >= self.quorum_size
    }

    fn require_quorum(&self) -> FsResult<()> {
        let online = self.online_nodes();
        if online < self.quorum_size {
            return Err(FsError::NoQuorum {
                online,
                required: self.quorum_size,
            });
        }
        Ok(())
    }

    pub fn node(&self, id: u64) -> Option<Node> {
        self.nodes.read().get(&id).cloned()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }
}

/// This block is about membership
impl Coordinator {
    /// Admit a node as `Joining`; its first heartbeat brings it online.
    pub fn join_node(&self, id: u64, name: &str, address: &str, port: u16) -> FsResult<()> {
        info!("node {id} ({name} at {address}:{port}) joining");
        let now = self.clock.now();
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&id) {
            Some(node) if node.state.can_become(NodeState::Joining) => {
                node.state = NodeState::Joining;
                node.name = name.to_string();
                node.address = address.to_string();
                node.port = port;
                node.last_heartbeat = now;
            }
            Some(node) => {
                return Err(FsError::NameCollision(format!(
                    "node {id} is already {:?}",
                    node.state
                )))
            }
            None => {
                nodes.insert(
                    id,
                    Node {
                        id,
                        name: name.to_string(),
                        address: address.to_string(),
                        port,
                        state: NodeState::Joining,
                        last_heartbeat: now,
                    },
                );
            }
        }
        Ok(())
    }

    /// move a node to `state`, refusing transitions the state machine forbids
    pub fn set_node_state(&self, id: u64, state: NodeState) -> FsResult<()> {
        {
            let mut nodes = self.nodes.write();
            let node = nodes
                .get_mut(&id)
                .ok_or_else(|| FsError::NotFound(format!("node {id}")))?;
            if !node.state.can_become(state) {
                return Err(FsError::InvalidDeviceState(format!(
                    "node {id} cannot go from {:?} to {state:?}",
                    node.state
                )));
            }
            info!("node {id}: {:?} -> {state:?}", node.state);
            node.state = state;
        }
        if matches!(state, NodeState::Failed | NodeState::Offline) {
            self.locks.release_node(id);
        }
        Ok(())
    }

    pub fn heartbeat(&self, id: u64) -> FsResult<()> {
        let now = self.clock.now();
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(format!("node {id}")))?;
        match node.state {
            NodeState::Failed | NodeState::Offline => {
                return Err(FsError::InvalidDeviceState(format!(
                    "node {id} is {:?}, it has to join again",
                    node.state
                )))
            }
            NodeState::Joining => {
                info!("node {id} online");
                node.state = NodeState::Online;
            }
            NodeState::Online | NodeState::Leaving => {}
        }
        node.last_heartbeat = now;
        drop(nodes);
        self.locks.renew(id);
        Ok(())
    }

    /// Leave the cluster in order, giving up every lock on the way out.
    pub fn leave_node(&self, id: u64) -> FsResult<()> {
        let current = self
            .node(id)
            .ok_or_else(|| FsError::NotFound(format!("node {id}")))?;
        match current.state {
            NodeState::Online => {
                self.set_node_state(id, NodeState::Leaving)?;
                self.set_node_state(id, NodeState::Offline)
            }
            NodeState::Offline => Ok(()),
            _ => self.set_node_state(id, NodeState::Offline),
        }
    }

    /// Fail every remote node whose last heartbeat is older than the timeout,
    /// release what they held, and expire overdue lock leases.
    pub fn detect_failures(&self) -> Vec<u64> {
        let now = self.clock.now();
        let failed: Vec<u64> = {
            let mut nodes = self.nodes.write();
            nodes
                .values_mut()
                .filter(|node| node.id != self.local_node)
                .filter(|node| matches!(node.state, NodeState::Online | NodeState::Joining))
                .filter(|node| now.saturating_since(node.last_heartbeat) > self.heartbeat_timeout)
                .map(|node| {
                    warn!("node {} missed its heartbeat, marking it failed", node.id);
                    node.state = NodeState::Failed;
                    node.id
                })
                .collect()
        };
        for node in &failed {
            self.locks.release_node(*node);
        }
        // this node is alive by definition
        self.locks.renew(self.local_node);
        self.locks.expire(now);
        failed
    }
}

/// This block is about replication groups
impl Coordinator {
    /// Put a volume into the group for `factor` copies, creating the group when needed.
    pub fn join_replication(&self, volume_id: u64, volume_name: &str, factor: u32) -> FsResult<u64> {
        info!("volume {volume_name} joins replication with factor {factor}");
        self.require_quorum()?;
        if factor == 0 {
            return Err(FsError::InvalidArgument("replication factor 0".into()));
        }
        let online: Vec<u64> = {
            let nodes = self.nodes.read();
            let mut online: Vec<u64> = nodes
                .values()
                .filter(|node| node.state == NodeState::Online)
                .map(|node| node.id)
                .collect();
            // the local node always keeps a copy
            online.sort_by_key(|id| (*id != self.local_node, *id));
            online
        };
        if (factor as usize) > online.len() {
            return Err(FsError::InsufficientResources(format!(
                "replication factor {factor} with {} online nodes",
                online.len()
            )));
        }
        let mut groups = self.groups.lock();
        if let Some(group) = groups
            .values_mut()
            .find(|group| group.replication_factor == factor)
        {
            if !group.volumes.contains(&volume_id) {
                group.volumes.push(volume_id);
            }
            return Ok(group.id);
        }
        let id = self.next_group.fetch_add(1, Ordering::Relaxed);
        groups.insert(
            id,
            ReplicationGroup {
                id,
                name: format!("rf-{factor}"),
                replication_factor: factor,
                consistency: if factor > 1 {
                    ConsistencyLevel::Strong
                } else {
                    ConsistencyLevel::Eventual
                },
                nodes: online.into_iter().take(factor as usize).collect(),
                volumes: vec![volume_id],
            },
        );
        Ok(id)
    }

    /// take a volume out of its group, dropping the group once it is empty
    pub fn leave_replication(&self, volume_id: u64, group_id: u64) {
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(&group_id) else {
            return;
        };
        group.volumes.retain(|v| *v != volume_id);
        if group.volumes.is_empty() {
            info!("replication group {} torn down", group.name);
            groups.remove(&group_id);
        }
    }

    pub fn group(&self, id: u64) -> Option<ReplicationGroup> {
        self.groups.lock().get(&id).cloned()
    }

    pub fn groups(&self) -> Vec<ReplicationGroup> {
        self.groups.lock().values().cloned().collect()
    }
}

/// This block is about distributed locks
impl Coordinator {
    pub fn acquire_lock(
        &self,
        node: u64,
        name: &str,
        lock_type: LockType,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> FsResult<()> {
        self.require_quorum()?;
        match self.node(node).map(|n| n.state) {
            Some(NodeState::Online) => {}
            Some(state) => {
                return Err(FsError::InvalidDeviceState(format!("node {node} is {state:?}")))
            }
            None => return Err(FsError::NotFound(format!("node {node}"))),
        }
        self.locks.acquire(node, name, lock_type, mode, timeout)?;
        self.stats.inc_lock_acquisitions();
        Ok(())
    }

    pub fn release_lock(&self, node: u64, name: &str) -> FsResult<()> {
        self.locks.release(node, name)
    }

    pub fn cancel_acquire(&self, node: u64, name: &str) -> usize {
        self.locks.cancel(node, name)
    }

    pub fn lock_info(&self, name: &str) -> Option<LockInfo> {
        self.locks.info(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time_util::ManualClock;
    use std::{sync::Barrier, thread};

    fn coordinator(quorum: usize) -> (Coordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(TimeDurationStruct::from_nanos(1_000_000)));
        let config = FsConfig {
            quorum_size: quorum,
            ..FsConfig::default()
        };
        (
            Coordinator::new(&config, clock.clone(), Arc::new(Statistics::default())),
            clock,
        )
    }

    fn bring_online(coordinator: &Coordinator, id: u64) -> FsResult<()> {
        coordinator.join_node(id, &format!("node-{id}"), "10.0.0.1", 7070)?;
        coordinator.heartbeat(id)
    }

    #[test]
    fn test_exactly_one_immediate_exclusive_wins() -> anyhow::Result<()> {
        let (coordinator, _) = coordinator(1);
        bring_online(&coordinator, 2)?;
        let barrier = Barrier::new(2);
        let results: Vec<FsResult<()>> = thread::scope(|s| {
            let contenders: Vec<_> = [1u64, 2]
                .into_iter()
                .map(|node| {
                    let coordinator = &coordinator;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        coordinator.acquire_lock(
                            node,
                            "volume:V1",
                            LockType::Exclusive,
                            LockMode::Immediate,
                            None,
                        )
                    })
                })
                .collect();
            contenders.into_iter().map(|c| c.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(FsError::LockConflict(_))))
                .count(),
            1
        );
        assert_eq!(coordinator.stats.snapshot().lock_acquisitions, 1);
        Ok(())
    }

    #[test]
    fn test_quorum_gates_locks_and_groups() -> anyhow::Result<()> {
        let (coordinator, _) = coordinator(2);
        assert!(!coordinator.has_quorum());
        assert!(matches!(
            coordinator.acquire_lock(1, "l", LockType::Read, LockMode::Immediate, None),
            Err(FsError::NoQuorum { online: 1, required: 2 })
        ));
        assert!(matches!(
            coordinator.join_replication(1, "v", 1),
            Err(FsError::NoQuorum { .. })
        ));
        bring_online(&coordinator, 2)?;
        coordinator.acquire_lock(1, "l", LockType::Read, LockMode::Immediate, None)?;
        Ok(())
    }

    #[test]
    fn test_node_state_machine() -> anyhow::Result<()> {
        let (coordinator, _) = coordinator(1);
        coordinator.join_node(5, "n5", "10.0.0.5", 7070)?;
        assert_eq!(coordinator.node(5).map(|n| n.state), Some(NodeState::Joining));
        assert!(matches!(
            coordinator.join_node(5, "n5", "10.0.0.5", 7070),
            Err(FsError::NameCollision(_))
        ));
        assert!(coordinator.set_node_state(5, NodeState::Leaving).is_err());
        coordinator.heartbeat(5)?;
        assert_eq!(coordinator.online_nodes(), 2);
        coordinator.set_node_state(5, NodeState::Failed)?;
        assert!(coordinator.heartbeat(5).is_err());
        coordinator.join_node(5, "n5", "10.0.0.5", 7070)?;
        coordinator.heartbeat(5)?;
        coordinator.leave_node(5)?;
        assert_eq!(coordinator.node(5).map(|n| n.state), Some(NodeState::Offline));
        Ok(())
    }

    #[test]
    fn test_silent_node_fails_and_loses_locks() -> anyhow::Result<()> {
        let (coordinator, clock) = coordinator(1);
        bring_online(&coordinator, 2)?;
        coordinator.acquire_lock(2, "x", LockType::Exclusive, LockMode::Immediate, None)?;
        clock.advance(Duration::from_secs(10));
        coordinator.heartbeat(2)?;
        assert!(coordinator.detect_failures().is_empty());

        clock.advance(Duration::from_secs(31));
        assert_eq!(coordinator.detect_failures(), vec![2]);
        assert!(coordinator.lock_info("x").is_none());
        coordinator.acquire_lock(1, "x", LockType::Exclusive, LockMode::Immediate, None)?;
        assert!(matches!(
            coordinator.acquire_lock(2, "y", LockType::Read, LockMode::Immediate, None),
            Err(FsError::InvalidDeviceState(_))
        ));
        Ok(())
    }

    #[test]
    fn test_heartbeats_keep_locks_held() -> anyhow::Result<()> {
        let (coordinator, clock) = coordinator(1);
        bring_online(&coordinator, 2)?;
        coordinator.acquire_lock(2, "x", LockType::Exclusive, LockMode::Immediate, None)?;
        coordinator.acquire_lock(1, "y", LockType::Exclusive, LockMode::Immediate, None)?;
        for _ in 0..4 {
            clock.advance(Duration::from_secs(20));
            coordinator.heartbeat(2)?;
            assert!(coordinator.detect_failures().is_empty());
        }
        assert_eq!(coordinator.lock_info("x").map(|i| i.holders[0].node), Some(2));
        assert_eq!(coordinator.lock_info("y").map(|i| i.holders[0].node), Some(1));
        assert!(matches!(
            coordinator.acquire_lock(1, "x", LockType::Read, LockMode::Immediate, None),
            Err(FsError::LockConflict(_))
        ));
        Ok(())
    }

    #[test]
    fn test_replication_groups_are_shared_per_factor() -> anyhow::Result<()> {
        let (coordinator, _) = coordinator(1);
        assert!(matches!(
            coordinator.join_replication(10, "a", 2),
            Err(FsError::InsufficientResources(_))
        ));
        bring_online(&coordinator, 2)?;
        let first = coordinator.join_replication(10, "a", 2)?;
        let second = coordinator.join_replication(11, "b", 2)?;
        assert_eq!(first, second);
        let group = coordinator.group(first).unwrap();
        assert_eq!(group.nodes, vec![1, 2]);
        assert_eq!(group.volumes, vec![10, 11]);

        coordinator.leave_replication(10, first);
        assert!(coordinator.group(first).is_some());
        coordinator.leave_replication(11, first);
        assert!(coordinator.groups().is_empty());
        Ok(())
    }
}
