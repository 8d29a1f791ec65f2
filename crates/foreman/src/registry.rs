//! Pool registry
//!
//! Maps `(pool, role)` to the live participants in that role. Membership
//! is a relation plus lookup, never ownership: entries hold cloned mailbox
//! handles, and a member whose mailbox has closed is treated as absent.
//! Lookups tolerate transient emptiness (a component restart in progress)
//! by returning nothing rather than blocking.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::NodeId;
use crate::pool::PoolId;
use crate::queue::ProducerHandle;
use crate::worker::{MonitorHandle, WorkerRef};

/// Identifier for a registry member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(pub Uuid);

impl MemberId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

/// The three roles every pool registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Queues,
    WorkerMonitors,
    Workers,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Queues, Role::WorkerMonitors, Role::Workers];
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Queues => write!(f, "queues"),
            Role::WorkerMonitors => write!(f, "worker_monitors"),
            Role::Workers => write!(f, "workers"),
        }
    }
}

/// Lookup scope: a single node, or every node that registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    Cluster,
}

/// A registered participant.
#[derive(Debug, Clone)]
pub enum Member {
    Producer(ProducerHandle),
    Monitor(MonitorHandle),
    Worker(WorkerRef),
}

impl Member {
    pub fn id(&self) -> MemberId {
        match self {
            Member::Producer(h) => h.id,
            Member::Monitor(h) => h.id,
            Member::Worker(w) => w.id,
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Member::Producer(h) => !h.is_closed(),
            Member::Monitor(h) => !h.is_closed(),
            Member::Worker(w) => !w.is_closed(),
        }
    }

    pub fn as_producer(&self) -> Option<&ProducerHandle> {
        match self {
            Member::Producer(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_monitor(&self) -> Option<&MonitorHandle> {
        match self {
            Member::Monitor(h) => Some(h),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Join attempted before the pool's groups were created (or after
    /// teardown).
    #[error("pool not registered: {0}")]
    NoSuchPool(PoolId),
}

struct Registration {
    node: NodeId,
    member: Member,
}

/// Shared in-memory registry. One instance may serve several pools; a
/// `(Global, _)` pool would additionally mirror remote registrations into
/// it, which is outside this crate's scope.
pub struct PoolRegistry {
    node: NodeId,
    groups: RwLock<HashMap<(PoolId, Role), Vec<Registration>>>,
}

impl PoolRegistry {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Identity of this node.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Create the three role groups for a pool. Idempotent.
    pub fn create(&self, pool: &PoolId) {
        let mut groups = self.groups.write();
        for role in Role::ALL {
            groups.entry((pool.clone(), role)).or_default();
        }
    }

    /// Remove a pool's groups. This is pool-level shutdown: subsequent
    /// joins fail and lookups return nothing.
    pub fn delete(&self, pool: &PoolId) {
        let mut groups = self.groups.write();
        for role in Role::ALL {
            groups.remove(&(pool.clone(), role));
        }
    }

    /// Register a live participant under this registry's node identity.
    pub fn join(&self, pool: &PoolId, role: Role, member: Member) -> Result<(), RegistryError> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(&(pool.clone(), role))
            .ok_or_else(|| RegistryError::NoSuchPool(pool.clone()))?;
        group.retain(|r| r.member.is_alive());
        group.push(Registration {
            node: self.node.clone(),
            member,
        });
        Ok(())
    }

    /// Drop a participant. A no-op when the pool or member is gone.
    pub fn leave(&self, pool: &PoolId, role: Role, member: MemberId) {
        let mut groups = self.groups.write();
        if let Some(group) = groups.get_mut(&(pool.clone(), role)) {
            group.retain(|r| r.member.id() != member);
        }
    }

    /// Live members of a role. `Scope::Local` restricts to this node.
    pub fn members(&self, pool: &PoolId, role: Role, scope: Scope) -> Vec<Member> {
        let groups = self.groups.read();
        let Some(group) = groups.get(&(pool.clone(), role)) else {
            return Vec::new();
        };
        group
            .iter()
            .filter(|r| match scope {
                Scope::Local => r.node == self.node,
                Scope::Cluster => true,
            })
            .filter(|r| r.member.is_alive())
            .map(|r| r.member.clone())
            .collect()
    }

    /// Pick one member, preferring local over remote and choosing at
    /// random among the equally close. Returns `None` when the role is
    /// (transiently) empty.
    pub fn closest(&self, pool: &PoolId, role: Role) -> Option<Member> {
        let local = self.members(pool, role, Scope::Local);
        let candidates = if local.is_empty() {
            self.members(pool, role, Scope::Cluster)
        } else {
            local
        };
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    /// Convenience: the closest queue producer of a pool.
    pub fn closest_producer(&self, pool: &PoolId) -> Option<ProducerHandle> {
        self.closest(pool, Role::Queues)
            .and_then(|m| m.as_producer().cloned())
    }
}
