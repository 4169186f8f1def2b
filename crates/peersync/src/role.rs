//! Peer role provider and sync eligibility.

use crate::item::SyncDirection;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Redundancy role of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Node serves traffic.
    Active,
    /// Node is the standby.
    Passive,
    /// Role not (yet) known.
    #[default]
    Unknown,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Active => write!(f, "Active"),
            PeerRole::Passive => write!(f, "Passive"),
            PeerRole::Unknown => write!(f, "Unknown"),
        }
    }
}

impl PeerRole {
    fn to_u8(self) -> u8 {
        match self {
            PeerRole::Active => 0,
            PeerRole::Passive => 1,
            PeerRole::Unknown => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerRole::Active,
            1 => PeerRole::Passive,
            _ => PeerRole::Unknown,
        }
    }
}

/// Source of the local role and the redundancy signal.
#[async_trait]
pub trait RoleProvider: Send + Sync {
    /// Fetch fresh values from the backing source.
    async fn refresh(&self);
    /// Current local role.
    fn role(&self) -> PeerRole;
    /// Whether the redundant pair is established.
    fn redundancy_enabled(&self) -> bool;
}

/// Role provider with fixed values, taken from the daemon config.
#[derive(Debug)]
pub struct StaticRoleProvider {
    role: AtomicU8,
    redundancy: AtomicBool,
}

impl StaticRoleProvider {
    /// Create a provider reporting `role` and `redundancy_enabled`.
    pub fn new(role: PeerRole, redundancy_enabled: bool) -> Self {
        Self {
            role: AtomicU8::new(role.to_u8()),
            redundancy: AtomicBool::new(redundancy_enabled),
        }
    }

    /// Change the reported role.
    pub fn set_role(&self, role: PeerRole) {
        self.role.store(role.to_u8(), Ordering::SeqCst);
    }

    /// Change the reported redundancy signal.
    pub fn set_redundancy_enabled(&self, enabled: bool) {
        self.redundancy.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoleProvider for StaticRoleProvider {
    async fn refresh(&self) {}

    fn role(&self) -> PeerRole {
        PeerRole::from_u8(self.role.load(Ordering::SeqCst))
    }

    fn redundancy_enabled(&self) -> bool {
        self.redundancy.load(Ordering::SeqCst)
    }
}

/// Whether an item with `direction` is synced from a node with `role`.
pub fn is_eligible(direction: SyncDirection, role: PeerRole) -> bool {
    matches!(
        (direction, role),
        (SyncDirection::Bidirectional, _)
            | (SyncDirection::ActiveToPassive, PeerRole::Active)
            | (SyncDirection::PassiveToActive, PeerRole::Passive)
    )
}
