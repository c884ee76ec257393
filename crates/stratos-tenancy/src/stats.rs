//! Read-only snapshots of manager state.

use serde::Serialize;

/// Lifecycle of the registry pool as seen by observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MainStatus {
    /// `start()` has not completed yet.
    Uninitialized,
    Connected,
    /// `shutdown()` has run.
    Closed,
}

impl std::fmt::Display for MainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MainStatus::Uninitialized => write!(f, "uninitialized"),
            MainStatus::Connected => write!(f, "connected"),
            MainStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot returned by `TenantConnectionManager::get_stats`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub main: MainStatus,
    /// Number of tenant pools currently held.
    pub active_tenants: usize,
    /// Tenant database names, least recently used first.
    pub tenants: Vec<String>,
    /// Pool creations in flight.
    pub pending_creations: usize,
}
