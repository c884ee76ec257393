//! Health probes over the pools a manager currently holds.
//!
//! Probing never opens a pool and never changes recency order, so a health
//! endpoint polled every few seconds cannot keep an idle tenant alive.

use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::manager::TenantConnectionManager;
use crate::pool::{ConnectionFactory, PoolHandle};
use crate::stats::MainStatus;

/// Outcome of probing one pool, or of the whole report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Registry reachable, at least one tenant pool failing.
    Degraded,
    Unhealthy,
}

/// Probe result for a single pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub database: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PoolHealth {
    fn from_probe(database: String, probe: Result<(), String>) -> Self {
        match probe {
            Ok(()) => Self {
                database,
                status: HealthStatus::Healthy,
                error: None,
            },
            Err(error) => Self {
                database,
                status: HealthStatus::Unhealthy,
                error: Some(error),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Snapshot of registry and tenant pool health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Unix seconds.
    pub checked_at: u64,
    pub main_status: MainStatus,
    /// Registry probe, absent when the manager is not running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main: Option<PoolHealth>,
    pub summary: HealthSummary,
    pub tenants: Vec<PoolHealth>,
}

/// Ping the registry pool and every tenant pool the manager holds.
///
/// Each ping is bounded by `timeout`. The report is unhealthy when the
/// registry is unreachable or not running, degraded when only tenant pools
/// fail.
pub async fn check_health<F: ConnectionFactory>(
    manager: &TenantConnectionManager<F>,
    timeout: Duration,
) -> HealthReport {
    let main_status = manager.main_status();
    let main = match (main_status, manager.main_handle()) {
        (MainStatus::Connected, Some(handle)) => Some(PoolHealth::from_probe(
            "registry".to_string(),
            probe(&handle, timeout).await,
        )),
        _ => None,
    };

    let handles = manager.tenant_handles().await;
    let tenants: Vec<PoolHealth> = join_all(handles.into_iter().map(|(database, handle)| async move {
        let result = probe(&handle, timeout).await;
        if let Err(e) = &result {
            warn!(%database, error = %e, "tenant pool health check failed");
        }
        PoolHealth::from_probe(database, result)
    }))
    .await;

    let healthy = tenants
        .iter()
        .filter(|t| t.status == HealthStatus::Healthy)
        .count();
    let summary = HealthSummary {
        total: tenants.len(),
        healthy,
        unhealthy: tenants.len() - healthy,
    };

    let main_healthy = main
        .as_ref()
        .is_some_and(|m| m.status == HealthStatus::Healthy);
    let status = if !main_healthy {
        HealthStatus::Unhealthy
    } else if summary.unhealthy > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    debug!(?status, tenants = summary.total, unhealthy = summary.unhealthy, "health check complete");

    HealthReport {
        status,
        checked_at: epoch_secs(),
        main_status,
        main,
        summary,
        tenants,
    }
}

async fn probe<P: PoolHandle>(handle: &P, timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(timeout, handle.ping()).await {
        Ok(result) => result,
        Err(_) => Err(format!("ping timed out after {timeout:?}")),
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
