use anyhow::bail;
use stratos_tenancy::{HealthStatus, TenancyConfig, check_health};
use tracing::warn;

use super::{print_json, start_manager};

/// Open the listed tenant pools, probe everything the manager holds and print
/// the report. Fails unless every pool is healthy.
pub async fn run(config: &TenancyConfig, tenants: &[String]) -> anyhow::Result<()> {
    let manager = start_manager(config).await?;
    let mut unopened = 0usize;
    for database in tenants {
        if let Err(e) = manager.get_tenant_connection(database).await {
            warn!(%database, error = %e, "could not open tenant pool");
            unopened += 1;
        }
    }

    let report = check_health(&manager, config.database.connect_timeout).await;
    manager.shutdown().await;
    print_json(&report)?;

    if report.status != HealthStatus::Healthy || unopened > 0 {
        bail!(
            "{:?}: {} of {} tenant pools unhealthy, {unopened} could not be opened",
            report.status,
            report.summary.unhealthy,
            report.summary.total
        );
    }
    Ok(())
}
