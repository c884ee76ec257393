use anyhow::{Context, anyhow};
use serde_json::json;
use stratos_tenancy::{
    DomainResolver, PgTenantConnectionManager, PgTenantDirectory, PoolHandle, TenancyConfig,
    TenantContext,
};

use super::{print_json, start_manager};

/// Resolve `host`, open its tenant pool and print the tenant with manager stats.
pub async fn run(config: &TenancyConfig, host: &str) -> anyhow::Result<()> {
    let manager = start_manager(config).await?;
    let result = resolve_and_ping(config, &manager, host).await;
    let stats = manager.get_stats().await;
    manager.shutdown().await;
    let context = result?;

    print_json(&json!({ "tenant": context, "stats": stats }))
}

async fn resolve_and_ping(
    config: &TenancyConfig,
    manager: &PgTenantConnectionManager,
    host: &str,
) -> anyhow::Result<TenantContext> {
    let directory = PgTenantDirectory::new(manager.get_main_connection()?);
    let resolver = DomainResolver::new(directory, &config.resolver);
    let (context, pool) = resolver
        .connect(Some(host), manager)
        .await
        .with_context(|| format!("resolving {host}"))?;
    pool.ping()
        .await
        .map_err(|e| anyhow!("tenant database {} unreachable: {e}", context.database_name))?;
    Ok(context)
}
