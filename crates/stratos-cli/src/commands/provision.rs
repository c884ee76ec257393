use anyhow::{Context, bail};
use serde_json::json;
use stratos_tenancy::{TenancyConfig, tenant_database_name};

use super::{build_manager, print_json};

pub async fn run(
    config: &TenancyConfig,
    database: Option<String>,
    tenant_id: Option<String>,
) -> anyhow::Result<()> {
    let database = target_database(config, database, tenant_id)?;

    let manager = build_manager(config);
    let result = manager.create_tenant_database(&database).await;
    manager.shutdown().await;
    let outcome = result.with_context(|| format!("provisioning {database}"))?;

    print_json(&json!({ "database": database, "outcome": outcome }))
}

fn target_database(
    config: &TenancyConfig,
    database: Option<String>,
    tenant_id: Option<String>,
) -> anyhow::Result<String> {
    match (database, tenant_id) {
        (Some(database), _) => Ok(database),
        (None, Some(tenant_id)) => {
            Ok(tenant_database_name(&config.resolver.tenant_db_prefix, &tenant_id)?)
        }
        (None, None) => bail!("either --database or --tenant-id is required"),
    }
}
