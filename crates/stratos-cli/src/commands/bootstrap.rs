use anyhow::Context;
use serde_json::json;
use stratos_tenancy::{PgProvisioner, Provisioner, TenancyConfig};
use tracing::info;

use super::print_json;

/// Create the registry database, the application role and the registry schema.
pub async fn run(config: &TenancyConfig) -> anyhow::Result<()> {
    let database = &config.database.main_database;
    info!(%database, "bootstrapping registry");

    let provisioner = PgProvisioner::new(config.database.clone());
    let outcome = provisioner
        .ensure_registry()
        .await
        .with_context(|| format!("bootstrapping registry database {database}"))?;

    print_json(&json!({ "database": database, "outcome": outcome }))
}
