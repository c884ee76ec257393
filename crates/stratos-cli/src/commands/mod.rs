use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use stratos_tenancy::{
    PgPoolFactory, PgProvisioner, PgTenantConnectionManager, TenancyConfig,
    TenantConnectionManager,
};

pub mod bootstrap;
pub mod health;
pub mod provision;
pub mod resolve;

/// Load from `path` if given, else from the environment.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<TenancyConfig> {
    match path {
        Some(path) => TenancyConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => TenancyConfig::from_env().context("loading configuration from environment"),
    }
}

/// Manager over Postgres pools with the Postgres provisioner attached.
/// Not started.
pub fn build_manager(config: &TenancyConfig) -> PgTenantConnectionManager {
    TenantConnectionManager::new(
        config.manager.clone(),
        PgPoolFactory::new(config.database.clone()),
    )
    .with_provisioner(Arc::new(PgProvisioner::new(config.database.clone())))
}

pub async fn start_manager(config: &TenancyConfig) -> anyhow::Result<PgTenantConnectionManager> {
    let manager = build_manager(config);
    manager
        .start()
        .await
        .context("connecting to the registry database")?;
    Ok(manager)
}

pub fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
