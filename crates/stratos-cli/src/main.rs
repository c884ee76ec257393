//! stratosctl — operator CLI for Stratos tenant databases.
//!
//! # Usage
//!
//! ```text
//! stratosctl bootstrap
//! stratosctl provision --tenant-id 01HZX3K9Q8M2N4P6R7S8T9V0W1
//! stratosctl resolve acme.example.com
//! stratosctl health --tenant saas_tenant_01hzx3k9q8m2n4p6
//! ```
//!
//! Configuration comes from `--config <file.toml>` or the `DB_*` environment.

use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "stratosctl",
    about = "Stratos tenant database operations",
    version,
    propagate_version = true
)]
struct Cli {
    /// TOML configuration file. Defaults to DB_* environment variables.
    #[arg(long, global = true, env = "STRATOS_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the registry database, application role and registry schema.
    Bootstrap,
    /// Create a tenant database and apply the tenant schema.
    #[command(group(ArgGroup::new("target").required(true).args(["database", "tenant_id"])))]
    Provision {
        /// Physical database name.
        #[arg(long)]
        database: Option<String>,
        /// Tenant id; the database name is derived with the configured prefix.
        #[arg(long)]
        tenant_id: Option<String>,
    },
    /// Resolve a host to its tenant and open the tenant pool.
    Resolve {
        /// Host header value, port allowed.
        host: String,
    },
    /// Probe the registry pool and the given tenant pools.
    Health {
        /// Tenant database to open before probing. Repeatable.
        #[arg(long = "tenant")]
        tenants: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json)?;

    let config = commands::load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Bootstrap => commands::bootstrap::run(&config).await,
        Command::Provision {
            database,
            tenant_id,
        } => commands::provision::run(&config, database, tenant_id).await,
        Command::Resolve { host } => commands::resolve::run(&config, &host).await,
        Command::Health { tenants } => commands::health::run(&config, &tenants).await,
    }
}

/// Logs go to stderr so command output on stdout stays machine-readable.
fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new("info,stratos=debug")?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn provision_requires_a_target() {
        assert!(Cli::try_parse_from(["stratosctl", "provision"]).is_err());
        assert!(
            Cli::try_parse_from([
                "stratosctl",
                "provision",
                "--database",
                "a",
                "--tenant-id",
                "b"
            ])
            .is_err()
        );
    }

    #[test]
    fn provision_by_tenant_id() {
        let cli = Cli::try_parse_from(["stratosctl", "provision", "--tenant-id", "01HZX"]).unwrap();
        match cli.command {
            Command::Provision {
                database,
                tenant_id,
            } => {
                assert_eq!(database, None);
                assert_eq!(tenant_id.as_deref(), Some("01HZX"));
            }
            _ => panic!("expected provision"),
        }
    }

    #[test]
    fn health_accepts_repeated_tenants_and_global_flags() {
        let cli = Cli::try_parse_from([
            "stratosctl",
            "health",
            "--tenant",
            "saas_a",
            "--tenant",
            "saas_b",
            "--json",
            "--config",
            "stratos.toml",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("stratos.toml")));
        match cli.command {
            Command::Health { tenants } => assert_eq!(tenants, ["saas_a", "saas_b"]),
            _ => panic!("expected health"),
        }
    }
}
