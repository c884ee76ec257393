//! Postgres implementations backed by sqlx.
//!
//! - [`PgPoolFactory`] opens tenant and registry pools with the application role.
//! - [`PgProvisioner`] creates databases and applies migrations with the root role.
//! - [`PgTenantDirectory`] reads the registry `tenants` table.

use std::path::Path;

use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::error::{TenancyError, TenancyResult};
use crate::pool::{ConnectionFactory, PoolHandle, PoolSettings};
use crate::provision::{ProvisionOutcome, Provisioner, quote_identifier, quote_literal};
use crate::resolver::{TenantDirectory, TenantRecord};

const APPLICATION_NAME: &str = "stratos";

/// Database the root role connects to when creating other databases.
const MAINTENANCE_DATABASE: &str = "postgres";

/// SQLSTATE `duplicate_database`.
const DUPLICATE_DATABASE: &str = "42P04";

/// SQLSTATE `duplicate_object`, raised for an existing role.
const DUPLICATE_OBJECT: &str = "42710";

fn has_code(err: &sqlx::Error, code: &str) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|c| c == code)
}

// ── Pool factory ─────────────────────────────────────────────────────

/// Opens sqlx pools with the application role.
#[derive(Debug, Clone)]
pub struct PgPoolFactory {
    config: DatabaseConfig,
}

impl PgPoolFactory {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .password(&self.config.password)
            .database(database)
            .application_name(APPLICATION_NAME)
    }

    async fn open(&self, database: &str, settings: &PoolSettings) -> TenancyResult<PgPool> {
        let timeout = self.config.connect_timeout;
        let label = database.to_string();
        // min_connections(0) plus connect_with still dials once, so a missing
        // database fails here rather than on first query.
        let connect = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(0)
            .idle_timeout(settings.idle_timeout)
            .acquire_timeout(timeout)
            .after_connect(move |_conn, _meta| {
                let database = label.clone();
                Box::pin(async move {
                    debug!(%database, "database connection established");
                    Ok(())
                })
            })
            .connect_with(self.connect_options(database));

        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(pool)) => {
                info!(
                    %database,
                    max_connections = settings.max_connections,
                    idle_timeout = ?settings.idle_timeout,
                    "database pool established"
                );
                Ok(pool)
            }
            Ok(Err(e)) => {
                error!(%database, error = %e, "database pool connection error");
                Err(TenancyError::connection(database, e))
            }
            Err(_) => {
                error!(%database, ?timeout, "database pool connection timed out");
                Err(TenancyError::connection(
                    database,
                    format!("connect timed out after {timeout:?}"),
                ))
            }
        }
    }
}

#[async_trait]
impl ConnectionFactory for PgPoolFactory {
    type Pool = PgPool;

    async fn create_pool(&self, database: &str, settings: &PoolSettings) -> TenancyResult<PgPool> {
        self.open(database, settings).await
    }

    async fn create_main_pool(&self, settings: &PoolSettings) -> TenancyResult<PgPool> {
        self.open(&self.config.main_database, settings).await
    }
}

#[async_trait]
impl PoolHandle for PgPool {
    async fn close(&self) {
        PgPool::close(self).await;
        debug!(database = ?self.connect_options().get_database(), "database pool removed");
    }

    async fn ping(&self) -> Result<(), String> {
        sqlx::query("SELECT 1")
            .execute(self)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn is_closed(&self) -> bool {
        PgPool::is_closed(self)
    }
}

// ── Provisioner ──────────────────────────────────────────────────────

/// Creates databases and applies migrations with the root role.
#[derive(Debug, Clone)]
pub struct PgProvisioner {
    config: DatabaseConfig,
}

impl PgProvisioner {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    /// Single-connection root pool on `database`, closed by the caller.
    async fn connect_as_root(&self, database: &str) -> TenancyResult<PgPool> {
        let options = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.root_user)
            .password(&self.config.root_password)
            .database(database)
            .application_name(APPLICATION_NAME);
        let timeout = self.config.connect_timeout;
        let connect = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(timeout)
            .connect_with(options);
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(pool)) => Ok(pool),
            Ok(Err(e)) => Err(TenancyError::provisioning(
                database,
                format!("root connection failed: {e}"),
            )),
            Err(_) => Err(TenancyError::provisioning(
                database,
                format!("root connection timed out after {timeout:?}"),
            )),
        }
    }

    async fn create_in(&self, root: &PgPool, database: &str) -> TenancyResult<ProvisionOutcome> {
        let exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
                .bind(database)
                .fetch_optional(root)
                .await
                .map_err(|e| TenancyError::provisioning(database, e))?;
        if exists.is_some() {
            return Ok(ProvisionOutcome::AlreadyExists);
        }

        let sql = format!("CREATE DATABASE {}", quote_identifier(database));
        match sqlx::raw_sql(&sql).execute(root).await {
            Ok(_) => {
                info!(%database, "database created");
                Ok(ProvisionOutcome::Created)
            }
            Err(e) if has_code(&e, DUPLICATE_DATABASE) => Ok(ProvisionOutcome::AlreadyExists),
            Err(e) => Err(TenancyError::provisioning(database, e)),
        }
    }

    async fn ensure_role(&self, root: &PgPool) -> TenancyResult<()> {
        let role = &self.config.user;
        let sql = format!(
            "CREATE ROLE {} WITH LOGIN PASSWORD {}",
            quote_identifier(role),
            quote_literal(&self.config.password)
        );
        match sqlx::raw_sql(&sql).execute(root).await {
            Ok(_) => {
                info!(%role, "application role created");
                Ok(())
            }
            Err(e) if has_code(&e, DUPLICATE_OBJECT) => {
                debug!(%role, "application role already exists");
                Ok(())
            }
            Err(e) => Err(TenancyError::provisioning(&self.config.main_database, e)),
        }
    }

    /// Apply migrations from `migrations` (if any) and grant the application
    /// role access, through a root pool on `database`.
    async fn prepare(
        &self,
        root: &PgPool,
        database: &str,
        migrations: Option<&Path>,
    ) -> TenancyResult<()> {
        if let Some(dir) = migrations {
            let migrator = Migrator::new(dir.to_path_buf())
                .await
                .map_err(|e| TenancyError::provisioning(database, e))?;
            migrator
                .run(root)
                .await
                .map_err(|e| TenancyError::provisioning(database, e))?;
            info!(%database, migrations = migrator.iter().count(), "migrations applied");
        }

        let role = quote_identifier(&self.config.user);
        let grants = [
            format!(
                "GRANT ALL PRIVILEGES ON DATABASE {} TO {role}",
                quote_identifier(database)
            ),
            format!("GRANT ALL ON SCHEMA public TO {role}"),
            format!("GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA public TO {role}"),
            format!("GRANT ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA public TO {role}"),
        ];
        for sql in &grants {
            sqlx::raw_sql(sql)
                .execute(root)
                .await
                .map_err(|e| TenancyError::provisioning(database, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for PgProvisioner {
    async fn create_database(&self, database: &str) -> TenancyResult<ProvisionOutcome> {
        let root = self.connect_as_root(MAINTENANCE_DATABASE).await?;
        let result = self.create_in(&root, database).await;
        root.close().await;
        result
    }

    async fn initialize_schema(&self, database: &str) -> TenancyResult<()> {
        let root = self.connect_as_root(database).await?;
        let result = self
            .prepare(&root, database, self.config.tenant_migrations.as_deref())
            .await;
        root.close().await;
        result
    }

    async fn ensure_registry(&self) -> TenancyResult<ProvisionOutcome> {
        let database = self.config.main_database.as_str();

        let root = self.connect_as_root(MAINTENANCE_DATABASE).await?;
        let created = match self.ensure_role(&root).await {
            Ok(()) => self.create_in(&root, database).await,
            Err(e) => Err(e),
        };
        root.close().await;
        let outcome = created?;

        let root = self.connect_as_root(database).await?;
        let result = self
            .prepare(&root, database, self.config.registry_migrations.as_deref())
            .await;
        root.close().await;
        result?;

        info!(%database, ?outcome, "registry ready");
        Ok(outcome)
    }
}

// ── Tenant directory ─────────────────────────────────────────────────

/// Tenant lookups against the registry database.
#[derive(Debug, Clone)]
pub struct PgTenantDirectory {
    pool: PgPool,
}

impl PgTenantDirectory {
    /// `pool` is the manager's main connection.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantDirectory for PgTenantDirectory {
    async fn find_by_domain(&self, domain: &str) -> TenancyResult<Option<TenantRecord>> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT id, domain, database_name FROM tenants WHERE domain = $1 LIMIT 1",
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TenancyError::Registry(e.to_string()))?;

        Ok(row.map(|(id, domain, database_name)| TenantRecord {
            id,
            domain,
            database_name,
        }))
    }
}
