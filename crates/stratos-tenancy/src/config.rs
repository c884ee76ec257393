//! Configuration for the tenant connection manager and its factory.
//!
//! Loaded from environment variables ([`TenancyConfig::from_env`]) or a TOML
//! file ([`TenancyConfig::from_file`]). Durations are expressed in
//! milliseconds in both sources.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TenancyError, TenancyResult};
use crate::pool::PoolSettings;
use crate::provision::validate_database_name;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenancyConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Database server location and credentials, consumed by the connection factory
/// and the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Application role used for every tenant and registry pool.
    pub user: String,
    pub password: String,
    /// Registry (control-plane) database holding tenant metadata.
    pub main_database: String,
    /// Elevated role used only for provisioning.
    #[serde(default = "default_root_user")]
    pub root_user: String,
    pub root_password: String,
    /// Upper bound on establishing a pool (default: 5s).
    #[serde(default = "default_connect_timeout", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// sqlx migrations applied to every new tenant database.
    #[serde(default)]
    pub tenant_migrations: Option<PathBuf>,
    /// sqlx migrations applied to the registry database on bootstrap.
    #[serde(default)]
    pub registry_migrations: Option<PathBuf>,
}

/// Resource ceilings and timers of the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum tenant pools held at once (default: 50).
    pub max_tenant_pools: usize,
    /// Settings for each tenant pool (default: 10 connections, 30 min idle).
    pub tenant_pool: PoolSettings,
    /// Settings for the registry pool (default: 20 connections, 60s idle).
    pub main_pool: PoolSettings,
    /// Tenant pools unused for longer than this are swept (default: 30 min).
    #[serde(with = "duration_ms")]
    pub idle_threshold: Duration,
    /// Interval between idle sweeps (default: 5 min).
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Upper bound on closing a single pool (default: 30s).
    #[serde(with = "duration_ms")]
    pub close_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_tenant_pools: 50,
            tenant_pool: PoolSettings {
                max_connections: 10,
                idle_timeout: Duration::from_secs(30 * 60),
            },
            main_pool: PoolSettings {
                max_connections: 20,
                idle_timeout: Duration::from_secs(60),
            },
            idle_threshold: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            close_timeout: Duration::from_secs(30),
        }
    }
}

/// Host-to-tenant resolution policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Prefix of generated tenant database names.
    pub tenant_db_prefix: String,
    /// Tenant substituted when an unregistered development domain is seen.
    pub dev_fallback: Option<DevFallback>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            tenant_db_prefix: "saas_tenant_".to_string(),
            dev_fallback: None,
        }
    }
}

/// Development tenant used for a single unregistered domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevFallback {
    pub domain: String,
    #[serde(default = "default_dev_tenant_id")]
    pub tenant_id: String,
    #[serde(default = "default_dev_database")]
    pub database: String,
}

fn default_port() -> u16 {
    5432
}

fn default_root_user() -> String {
    "postgres".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_dev_tenant_id() -> String {
    "dev-tenant".to_string()
}

fn default_dev_database() -> String {
    "saas_dev".to_string()
}

impl TenancyConfig {
    /// Load from the process environment.
    pub fn from_env() -> TenancyResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load from an explicit set of variables.
    pub fn from_vars<I, K, V>(vars: I) -> TenancyResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env = EnvVars(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );

        let mut manager = ManagerConfig::default();
        if let Some(max) = env.parse("MAX_TENANT_POOLS")? {
            manager.max_tenant_pools = max;
        }
        if let Some(max) = env.parse("TENANT_DB_MAX_CONNECTIONS")? {
            manager.tenant_pool.max_connections = max;
        }
        if let Some(ms) = env.millis("TENANT_DB_IDLE_TIMEOUT")? {
            manager.tenant_pool.idle_timeout = ms;
        }
        if let Some(max) = env.parse("MAIN_DB_MAX_CONNECTIONS")? {
            manager.main_pool.max_connections = max;
        }
        if let Some(ms) = env.millis("MAIN_DB_IDLE_TIMEOUT")? {
            manager.main_pool.idle_timeout = ms;
        }
        if let Some(ms) = env.millis("TENANT_POOL_IDLE_THRESHOLD_MS")? {
            manager.idle_threshold = ms;
        }
        if let Some(ms) = env.millis("TENANT_POOL_SWEEP_INTERVAL_MS")? {
            manager.sweep_interval = ms;
        }
        if let Some(ms) = env.millis("TENANT_POOL_CLOSE_TIMEOUT_MS")? {
            manager.close_timeout = ms;
        }

        let mut resolver = ResolverConfig::default();
        if let Some(prefix) = env.get("TENANT_DB_PREFIX") {
            resolver.tenant_db_prefix = prefix.to_string();
        }
        if let Some(domain) = env.get("DEV_TENANT_DOMAIN") {
            resolver.dev_fallback = Some(DevFallback {
                domain: domain.to_string(),
                tenant_id: default_dev_tenant_id(),
                database: env
                    .get("DEV_TENANT_DATABASE")
                    .map(str::to_string)
                    .unwrap_or_else(default_dev_database),
            });
        }

        let config = Self {
            database: DatabaseConfig {
                host: env.require("DB_HOST")?,
                port: env.parse("DB_PORT")?.unwrap_or_else(default_port),
                user: env.require("DB_USER")?,
                password: env.require("DB_PASSWORD")?,
                main_database: env.require("DB_NAME")?,
                root_user: env
                    .get("DB_ROOT_USER")
                    .map(str::to_string)
                    .unwrap_or_else(default_root_user),
                root_password: env.require("DB_ROOT_PASSWORD")?,
                connect_timeout: env
                    .millis("DB_CONNECT_TIMEOUT_MS")?
                    .unwrap_or_else(default_connect_timeout),
                tenant_migrations: env.get("TENANT_MIGRATIONS_DIR").map(PathBuf::from),
                registry_migrations: env.get("REGISTRY_MIGRATIONS_DIR").map(PathBuf::from),
            },
            manager,
            resolver,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> TenancyResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TenancyError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> TenancyResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| TenancyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the manager cannot operate with.
    pub fn validate(&self) -> TenancyResult<()> {
        let manager = &self.manager;
        if manager.max_tenant_pools == 0 {
            return Err(TenancyError::Config(
                "max_tenant_pools must be at least 1".into(),
            ));
        }
        if manager.tenant_pool.max_connections == 0 || manager.main_pool.max_connections == 0 {
            return Err(TenancyError::Config(
                "pool max_connections must be at least 1".into(),
            ));
        }
        if manager.sweep_interval.is_zero() {
            return Err(TenancyError::Config("sweep_interval must be non-zero".into()));
        }
        if self.database.connect_timeout.is_zero() {
            return Err(TenancyError::Config("connect_timeout must be non-zero".into()));
        }
        // The prefix must itself form a valid identifier start.
        validate_database_name(&self.resolver.tenant_db_prefix).map_err(|_| {
            TenancyError::Config(format!(
                "invalid tenant_db_prefix: {:?}",
                self.resolver.tenant_db_prefix
            ))
        })?;
        Ok(())
    }
}

struct EnvVars(HashMap<String, String>);

impl EnvVars {
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, name: &str) -> TenancyResult<String> {
        self.get(name)
            .map(str::to_string)
            .ok_or_else(|| TenancyError::Config(format!("missing environment variable {name}")))
    }

    fn parse<T: FromStr>(&self, name: &str) -> TenancyResult<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| TenancyError::Config(format!("invalid {name}={raw:?}: {e}")))
            })
            .transpose()
    }

    fn millis(&self, name: &str) -> TenancyResult<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
