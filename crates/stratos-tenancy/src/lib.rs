//! stratos-tenancy — database-per-tenant connection management.
//!
//! Keeps one connection pool per tenant database, bounded in number, plus a
//! single pool for the registry database that describes the tenants:
//! - **manager**: `TenantConnectionManager`, the pool table with LRU eviction,
//!   single-flight creation and an idle sweeper
//! - **pool**: the `ConnectionFactory` / `PoolHandle` seam and the per-tenant record
//! - **postgres**: sqlx implementations of the factory, provisioner and tenant directory
//! - **provision**: database creation, name validation and derivation
//! - **resolver**: `Host` header to tenant database resolution
//! - **health**: pool probes for health endpoints
//! - **config**: environment and TOML configuration

pub mod config;
pub mod error;
pub mod health;
pub mod lru;
pub mod manager;
pub mod pool;
pub mod postgres;
pub mod provision;
pub mod resolver;
pub mod stats;

#[cfg(test)]
mod testing;

pub use config::{DatabaseConfig, DevFallback, ManagerConfig, ResolverConfig, TenancyConfig};
pub use error::{TenancyError, TenancyResult};
pub use health::{HealthReport, HealthStatus, check_health};
pub use manager::TenantConnectionManager;
pub use pool::{ConnectionFactory, PoolHandle, PoolSettings, TenantPool};
pub use postgres::{PgPoolFactory, PgProvisioner, PgTenantDirectory};
pub use provision::{ProvisionOutcome, Provisioner, tenant_database_name, validate_database_name};
pub use resolver::{DomainResolver, TenantContext, TenantDirectory, TenantRecord, normalize_domain};
pub use stats::{MainStatus, ManagerStats};

/// Manager backed by real Postgres pools.
pub type PgTenantConnectionManager = TenantConnectionManager<PgPoolFactory>;
