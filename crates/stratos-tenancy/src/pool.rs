//! Pool record and the connection factory seam.
//!
//! The manager is generic over a [`ConnectionFactory`] so that the Postgres
//! factory in [`crate::postgres`] can be swapped for an in-memory one in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::duration_ms;
use crate::error::TenancyResult;

/// Ceiling and idle policy applied to one physical pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum concurrently open connections in the pool.
    pub max_connections: u32,
    /// Connections idle longer than this are closed by the pool itself.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
}

/// A live connection pool. Clones share the same underlying pool.
#[async_trait]
pub trait PoolHandle: Clone + Send + Sync + 'static {
    /// Close the pool, waiting for checked-out connections to be returned.
    async fn close(&self);

    /// Round-trip a trivial query. Returns the failure reason on error.
    async fn ping(&self) -> Result<(), String>;

    fn is_closed(&self) -> bool;
}

/// Opens physical pools. Implementations enforce their own connect timeout
/// and never retry.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Pool: PoolHandle;

    /// Open a pool scoped to one tenant database.
    async fn create_pool(&self, database: &str, settings: &PoolSettings)
    -> TenancyResult<Self::Pool>;

    /// Open the pool for the registry database.
    async fn create_main_pool(&self, settings: &PoolSettings) -> TenancyResult<Self::Pool>;
}

#[async_trait]
impl<T: ConnectionFactory> ConnectionFactory for Arc<T> {
    type Pool = T::Pool;

    async fn create_pool(
        &self,
        database: &str,
        settings: &PoolSettings,
    ) -> TenancyResult<Self::Pool> {
        (**self).create_pool(database, settings).await
    }

    async fn create_main_pool(&self, settings: &PoolSettings) -> TenancyResult<Self::Pool> {
        (**self).create_main_pool(settings).await
    }
}

/// One tenant's pool plus the recency bookkeeping the manager needs.
#[derive(Debug)]
pub struct TenantPool<P> {
    database: String,
    handle: P,
    last_used_at: Instant,
    uses: u64,
}

impl<P> TenantPool<P> {
    pub fn new(database: impl Into<String>, handle: P, now: Instant) -> Self {
        Self {
            database: database.into(),
            handle,
            last_used_at: now,
            uses: 1,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn handle(&self) -> &P {
        &self.handle
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Number of acquisitions served by this pool, including the first.
    pub fn uses(&self) -> u64 {
        self.uses
    }

    /// Record an acquisition at `now`.
    pub fn touch(&mut self, now: Instant) {
        self.last_used_at = self.last_used_at.max(now);
        self.uses += 1;
    }

    pub fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_used_at) > threshold
    }
}
