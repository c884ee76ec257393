//! In-memory factory, pool and provisioner shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ManagerConfig;
use crate::error::{TenancyError, TenancyResult};
use crate::pool::{ConnectionFactory, PoolHandle, PoolSettings};
use crate::provision::{ProvisionOutcome, Provisioner};

// ── Mock pool ────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct MockPool {
    pub id: u64,
    pub database: String,
    closed: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
    close_calls: Arc<AtomicU64>,
    close_delay: Duration,
}

impl MockPool {
    pub fn new(id: u64, database: &str, close_delay: Duration) -> Self {
        Self {
            id,
            database: database.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
            healthy: Arc::new(AtomicBool::new(true)),
            close_calls: Arc::new(AtomicU64::new(0)),
            close_delay,
        }
    }

    pub fn close_calls(&self) -> u64 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl PoolHandle for MockPool {
    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn ping(&self) -> Result<(), String> {
        if self.is_closed() {
            return Err("pool is closed".to_string());
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("connection reset by peer".to_string())
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ── Mock factory ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockFactory {
    next_id: AtomicU64,
    attempts: Mutex<HashMap<String, usize>>,
    created: Mutex<Vec<MockPool>>,
    main: Mutex<Option<MockPool>>,
    failing: Mutex<HashSet<String>>,
    fail_main: AtomicBool,
    create_delay: Duration,
    close_delay: Duration,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Factory whose tenant pool creations take `delay` to complete.
    pub fn with_create_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            create_delay: delay,
            ..Self::default()
        })
    }

    /// Factory whose pools take `delay` to close.
    pub fn with_close_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            close_delay: delay,
            ..Self::default()
        })
    }

    pub fn fail_database(&self, database: &str) {
        self.failing.lock().unwrap().insert(database.to_string());
    }

    pub fn heal_database(&self, database: &str) {
        self.failing.lock().unwrap().remove(database);
    }

    pub fn fail_main(&self) {
        self.fail_main.store(true, Ordering::SeqCst);
    }

    /// Creation attempts for `database`, failed ones included.
    pub fn attempts(&self, database: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(database)
            .copied()
            .unwrap_or(0)
    }

    /// Successful tenant pool creations across all databases.
    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn pools_for(&self, database: &str) -> Vec<MockPool> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.database == database)
            .cloned()
            .collect()
    }

    pub fn main_pool(&self) -> Option<MockPool> {
        self.main.lock().unwrap().clone()
    }

    pub fn main_creations(&self) -> usize {
        usize::from(self.main.lock().unwrap().is_some())
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Pool = MockPool;

    async fn create_pool(
        &self,
        database: &str,
        _settings: &PoolSettings,
    ) -> TenancyResult<MockPool> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(database.to_string())
            .or_default() += 1;
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self.failing.lock().unwrap().contains(database) {
            return Err(TenancyError::connection(
                database,
                format!("database \"{database}\" does not exist"),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pool = MockPool::new(id, database, self.close_delay);
        self.created.lock().unwrap().push(pool.clone());
        Ok(pool)
    }

    async fn create_main_pool(&self, _settings: &PoolSettings) -> TenancyResult<MockPool> {
        if self.fail_main.load(Ordering::SeqCst) {
            return Err(TenancyError::connection("registry", "connection refused"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pool = MockPool::new(id, "registry", Duration::ZERO);
        *self.main.lock().unwrap() = Some(pool.clone());
        Ok(pool)
    }
}

// ── Mock provisioner ─────────────────────────────────────────────────

#[derive(Default)]
pub struct MockProvisioner {
    existing: Mutex<HashSet<String>>,
    schema_runs: Mutex<Vec<String>>,
    fail_create: AtomicBool,
}

impl MockProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn schema_runs(&self) -> Vec<String> {
        self.schema_runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn create_database(&self, database: &str) -> TenancyResult<ProvisionOutcome> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TenancyError::connection(database, "permission denied"));
        }
        if self.existing.lock().unwrap().insert(database.to_string()) {
            Ok(ProvisionOutcome::Created)
        } else {
            Ok(ProvisionOutcome::AlreadyExists)
        }
    }

    async fn initialize_schema(&self, database: &str) -> TenancyResult<()> {
        self.schema_runs.lock().unwrap().push(database.to_string());
        Ok(())
    }

    async fn ensure_registry(&self) -> TenancyResult<ProvisionOutcome> {
        Ok(ProvisionOutcome::Created)
    }
}

/// Manager settings with a sweep interval long enough to stay out of the way
/// of tests that drive cleanup by hand.
pub fn manual_sweep_config(max_tenant_pools: usize) -> ManagerConfig {
    ManagerConfig {
        max_tenant_pools,
        sweep_interval: Duration::from_secs(24 * 60 * 60),
        ..ManagerConfig::default()
    }
}

/// Yield until `condition` holds. Panics after ~5s of polling.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
