//! Tenant connection manager.
//!
//! Maps tenant database names to live pools, bounded by
//! [`ManagerConfig::max_tenant_pools`], with least-recently-used eviction and
//! a background sweep of idle pools. The registry ("main") pool lives outside
//! that table and is never evicted.
//!
//! # Acquisition
//!
//! ```text
//! get_tenant_connection(db)
//!   → pool in table        → touch, move to most-recent end → handle
//!   → creation in flight   → join it → same handle or same error
//!   → absent               → spawn creation, register it as in flight
//!       → factory ok  → lock, evict oldest until room, admit → handle
//!       → factory err → lock, forget the in-flight entry      → error
//! ```
//!
//! Creation runs in its own task and callers await a shared future, so a
//! caller that gives up does not cancel the creation other callers joined.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::error::{TenancyError, TenancyResult};
use crate::lru::LruIndex;
use crate::pool::{ConnectionFactory, PoolHandle, TenantPool};
use crate::provision::{ProvisionOutcome, Provisioner, validate_database_name};
use crate::stats::{MainStatus, ManagerStats};

type PendingPool<P> = Shared<BoxFuture<'static, TenancyResult<P>>>;

/// Names of the pools unused for longer than `threshold` at `now`.
pub fn select_idle<'a, P: 'a>(
    pools: impl IntoIterator<Item = &'a TenantPool<P>>,
    now: Instant,
    threshold: Duration,
) -> Vec<String> {
    pools
        .into_iter()
        .filter(|pool| pool.is_idle(now, threshold))
        .map(|pool| pool.database().to_string())
        .collect()
}

// ── Pool table ───────────────────────────────────────────────────────

/// Tenant pools, their recency order and in-flight creations.
///
/// `pools` and `lru` always hold the same key set.
struct PoolTable<P> {
    pools: HashMap<String, TenantPool<P>>,
    lru: LruIndex,
    pending: HashMap<String, PendingPool<P>>,
}

impl<P: PoolHandle> PoolTable<P> {
    fn new() -> Self {
        Self {
            pools: HashMap::new(),
            lru: LruIndex::new(),
            pending: HashMap::new(),
        }
    }

    /// Hand out the pool for `database`, recording the use.
    fn acquire(&mut self, database: &str, now: Instant) -> Option<P> {
        let pool = self.pools.get_mut(database)?;
        pool.touch(now);
        self.lru.touch(database);
        Some(pool.handle().clone())
    }

    fn admit(&mut self, pool: TenantPool<P>) {
        self.lru.push(pool.database());
        self.pools.insert(pool.database().to_string(), pool);
        debug_assert_eq!(self.pools.len(), self.lru.len());
    }

    fn remove(&mut self, database: &str) -> Option<TenantPool<P>> {
        self.lru.remove(database);
        self.pools.remove(database)
    }

    /// Evict least recently used pools until one more fits under `capacity`.
    fn make_room(&mut self, capacity: usize) -> TenancyResult<Vec<TenantPool<P>>> {
        if capacity == 0 {
            return Err(TenancyError::Capacity { capacity });
        }
        let mut evicted = Vec::new();
        while self.pools.len() >= capacity {
            match self.lru.pop_oldest() {
                Some(oldest) => evicted.extend(self.pools.remove(&oldest)),
                None => break,
            }
        }
        Ok(evicted)
    }

    /// Take every pool out of the table, least recently used first.
    fn drain(&mut self) -> Vec<TenantPool<P>> {
        self.pending.clear();
        let mut drained = Vec::with_capacity(self.pools.len());
        while let Some(oldest) = self.lru.pop_oldest() {
            drained.extend(self.pools.remove(&oldest));
        }
        drained.extend(self.pools.drain().map(|(_, pool)| pool));
        drained
    }
}

// ── Manager ──────────────────────────────────────────────────────────

struct ManagerState<F: ConnectionFactory> {
    config: ManagerConfig,
    factory: F,
    provisioner: OnceLock<Arc<dyn Provisioner>>,
    table: Mutex<PoolTable<F::Pool>>,
    main: OnceLock<F::Pool>,
    closed: AtomicBool,
    /// Also serializes `start()` against itself and `shutdown()`.
    sweeper: Mutex<Option<Sweeper>>,
}

/// Process-wide owner of every database pool.
///
/// Cheap to clone; clones share the same pools.
pub struct TenantConnectionManager<F: ConnectionFactory> {
    state: Arc<ManagerState<F>>,
}

impl<F: ConnectionFactory> Clone for TenantConnectionManager<F> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for TenantConnectionManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConnectionManager")
            .field("max_tenant_pools", &self.state.config.max_tenant_pools)
            .field("started", &self.state.main.get().is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<F: ConnectionFactory> TenantConnectionManager<F> {
    pub fn new(config: ManagerConfig, factory: F) -> Self {
        Self {
            state: Arc::new(ManagerState {
                config,
                factory,
                provisioner: OnceLock::new(),
                table: Mutex::new(PoolTable::new()),
                main: OnceLock::new(),
                closed: AtomicBool::new(false),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Attach the provisioner used by [`Self::create_tenant_database`].
    pub fn with_provisioner(self, provisioner: Arc<dyn Provisioner>) -> Self {
        if self.state.provisioner.set(provisioner).is_err() {
            warn!("provisioner already set, keeping the first one");
        }
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.state.config
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Open the registry pool and start the idle sweeper.
    ///
    /// Calling it again after success is a no-op. Fails with
    /// [`TenancyError::ManagerClosed`] after [`Self::shutdown`].
    pub async fn start(&self) -> TenancyResult<()> {
        let mut sweeper = self.state.sweeper.lock().await;
        if self.is_closed() {
            return Err(TenancyError::ManagerClosed);
        }
        if self.state.main.get().is_some() {
            debug!("connection manager already started");
            return Ok(());
        }

        let config = &self.state.config;
        let main = self
            .state
            .factory
            .create_main_pool(&config.main_pool)
            .await
            .inspect_err(|e| error!(error = %e, "failed to open registry pool"))?;
        // Serialized by the sweeper lock, so the cell is still empty.
        let _ = self.state.main.set(main);

        *sweeper = Some(Sweeper::spawn(
            Arc::downgrade(&self.state),
            config.sweep_interval,
            config.idle_threshold,
        ));

        info!(
            max_tenant_pools = config.max_tenant_pools,
            sweep_interval = ?config.sweep_interval,
            idle_threshold = ?config.idle_threshold,
            "tenant connection manager started"
        );
        Ok(())
    }

    /// Pool for `database`, opening it on first use.
    ///
    /// Concurrent callers for the same database share one creation and all
    /// receive its outcome. Failures are not cached.
    pub async fn get_tenant_connection(&self, database: &str) -> TenancyResult<F::Pool> {
        self.ensure_running()?;
        if database.is_empty() {
            return Err(TenancyError::InvalidDatabaseName(String::new()));
        }

        let pending = {
            let mut table = self.state.table.lock().await;
            // shutdown() may have started while this caller waited for the lock.
            if self.is_closed() {
                return Err(TenancyError::ManagerClosed);
            }
            if let Some(handle) = table.acquire(database, Instant::now()) {
                debug!(%database, "tenant pool hit");
                return Ok(handle);
            }
            match table.pending.get(database) {
                Some(pending) => {
                    debug!(%database, "joining in-flight pool creation");
                    pending.clone()
                }
                None => {
                    let pending = ManagerState::spawn_creation(&self.state, database);
                    table.pending.insert(database.to_string(), pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// The registry pool.
    pub fn get_main_connection(&self) -> TenancyResult<F::Pool> {
        if self.is_closed() {
            return Err(TenancyError::ManagerClosed);
        }
        self.state
            .main
            .get()
            .cloned()
            .ok_or(TenancyError::NotInitialized)
    }

    /// Create the physical database for a tenant and apply its schema.
    ///
    /// An existing database is reported as [`ProvisionOutcome::AlreadyExists`]
    /// and still gets its schema initialized.
    pub async fn create_tenant_database(&self, database: &str) -> TenancyResult<ProvisionOutcome> {
        if self.is_closed() {
            return Err(TenancyError::ManagerClosed);
        }
        validate_database_name(database).map_err(|e| TenancyError::provisioning(database, e))?;
        let provisioner = self
            .state
            .provisioner
            .get()
            .ok_or_else(|| TenancyError::provisioning(database, "no provisioner configured"))?;

        info!(%database, "creating tenant database");
        let outcome = provisioner
            .create_database(database)
            .await
            .map_err(|e| into_provisioning(database, e))
            .inspect_err(|e| error!(%database, error = %e, "failed to create tenant database"))?;
        if outcome == ProvisionOutcome::AlreadyExists {
            warn!(%database, "tenant database already exists, initializing schema only");
        }

        provisioner
            .initialize_schema(database)
            .await
            .map_err(|e| into_provisioning(database, e))
            .inspect_err(|e| error!(%database, error = %e, "failed to initialize tenant schema"))?;
        info!(%database, ?outcome, "tenant database ready");
        Ok(outcome)
    }

    /// Close every tenant pool unused for longer than `threshold`.
    ///
    /// Returns how many pools were removed. Pools whose close times out are
    /// still removed.
    pub async fn cleanup_idle_connections(&self, threshold: Duration) -> usize {
        if self.is_closed() {
            return 0;
        }
        let now = Instant::now();
        let idle: Vec<TenantPool<F::Pool>> = {
            let mut table = self.state.table.lock().await;
            let names = select_idle(table.pools.values(), now, threshold);
            names.iter().filter_map(|name| table.remove(name)).collect()
        };
        if idle.is_empty() {
            return 0;
        }

        let closed = idle.len();
        for pool in &idle {
            info!(database = %pool.database(), uses = pool.uses(), "closing idle tenant pool");
        }
        let timeout = self.state.config.close_timeout;
        join_all(idle.into_iter().map(|pool| close_tenant_pool(pool, timeout))).await;
        closed
    }

    /// Stop the sweeper and close every pool, the registry pool last.
    ///
    /// Idempotent. After it returns, every acquisition fails with
    /// [`TenancyError::ManagerClosed`].
    pub async fn shutdown(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            debug!("connection manager already shut down");
            return;
        }
        info!("shutting down tenant connection manager");

        let sweeper = self.state.sweeper.lock().await.take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }

        let pools = self.state.table.lock().await.drain();
        let tenant_pools = pools.len();
        let timeout = self.state.config.close_timeout;
        join_all(pools.into_iter().map(|pool| close_tenant_pool(pool, timeout))).await;

        if let Some(main) = self.state.main.get() {
            close_pool("registry", main, timeout).await;
        }
        info!(tenant_pools, "all database connections closed");
    }

    /// Point-in-time view of the manager. Does not affect recency.
    pub async fn get_stats(&self) -> ManagerStats {
        let main = self.main_status();
        let table = self.state.table.lock().await;
        ManagerStats {
            main,
            active_tenants: table.pools.len(),
            tenants: table.lru.iter().map(str::to_string).collect(),
            pending_creations: table.pending.len(),
        }
    }

    pub fn main_status(&self) -> MainStatus {
        if self.is_closed() {
            MainStatus::Closed
        } else if self.state.main.get().is_some() {
            MainStatus::Connected
        } else {
            MainStatus::Uninitialized
        }
    }

    /// Registry pool without the lifecycle checks, for probes.
    pub(crate) fn main_handle(&self) -> Option<F::Pool> {
        self.state.main.get().cloned()
    }

    /// Tenant pools in recency order, without recording a use.
    pub(crate) async fn tenant_handles(&self) -> Vec<(String, F::Pool)> {
        let table = self.state.table.lock().await;
        table
            .lru
            .iter()
            .filter_map(|name| {
                table
                    .pools
                    .get(name)
                    .map(|pool| (name.to_string(), pool.handle().clone()))
            })
            .collect()
    }

    fn ensure_running(&self) -> TenancyResult<()> {
        if self.is_closed() {
            Err(TenancyError::ManagerClosed)
        } else if self.state.main.get().is_none() {
            Err(TenancyError::NotInitialized)
        } else {
            Ok(())
        }
    }
}

impl<F: ConnectionFactory> ManagerState<F> {
    /// Start creating the pool for `database` in its own task.
    fn spawn_creation(state: &Arc<Self>, database: &str) -> PendingPool<F::Pool> {
        let task = tokio::spawn(Arc::clone(state).create_and_admit(database.to_string()));
        let state = Arc::clone(state);
        let database = database.to_string();
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(%database, error = %e, "tenant pool creation task failed");
                    state.table.lock().await.pending.remove(&database);
                    Err(TenancyError::connection(
                        &database,
                        format!("pool creation aborted: {e}"),
                    ))
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn create_and_admit(self: Arc<Self>, database: String) -> TenancyResult<F::Pool> {
        let created = self
            .factory
            .create_pool(&database, &self.config.tenant_pool)
            .await;

        let mut table = self.table.lock().await;
        table.pending.remove(&database);
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                error!(%database, error = %e, "failed to open tenant pool");
                return Err(e);
            }
        };

        if self.closed.load(Ordering::Acquire) {
            drop(table);
            debug!(%database, "manager closed during pool creation, discarding pool");
            close_pool(&database, &handle, self.config.close_timeout).await;
            return Err(TenancyError::ManagerClosed);
        }

        let evicted = match table.make_room(self.config.max_tenant_pools) {
            Ok(evicted) => evicted,
            Err(e) => {
                drop(table);
                close_pool(&database, &handle, self.config.close_timeout).await;
                return Err(e);
            }
        };
        table.admit(TenantPool::new(
            database.clone(),
            handle.clone(),
            Instant::now(),
        ));
        let active = table.pools.len();
        drop(table);

        for pool in evicted {
            info!(
                database = %pool.database(),
                uses = pool.uses(),
                "evicting least recently used tenant pool"
            );
            self.close_detached(pool);
        }
        info!(%database, active, "tenant pool opened");
        Ok(handle)
    }

    /// Close an evicted pool without holding up the caller that evicted it.
    fn close_detached(&self, pool: TenantPool<F::Pool>) {
        tokio::spawn(close_tenant_pool(pool, self.config.close_timeout));
    }
}

/// Close `handle`, giving up after `timeout`. Returns whether it closed in time.
async fn close_pool<P: PoolHandle>(database: &str, handle: &P, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, handle.close()).await {
        Ok(()) => {
            debug!(%database, "pool closed");
            true
        }
        Err(_) => {
            warn!(%database, ?timeout, "timed out closing pool, dropping it");
            false
        }
    }
}

async fn close_tenant_pool<P: PoolHandle>(pool: TenantPool<P>, timeout: Duration) {
    close_pool(pool.database(), pool.handle(), timeout).await;
}

fn into_provisioning(database: &str, err: TenancyError) -> TenancyError {
    match err {
        TenancyError::Provisioning { .. } => err,
        other => TenancyError::provisioning(database, other),
    }
}

// ── Idle sweeper ─────────────────────────────────────────────────────

struct Sweeper {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Sweeper {
    fn spawn<F: ConnectionFactory>(
        state: Weak<ManagerState<F>>,
        interval: Duration,
        threshold: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweeper(state, interval, threshold, shutdown_rx));
        Self {
            handle,
            shutdown_tx,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "idle sweeper task failed");
        }
    }
}

/// Sweep idle pools every `interval` until shutdown or until the manager is
/// dropped.
async fn run_sweeper<F: ConnectionFactory>(
    state: Weak<ManagerState<F>>,
    interval: Duration,
    threshold: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(?interval, ?threshold, "idle sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(state) = state.upgrade() else {
                    break;
                };
                let manager = TenantConnectionManager { state };
                let closed = manager.cleanup_idle_connections(threshold).await;
                if closed > 0 {
                    debug!(closed, "idle sweep finished");
                }
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
    debug!("idle sweeper stopped");
}
