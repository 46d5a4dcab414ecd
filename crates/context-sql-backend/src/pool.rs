// crates/context-sql-backend/src/pool.rs
// ============================================================================
// Module: Connection Pool Manager
// Description: One lazily built, bounded pool per destination.
// Purpose: Hand out validated connections and own every pool's lifecycle.
// Dependencies: tracing
// ============================================================================

//! ## Overview
//! The manager keeps a mutex-guarded map from destination to pool. Pools are
//! created on first access from the dialect's connection URL. Every handed
//! out connection is validated; an invalid one causes the destination's pool
//! to be rebuilt wholesale before a fresh connection is taken.
//!
//! Pool construction failures surface as configuration errors and
//! acquisition failures as connectivity errors. Neither is retried.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use crate::config::BackendConfig;
use crate::dialect::DialectAdapter;
use crate::driver::ConnectionTarget;
use crate::driver::LowLevelConnection;
use crate::driver::LowLevelPool;
use crate::driver::PoolSettings;
use crate::driver::PoolStatus;
use crate::driver::SqlDriver;
use crate::error::BackendError;
use crate::error::DriverError;

// ============================================================================
// SECTION: Manager
// ============================================================================

/// Per-destination pool registry.
///
/// # Invariants
/// - At most one live pool per destination key.
/// - Pools removed from the map are closed by whoever removed them.
pub struct ConnectionPoolManager {
    /// Dialect used for URLs and error labels.
    dialect: Arc<dyn DialectAdapter>,
    /// Wire client building pools.
    driver: Arc<dyn SqlDriver>,
    /// Backend configuration (host, credentials, options).
    config: BackendConfig,
    /// Bounds applied to every pool.
    settings: PoolSettings,
    /// Live pools keyed by destination.
    pools: Mutex<HashMap<String, Arc<dyn LowLevelPool>>>,
}

impl ConnectionPoolManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new(
        config: BackendConfig,
        dialect: Arc<dyn DialectAdapter>,
        driver: Arc<dyn SqlDriver>,
    ) -> Self {
        let settings = PoolSettings {
            max_size: config.max_pool_size,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
        };
        Self {
            dialect,
            driver,
            config,
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a validated connection to `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] when a pool cannot be built and
    /// [`BackendError::Connectivity`] when no valid connection is obtained.
    pub fn acquire(&self, destination: &str) -> Result<Box<dyn LowLevelConnection>, BackendError> {
        let pool = self.pool_for(destination)?;
        let mut connection = self.checkout(&pool)?;
        if connection.is_valid() {
            self.log_status(destination, &pool);
            return Ok(connection);
        }
        tracing::warn!(
            dialect = self.dialect.name(),
            destination,
            "discarding invalid connection and rebuilding pool"
        );
        drop(connection);
        let pool = self.rebuild_pool(destination, &pool)?;
        let mut connection = self.checkout(&pool)?;
        if !connection.is_valid() {
            return Err(BackendError::from_acquire(
                self.dialect.name(),
                "Connection error",
                DriverError::connection(
                    "InvalidConnection",
                    format!("no valid connection available for '{destination}'"),
                ),
            ));
        }
        self.log_status(destination, &pool);
        Ok(connection)
    }

    /// Returns true when a pool exists for `destination`.
    #[must_use]
    pub fn is_pool_created(&self, destination: &str) -> bool {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools.contains_key(destination)
    }

    /// Returns the occupancy of the pool for `destination`, if any.
    #[must_use]
    pub fn pool_status(&self, destination: &str) -> Option<PoolStatus> {
        let pool = {
            let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
            pools.get(destination).cloned()
        };
        pool.map(|pool| pool.status())
    }

    /// Returns the number of checked-out connections across all pools.
    #[must_use]
    pub fn active_connections(&self) -> u32 {
        self.live_pools().iter().map(|pool| pool.status().active).sum()
    }

    /// Returns the summed capacity of all pools.
    #[must_use]
    pub fn max_connections(&self) -> u32 {
        self.live_pools().iter().map(|pool| pool.status().max_size).sum()
    }

    /// Closes every pool, continuing past individual failures.
    ///
    /// Returns the number of pools that failed to close.
    pub fn close(&self) -> usize {
        let drained: Vec<(String, Arc<dyn LowLevelPool>)> = {
            let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
            pools.drain().collect()
        };
        let mut failures = 0;
        for (destination, pool) in drained {
            if let Err(err) = pool.close() {
                failures += 1;
                tracing::warn!(
                    dialect = self.dialect.name(),
                    destination = %destination,
                    error = %err,
                    "failed to close connection pool"
                );
            }
        }
        failures
    }

    /// Returns the pool for `destination`, building it on first use.
    fn pool_for(&self, destination: &str) -> Result<Arc<dyn LowLevelPool>, BackendError> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(destination) {
            return Ok(Arc::clone(pool));
        }
        let pool = self.build_pool(destination)?;
        pools.insert(destination.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Replaces `stale` with a fresh pool unless another caller already did.
    fn rebuild_pool(
        &self,
        destination: &str,
        stale: &Arc<dyn LowLevelPool>,
    ) -> Result<Arc<dyn LowLevelPool>, BackendError> {
        let (fresh, replaced) = {
            let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
            match pools.get(destination) {
                Some(current) if !ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(stale)) => {
                    return Ok(Arc::clone(current));
                }
                _ => {}
            }
            let fresh = self.build_pool(destination)?;
            let replaced = pools.insert(destination.to_string(), Arc::clone(&fresh));
            (fresh, replaced)
        };
        if let Some(old) = replaced
            && let Err(err) = old.close()
        {
            tracing::warn!(
                dialect = self.dialect.name(),
                destination,
                error = %err,
                "failed to close stale connection pool"
            );
        }
        Ok(fresh)
    }

    /// Builds a pool for `destination` through the driver.
    fn build_pool(&self, destination: &str) -> Result<Arc<dyn LowLevelPool>, BackendError> {
        let target = ConnectionTarget {
            destination: destination.to_string(),
            url: self.dialect.build_connection_url(&self.config, destination),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        };
        tracing::info!(
            dialect = self.dialect.name(),
            driver = self.driver.name(),
            destination,
            url = %target.masked_url(),
            max_size = self.settings.max_size,
            "creating connection pool"
        );
        self.driver.create_pool(&target, &self.settings).map_err(|err| {
            BackendError::from_acquire(
                self.dialect.name(),
                "Connection error creating new pool",
                err,
            )
        })
    }

    /// Takes a connection from `pool`.
    fn checkout(
        &self,
        pool: &Arc<dyn LowLevelPool>,
    ) -> Result<Box<dyn LowLevelConnection>, BackendError> {
        pool.get()
            .map_err(|err| BackendError::from_acquire(self.dialect.name(), "Connection error", err))
    }

    /// Clones every live pool handle.
    fn live_pools(&self) -> Vec<Arc<dyn LowLevelPool>> {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools.values().cloned().collect()
    }

    /// Logs pool occupancy after a checkout.
    fn log_status(&self, destination: &str, pool: &Arc<dyn LowLevelPool>) {
        let status = pool.status();
        tracing::debug!(
            dialect = self.dialect.name(),
            destination,
            max = status.max_size,
            active = status.active,
            idle = status.idle,
            "pool status"
        );
    }
}
