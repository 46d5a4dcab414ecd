// crates/context-sql-backend/src/backend.rs
// ============================================================================
// Module: SQL Backend Facade
// Description: Public write, retention and error-log operations.
// Purpose: Wire pools, cache, writer, retention and error log together.
// Dependencies: time, tracing
// ============================================================================

//! ## Overview
//! [`SqlBackend`] is the only component the ingestion pipeline talks to.
//! Each operation acquires a connection for its destination, consults the
//! schema cache to skip redundant DDL, executes its statements and wraps any
//! failure into exactly one [`BackendError`] kind.
//!
//! Failures of table creation, inserts, upserts, snapshots and deletes are
//! also handed to the error log recorder. Destination creation failures and
//! connection-layer failures are returned without being recorded.
//!
//! ## Invariants
//! - A connection is released before its failure is recorded.
//! - No operation may run concurrently with [`SqlBackend::close`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use time::Duration;
use time::OffsetDateTime;

use crate::cache::SchemaObjectCache;
use crate::config::BackendConfig;
use crate::dialect::DialectAdapter;
use crate::dialect::dialect_for;
use crate::driver::LowLevelConnection;
use crate::driver::PoolStatus;
use crate::driver::SqlDriver;
use crate::driver::driver_for;
use crate::error::BackendError;
use crate::error::DriverError;
use crate::error::StatementFailure;
use crate::error::StatementKind;
use crate::error_log::ErrorLogRecorder;
use crate::pool::ConnectionPoolManager;
use crate::query::ColumnBatch;
use crate::query::ValueEncoding;
use crate::query::is_error_table;
use crate::retention::RetentionEnforcer;
use crate::writer::TransactionalWriter;
use crate::writer::UpsertRequest;

// ============================================================================
// SECTION: Facade
// ============================================================================

/// Relational storage backend for one configured database instance.
pub struct SqlBackend {
    /// Active dialect.
    dialect: Arc<dyn DialectAdapter>,
    /// Per-destination pools.
    pools: Arc<ConnectionPoolManager>,
    /// Destination and table existence cache.
    cache: Arc<SchemaObjectCache>,
    /// Insert and dual-write executor.
    writer: TransactionalWriter,
    /// Capping and expiration.
    retention: RetentionEnforcer,
    /// Failure recorder.
    recorder: ErrorLogRecorder,
    /// Set once [`SqlBackend::close`] ran.
    closed: AtomicBool,
}

impl SqlBackend {
    /// Builds a backend using the driver named by `config.driver`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] when the configuration is
    /// invalid or the driver identifier cannot be resolved.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        config.validate()?;
        let driver = driver_for(&config).map_err(|err| {
            BackendError::from_acquire(&config.instance, "Driver resolution error", err)
        })?;
        Self::with_driver(config, driver)
    }

    /// Builds a backend on top of an externally supplied driver.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] when the configuration is
    /// invalid.
    pub fn with_driver(
        config: BackendConfig,
        driver: Arc<dyn SqlDriver>,
    ) -> Result<Self, BackendError> {
        config.validate()?;
        let dialect = dialect_for(&config.instance);
        tracing::info!(
            dialect = dialect.name(),
            driver = driver.name(),
            persist_errors = config.persist_errors,
            "sql backend configured"
        );
        let cache = Arc::new(SchemaObjectCache::new());
        let writer = TransactionalWriter::new(Arc::clone(&dialect));
        let retention =
            RetentionEnforcer::new(Arc::clone(&dialect), config.timestamp_column.clone());
        let enabled = config.persist_errors;
        let max_latest_errors = config.max_latest_errors;
        let pools = Arc::new(ConnectionPoolManager::new(config, Arc::clone(&dialect), driver));
        let recorder = ErrorLogRecorder::new(
            Arc::clone(&dialect),
            Arc::clone(&pools),
            Arc::clone(&cache),
            enabled,
            max_latest_errors,
        );
        Ok(Self {
            dialect,
            pools,
            cache,
            writer,
            retention,
            recorder,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the active dialect name.
    #[must_use]
    pub fn dialect(&self) -> &str {
        self.dialect.name()
    }

    /// Returns the schema existence cache.
    #[must_use]
    pub fn schema_cache(&self) -> &SchemaObjectCache {
        &self.cache
    }

    // ------------------------------------------------------------------------
    // Schema objects
    // ------------------------------------------------------------------------

    /// Creates `destination` unless the cache already knows it.
    ///
    /// Failures are returned without being recorded in the error table.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when no connection is available or the DDL
    /// fails.
    pub fn create_destination(&self, destination: &str) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.check_identifier("destination", destination)?;
        if self.cache.has_destination(destination) {
            tracing::debug!(destination, "destination cached");
            return Ok(());
        }
        match self.dialect.create_destination_sql(destination) {
            Some(sql) => {
                let mut connection = self.pools.acquire(self.dialect.ddl_destination(destination))?;
                tracing::debug!(
                    dialect = self.dialect.name(),
                    destination,
                    query = %sql,
                    "creating destination"
                );
                connection.execute(&sql, &[]).map_err(|err| {
                    BackendError::from_statement(
                        self.dialect.name(),
                        "Database creation error",
                        StatementKind::Operational,
                        err,
                    )
                })?;
            }
            None => {
                // The destination materializes when its first connection opens.
                drop(self.pools.acquire(self.dialect.ddl_destination(destination))?);
            }
        }
        self.cache.add_destination(destination);
        Ok(())
    }

    /// Creates `table` inside `destination` unless the cache already knows it.
    ///
    /// `column_spec` is a caller-rendered column definition clause such as
    /// `(id TEXT, recvTime TEXT)`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when no connection is available or the DDL
    /// fails.
    pub fn create_table(
        &self,
        destination: &str,
        table: &str,
        column_spec: &str,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.check_identifier("destination", destination)?;
        self.check_identifier("table", table)?;
        if self.cache.has_table(destination, table) {
            tracing::debug!(destination, table, "table cached");
            return Ok(());
        }
        let sql = self.dialect.create_table_sql(destination, table, column_spec);
        self.run_recorded(destination, |connection| {
            tracing::debug!(destination, table, query = %sql, "creating table");
            connection.execute(&sql, &[]).map_err(|err| {
                StatementFailure::new(
                    BackendError::from_statement(
                        self.dialect.name(),
                        "Table creation error",
                        StatementKind::Operational,
                        err,
                    ),
                    sql.as_str(),
                )
            })
        })?;
        self.cache.add_table(destination, table);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Inserts `batch` into `table` with one statement.
    ///
    /// Returns the number of inserted rows.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::BadContextData`] when rows are rejected,
    /// [`BackendError::Persistence`] on timeouts, and connection-layer kinds
    /// when no connection is available.
    pub fn insert_context_data(
        &self,
        destination: &str,
        table: &str,
        batch: &ColumnBatch,
        encoding: ValueEncoding,
    ) -> Result<u64, BackendError> {
        self.ensure_open()?;
        self.check_identifier("destination", destination)?;
        self.check_identifier("table", table)?;
        let inserted = self.run_recorded(destination, |connection| {
            self.writer.insert(connection, destination, table, batch, encoding)
        })?;
        self.cache.add_table(destination, table);
        Ok(inserted)
    }

    /// Appends history rows and upserts latest-value rows atomically.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] after rolling the transaction back.
    pub fn upsert_transaction(&self, request: &UpsertRequest<'_>) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.check_identifier("destination", request.destination)?;
        self.check_identifier("table", request.table)?;
        self.check_identifier("table", &request.latest_table())?;
        self.run_recorded(request.destination, |connection| {
            self.writer.upsert(connection, request)
        })
    }

    // ------------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------------

    /// Deletes the oldest rows of `table` beyond `max_records`.
    ///
    /// Returns the number of deleted rows.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when the snapshot or delete fails.
    pub fn cap_records(
        &self,
        destination: &str,
        table: &str,
        max_records: usize,
    ) -> Result<u64, BackendError> {
        self.ensure_open()?;
        self.check_identifier("destination", destination)?;
        self.check_identifier("table", table)?;
        self.run_recorded(destination, |connection| {
            self.retention.cap_records(connection, destination, table, max_records)
        })
    }

    /// Expires rows older than `ttl_seconds` in every cached table.
    ///
    /// Returns the number of deleted rows.
    ///
    /// # Errors
    ///
    /// Returns the first [`BackendError`] met; tables after it are skipped.
    pub fn expirate_records_cache(&self, ttl_seconds: u64) -> Result<u64, BackendError> {
        self.expirate_records_cache_at(ttl_seconds, OffsetDateTime::now_utc())
    }

    /// Expires rows older than `now - ttl_seconds` in every cached table.
    ///
    /// Error tables are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first [`BackendError`] met; tables after it are skipped.
    pub fn expirate_records_cache_at(
        &self,
        ttl_seconds: u64,
        now: OffsetDateTime,
    ) -> Result<u64, BackendError> {
        self.ensure_open()?;
        let ttl = Duration::seconds(i64::try_from(ttl_seconds).unwrap_or(i64::MAX));
        let mut deleted = 0u64;
        for (destination, table) in self.cache.snapshot() {
            if is_error_table(&destination, &table) {
                continue;
            }
            deleted += self.run_recorded(&destination, |connection| {
                self.retention.expire_records(connection, &destination, &table, ttl, now)
            })?;
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------------
    // Error log
    // ------------------------------------------------------------------------

    /// Creates the error table of `destination` unless cached.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when no connection is available or the DDL
    /// fails.
    pub fn create_error_table(&self, destination: &str) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.check_identifier("destination", destination)?;
        self.recorder.create_error_table(destination, false)
    }

    /// Trims the error table of `destination` to the newest rows.
    ///
    /// Returns the number of deleted rows.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when no connection is available or the
    /// delete fails.
    pub fn purge_error_table(&self, destination: &str) -> Result<u64, BackendError> {
        self.ensure_open()?;
        self.check_identifier("destination", destination)?;
        self.recorder.purge_error_table(destination)
    }

    // ------------------------------------------------------------------------
    // Lifecycle and diagnostics
    // ------------------------------------------------------------------------

    /// Forgets every cached destination and table.
    pub fn reset_schema_cache(&self) {
        self.cache.reset();
    }

    /// Returns true when a pool exists for `destination`.
    #[must_use]
    pub fn is_pool_created(&self, destination: &str) -> bool {
        self.pools.is_pool_created(destination)
    }

    /// Returns the occupancy of the pool for `destination`.
    #[must_use]
    pub fn pool_status(&self, destination: &str) -> Option<PoolStatus> {
        self.pools.pool_status(destination)
    }

    /// Returns the number of checked-out connections across all pools.
    #[must_use]
    pub fn active_connections(&self) -> u32 {
        self.pools.active_connections()
    }

    /// Returns the summed capacity of all pools.
    #[must_use]
    pub fn max_connections(&self) -> u32 {
        self.pools.max_connections()
    }

    /// Returns true once [`SqlBackend::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Releases every pool.
    ///
    /// Returns the number of pools that failed to close; the remaining pools
    /// are released regardless.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let failures = self.pools.close();
        tracing::info!(dialect = self.dialect.name(), failures, "sql backend closed");
        failures
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Runs `operation` on a connection to `destination`, recording failures.
    ///
    /// Acquisition failures are returned unrecorded.
    fn run_recorded<T>(
        &self,
        destination: &str,
        operation: impl FnOnce(&mut dyn LowLevelConnection) -> Result<T, StatementFailure>,
    ) -> Result<T, BackendError> {
        let mut connection = self.pools.acquire(destination)?;
        let outcome = operation(&mut *connection);
        drop(connection);
        outcome.map_err(|failure| {
            if failure.record {
                self.recorder.persist(destination, &failure.error, &failure.query);
            }
            failure.error
        })
    }

    /// Fails once the backend has been closed.
    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.is_closed() {
            return Err(BackendError::from_acquire(
                self.dialect.name(),
                "Connection error",
                DriverError::connection("BackendClosed", "backend has been closed"),
            ));
        }
        Ok(())
    }

    /// Rejects identifiers that cannot name a destination or table.
    fn check_identifier(&self, kind: &str, name: &str) -> Result<(), BackendError> {
        let invalid = name.trim().is_empty()
            || name.chars().any(|ch| ch.is_control() || ch == '/' || ch == '\\');
        if invalid {
            return Err(BackendError::bad_context_data(
                self.dialect.name(),
                "Identifier validation error",
                "InvalidIdentifier",
                format!("invalid {kind} name '{}'", name.escape_default()),
            ));
        }
        Ok(())
    }
}
