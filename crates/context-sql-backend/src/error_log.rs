// crates/context-sql-backend/src/error_log.rs
// ============================================================================
// Module: Error Log Recorder
// Description: Best-effort persistence of failures into per-destination tables.
// Purpose: Keep a bounded forensic trail without destabilizing writes.
// Dependencies: time, tracing
// ============================================================================

//! ## Overview
//! Failures of data and DDL statements are recorded into
//! `<destination>_error_log` (timestamp, error text, query text) with bound
//! parameters, after which the table is purged down to the newest
//! `max_latest_errors` rows.
//!
//! Rows sharing a timestamp are ordered by `rowid` on `SQLite` and `ctid` on
//! `PostgreSQL`, so the purge keeps exactly `max_latest_errors` rows. Other
//! dialects, MySQL included, keep by timestamp alone: every row tied with the
//! oldest kept timestamp survives, so the table can hold more than
//! `max_latest_errors` rows.
//!
//! Recording never fails the caller. It runs as a bounded state machine:
//! ensure table, insert, purge. When the insert is rejected as bad data the
//! table is re-created once and recording stops there.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use time::OffsetDateTime;

use crate::cache::SchemaObjectCache;
use crate::dialect::DialectAdapter;
use crate::driver::SqlValue;
use crate::error::BackendError;
use crate::error::StatementKind;
use crate::pool::ConnectionPoolManager;
use crate::query::QueryBuilder;
use crate::query::error_table_name;

// ============================================================================
// SECTION: Recorder
// ============================================================================

/// Steps of one persistence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersistStep {
    /// Create the error table unless cached.
    EnsureTable,
    /// Insert the failure row.
    Insert,
    /// Re-create the table after a rejected insert, then stop.
    RecreateTable,
    /// Trim the table to the retention bound.
    Purge,
    /// Attempt finished.
    Done,
}

/// Records operation failures into per-destination error tables.
pub struct ErrorLogRecorder {
    /// Dialect used for statement text and error labels.
    dialect: Arc<dyn DialectAdapter>,
    /// Shared pool registry.
    pools: Arc<ConnectionPoolManager>,
    /// Shared existence cache.
    cache: Arc<SchemaObjectCache>,
    /// False disables [`ErrorLogRecorder::persist`].
    enabled: bool,
    /// Number of newest rows kept by the purge step.
    max_latest_errors: usize,
}

impl ErrorLogRecorder {
    /// Creates a recorder.
    #[must_use]
    pub const fn new(
        dialect: Arc<dyn DialectAdapter>,
        pools: Arc<ConnectionPoolManager>,
        cache: Arc<SchemaObjectCache>,
        enabled: bool,
        max_latest_errors: usize,
    ) -> Self {
        Self {
            dialect,
            pools,
            cache,
            enabled,
            max_latest_errors,
        }
    }

    /// Returns true when failures are recorded.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Records `error` and its `query` for `destination`.
    ///
    /// Connectivity and configuration failures are skipped, and every failure
    /// of the attempt itself is logged only.
    pub fn persist(&self, destination: &str, error: &BackendError, query: &str) {
        if !self.enabled || !error.is_persistable() {
            return;
        }
        let mut step = PersistStep::EnsureTable;
        while step != PersistStep::Done {
            step = match step {
                PersistStep::EnsureTable => match self.create_error_table(destination, false) {
                    Ok(()) => PersistStep::Insert,
                    Err(err) => {
                        self.log_failure(destination, "ensure error table", &err);
                        PersistStep::Done
                    }
                },
                PersistStep::Insert => match self.insert_error(destination, error, query) {
                    Ok(()) => PersistStep::Purge,
                    Err(err) if err.is_bad_context_data() => {
                        self.log_failure(destination, "insert error row", &err);
                        PersistStep::RecreateTable
                    }
                    Err(err) => {
                        self.log_failure(destination, "insert error row", &err);
                        PersistStep::Done
                    }
                },
                PersistStep::RecreateTable => {
                    match self.create_error_table(destination, true) {
                        Ok(()) => tracing::warn!(
                            dialect = self.dialect.name(),
                            destination,
                            "error table re-created; failure not recorded"
                        ),
                        Err(err) => self.log_failure(destination, "re-create error table", &err),
                    }
                    PersistStep::Done
                }
                PersistStep::Purge => {
                    if let Err(err) = self.purge_error_table(destination) {
                        self.log_failure(destination, "purge error table", &err);
                    }
                    PersistStep::Done
                }
                PersistStep::Done => PersistStep::Done,
            };
        }
    }

    /// Creates the error table of `destination`.
    ///
    /// Without `force` the call is skipped when the table is cached.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when no connection is available or the DDL
    /// fails.
    pub fn create_error_table(&self, destination: &str, force: bool) -> Result<(), BackendError> {
        let table = error_table_name(destination);
        if !force && self.cache.has_table(destination, &table) {
            tracing::debug!(destination, table = %table, "error table cached");
            return Ok(());
        }
        let sql = QueryBuilder::new(self.dialect.as_ref()).create_error_table(destination);
        let mut connection = self.pools.acquire(destination)?;
        tracing::debug!(
            dialect = self.dialect.name(),
            destination,
            query = %sql,
            "creating error table"
        );
        connection.execute(&sql, &[]).map_err(|err| {
            BackendError::from_statement(
                self.dialect.name(),
                "Error table creation error",
                StatementKind::Operational,
                err,
            )
        })?;
        self.cache.add_table(destination, &table);
        Ok(())
    }

    /// Deletes every error row except the newest `max_latest_errors`.
    ///
    /// Returns the number of deleted rows.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when no connection is available or the
    /// delete fails.
    pub fn purge_error_table(&self, destination: &str) -> Result<u64, BackendError> {
        let sql = QueryBuilder::new(self.dialect.as_ref())
            .purge_errors(destination, self.max_latest_errors);
        let mut connection = self.pools.acquire(destination)?;
        tracing::debug!(
            dialect = self.dialect.name(),
            destination,
            query = %sql,
            "purging error table"
        );
        connection.execute(&sql, &[]).map_err(|err| {
            BackendError::from_statement(
                self.dialect.name(),
                "Error table purge error",
                StatementKind::Operational,
                err,
            )
        })
    }

    /// Inserts one failure row with bound parameters.
    fn insert_error(
        &self,
        destination: &str,
        error: &BackendError,
        query: &str,
    ) -> Result<(), BackendError> {
        let sql = QueryBuilder::new(self.dialect.as_ref()).insert_error(destination);
        let params = [
            SqlValue::Timestamp(OffsetDateTime::now_utc()),
            SqlValue::Text(error.to_string()),
            SqlValue::Text(query.to_string()),
        ];
        let mut connection = self.pools.acquire(destination)?;
        connection.execute(&sql, &params).map_err(|err| {
            BackendError::from_statement(
                self.dialect.name(),
                "Error table insertion error",
                StatementKind::Data,
                err,
            )
        })?;
        self.cache.add_table(destination, &error_table_name(destination));
        Ok(())
    }

    /// Logs a failed persistence step.
    fn log_failure(&self, destination: &str, step: &str, err: &BackendError) {
        tracing::warn!(
            dialect = self.dialect.name(),
            destination,
            step,
            error = %err,
            "error log persistence failed"
        );
    }
}
