// crates/context-sql-backend/src/retention.rs
// ============================================================================
// Module: Retention Enforcer
// Description: Row-count capping and time-based expiration of history rows.
// Purpose: Bound table growth with snapshot-then-delete maintenance sweeps.
// Dependencies: time, tracing
// ============================================================================

//! ## Overview
//! Both operations read the timestamp column of a table in ascending order
//! into a disconnected snapshot, pick the oldest prefix to drop and delete it
//! with statements whose filter is an OR-chain of bound equality predicates,
//! at most [`DELETE_CHUNK_SIZE`] per statement. Rows sharing a selected
//! timestamp are deleted together.
//!
//! Expiration walks the snapshot and stops at the first row that is not
//! expired, so it relies on timestamps being non-decreasing in insertion
//! order. Out-of-order rows lead to under-deletion, never over-deletion.
//!
//! Sweeps are not isolated from concurrent inserts.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use time::Duration;
use time::OffsetDateTime;

use crate::dialect::DialectAdapter;
use crate::driver::LowLevelConnection;
use crate::driver::RowSet;
use crate::driver::SqlValue;
use crate::error::BackendError;
use crate::error::StatementFailure;
use crate::error::StatementKind;
use crate::query::QueryBuilder;
use crate::timestamp::timestamp_from_value;

// ============================================================================
// SECTION: Enforcer
// ============================================================================

/// Context used for snapshot failures.
const SELECT_CONTEXT: &str = "Data select error";

/// Maximum equality predicates OR-chained into one DELETE.
///
/// `SQLite` caps expression tree depth at 1000.
pub const DELETE_CHUNK_SIZE: usize = 250;

/// Context used for delete failures.
const DELETE_CONTEXT: &str = "Data deletion error";

/// Context used for unparseable timestamps.
const EXPIRATION_CONTEXT: &str = "Data expiration error";

/// Applies retention policies to one table at a time.
pub struct RetentionEnforcer {
    /// Dialect used for statement text and error labels.
    dialect: Arc<dyn DialectAdapter>,
    /// Column ordering rows by age.
    timestamp_column: String,
}

impl RetentionEnforcer {
    /// Creates an enforcer keyed off `timestamp_column`.
    #[must_use]
    pub fn new(dialect: Arc<dyn DialectAdapter>, timestamp_column: impl Into<String>) -> Self {
        Self {
            dialect,
            timestamp_column: timestamp_column.into(),
        }
    }

    /// Deletes the oldest rows beyond `max_records`.
    ///
    /// Returns the number of deleted rows; zero when within the cap.
    ///
    /// # Errors
    ///
    /// Returns a [`StatementFailure`] when the snapshot or delete fails.
    pub(crate) fn cap_records(
        &self,
        connection: &mut dyn LowLevelConnection,
        destination: &str,
        table: &str,
        max_records: usize,
    ) -> Result<u64, StatementFailure> {
        let snapshot = self.snapshot(connection, destination, table)?;
        let excess = snapshot.len().saturating_sub(max_records);
        if excess == 0 {
            return Ok(0);
        }
        let doomed: Vec<SqlValue> = snapshot
            .rows()
            .iter()
            .take(excess)
            .filter_map(|row| row.first().cloned())
            .collect();
        let deleted = self.delete_values(connection, destination, table, doomed)?;
        tracing::info!(
            dialect = self.dialect.name(),
            destination,
            table,
            max_records,
            deleted,
            "capped records"
        );
        Ok(deleted)
    }

    /// Deletes the leading rows older than `now - ttl`.
    ///
    /// Returns the number of deleted rows.
    ///
    /// # Errors
    ///
    /// Returns a [`StatementFailure`] when the snapshot or delete fails. An
    /// unparseable timestamp is an unrecorded
    /// [`BackendError::BadContextData`].
    pub(crate) fn expire_records(
        &self,
        connection: &mut dyn LowLevelConnection,
        destination: &str,
        table: &str,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<u64, StatementFailure> {
        let Some(cutoff) = now.checked_sub(ttl) else {
            return Ok(0);
        };
        let snapshot = self.snapshot(connection, destination, table)?;
        let mut expired = Vec::new();
        for row in snapshot.rows() {
            let value = row.first().cloned().unwrap_or(SqlValue::Null);
            let recorded = timestamp_from_value(&value).map_err(|err| {
                StatementFailure::unrecorded(
                    BackendError::bad_context_data(
                        self.dialect.name(),
                        EXPIRATION_CONTEXT,
                        "ParseError",
                        err.to_string(),
                    ),
                    String::new(),
                )
            })?;
            if recorded >= cutoff {
                break;
            }
            expired.push(value);
        }
        let deleted = self.delete_values(connection, destination, table, expired)?;
        if deleted > 0 {
            tracing::info!(
                dialect = self.dialect.name(),
                destination,
                table,
                deleted,
                "expired records"
            );
        }
        Ok(deleted)
    }

    /// Reads the timestamp column in ascending order.
    fn snapshot(
        &self,
        connection: &mut dyn LowLevelConnection,
        destination: &str,
        table: &str,
    ) -> Result<RowSet, StatementFailure> {
        let sql = QueryBuilder::new(self.dialect.as_ref()).select_ordered(
            destination,
            table,
            &self.timestamp_column,
        );
        tracing::debug!(
            dialect = self.dialect.name(),
            destination,
            query = %sql,
            "reading snapshot"
        );
        connection.query(&sql, &[]).map_err(|err| {
            StatementFailure::new(
                BackendError::from_statement(
                    self.dialect.name(),
                    SELECT_CONTEXT,
                    StatementKind::Operational,
                    err,
                ),
                sql.as_str(),
            )
        })
    }

    /// Deletes every row whose timestamp equals one of `values`.
    ///
    /// `values` arrive in ascending order; duplicates and `NULL`s are
    /// dropped before binding. Nothing is issued for an empty set. Large sets
    /// are split into statements of at most [`DELETE_CHUNK_SIZE`] predicates
    /// on the same connection, and the affected counts are summed.
    fn delete_values(
        &self,
        connection: &mut dyn LowLevelConnection,
        destination: &str,
        table: &str,
        mut values: Vec<SqlValue>,
    ) -> Result<u64, StatementFailure> {
        values.retain(|value| !value.is_null());
        values.dedup();
        let builder = QueryBuilder::new(self.dialect.as_ref());
        let mut deleted = 0u64;
        for chunk in values.chunks(DELETE_CHUNK_SIZE) {
            let sql =
                builder.delete_matching(destination, table, &self.timestamp_column, chunk.len());
            tracing::debug!(
                dialect = self.dialect.name(),
                destination,
                query = %sql,
                values = chunk.len(),
                "deleting rows"
            );
            let affected = connection.execute(&sql, chunk).map_err(|err| {
                StatementFailure::new(
                    BackendError::from_statement(
                        self.dialect.name(),
                        DELETE_CONTEXT,
                        StatementKind::Operational,
                        err,
                    ),
                    sql.as_str(),
                )
            })?;
            deleted = deleted.saturating_add(affected);
        }
        Ok(deleted)
    }
}
