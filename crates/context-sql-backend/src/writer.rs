// crates/context-sql-backend/src/writer.rs
// ============================================================================
// Module: Transactional Writer
// Description: Append-only inserts and the atomic history + latest dual write.
// Purpose: Never expose a history insert without its latest-value upsert.
// Dependencies: tracing
// ============================================================================

//! ## Overview
//! [`TransactionalWriter::insert`] appends one batch with multi-row
//! statements sized to the bound-parameter budget. [`TransactionalWriter::upsert`] appends the history
//! batch and upserts the latest-value batch inside one transaction; any
//! failure rolls the whole unit back.
//!
//! Latest-value rows follow last-writer-wins by timestamp: a stored row is
//! overwritten only by a row whose timestamp is not older, regardless of
//! arrival order.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use crate::dialect::DialectAdapter;
use crate::driver::LowLevelConnection;
use crate::driver::SqlValue;
use crate::error::BackendError;
use crate::error::DriverError;
use crate::error::StatementFailure;
use crate::error::StatementKind;
use crate::query::ColumnBatch;
use crate::query::QueryBuilder;
use crate::query::ValueEncoding;

// ============================================================================
// SECTION: Requests
// ============================================================================

/// Inputs of one atomic history + latest-value write.
#[derive(Debug, Clone, Copy)]
pub struct UpsertRequest<'a> {
    /// Target destination.
    pub destination: &'a str,
    /// History table name.
    pub table: &'a str,
    /// Rows appended to the history table.
    pub history: &'a ColumnBatch,
    /// Rows that become the latest snapshot per key.
    pub latest: &'a ColumnBatch,
    /// Suffix forming the latest-value table name from `table`.
    pub latest_suffix: &'a str,
    /// Column acting as the uniqueness key of the latest-value table.
    pub unique_key: &'a str,
    /// Column holding each row's timestamp.
    pub timestamp_key: &'a str,
    /// Dialect format string used to parse `timestamp_key` values.
    pub timestamp_format: &'a str,
    /// How batch values are bound.
    pub encoding: ValueEncoding,
}

impl UpsertRequest<'_> {
    /// Returns the latest-value table name.
    #[must_use]
    pub fn latest_table(&self) -> String {
        format!("{}{}", self.table, self.latest_suffix)
    }
}

// ============================================================================
// SECTION: Writer
// ============================================================================

/// Bound parameters allowed in one statement.
///
/// Below `SQLite`'s 32 766 and `PostgreSQL`'s 65 535 variable limits.
pub const MAX_BOUND_PARAMETERS: usize = 30_000;

/// Statement context used for plain inserts.
const INSERT_CONTEXT: &str = "Data insertion error";

/// Statement context used for the dual write.
const UPSERT_CONTEXT: &str = "Data upsert error";

/// Executes data-carrying statements for one dialect.
pub struct TransactionalWriter {
    /// Dialect used for statement text and error labels.
    dialect: Arc<dyn DialectAdapter>,
}

impl TransactionalWriter {
    /// Creates a writer for `dialect`.
    #[must_use]
    pub const fn new(dialect: Arc<dyn DialectAdapter>) -> Self {
        Self {
            dialect,
        }
    }

    /// Appends `batch` to `table` with multi-row INSERTs.
    ///
    /// A batch that fits [`MAX_BOUND_PARAMETERS`] is one statement. Larger
    /// batches are split into statements that each fit the budget and run
    /// inside one transaction, so the batch still lands all or nothing.
    ///
    /// Returns the number of inserted rows.
    ///
    /// # Errors
    ///
    /// Returns a [`StatementFailure`] carrying the statement text; malformed
    /// batches and rejected rows are [`BackendError::BadContextData`].
    pub(crate) fn insert(
        &self,
        connection: &mut dyn LowLevelConnection,
        destination: &str,
        table: &str,
        batch: &ColumnBatch,
        encoding: ValueEncoding,
    ) -> Result<u64, StatementFailure> {
        self.check_batch(INSERT_CONTEXT, batch)?;
        let columns = batch.column_names();
        let rows = batch.rows(encoding);
        let per_statement = rows_per_statement(columns.len());
        if rows.len() <= per_statement {
            return self.insert_rows(connection, destination, table, &columns, &rows);
        }
        self.begin(connection)?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(per_statement) {
            match self.insert_rows(connection, destination, table, &columns, chunk) {
                Ok(count) => inserted = inserted.saturating_add(count),
                Err(failure) => {
                    self.rollback(connection, destination);
                    return Err(failure);
                }
            }
        }
        if let Err(err) = connection.commit() {
            self.rollback(connection, destination);
            return Err(self.data_failure(INSERT_CONTEXT, err, "COMMIT"));
        }
        Ok(inserted)
    }

    /// Executes one multi-row INSERT for `rows`.
    fn insert_rows(
        &self,
        connection: &mut dyn LowLevelConnection,
        destination: &str,
        table: &str,
        columns: &[&str],
        rows: &[Vec<SqlValue>],
    ) -> Result<u64, StatementFailure> {
        let sql =
            QueryBuilder::new(self.dialect.as_ref()).insert(destination, table, columns, rows.len());
        let params: Vec<SqlValue> = rows.iter().flatten().cloned().collect();
        tracing::debug!(
            dialect = self.dialect.name(),
            destination,
            table,
            query = %sql,
            rows = rows.len(),
            "executing insert"
        );
        connection
            .execute(&sql, &params)
            .map_err(|err| self.data_failure(INSERT_CONTEXT, err, &sql))
    }

    /// Appends the history batch and upserts the latest batch atomically.
    ///
    /// An empty latest batch only appends history.
    ///
    /// # Errors
    ///
    /// Returns a [`StatementFailure`] carrying the failing statement; the
    /// transaction has been rolled back when this returns an error.
    pub(crate) fn upsert(
        &self,
        connection: &mut dyn LowLevelConnection,
        request: &UpsertRequest<'_>,
    ) -> Result<(), StatementFailure> {
        self.check_batch(UPSERT_CONTEXT, request.history)?;
        let write_latest = !request.latest.is_empty();
        if write_latest {
            self.check_batch(UPSERT_CONTEXT, request.latest)?;
            self.check_upsert_columns(request)?;
        }
        let builder = QueryBuilder::new(self.dialect.as_ref());
        let history_columns = request.history.column_names();
        let history_sql = builder.insert(request.destination, request.table, &history_columns, 1);
        let latest_columns = request.latest.column_names();
        let latest_sql = builder.upsert(
            request.destination,
            &request.latest_table(),
            &latest_columns,
            request.unique_key,
            request.timestamp_key,
            request.timestamp_format,
        );

        self.begin(connection)?;

        tracing::debug!(
            dialect = self.dialect.name(),
            destination = request.destination,
            query = %history_sql,
            rows = request.history.row_count(),
            "executing history batch"
        );
        if let Err(err) =
            connection.execute_many(&history_sql, &request.history.rows(request.encoding))
        {
            self.rollback(connection, request.destination);
            return Err(self.data_failure(UPSERT_CONTEXT, err, &history_sql));
        }

        if write_latest {
            tracing::debug!(
                dialect = self.dialect.name(),
                destination = request.destination,
                query = %latest_sql,
                rows = request.latest.row_count(),
                "executing latest-value batch"
            );
            if let Err(err) =
                connection.execute_many(&latest_sql, &request.latest.rows(request.encoding))
            {
                self.rollback(connection, request.destination);
                return Err(self.data_failure(UPSERT_CONTEXT, err, &latest_sql));
            }
        }

        if let Err(err) = connection.commit() {
            self.rollback(connection, request.destination);
            return Err(self.data_failure(UPSERT_CONTEXT, err, "COMMIT"));
        }
        Ok(())
    }

    /// Opens a transaction on `connection`.
    fn begin(&self, connection: &mut dyn LowLevelConnection) -> Result<(), StatementFailure> {
        connection.begin().map_err(|err| {
            StatementFailure::new(
                BackendError::from_statement(
                    self.dialect.name(),
                    "Transaction error",
                    StatementKind::Operational,
                    err,
                ),
                "BEGIN",
            )
        })
    }

    /// Rejects malformed batches before any statement runs.
    fn check_batch(&self, context: &str, batch: &ColumnBatch) -> Result<(), StatementFailure> {
        batch.validate().map_err(|err| {
            StatementFailure::from(BackendError::bad_context_data(
                self.dialect.name(),
                context,
                "BatchError",
                err.to_string(),
            ))
        })
    }

    /// Requires the key and timestamp columns in the latest batch.
    fn check_upsert_columns(&self, request: &UpsertRequest<'_>) -> Result<(), StatementFailure> {
        let columns = request.latest.column_names();
        for required in [request.unique_key, request.timestamp_key] {
            if !columns.contains(&required) {
                return Err(StatementFailure::from(BackendError::bad_context_data(
                    self.dialect.name(),
                    UPSERT_CONTEXT,
                    "BatchError",
                    format!("latest batch lacks column '{required}'"),
                )));
            }
        }
        Ok(())
    }

    /// Wraps a data statement failure with its query text.
    fn data_failure(&self, context: &str, err: DriverError, sql: &str) -> StatementFailure {
        StatementFailure::new(
            BackendError::from_statement(self.dialect.name(), context, StatementKind::Data, err),
            sql,
        )
    }

    /// Rolls back, logging rather than raising failures.
    fn rollback(&self, connection: &mut dyn LowLevelConnection, destination: &str) {
        if !connection.in_transaction() {
            return;
        }
        if let Err(err) = connection.rollback() {
            tracing::error!(
                dialect = self.dialect.name(),
                destination,
                error = %err,
                "transaction rollback failed"
            );
        }
    }
}

/// Rows that fit one statement of `width` columns.
const fn rows_per_statement(width: usize) -> usize {
    let rows = MAX_BOUND_PARAMETERS / if width == 0 { 1 } else { width };
    if rows == 0 { 1 } else { rows }
}

#[cfg(test)]
mod tests {
    use super::MAX_BOUND_PARAMETERS;
    use super::rows_per_statement;

    #[test]
    fn rows_per_statement_stays_within_parameter_limit() {
        assert_eq!(rows_per_statement(3), 10_000);
        assert!(rows_per_statement(7) * 7 <= MAX_BOUND_PARAMETERS);
        assert_eq!(rows_per_statement(0), MAX_BOUND_PARAMETERS);
        assert_eq!(rows_per_statement(MAX_BOUND_PARAMETERS + 1), 1);
    }
}
