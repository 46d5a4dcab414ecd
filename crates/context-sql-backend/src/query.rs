// crates/context-sql-backend/src/query.rs
// ============================================================================
// Module: Query Building
// Description: Parameterized statement text and bound values for the backend.
// Purpose: Keep every value out of statement text and every identifier quoted.
// Dependencies: serde_json, thiserror
// ============================================================================

//! ## Overview
//! Callers hand the backend a [`ColumnBatch`]: ordered columns, each holding
//! one JSON value per row. [`QueryBuilder`] renders statement text with `?`
//! placeholders and quoted identifiers for the active dialect, and
//! [`ColumnBatch::rows`] turns the batch into bound [`SqlValue`] rows.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde_json::Value;
use thiserror::Error;

use crate::dialect::DialectAdapter;
use crate::driver::SqlValue;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Suffix appended to a destination name to form its error table name.
pub const ERROR_TABLE_SUFFIX: &str = "_error_log";

/// Error table timestamp column.
pub const ERROR_TIMESTAMP_COLUMN: &str = "timestamp";

/// Error table message column.
pub const ERROR_MESSAGE_COLUMN: &str = "error";

/// Error table query column.
pub const ERROR_QUERY_COLUMN: &str = "query";

/// Returns the error table name for `destination`.
#[must_use]
pub fn error_table_name(destination: &str) -> String {
    format!("{destination}{ERROR_TABLE_SUFFIX}")
}

/// Returns true when `table` is the error table of `destination`.
#[must_use]
pub fn is_error_table(destination: &str, table: &str) -> bool {
    table.strip_prefix(destination) == Some(ERROR_TABLE_SUFFIX)
}

// ============================================================================
// SECTION: Batches
// ============================================================================

/// Rejected batch shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    /// The batch has no columns or no rows.
    #[error("batch carries no rows")]
    Empty,
    /// Two columns share one name.
    #[error("column '{0}' appears more than once")]
    DuplicateColumn(String),
    /// A column length differs from the first column's length.
    #[error("column '{column}' has {actual} values, expected {expected}")]
    Ragged {
        /// Offending column.
        column: String,
        /// Row count of the first column.
        expected: usize,
        /// Row count of the offending column.
        actual: usize,
    },
}

/// How batch values are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueEncoding {
    /// Bind booleans, numbers and strings with their native SQL types.
    Native,
    /// Bind every non-null value as text.
    #[default]
    Text,
}

/// Converts one JSON value into a bound parameter.
#[must_use]
pub fn encode_value(value: &Value, encoding: ValueEncoding) -> SqlValue {
    match (value, encoding) {
        (Value::Null, _) => SqlValue::Null,
        (Value::String(text), _) => SqlValue::Text(text.clone()),
        (Value::Bool(flag), ValueEncoding::Native) => SqlValue::Bool(*flag),
        (Value::Number(number), ValueEncoding::Native) => number.as_i64().map_or_else(
            || number.as_f64().map_or_else(|| SqlValue::Text(number.to_string()), SqlValue::Real),
            SqlValue::Integer,
        ),
        (other, _) => SqlValue::Text(other.to_string()),
    }
}

/// Ordered column-oriented batch of rows.
///
/// # Invariants
/// - Column order is insertion order and drives statement column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnBatch {
    /// Columns with one value per row.
    columns: Vec<(String, Vec<Value>)>,
}

impl ColumnBatch {
    /// Creates an empty batch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            columns: Vec::new(),
        }
    }

    /// Appends a column, builder style.
    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.push_column(name, values);
        self
    }

    /// Appends a column.
    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<Value>) {
        self.columns.push((name.into(), values));
    }

    /// Returns the column names in order.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Returns the number of rows (length of the first column).
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, |(_, values)| values.len())
    }

    /// Returns true when the batch carries no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    /// Checks that the batch is non-empty, rectangular and uniquely named.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError`] describing the first shape violation.
    pub fn validate(&self) -> Result<(), BatchError> {
        let expected = self.row_count();
        if expected == 0 {
            return Err(BatchError::Empty);
        }
        for (index, (name, values)) in self.columns.iter().enumerate() {
            if self.columns[.. index].iter().any(|(other, _)| other == name) {
                return Err(BatchError::DuplicateColumn(name.clone()));
            }
            if values.len() != expected {
                return Err(BatchError::Ragged {
                    column: name.clone(),
                    expected,
                    actual: values.len(),
                });
            }
        }
        Ok(())
    }

    /// Transposes the batch into bound parameter rows.
    #[must_use]
    pub fn rows(&self, encoding: ValueEncoding) -> Vec<Vec<SqlValue>> {
        (0 .. self.row_count())
            .map(|row| {
                self.columns
                    .iter()
                    .map(|(_, values)| {
                        values.get(row).map_or(SqlValue::Null, |value| encode_value(value, encoding))
                    })
                    .collect()
            })
            .collect()
    }
}

impl FromIterator<(String, Vec<Value>)> for ColumnBatch {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Value>)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

// ============================================================================
// SECTION: Statement Text
// ============================================================================

/// Renders dialect-correct statement text with `?` placeholders.
#[derive(Clone, Copy)]
pub struct QueryBuilder<'a> {
    /// Active dialect.
    dialect: &'a dyn DialectAdapter,
}

impl<'a> QueryBuilder<'a> {
    /// Creates a builder for `dialect`.
    #[must_use]
    pub const fn new(dialect: &'a dyn DialectAdapter) -> Self {
        Self {
            dialect,
        }
    }

    /// Quoted, comma-separated column list.
    fn column_list(&self, columns: &[&str]) -> String {
        columns
            .iter()
            .map(|column| self.dialect.quote_identifier(column))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// One `(?,?,...)` group.
    fn placeholder_group(width: usize) -> String {
        format!("({})", vec!["?"; width].join(","))
    }

    /// Multi-row INSERT binding `rows * columns.len()` parameters.
    #[must_use]
    pub fn insert(&self, destination: &str, table: &str, columns: &[&str], rows: usize) -> String {
        let group = Self::placeholder_group(columns.len());
        let values = vec![group.as_str(); rows.max(1)].join(",");
        format!(
            "INSERT INTO {} ({}) VALUES {values}",
            self.dialect.table_ref(destination, table),
            self.column_list(columns)
        )
    }

    /// Last-writer-wins single-row UPSERT into the latest-value table.
    #[must_use]
    pub fn upsert(
        &self,
        destination: &str,
        table: &str,
        columns: &[&str],
        unique_key: &str,
        timestamp_key: &str,
        timestamp_format: &str,
    ) -> String {
        let table_ref = self.dialect.table_ref(destination, table);
        let clause = self.dialect.upsert_conflict_clause(
            &table_ref,
            columns,
            unique_key,
            timestamp_key,
            timestamp_format,
        );
        format!(
            "INSERT INTO {table_ref} ({}) VALUES {} {clause}",
            self.column_list(columns),
            Self::placeholder_group(columns.len())
        )
    }

    /// Snapshot of one column ordered ascending.
    #[must_use]
    pub fn select_ordered(&self, destination: &str, table: &str, column: &str) -> String {
        let column = self.dialect.quote_identifier(column);
        format!(
            "SELECT {column} FROM {} ORDER BY {column} ASC",
            self.dialect.table_ref(destination, table)
        )
    }

    /// DELETE whose filter is an OR-chain of `matches` equality predicates.
    #[must_use]
    pub fn delete_matching(
        &self,
        destination: &str,
        table: &str,
        column: &str,
        matches: usize,
    ) -> String {
        let predicate = format!("{} = ?", self.dialect.quote_identifier(column));
        let filter = vec![predicate.as_str(); matches.max(1)].join(" OR ");
        format!("DELETE FROM {} WHERE {filter}", self.dialect.table_ref(destination, table))
    }

    /// Error table DDL.
    #[must_use]
    pub fn create_error_table(&self, destination: &str) -> String {
        let spec = format!(
            "({} TIMESTAMP, {} TEXT, {} TEXT)",
            self.dialect.quote_identifier(ERROR_TIMESTAMP_COLUMN),
            self.dialect.quote_identifier(ERROR_MESSAGE_COLUMN),
            self.dialect.quote_identifier(ERROR_QUERY_COLUMN)
        );
        self.dialect.create_table_sql(destination, &error_table_name(destination), &spec)
    }

    /// Error row INSERT binding timestamp, message and query.
    #[must_use]
    pub fn insert_error(&self, destination: &str) -> String {
        self.insert(
            destination,
            &error_table_name(destination),
            &[ERROR_TIMESTAMP_COLUMN, ERROR_MESSAGE_COLUMN, ERROR_QUERY_COLUMN],
            1,
        )
    }

    /// DELETE keeping only the `keep` newest error rows.
    ///
    /// Timestamp ties are ordered by the dialect's row identity when it has
    /// one.
    #[must_use]
    pub fn purge_errors(&self, destination: &str, keep: usize) -> String {
        let table_ref = self.dialect.table_ref(destination, &error_table_name(destination));
        let timestamp = self.dialect.quote_identifier(ERROR_TIMESTAMP_COLUMN);
        match self.dialect.row_identity() {
            Some(identity) => format!(
                "DELETE FROM {table_ref} WHERE {identity} NOT IN (SELECT {identity} FROM \
                 {table_ref} ORDER BY {timestamp} DESC, {identity} DESC LIMIT {keep})"
            ),
            None => format!(
                "DELETE FROM {table_ref} WHERE {timestamp} NOT IN (SELECT {timestamp} FROM \
                 (SELECT {timestamp} FROM {table_ref} ORDER BY {timestamp} DESC LIMIT {keep}) \
                 newest)"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::BatchError;
    use super::ColumnBatch;
    use super::QueryBuilder;
    use super::ValueEncoding;
    use super::encode_value;
    use super::is_error_table;
    use crate::dialect::dialect_for;
    use crate::driver::SqlValue;

    #[test]
    fn native_encoding_keeps_types() {
        assert_eq!(encode_value(&json!(true), ValueEncoding::Native), SqlValue::Bool(true));
        assert_eq!(encode_value(&json!(42), ValueEncoding::Native), SqlValue::Integer(42));
        assert_eq!(encode_value(&json!(1.5), ValueEncoding::Native), SqlValue::Real(1.5));
        assert_eq!(encode_value(&json!(null), ValueEncoding::Native), SqlValue::Null);
        assert_eq!(
            encode_value(&json!({"a": 1}), ValueEncoding::Native),
            SqlValue::Text("{\"a\":1}".to_string())
        );
    }

    #[test]
    fn text_encoding_stringifies() {
        assert_eq!(encode_value(&json!(42), ValueEncoding::Text), SqlValue::from("42"));
        assert_eq!(encode_value(&json!("x"), ValueEncoding::Text), SqlValue::from("x"));
        assert_eq!(encode_value(&json!(null), ValueEncoding::Text), SqlValue::Null);
    }

    #[test]
    fn batch_validation_rejects_bad_shapes() {
        assert_eq!(ColumnBatch::new().validate(), Err(BatchError::Empty));
        let ragged = ColumnBatch::new()
            .with_column("a", vec![json!(1), json!(2)])
            .with_column("b", vec![json!(1)]);
        assert!(matches!(ragged.validate(), Err(BatchError::Ragged { actual: 1, .. })));
        let duplicate =
            ColumnBatch::new().with_column("a", vec![json!(1)]).with_column("a", vec![json!(2)]);
        assert_eq!(duplicate.validate(), Err(BatchError::DuplicateColumn("a".to_string())));
    }

    #[test]
    fn batch_rows_transpose_columns() {
        let batch = ColumnBatch::new()
            .with_column("id", vec![json!("a"), json!("b")])
            .with_column("v", vec![json!(1), json!(2)]);
        assert_eq!(
            batch.rows(ValueEncoding::Native),
            vec![
                vec![SqlValue::from("a"), SqlValue::Integer(1)],
                vec![SqlValue::from("b"), SqlValue::Integer(2)],
            ]
        );
    }

    #[test]
    fn multi_row_insert_uses_placeholders() {
        let dialect = dialect_for("mysql");
        let builder = QueryBuilder::new(dialect.as_ref());
        assert_eq!(
            builder.insert("sensors", "temp", &["id", "v"], 2),
            "INSERT INTO `temp` (`id`,`v`) VALUES (?,?),(?,?)"
        );
    }

    #[test]
    fn delete_matching_chains_predicates() {
        let dialect = dialect_for("postgresql");
        let builder = QueryBuilder::new(dialect.as_ref());
        assert_eq!(
            builder.delete_matching("sensors", "temp", "recvTime", 2),
            "DELETE FROM \"sensors\".\"temp\" WHERE \"recvTime\" = ? OR \"recvTime\" = ?"
        );
    }

    #[test]
    fn purge_keeps_newest_rows() {
        let dialect = dialect_for("mysql");
        let builder = QueryBuilder::new(dialect.as_ref());
        assert_eq!(
            builder.purge_errors("sensors", 100),
            "DELETE FROM `sensors_error_log` WHERE `timestamp` NOT IN (SELECT `timestamp` FROM \
             (SELECT `timestamp` FROM `sensors_error_log` ORDER BY `timestamp` DESC LIMIT 100) \
             newest)"
        );
    }

    #[test]
    fn sqlite_purge_breaks_timestamp_ties_by_rowid() {
        let dialect = dialect_for("sqlite");
        let builder = QueryBuilder::new(dialect.as_ref());
        assert_eq!(
            builder.purge_errors("sensors", 2),
            "DELETE FROM \"sensors_error_log\" WHERE rowid NOT IN (SELECT rowid FROM \
             \"sensors_error_log\" ORDER BY \"timestamp\" DESC, rowid DESC LIMIT 2)"
        );
    }

    #[test]
    fn postgres_purge_breaks_timestamp_ties_by_ctid() {
        let dialect = dialect_for("postgresql");
        let builder = QueryBuilder::new(dialect.as_ref());
        assert_eq!(
            builder.purge_errors("sensors", 5),
            "DELETE FROM \"sensors\".\"sensors_error_log\" WHERE ctid NOT IN (SELECT ctid FROM \
             \"sensors\".\"sensors_error_log\" ORDER BY \"timestamp\" DESC, ctid DESC LIMIT 5)"
        );
    }

    #[test]
    fn error_table_matches_only_its_destination() {
        assert!(is_error_table("sensors", "sensors_error_log"));
        assert!(!is_error_table("sensors", "readings_error_log"));
        assert!(!is_error_table("readings", "sensors_error_log"));
        assert!(!is_error_table("sensors", "sensors"));
    }

    #[test]
    fn error_table_ddl_quotes_columns() {
        let dialect = dialect_for("sqlite");
        let builder = QueryBuilder::new(dialect.as_ref());
        assert_eq!(
            builder.create_error_table("sensors"),
            "CREATE TABLE IF NOT EXISTS \"sensors_error_log\" (\"timestamp\" TIMESTAMP, \
             \"error\" TEXT, \"query\" TEXT)"
        );
    }
}
