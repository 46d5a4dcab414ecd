// crates/context-sql-backend/src/dialect.rs
// ============================================================================
// Module: SQL Dialects
// Description: Addressing and rendering conventions per database product.
// Purpose: Centralize identifier quoting and dialect-specific SQL fragments.
// Dependencies: std
// ============================================================================

//! ## Overview
//! A [`DialectAdapter`] answers every question that differs between database
//! products: how a destination is addressed in the connection URL, how
//! identifiers are quoted, how a table is referenced, how destinations are
//! created and how the last-writer-wins upsert clause is rendered.
//!
//! Three adapters ship with the crate:
//! - [`MySqlDialect`]: the destination is the database named in the URL.
//! - [`AnsiDialect`]: every pool addresses the shared default database and
//!   the destination is a schema inside it.
//! - [`SqliteDialect`]: one database file per destination; the destination
//!   materializes when its first connection opens.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use crate::config::BackendConfig;

// ============================================================================
// SECTION: Adapter Contract
// ============================================================================

/// Dialect-specific rendering strategy.
pub trait DialectAdapter: Send + Sync {
    /// Lower-case dialect name used in logs and error messages.
    fn name(&self) -> &str;

    /// Builds the connection URL for the pool serving `destination`.
    fn build_connection_url(&self, config: &BackendConfig, destination: &str) -> String;

    /// Quotes one identifier.
    fn quote_identifier(&self, identifier: &str) -> String;

    /// Renders a reference to `table` inside `destination`.
    fn table_ref(&self, destination: &str, table: &str) -> String;

    /// Destination creation DDL; `None` when destinations need no DDL.
    fn create_destination_sql(&self, destination: &str) -> Option<String>;

    /// Pool key used to run destination-level DDL for `destination`.
    fn ddl_destination<'a>(&self, destination: &'a str) -> &'a str;

    /// Table creation DDL for a caller-rendered column clause.
    fn create_table_sql(&self, destination: &str, table: &str, column_spec: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} {}",
            self.table_ref(destination, table),
            column_spec.trim()
        )
    }

    /// Wraps a column expression so it compares as a point in time.
    fn timestamp_expr(&self, expr: &str, format: &str) -> String;

    /// Renders the conflict clause appended to the latest-value INSERT.
    ///
    /// `columns` are the inserted column names in order. A row overwrites the
    /// stored one only when its timestamp is not older.
    fn upsert_conflict_clause(
        &self,
        table_ref: &str,
        columns: &[&str],
        unique_key: &str,
        timestamp_key: &str,
        timestamp_format: &str,
    ) -> String;

    /// Hidden per-row identity that orders rows sharing a timestamp.
    fn row_identity(&self) -> Option<&'static str> {
        None
    }
}

/// Selects the adapter for a configured instance identifier.
#[must_use]
pub fn dialect_for(instance: &str) -> Arc<dyn DialectAdapter> {
    let normalized = instance.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "mysql" => Arc::new(MySqlDialect),
        "sqlite" => Arc::new(SqliteDialect),
        _ => Arc::new(AnsiDialect::new(normalized)),
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Quotes `identifier` with `quote`, doubling embedded quote characters.
fn quote_with(identifier: &str, quote: char) -> String {
    let doubled: String = [quote, quote].iter().collect();
    let escaped = identifier.replace(quote, &doubled);
    format!("{quote}{escaped}{quote}")
}

/// Escapes a value embedded in a single-quoted SQL literal.
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Appends `?options` when extra options are configured.
fn with_options(url: String, config: &BackendConfig) -> String {
    match config.effective_options() {
        Some(options) => format!("{url}?{options}"),
        None => url,
    }
}

/// Orders update targets: unique key dropped, timestamp column last.
fn update_targets<'a>(columns: &[&'a str], unique_key: &str, timestamp_key: &str) -> Vec<&'a str> {
    let mut targets: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|column| *column != unique_key && *column != timestamp_key)
        .collect();
    if let Some(timestamp) = columns.iter().copied().find(|column| *column == timestamp_key)
        && timestamp != unique_key
    {
        targets.push(timestamp);
    }
    targets
}

/// Renders the `ON CONFLICT` form shared by ANSI databases and `SQLite`.
fn on_conflict_clause(
    dialect: &dyn DialectAdapter,
    table_ref: &str,
    columns: &[&str],
    unique_key: &str,
    timestamp_key: &str,
    timestamp_format: &str,
) -> String {
    let key = dialect.quote_identifier(unique_key);
    let targets = update_targets(columns, unique_key, timestamp_key);
    if targets.is_empty() {
        return format!("ON CONFLICT ({key}) DO NOTHING");
    }
    let assignments = targets
        .iter()
        .map(|column| {
            let quoted = dialect.quote_identifier(column);
            format!("{quoted} = EXCLUDED.{quoted}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    let timestamp = dialect.quote_identifier(timestamp_key);
    let incoming = dialect.timestamp_expr(&format!("EXCLUDED.{timestamp}"), timestamp_format);
    let stored = dialect.timestamp_expr(&format!("{table_ref}.{timestamp}"), timestamp_format);
    format!("ON CONFLICT ({key}) DO UPDATE SET {assignments} WHERE {incoming} >= {stored}")
}

// ============================================================================
// SECTION: MySQL
// ============================================================================

/// `MySQL`: destinations are databases addressed directly in the URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl DialectAdapter for MySqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn build_connection_url(&self, config: &BackendConfig, destination: &str) -> String {
        with_options(format!("mysql://{}:{}/{destination}", config.host, config.port), config)
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        quote_with(identifier, '`')
    }

    fn table_ref(&self, _destination: &str, table: &str) -> String {
        self.quote_identifier(table)
    }

    fn create_destination_sql(&self, destination: &str) -> Option<String> {
        Some(format!("CREATE DATABASE IF NOT EXISTS {}", self.quote_identifier(destination)))
    }

    fn ddl_destination<'a>(&self, _destination: &'a str) -> &'a str {
        ""
    }

    fn timestamp_expr(&self, expr: &str, format: &str) -> String {
        format!("STR_TO_DATE({expr},{})", literal(format))
    }

    fn upsert_conflict_clause(
        &self,
        _table_ref: &str,
        columns: &[&str],
        unique_key: &str,
        timestamp_key: &str,
        timestamp_format: &str,
    ) -> String {
        let timestamp = self.quote_identifier(timestamp_key);
        let incoming = self.timestamp_expr(&format!("VALUES({timestamp})"), timestamp_format);
        let stored = self.timestamp_expr(&timestamp, timestamp_format);
        let targets = update_targets(columns, unique_key, timestamp_key);
        if targets.is_empty() {
            let key = self.quote_identifier(unique_key);
            return format!("ON DUPLICATE KEY UPDATE {key} = {key}");
        }
        // Assignments apply left to right, so the timestamp must be updated last.
        let assignments = targets
            .iter()
            .map(|column| {
                let quoted = self.quote_identifier(column);
                format!("{quoted} = IF({incoming} >= {stored}, VALUES({quoted}), {quoted})")
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("ON DUPLICATE KEY UPDATE {assignments}")
    }
}

// ============================================================================
// SECTION: ANSI
// ============================================================================

/// Schema-addressed databases such as `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct AnsiDialect {
    /// Instance identifier, also the URL scheme.
    name: String,
}

impl AnsiDialect {
    /// Creates an adapter for the given instance identifier.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
        }
    }
}

impl DialectAdapter for AnsiDialect {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_connection_url(&self, config: &BackendConfig, _destination: &str) -> String {
        with_options(
            format!("{}://{}:{}/{}", self.name, config.host, config.port, config.default_database),
            config,
        )
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        quote_with(identifier, '"')
    }

    fn table_ref(&self, destination: &str, table: &str) -> String {
        format!("{}.{}", self.quote_identifier(destination), self.quote_identifier(table))
    }

    fn create_destination_sql(&self, destination: &str) -> Option<String> {
        Some(format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote_identifier(destination)))
    }

    fn ddl_destination<'a>(&self, _destination: &'a str) -> &'a str {
        ""
    }

    fn timestamp_expr(&self, expr: &str, format: &str) -> String {
        format!("to_timestamp(CAST({expr} AS TEXT),{})", literal(format))
    }

    fn upsert_conflict_clause(
        &self,
        table_ref: &str,
        columns: &[&str],
        unique_key: &str,
        timestamp_key: &str,
        timestamp_format: &str,
    ) -> String {
        on_conflict_clause(self, table_ref, columns, unique_key, timestamp_key, timestamp_format)
    }

    fn row_identity(&self) -> Option<&'static str> {
        (self.name == "postgresql").then_some("ctid")
    }
}

// ============================================================================
// SECTION: SQLite
// ============================================================================

/// `SQLite`: one database file per destination under the host directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl DialectAdapter for SqliteDialect {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn build_connection_url(&self, config: &BackendConfig, destination: &str) -> String {
        let directory = config.host.trim_end_matches('/');
        with_options(format!("sqlite://{directory}/{destination}.db"), config)
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        quote_with(identifier, '"')
    }

    fn table_ref(&self, _destination: &str, table: &str) -> String {
        self.quote_identifier(table)
    }

    fn create_destination_sql(&self, _destination: &str) -> Option<String> {
        None
    }

    fn ddl_destination<'a>(&self, destination: &'a str) -> &'a str {
        destination
    }

    /// `julianday` reads ISO-8601 text; the format string is not needed.
    fn timestamp_expr(&self, expr: &str, _format: &str) -> String {
        format!("julianday({expr})")
    }

    fn upsert_conflict_clause(
        &self,
        table_ref: &str,
        columns: &[&str],
        unique_key: &str,
        timestamp_key: &str,
        timestamp_format: &str,
    ) -> String {
        on_conflict_clause(self, table_ref, columns, unique_key, timestamp_key, timestamp_format)
    }

    fn row_identity(&self) -> Option<&'static str> {
        Some("rowid")
    }
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::expect_used,
        clippy::unwrap_used,
        reason = "Test assertions use expect/unwrap for clarity."
    )]

    use super::DialectAdapter;
    use super::dialect_for;
    use crate::config::BackendConfig;

    fn config(instance: &str) -> BackendConfig {
        let mut config = BackendConfig::new("db.local", instance, "sqlite");
        config.port = 5432;
        config.default_database = "ctx".to_string();
        config
    }

    #[test]
    fn mysql_addresses_destination_as_database() {
        let dialect = dialect_for("MySQL");
        let mut config = config("mysql");
        config.port = 3306;
        config.options = Some("useSSL=false".to_string());
        assert_eq!(dialect.name(), "mysql");
        assert_eq!(
            dialect.build_connection_url(&config, "sensors"),
            "mysql://db.local:3306/sensors?useSSL=false"
        );
        assert_eq!(dialect.table_ref("sensors", "temp"), "`temp`");
        assert_eq!(dialect.ddl_destination("sensors"), "");
        assert_eq!(
            dialect.create_destination_sql("sensors").as_deref(),
            Some("CREATE DATABASE IF NOT EXISTS `sensors`")
        );
    }

    #[test]
    fn ansi_addresses_destination_as_schema() {
        let dialect = dialect_for("postgresql");
        let config = config("postgresql");
        assert_eq!(
            dialect.build_connection_url(&config, "sensors"),
            "postgresql://db.local:5432/ctx"
        );
        assert_eq!(dialect.table_ref("sensors", "temp"), "\"sensors\".\"temp\"");
        assert_eq!(
            dialect.create_destination_sql("sensors").as_deref(),
            Some("CREATE SCHEMA IF NOT EXISTS \"sensors\"")
        );
    }

    #[test]
    fn sqlite_has_no_destination_ddl() {
        let dialect = dialect_for("sqlite");
        let mut config = config("sqlite");
        config.host = "/var/lib/ctx/".to_string();
        assert_eq!(
            dialect.build_connection_url(&config, "sensors"),
            "sqlite:///var/lib/ctx/sensors.db"
        );
        assert!(dialect.create_destination_sql("sensors").is_none());
        assert_eq!(dialect.ddl_destination("sensors"), "sensors");
    }

    #[test]
    fn identifiers_escape_embedded_quotes() {
        assert_eq!(dialect_for("mysql").quote_identifier("a`b"), "`a``b`");
        assert_eq!(dialect_for("postgresql").quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn mysql_upsert_updates_timestamp_last_and_skips_key() {
        let clause = dialect_for("mysql").upsert_conflict_clause(
            "`temp_latest`",
            &["recvTime", "entityId", "value"],
            "entityId",
            "recvTime",
            "%Y-%m-%d %H:%i:%s",
        );
        assert!(clause.starts_with("ON DUPLICATE KEY UPDATE `value` = IF("));
        assert!(!clause.contains("`entityId` = "));
        let value_at = clause.find("`value` = ").unwrap();
        let time_at = clause.find("`recvTime` = ").unwrap();
        assert!(value_at < time_at);
        assert!(clause.contains("STR_TO_DATE(VALUES(`recvTime`),'%Y-%m-%d %H:%i:%s')"));
    }

    #[test]
    fn ansi_upsert_guards_on_timestamp() {
        let dialect = dialect_for("postgresql");
        let table_ref = dialect.table_ref("sensors", "temp_latest");
        let clause = dialect.upsert_conflict_clause(
            &table_ref,
            &["entityId", "value", "recvTime"],
            "entityId",
            "recvTime",
            "YYYY-MM-DD HH24:MI:SS",
        );
        assert_eq!(
            clause,
            "ON CONFLICT (\"entityId\") DO UPDATE SET \"value\" = EXCLUDED.\"value\", \
             \"recvTime\" = EXCLUDED.\"recvTime\" WHERE \
             to_timestamp(CAST(EXCLUDED.\"recvTime\" AS TEXT),'YYYY-MM-DD HH24:MI:SS') >= \
             to_timestamp(CAST(\"sensors\".\"temp_latest\".\"recvTime\" AS TEXT),'YYYY-MM-DD HH24:MI:SS')"
        );
    }

    #[test]
    fn key_only_upsert_does_nothing_on_conflict() {
        let clause =
            dialect_for("sqlite").upsert_conflict_clause("\"t\"", &["id"], "id", "ts", "");
        assert_eq!(clause, "ON CONFLICT (\"id\") DO NOTHING");
    }
}
