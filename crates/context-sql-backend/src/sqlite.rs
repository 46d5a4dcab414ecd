// crates/context-sql-backend/src/sqlite.rs
// ============================================================================
// Module: SQLite Driver
// Description: Bundled rusqlite wire client with r2d2 pooling.
// Purpose: Provide an embedded driver with one database file per destination.
// Dependencies: rusqlite, r2d2, tracing
// ============================================================================

//! ## Overview
//! [`SqliteDriver`] serves URLs of the form `sqlite://<dir>/<destination>.db`
//! with optional `?key=value&...` options applied as PRAGMAs. Every
//! connection gets the configured journal mode, sync mode and busy timeout.
//! Busy, locked and interrupted statements surface as timeouts.
//!
//! A handle returned to its pool with an open transaction is rolled back
//! before reuse; a failed rollback discards the handle.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use r2d2::ManageConnection;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::params_from_iter;
use rusqlite::types::ToSql;
use rusqlite::types::ToSqlOutput;
use rusqlite::types::Value;
use rusqlite::types::ValueRef;

use crate::config::SqliteSettings;
use crate::driver::ConnectionTarget;
use crate::driver::LowLevelConnection;
use crate::driver::LowLevelPool;
use crate::driver::PoolSettings;
use crate::driver::R2d2Pool;
use crate::driver::RowSet;
use crate::driver::SqlDriver;
use crate::driver::SqlValue;
use crate::error::DriverError;
use crate::timestamp::format_timestamp;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// URL scheme served by this driver.
const URL_SCHEME: &str = "sqlite://";

/// Maximum accepted PRAGMA option key or value length.
const MAX_OPTION_LENGTH: usize = 64;

// ============================================================================
// SECTION: Driver
// ============================================================================

/// Embedded `SQLite` driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver {
    /// Pragmas and busy timeout applied to every connection.
    settings: SqliteSettings,
}

impl SqliteDriver {
    /// Creates a driver applying `settings` to every connection.
    #[must_use]
    pub const fn new(settings: SqliteSettings) -> Self {
        Self {
            settings,
        }
    }
}

impl SqlDriver for SqliteDriver {
    fn name(&self) -> &str {
        "rusqlite"
    }

    fn create_pool(
        &self,
        target: &ConnectionTarget,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn LowLevelPool>, DriverError> {
        let (path, pragmas) = parse_url(&target.url)?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| DriverError::configuration("SqliteDirectory", err.to_string()))?;
        }
        let manager = SqliteConnectionManager {
            path,
            pragmas,
            settings: self.settings,
        };
        Ok(Arc::new(R2d2Pool::build(manager, settings)?))
    }
}

/// Splits a `sqlite://` URL into the database path and validated options.
fn parse_url(url: &str) -> Result<(PathBuf, Vec<(String, String)>), DriverError> {
    let rest = url.strip_prefix(URL_SCHEME).ok_or_else(|| {
        DriverError::configuration("InvalidUrl", format!("expected {URL_SCHEME} url: {url}"))
    })?;
    let (path, options) = rest.split_once('?').unwrap_or((rest, ""));
    if path.is_empty() {
        return Err(DriverError::configuration("InvalidUrl", "sqlite url has no path"));
    }
    let mut pragmas = Vec::new();
    for option in options.split('&').filter(|option| !option.is_empty()) {
        let (key, value) = option.split_once('=').ok_or_else(|| {
            DriverError::configuration("InvalidOption", format!("option without value: {option}"))
        })?;
        if !is_safe_token(key) || !is_safe_token(value) {
            return Err(DriverError::configuration(
                "InvalidOption",
                format!("unsupported option: {option}"),
            ));
        }
        pragmas.push((key.to_string(), value.to_string()));
    }
    Ok((PathBuf::from(path), pragmas))
}

/// Accepts short ASCII words usable verbatim in a PRAGMA statement.
fn is_safe_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_OPTION_LENGTH
        && token.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

// ============================================================================
// SECTION: Connection Manager
// ============================================================================

/// `r2d2` manager opening `SQLite` connections to one file.
#[derive(Debug)]
struct SqliteConnectionManager {
    /// Database file path.
    path: PathBuf,
    /// Extra PRAGMAs from URL options.
    pragmas: Vec<(String, String)>,
    /// Journal, sync and busy timeout settings.
    settings: SqliteSettings,
}

impl ManageConnection for SqliteConnectionManager {
    type Connection = SqliteConnection;
    type Error = DriverError;

    fn connect(&self) -> Result<SqliteConnection, DriverError> {
        let connection = open_connection(&self.path, &self.settings, &self.pragmas)?;
        tracing::debug!(path = %self.path.display(), "opened sqlite connection");
        Ok(SqliteConnection {
            connection,
        })
    }

    fn is_valid(&self, conn: &mut SqliteConnection) -> Result<(), DriverError> {
        conn.connection.execute_batch("SELECT 1;").map_err(map_sqlite_error)
    }

    fn has_broken(&self, conn: &mut SqliteConnection) -> bool {
        if conn.connection.is_autocommit() {
            return false;
        }
        if let Err(err) = conn.connection.execute_batch("ROLLBACK;") {
            tracing::error!(error = %err, "rollback of abandoned transaction failed");
            return true;
        }
        false
    }
}

/// Opens one connection and applies pragmas.
fn open_connection(
    path: &Path,
    settings: &SqliteSettings,
    pragmas: &[(String, String)],
) -> Result<Connection, DriverError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(path, flags)
        .map_err(|err| DriverError::connection("SqliteOpenError", err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", settings.journal_mode.pragma_value()))
        .map_err(map_sqlite_error)?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", settings.sync_mode.pragma_value()))
        .map_err(map_sqlite_error)?;
    connection
        .busy_timeout(Duration::from_millis(settings.busy_timeout_ms))
        .map_err(map_sqlite_error)?;
    for (key, value) in pragmas {
        connection
            .execute_batch(&format!("PRAGMA {key} = {value};"))
            .map_err(|err| DriverError::configuration("InvalidOption", err.to_string()))?;
    }
    Ok(connection)
}

/// Maps a rusqlite failure onto a driver error kind.
fn map_sqlite_error(err: rusqlite::Error) -> DriverError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::OperationInterrupted => {
                DriverError::timeout("SqliteTimeout", err.to_string())
            }
            ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::SystemIoFailure => {
                DriverError::connection("SqliteIoError", err.to_string())
            }
            _ => DriverError::statement("SqliteFailure", err.to_string()),
        },
        _ => DriverError::statement("SqliteError", err.to_string()),
    }
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// One pooled `SQLite` connection.
pub struct SqliteConnection {
    /// Underlying rusqlite connection.
    connection: Connection,
}

impl LowLevelConnection for SqliteConnection {
    fn is_valid(&mut self) -> bool {
        self.connection.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DriverError> {
        let mut statement = self.connection.prepare(sql).map_err(map_sqlite_error)?;
        let affected = statement.execute(params_from_iter(params.iter())).map_err(map_sqlite_error)?;
        Ok(u64::try_from(affected).unwrap_or(u64::MAX))
    }

    fn execute_many(&mut self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<Vec<u64>, DriverError> {
        let mut statement = self.connection.prepare(sql).map_err(map_sqlite_error)?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let affected =
                statement.execute(params_from_iter(row.iter())).map_err(map_sqlite_error)?;
            counts.push(u64::try_from(affected).unwrap_or(u64::MAX));
        }
        Ok(counts)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<RowSet, DriverError> {
        let mut statement = self.connection.prepare(sql).map_err(map_sqlite_error)?;
        let columns: Vec<String> =
            statement.column_names().into_iter().map(str::to_string).collect();
        let width = columns.len();
        let mut snapshot = RowSet::new(columns);
        let mut rows = statement.query(params_from_iter(params.iter())).map_err(map_sqlite_error)?;
        while let Some(row) = rows.next().map_err(map_sqlite_error)? {
            let mut values = Vec::with_capacity(width);
            for index in 0 .. width {
                let value = row.get_ref(index).map_err(map_sqlite_error)?;
                values.push(value_from_ref(value));
            }
            snapshot.push_row(values);
        }
        Ok(snapshot)
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        self.connection.execute_batch("BEGIN IMMEDIATE;").map_err(map_sqlite_error)
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.connection.execute_batch("COMMIT;").map_err(map_sqlite_error)
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.connection.execute_batch("ROLLBACK;").map_err(map_sqlite_error)
    }

    fn in_transaction(&self) -> bool {
        !self.connection.is_autocommit()
    }
}

/// Copies a borrowed column value into an owned [`SqlValue`].
fn value_from_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(number) => SqlValue::Integer(number),
        ValueRef::Real(number) => SqlValue::Real(number),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Bool(flag) => ToSqlOutput::Owned(Value::Integer(i64::from(*flag))),
            Self::Integer(number) => ToSqlOutput::Owned(Value::Integer(*number)),
            Self::Real(number) => ToSqlOutput::Owned(Value::Real(*number)),
            Self::Text(text) => ToSqlOutput::Borrowed(ValueRef::Text(text.as_bytes())),
            Self::Timestamp(instant) => ToSqlOutput::Owned(Value::Text(format_timestamp(*instant))),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::expect_used,
        clippy::unwrap_used,
        reason = "Test assertions use expect/unwrap for clarity."
    )]

    use std::time::Duration;

    use tempfile::TempDir;

    use super::SqliteDriver;
    use super::parse_url;
    use crate::config::SqliteSettings;
    use crate::driver::ConnectionTarget;
    use crate::driver::PoolSettings;
    use crate::driver::SqlDriver;

    #[test]
    fn parses_path_and_options() {
        let (path, pragmas) = parse_url("sqlite:///tmp/ctx/sensors.db?foreign_keys=ON").unwrap();
        assert_eq!(path.to_str(), Some("/tmp/ctx/sensors.db"));
        assert_eq!(pragmas, vec![("foreign_keys".to_string(), "ON".to_string())]);
    }

    #[test]
    fn rejects_foreign_schemes_and_unsafe_options() {
        assert!(parse_url("mysql://db:3306/sensors").is_err());
        assert!(parse_url("sqlite://").is_err());
        assert!(parse_url("sqlite:///tmp/a.db?x=1;DROP").is_err());
        assert!(parse_url("sqlite:///tmp/a.db?novalue").is_err());
    }

    #[test]
    fn close_returns_promptly_and_rejects_new_checkouts() {
        let dir = TempDir::new().unwrap();
        let target = ConnectionTarget {
            destination: "sensors".to_string(),
            url: format!("sqlite://{}/sensors.db", dir.path().display()),
            username: String::new(),
            password: String::new(),
        };
        let settings = PoolSettings {
            max_size: 2,
            acquire_timeout: Duration::from_millis(500),
        };
        let pool = SqliteDriver::new(SqliteSettings::default())
            .create_pool(&target, &settings)
            .unwrap();
        let mut held = pool.get().unwrap();
        pool.close().unwrap();
        assert!(held.is_valid());
        assert!(pool.get().is_err());
        assert_eq!(pool.status().max_size, 0);
        pool.close().unwrap();
        drop(held);
    }
}
