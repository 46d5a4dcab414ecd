// crates/context-sql-backend/src/driver.rs
// ============================================================================
// Module: Driver Interfaces
// Description: Wire-client contracts consumed by the backend.
// Purpose: Keep the concrete database client and its pooling behind traits.
// Dependencies: r2d2, time, tracing
// ============================================================================

//! ## Overview
//! The backend never talks to a database client directly. A [`SqlDriver`]
//! builds one bounded [`LowLevelPool`] per destination, and pools hand out
//! [`LowLevelConnection`] handles that return to their pool when dropped.
//! [`R2d2Pool`] adapts any `r2d2` connection manager whose connection type
//! implements [`LowLevelConnection`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use r2d2::ManageConnection;
use r2d2::Pool;
use r2d2::PooledConnection;
use time::OffsetDateTime;

use crate::config::BackendConfig;
use crate::error::DriverError;
use crate::sqlite::SqliteDriver;
use crate::timestamp::format_timestamp;

// ============================================================================
// SECTION: Values
// ============================================================================

/// Driver-neutral bound parameter or fetched column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit integer value.
    Integer(i64),
    /// Double precision value.
    Real(f64),
    /// Text value.
    Text(String),
    /// Point in time.
    Timestamp(OffsetDateTime),
}

impl SqlValue {
    /// Returns true for [`SqlValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Renders the value as text; `None` for `NULL`.
    #[must_use]
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(value) => Some(value.to_string()),
            Self::Integer(value) => Some(value.to_string()),
            Self::Real(value) => Some(value.to_string()),
            Self::Text(value) => Some(value.clone()),
            Self::Timestamp(value) => Some(format_timestamp(*value)),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

// ============================================================================
// SECTION: Row Sets
// ============================================================================

/// Disconnected result snapshot, readable after its cursor is closed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    /// Column names in select order.
    columns: Vec<String>,
    /// Owned row values, one entry per column.
    rows: Vec<Vec<SqlValue>>,
}

impl RowSet {
    /// Creates an empty snapshot with the given columns.
    #[must_use]
    pub const fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Appends one row.
    pub fn push_row(&mut self, row: Vec<SqlValue>) {
        self.rows.push(row);
    }

    /// Returns the column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when the snapshot holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the rows in fetch order.
    #[must_use]
    pub fn rows(&self) -> &[Vec<SqlValue>] {
        &self.rows
    }

    /// Finds a column index, falling back to a case-insensitive match.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column == name)
            .or_else(|| self.columns.iter().position(|column| column.eq_ignore_ascii_case(name)))
    }

    /// Returns the value at `row` for column `name`.
    #[must_use]
    pub fn value(&self, row: usize, name: &str) -> Option<&SqlValue> {
        let index = self.column_index(name)?;
        self.rows.get(row).and_then(|values| values.get(index))
    }
}

// ============================================================================
// SECTION: Connections and Pools
// ============================================================================

/// Resolved connection target for one destination pool.
#[derive(Clone)]
pub struct ConnectionTarget {
    /// Destination the pool serves (empty for server-level connections).
    pub destination: String,
    /// Dialect-specific connection URL.
    pub url: String,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
}

impl ConnectionTarget {
    /// Returns the URL with credentials appended and the password masked.
    #[must_use]
    pub fn masked_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{separator}user={}&password=XXXXXXXXXX", self.url, self.username)
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("destination", &self.destination)
            .field("url", &self.masked_url())
            .finish()
    }
}

/// Bounds applied to each destination pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum number of open connections.
    pub max_size: u32,
    /// Maximum wait for a free connection.
    pub acquire_timeout: Duration,
}

/// Snapshot of one pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatus {
    /// Configured capacity.
    pub max_size: u32,
    /// Connections handed out.
    pub active: u32,
    /// Connections open but idle.
    pub idle: u32,
}

/// Connection handle handed out by a [`LowLevelPool`].
///
/// Dropping the handle returns it to its pool.
pub trait LowLevelConnection: Send {
    /// Returns true when the handle can still execute statements.
    fn is_valid(&mut self) -> bool;

    /// Executes one statement with bound parameters, returning affected rows.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the statement fails.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DriverError>;

    /// Executes one statement once per parameter row.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] on the first failing row.
    fn execute_many(&mut self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<Vec<u64>, DriverError> {
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            counts.push(self.execute(sql, row)?);
        }
        Ok(counts)
    }

    /// Runs a query and materializes the full result.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the query fails.
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<RowSet, DriverError>;

    /// Opens a transaction (auto-commit off).
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the transaction cannot be opened.
    fn begin(&mut self) -> Result<(), DriverError>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the commit fails.
    fn commit(&mut self) -> Result<(), DriverError>;

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the rollback fails.
    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Returns true while a transaction is open.
    fn in_transaction(&self) -> bool;
}

/// Bounded pool of connections to one destination.
pub trait LowLevelPool: Send + Sync {
    /// Takes a connection, blocking up to the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the pool is exhausted, closed, or the
    /// server cannot be reached.
    fn get(&self) -> Result<Box<dyn LowLevelConnection>, DriverError>;

    /// Returns the current occupancy.
    fn status(&self) -> PoolStatus;

    /// Releases every idle connection and refuses further checkouts.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when teardown fails.
    fn close(&self) -> Result<(), DriverError>;
}

/// Wire-level client able to build destination pools.
pub trait SqlDriver: Send + Sync {
    /// Driver identifier used in logs.
    fn name(&self) -> &str;

    /// Builds a bounded pool for the given target.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] with [`crate::error::DriverErrorKind::Configuration`]
    /// when the target or settings are unusable.
    fn create_pool(
        &self,
        target: &ConnectionTarget,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn LowLevelPool>, DriverError>;
}

/// Resolves the driver named by `config.driver`.
///
/// # Errors
///
/// Returns a configuration [`DriverError`] when the identifier is unknown or
/// the driver was not compiled in.
pub fn driver_for(config: &BackendConfig) -> Result<Arc<dyn SqlDriver>, DriverError> {
    match config.driver.trim().to_ascii_lowercase().as_str() {
        "sqlite" | "rusqlite" => Ok(Arc::new(SqliteDriver::new(config.sqlite))),
        #[cfg(feature = "postgres")]
        "postgres" | "postgresql" => Ok(Arc::new(crate::postgres::PostgresDriver::new())),
        other => Err(DriverError::configuration(
            "DriverNotFound",
            format!("no driver registered for identifier '{other}'"),
        )),
    }
}

// ============================================================================
// SECTION: r2d2 Adapter
// ============================================================================

/// [`LowLevelPool`] backed by an `r2d2` pool.
///
/// # Invariants
/// - The inner pool is `None` once [`LowLevelPool::close`] has run.
pub struct R2d2Pool<M: ManageConnection> {
    /// Inner pool; taken on close.
    pool: Mutex<Option<Pool<M>>>,
}

impl<M> R2d2Pool<M>
where
    M: ManageConnection,
    M::Connection: LowLevelConnection,
{
    /// Builds a lazily filled pool bounded by `settings`.
    ///
    /// # Errors
    ///
    /// Returns a configuration [`DriverError`] when `r2d2` rejects the pool.
    pub fn build(manager: M, settings: &PoolSettings) -> Result<Self, DriverError> {
        if settings.max_size == 0 || settings.acquire_timeout.is_zero() {
            return Err(DriverError::configuration(
                "PoolSettings",
                "pool size and acquire timeout must be greater than zero",
            ));
        }
        let pool = Pool::builder()
            .max_size(settings.max_size)
            .min_idle(Some(0))
            .connection_timeout(settings.acquire_timeout)
            .test_on_check_out(false)
            .build(manager)
            .map_err(|err| DriverError::configuration("PoolBuildError", err.to_string()))?;
        Ok(Self {
            pool: Mutex::new(Some(pool)),
        })
    }

    /// Returns a clone of the live pool handle.
    fn live_pool(&self) -> Result<Pool<M>, DriverError> {
        let guard = self
            .pool
            .lock()
            .map_err(|_| DriverError::connection("PoolPoisoned", "pool mutex poisoned"))?;
        guard.clone().ok_or_else(|| DriverError::connection("PoolClosed", "pool is closed"))
    }
}

impl<M> LowLevelPool for R2d2Pool<M>
where
    M: ManageConnection,
    M::Connection: LowLevelConnection,
{
    fn get(&self) -> Result<Box<dyn LowLevelConnection>, DriverError> {
        let pool = self.live_pool()?;
        let connection =
            pool.get().map_err(|err| DriverError::connection("PoolTimeout", err.to_string()))?;
        Ok(Box::new(connection))
    }

    fn status(&self) -> PoolStatus {
        let Ok(pool) = self.live_pool() else {
            return PoolStatus::default();
        };
        let state = pool.state();
        PoolStatus {
            max_size: pool.max_size(),
            active: state.connections.saturating_sub(state.idle_connections),
            idle: state.idle_connections,
        }
    }

    fn close(&self) -> Result<(), DriverError> {
        let taken = {
            let mut guard = self
                .pool
                .lock()
                .map_err(|_| DriverError::connection("PoolPoisoned", "pool mutex poisoned"))?;
            guard.take()
        };
        // Idle connections close here; checked-out ones close when returned.
        drop(taken);
        Ok(())
    }
}

impl<M> LowLevelConnection for PooledConnection<M>
where
    M: ManageConnection,
    M::Connection: LowLevelConnection,
{
    fn is_valid(&mut self) -> bool {
        LowLevelConnection::is_valid(&mut **self)
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DriverError> {
        LowLevelConnection::execute(&mut **self, sql, params)
    }

    fn execute_many(&mut self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<Vec<u64>, DriverError> {
        LowLevelConnection::execute_many(&mut **self, sql, rows)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<RowSet, DriverError> {
        LowLevelConnection::query(&mut **self, sql, params)
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        LowLevelConnection::begin(&mut **self)
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        LowLevelConnection::commit(&mut **self)
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        LowLevelConnection::rollback(&mut **self)
    }

    fn in_transaction(&self) -> bool {
        LowLevelConnection::in_transaction(&**self)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionTarget;
    use super::RowSet;
    use super::SqlValue;

    #[test]
    fn masked_url_hides_password() {
        let target = ConnectionTarget {
            destination: "sensors".to_string(),
            url: "mysql://db:3306/sensors".to_string(),
            username: "cygnus".to_string(),
            password: "secret".to_string(),
        };
        let masked = target.masked_url();
        assert_eq!(masked, "mysql://db:3306/sensors?user=cygnus&password=XXXXXXXXXX");
        assert!(!format!("{target:?}").contains("secret"));
    }

    #[test]
    fn masked_url_appends_to_existing_options() {
        let target = ConnectionTarget {
            destination: String::new(),
            url: "postgresql://db:5432/postgres?sslmode=disable".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        };
        assert!(target.masked_url().contains("sslmode=disable&user=u"));
    }

    #[test]
    fn row_set_column_lookup_falls_back_to_case_insensitive() {
        let mut rows = RowSet::new(vec!["recvtime".to_string()]);
        rows.push_row(vec![SqlValue::from("2024-01-01 00:00:00")]);
        assert_eq!(rows.column_index("recvTime"), Some(0));
        assert_eq!(rows.value(0, "recvTime"), Some(&SqlValue::from("2024-01-01 00:00:00")));
        assert_eq!(rows.value(1, "recvTime"), None);
    }
}
