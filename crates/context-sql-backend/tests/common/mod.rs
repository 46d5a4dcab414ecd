// crates/context-sql-backend/tests/common/mod.rs
// ============================================================================
// Module: Common Test Utilities
// Description: Shared helpers for context-sql-backend integration tests.
// Purpose: Provide a recording fake driver and SQLite backend builders.
// Dependencies: context-sql-backend, serde_json, tempfile
// ============================================================================

//! ## Overview
//! The recording driver captures every statement per destination and lets
//! tests inject pool construction failures, exhausted pools, invalid
//! connections and statement failures. The `SQLite` helpers build backends
//! over a throwaway directory.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    dead_code,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use context_sql_backend::BackendConfig;
use context_sql_backend::ColumnBatch;
use context_sql_backend::ConnectionTarget;
use context_sql_backend::DriverError;
use context_sql_backend::LowLevelConnection;
use context_sql_backend::LowLevelPool;
use context_sql_backend::PoolSettings;
use context_sql_backend::PoolStatus;
use context_sql_backend::RowSet;
use context_sql_backend::SqlBackend;
use context_sql_backend::SqlDriver;
use context_sql_backend::SqlValue;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// SECTION: Recording Driver
// ============================================================================

/// Statement failure injected for statements containing `needle`.
#[derive(Clone)]
pub struct FailRule {
    /// Substring matched against statement text.
    pub needle: String,
    /// Error returned on match.
    pub error: DriverError,
    /// Remaining matches before the rule expires.
    pub remaining: usize,
}

/// Shared state observed and steered by tests.
#[derive(Default)]
pub struct FakeState {
    /// Executed statements as `(destination, sql)`.
    pub statements: Mutex<Vec<(String, String)>>,
    /// Destinations whose pool was created, in creation order.
    pub pools_created: Mutex<Vec<String>>,
    /// Destinations whose pool was closed.
    pub pools_closed: Mutex<Vec<String>>,
    /// Destination whose pool fails to close.
    pub fail_close_for: Mutex<Option<String>>,
    /// Number of upcoming checkouts that hand out invalid connections.
    pub invalid_checkouts: AtomicUsize,
    /// When set, checkouts fail as if the pool were exhausted.
    pub exhausted: AtomicBool,
    /// When set, pool construction fails.
    pub fail_create_pool: AtomicBool,
    /// Injected statement failures.
    pub fail_rules: Mutex<Vec<FailRule>>,
}

impl FakeState {
    /// Returns the recorded statements.
    pub fn statements(&self) -> Vec<(String, String)> {
        self.statements.lock().unwrap().clone()
    }

    /// Returns recorded statements containing `needle`.
    pub fn statements_containing(&self, needle: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|(_, sql)| sql.contains(needle))
            .map(|(_, sql)| sql)
            .collect()
    }

    /// Forgets recorded statements.
    pub fn clear_statements(&self) {
        self.statements.lock().unwrap().clear();
    }

    /// Registers a statement failure.
    pub fn fail_on(&self, needle: &str, error: DriverError, times: usize) {
        self.fail_rules.lock().unwrap().push(FailRule {
            needle: needle.to_string(),
            error,
            remaining: times,
        });
    }

    /// Returns the injected failure for `sql`, consuming one match.
    fn take_failure(&self, sql: &str) -> Option<DriverError> {
        let mut rules = self.fail_rules.lock().unwrap();
        let rule = rules.iter_mut().find(|rule| rule.remaining > 0 && sql.contains(&rule.needle))?;
        rule.remaining -= 1;
        Some(rule.error.clone())
    }
}

/// Driver recording every statement into [`FakeState`].
pub struct RecordingDriver {
    /// Shared state.
    pub state: Arc<FakeState>,
}

impl SqlDriver for RecordingDriver {
    fn name(&self) -> &str {
        "recording"
    }

    fn create_pool(
        &self,
        target: &ConnectionTarget,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn LowLevelPool>, DriverError> {
        if self.state.fail_create_pool.load(Ordering::SeqCst) {
            return Err(DriverError::configuration("DriverNotFound", "no such driver"));
        }
        self.state.pools_created.lock().unwrap().push(target.destination.clone());
        Ok(Arc::new(RecordingPool {
            destination: target.destination.clone(),
            max_size: settings.max_size,
            state: Arc::clone(&self.state),
            active: Arc::new(AtomicUsize::new(0)),
        }))
    }
}

/// Unbounded pool handing out recording connections.
struct RecordingPool {
    /// Destination key.
    destination: String,
    /// Reported capacity.
    max_size: u32,
    /// Shared state.
    state: Arc<FakeState>,
    /// Checked-out connection count.
    active: Arc<AtomicUsize>,
}

impl LowLevelPool for RecordingPool {
    fn get(&self) -> Result<Box<dyn LowLevelConnection>, DriverError> {
        if self.state.exhausted.load(Ordering::SeqCst) {
            return Err(DriverError::connection("PoolTimeout", "timed out waiting for connection"));
        }
        let valid = self
            .state
            .invalid_checkouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err();
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingConnection {
            destination: self.destination.clone(),
            state: Arc::clone(&self.state),
            active: Arc::clone(&self.active),
            valid,
            in_transaction: false,
        }))
    }

    fn status(&self) -> PoolStatus {
        let active = u32::try_from(self.active.load(Ordering::SeqCst)).unwrap();
        PoolStatus {
            max_size: self.max_size,
            active,
            idle: 0,
        }
    }

    fn close(&self) -> Result<(), DriverError> {
        self.state.pools_closed.lock().unwrap().push(self.destination.clone());
        let fail = self.state.fail_close_for.lock().unwrap().as_deref() == Some(&self.destination);
        if fail {
            return Err(DriverError::connection("PoolCloseError", "stuck pool"));
        }
        Ok(())
    }
}

/// Connection recording statements instead of executing them.
struct RecordingConnection {
    /// Destination key.
    destination: String,
    /// Shared state.
    state: Arc<FakeState>,
    /// Owning pool's checkout counter.
    active: Arc<AtomicUsize>,
    /// Reported validity.
    valid: bool,
    /// Transaction flag.
    in_transaction: bool,
}

impl RecordingConnection {
    /// Records `sql` and applies injected failures.
    fn record(&self, sql: &str) -> Result<(), DriverError> {
        self.state.statements.lock().unwrap().push((self.destination.clone(), sql.to_string()));
        self.state.take_failure(sql).map_or(Ok(()), Err)
    }
}

impl Drop for RecordingConnection {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LowLevelConnection for RecordingConnection {
    fn is_valid(&mut self) -> bool {
        self.valid
    }

    fn execute(&mut self, sql: &str, _params: &[SqlValue]) -> Result<u64, DriverError> {
        self.record(sql)?;
        Ok(1)
    }

    fn query(&mut self, sql: &str, _params: &[SqlValue]) -> Result<RowSet, DriverError> {
        self.record(sql)?;
        Ok(RowSet::new(vec!["recvTime".to_string()]))
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        self.record("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.record("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.in_transaction = false;
        self.record("ROLLBACK")
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

/// Builds a backend over the recording driver.
pub fn recording_backend(instance: &str, persist_errors: bool) -> (SqlBackend, Arc<FakeState>) {
    let state = Arc::new(FakeState::default());
    let mut config = BackendConfig::new("db.local", instance, "recording");
    config.persist_errors = persist_errors;
    let driver = Arc::new(RecordingDriver {
        state: Arc::clone(&state),
    });
    let backend = SqlBackend::with_driver(config, driver).unwrap();
    (backend, state)
}

// ============================================================================
// SECTION: SQLite Helpers
// ============================================================================

/// Builds a `SQLite` configuration rooted at `dir`.
pub fn sqlite_config(dir: &TempDir) -> BackendConfig {
    let mut config = BackendConfig::new(dir.path().to_string_lossy(), "sqlite", "sqlite");
    config.acquire_timeout_ms = 2_000;
    config
}

/// Builds a `SQLite` backend rooted at `dir`.
pub fn sqlite_backend(dir: &TempDir) -> SqlBackend {
    SqlBackend::new(sqlite_config(dir)).unwrap()
}

/// Opens a destination file directly for assertions.
pub fn open_destination(dir: &TempDir, destination: &str) -> rusqlite::Connection {
    rusqlite::Connection::open(dir.path().join(format!("{destination}.db"))).unwrap()
}

/// Counts rows of `table` in `destination`.
pub fn count_rows(dir: &TempDir, destination: &str, table: &str) -> i64 {
    open_destination(dir, destination)
        .query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))
        .unwrap()
}

/// Reads one text column of `table` ordered by it.
pub fn column_values(dir: &TempDir, destination: &str, table: &str, column: &str) -> Vec<String> {
    let connection = open_destination(dir, destination);
    let mut statement = connection
        .prepare(&format!("SELECT \"{column}\" FROM \"{table}\" ORDER BY \"{column}\" ASC"))
        .unwrap();
    statement.query_map([], |row| row.get::<_, String>(0)).unwrap().map(Result::unwrap).collect()
}

/// Builds a single-column string batch.
pub fn text_column(values: &[&str]) -> Vec<Value> {
    values.iter().map(|value| json!(value)).collect()
}

/// Builds a `(entityId, recvTime, temperature)` batch.
pub fn reading_batch(rows: &[(&str, &str, f64)]) -> ColumnBatch {
    ColumnBatch::new()
        .with_column("entityId", rows.iter().map(|(id, _, _)| json!(id)).collect())
        .with_column("recvTime", rows.iter().map(|(_, at, _)| json!(at)).collect())
        .with_column("temperature", rows.iter().map(|(_, _, value)| json!(value)).collect())
}
