// crates/context-sql-backend/src/postgres.rs
// ============================================================================
// Module: Postgres Driver
// Description: postgres wire client with r2d2 pooling.
// Purpose: Serve schema-addressed destinations on PostgreSQL servers.
// Dependencies: postgres, postgres-types, r2d2_postgres, bytes, time
// ============================================================================

//! ## Overview
//! [`PostgresDriver`] parses the dialect URL into a `postgres::Config`, adds
//! credentials and the acquire timeout as connect timeout, and pools clients
//! through `r2d2_postgres`. Statement text uses `?` placeholders, rewritten
//! to `$n` before execution. Parameters bind according to the type the
//! server infers, so text values can land in timestamp or integer columns.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::error::Error;
use std::sync::Arc;

use bytes::BytesMut;
use postgres::Client;
use postgres::NoTls;
use postgres::Row;
use postgres::error::SqlState;
use postgres_types::IsNull;
use postgres_types::ToSql;
use postgres_types::Type;
use postgres_types::to_sql_checked;
use r2d2::ManageConnection;
use r2d2_postgres::PostgresConnectionManager;
use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::UtcOffset;

use crate::driver::ConnectionTarget;
use crate::driver::LowLevelConnection;
use crate::driver::LowLevelPool;
use crate::driver::PoolSettings;
use crate::driver::R2d2Pool;
use crate::driver::RowSet;
use crate::driver::SqlDriver;
use crate::driver::SqlValue;
use crate::error::DriverError;
use crate::timestamp::timestamp_from_value;

// ============================================================================
// SECTION: Driver
// ============================================================================

/// `PostgreSQL` driver built on the synchronous `postgres` client.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    /// Creates the driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SqlDriver for PostgresDriver {
    fn name(&self) -> &str {
        "postgres"
    }

    fn create_pool(
        &self,
        target: &ConnectionTarget,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn LowLevelPool>, DriverError> {
        let mut pg_config = target
            .url
            .parse::<postgres::Config>()
            .map_err(|err| DriverError::configuration("InvalidUrl", err.to_string()))?;
        if !target.username.is_empty() {
            pg_config.user(&target.username);
        }
        if !target.password.is_empty() {
            pg_config.password(&target.password);
        }
        pg_config.connect_timeout(settings.acquire_timeout);
        let manager = PgConnectionManager {
            inner: PostgresConnectionManager::new(pg_config, NoTls),
        };
        Ok(Arc::new(R2d2Pool::build(manager, settings)?))
    }
}

// ============================================================================
// SECTION: Connection Manager
// ============================================================================

/// `r2d2` manager wrapping clients with transaction tracking.
struct PgConnectionManager {
    /// Upstream manager producing raw clients.
    inner: PostgresConnectionManager<NoTls>,
}

impl ManageConnection for PgConnectionManager {
    type Connection = PgConnection;
    type Error = DriverError;

    fn connect(&self) -> Result<PgConnection, DriverError> {
        let client = self
            .inner
            .connect()
            .map_err(|err| DriverError::connection("PostgresConnectError", err.to_string()))?;
        Ok(PgConnection {
            client,
            in_transaction: false,
        })
    }

    fn is_valid(&self, conn: &mut PgConnection) -> Result<(), DriverError> {
        self.inner.is_valid(&mut conn.client).map_err(map_postgres_error)
    }

    fn has_broken(&self, conn: &mut PgConnection) -> bool {
        if conn.in_transaction && conn.rollback().is_err() {
            return true;
        }
        self.inner.has_broken(&mut conn.client)
    }
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// One pooled `PostgreSQL` client.
pub struct PgConnection {
    /// Underlying client.
    client: Client,
    /// True between `begin` and `commit`/`rollback`.
    in_transaction: bool,
}

impl LowLevelConnection for PgConnection {
    fn is_valid(&mut self) -> bool {
        !self.client.is_closed() && self.client.simple_query("SELECT 1").is_ok()
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DriverError> {
        let sql = rewrite_placeholders(sql);
        self.client.execute(sql.as_str(), &param_refs(params)).map_err(map_postgres_error)
    }

    fn execute_many(&mut self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<Vec<u64>, DriverError> {
        let sql = rewrite_placeholders(sql);
        let statement = self.client.prepare(&sql).map_err(map_postgres_error)?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            counts.push(
                self.client.execute(&statement, &param_refs(row)).map_err(map_postgres_error)?,
            );
        }
        Ok(counts)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<RowSet, DriverError> {
        let sql = rewrite_placeholders(sql);
        let statement = self.client.prepare(&sql).map_err(map_postgres_error)?;
        let columns = statement.columns().iter().map(|column| column.name().to_string()).collect();
        let rows = self.client.query(&statement, &param_refs(params)).map_err(map_postgres_error)?;
        let mut snapshot = RowSet::new(columns);
        for row in &rows {
            snapshot.push_row(read_row(row)?);
        }
        Ok(snapshot)
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        self.client.batch_execute("BEGIN").map_err(map_postgres_error)?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.in_transaction = false;
        self.client.batch_execute("COMMIT").map_err(map_postgres_error)
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.in_transaction = false;
        self.client.batch_execute("ROLLBACK").map_err(map_postgres_error)
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

/// Borrows parameters in the form the client expects.
fn param_refs(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|value| value as &(dyn ToSql + Sync)).collect()
}

/// Rewrites `?` placeholders to `$1..$n`, leaving quoted text untouched.
fn rewrite_placeholders(sql: &str) -> String {
    let mut rewritten = String::with_capacity(sql.len() + 8);
    let mut quote: Option<char> = None;
    let mut index = 0usize;
    for ch in sql.chars() {
        match (quote, ch) {
            (None, '\'' | '"') => {
                quote = Some(ch);
                rewritten.push(ch);
            }
            (Some(open), _) if open == ch => {
                quote = None;
                rewritten.push(ch);
            }
            (None, '?') => {
                index += 1;
                rewritten.push('$');
                rewritten.push_str(&index.to_string());
            }
            _ => rewritten.push(ch),
        }
    }
    rewritten
}

/// Maps a client failure onto a driver error kind.
fn map_postgres_error(err: postgres::Error) -> DriverError {
    if err.is_closed() {
        return DriverError::connection("PostgresConnectionClosed", err.to_string());
    }
    match err.code() {
        Some(code) if *code == SqlState::QUERY_CANCELED => {
            DriverError::timeout("PostgresTimeout", err.to_string())
        }
        Some(code) => DriverError::statement(format!("SqlState{}", code.code()), err.to_string()),
        None => DriverError::statement("PostgresError", err.to_string()),
    }
}

// ============================================================================
// SECTION: Value Conversion
// ============================================================================

/// Reads every column of a row by its declared type.
fn read_row(row: &Row) -> Result<Vec<SqlValue>, DriverError> {
    let mut values = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => row.try_get::<_, Option<bool>>(index).map(|v| v.map(SqlValue::Bool)),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(index)
                .map(|v| v.map(|number| SqlValue::Integer(i64::from(number)))),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(index)
                .map(|v| v.map(|number| SqlValue::Integer(i64::from(number)))),
            Type::INT8 => row.try_get::<_, Option<i64>>(index).map(|v| v.map(SqlValue::Integer)),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(index)
                .map(|v| v.map(|number| SqlValue::Real(f64::from(number)))),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(index).map(|v| v.map(SqlValue::Real)),
            Type::TIMESTAMP => row
                .try_get::<_, Option<PrimitiveDateTime>>(index)
                .map(|v| v.map(|instant| SqlValue::Timestamp(instant.assume_utc()))),
            Type::TIMESTAMPTZ => {
                row.try_get::<_, Option<OffsetDateTime>>(index).map(|v| v.map(SqlValue::Timestamp))
            }
            _ => row.try_get::<_, Option<String>>(index).map(|v| v.map(SqlValue::Text)),
        }
        .map_err(|err| DriverError::statement("UnsupportedColumnType", err.to_string()))?;
        values.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(values)
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        if self.is_null() {
            return Ok(IsNull::Yes);
        }
        let text = self.to_text().unwrap_or_default();
        match *ty {
            Type::BOOL => match self {
                Self::Bool(flag) => flag.to_sql(ty, out),
                _ => text.parse::<bool>()?.to_sql(ty, out),
            },
            Type::INT2 => text.parse::<i16>()?.to_sql(ty, out),
            Type::INT4 => text.parse::<i32>()?.to_sql(ty, out),
            Type::INT8 => match self {
                Self::Integer(number) => number.to_sql(ty, out),
                _ => text.parse::<i64>()?.to_sql(ty, out),
            },
            Type::FLOAT4 => text.parse::<f32>()?.to_sql(ty, out),
            Type::FLOAT8 => match self {
                Self::Real(number) => number.to_sql(ty, out),
                _ => text.parse::<f64>()?.to_sql(ty, out),
            },
            Type::TIMESTAMP => {
                let utc = timestamp_from_value(self)?.to_offset(UtcOffset::UTC);
                PrimitiveDateTime::new(utc.date(), utc.time()).to_sql(ty, out)
            }
            Type::TIMESTAMPTZ => timestamp_from_value(self)?.to_sql(ty, out),
            _ => text.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
