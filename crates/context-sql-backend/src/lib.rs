// crates/context-sql-backend/src/lib.rs
// ============================================================================
// Module: Context SQL Backend
// Description: Pooled, dialect-aware relational storage for context data.
// Purpose: Turn logical write and retention operations into executed SQL.
// Dependencies: r2d2, rusqlite, serde, thiserror, time, toml, tracing
// ============================================================================

//! ## Overview
//! This crate is the relational-storage backend of a context-data ingestion
//! pipeline. [`SqlBackend`] ensures destinations and tables exist, inserts
//! rows, performs the atomic history + latest-value dual write, caps and
//! expires historical rows, and records failed statements into a bounded
//! per-destination error table.
//!
//! Connections come from one bounded pool per destination. The wire client
//! sits behind [`SqlDriver`]; a bundled `SQLite` driver is always available
//! and a `PostgreSQL` driver is enabled with the `postgres` feature.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod backend;
pub mod cache;
pub mod config;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod error_log;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod query;
pub mod retention;
pub mod sqlite;
pub mod timestamp;
pub mod writer;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use backend::SqlBackend;
pub use cache::SchemaObjectCache;
pub use config::BackendConfig;
pub use config::ConfigError;
pub use config::SqliteJournalMode;
pub use config::SqliteSettings;
pub use config::SqliteSyncMode;
pub use dialect::DialectAdapter;
pub use dialect::dialect_for;
pub use driver::ConnectionTarget;
pub use driver::LowLevelConnection;
pub use driver::LowLevelPool;
pub use driver::PoolSettings;
pub use driver::PoolStatus;
pub use driver::R2d2Pool;
pub use driver::RowSet;
pub use driver::SqlDriver;
pub use driver::SqlValue;
pub use driver::driver_for;
pub use error::BackendError;
pub use error::DriverError;
pub use error::DriverErrorKind;
#[cfg(feature = "postgres")]
pub use crate::postgres::PostgresDriver;
pub use query::ColumnBatch;
pub use query::ValueEncoding;
pub use sqlite::SqliteDriver;
pub use writer::UpsertRequest;
