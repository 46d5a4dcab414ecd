// crates/context-sql-backend/src/error.rs
// ============================================================================
// Module: Backend Errors
// Description: Typed error kinds surfaced by the SQL backend facade.
// Purpose: Wrap every low-level failure into exactly one caller-visible kind.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! Low-level driver failures arrive as [`DriverError`] values and are wrapped
//! into one [`BackendError`] kind before crossing the facade boundary. Only
//! [`BackendError::Persistence`] and [`BackendError::BadContextData`] are
//! eligible for error-table persistence; connection-layer failures are not.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

// ============================================================================
// SECTION: Driver Errors
// ============================================================================

/// Coarse classification of a wire-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Driver or pool could not be constructed from the given settings.
    Configuration,
    /// A connection could not be obtained or was lost.
    Connection,
    /// A statement exceeded its time budget.
    Timeout,
    /// The server rejected a statement.
    Statement,
}

/// Failure reported by a [`crate::driver::SqlDriver`] or one of its handles.
///
/// # Invariants
/// - `class` names the underlying failure class (e.g. `SqliteFailure`).
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct DriverError {
    /// Failure classification.
    pub kind: DriverErrorKind,
    /// Name of the underlying failure class.
    pub class: String,
    /// Low-level message.
    pub message: String,
}

impl DriverError {
    /// Builds a driver error of the given kind.
    #[must_use]
    pub fn new(kind: DriverErrorKind, class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            class: class.into(),
            message: message.into(),
        }
    }

    /// Builds a [`DriverErrorKind::Statement`] error.
    #[must_use]
    pub fn statement(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Statement, class, message)
    }

    /// Builds a [`DriverErrorKind::Connection`] error.
    #[must_use]
    pub fn connection(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connection, class, message)
    }

    /// Builds a [`DriverErrorKind::Configuration`] error.
    #[must_use]
    pub fn configuration(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Configuration, class, message)
    }

    /// Builds a [`DriverErrorKind::Timeout`] error.
    #[must_use]
    pub fn timeout(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Timeout, class, message)
    }
}

// ============================================================================
// SECTION: Backend Errors
// ============================================================================

/// Caller-visible backend failure.
///
/// # Invariants
/// - Every variant carries the dialect name, a context phrase, the failure
///   class name and the low-level message.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Driver not resolvable, invalid settings or pool construction failure.
    #[error("{dialect} {context} ({class}): {message}")]
    Configuration {
        /// Dialect name (upper case).
        dialect: String,
        /// Operation phrase.
        context: String,
        /// Underlying failure class.
        class: String,
        /// Low-level message.
        message: String,
    },
    /// Connection acquisition failed (pool exhausted, network failure).
    #[error("{dialect} {context} ({class}): {message}")]
    Connectivity {
        /// Dialect name (upper case).
        dialect: String,
        /// Operation phrase.
        context: String,
        /// Underlying failure class.
        class: String,
        /// Low-level message.
        message: String,
    },
    /// Statement timeout or operational failure of DDL/select/delete paths.
    #[error("{dialect} {context} ({class}): {message}")]
    Persistence {
        /// Dialect name (upper case).
        dialect: String,
        /// Operation phrase.
        context: String,
        /// Underlying failure class.
        class: String,
        /// Low-level message.
        message: String,
    },
    /// Statement rejected because of malformed or incompatible data.
    #[error("{dialect} {context} ({class}): {message}")]
    BadContextData {
        /// Dialect name (upper case).
        dialect: String,
        /// Operation phrase.
        context: String,
        /// Underlying failure class.
        class: String,
        /// Low-level message.
        message: String,
    },
}

/// Kind selector used when wrapping a statement-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatementKind {
    /// DDL, select, delete and purge statements.
    Operational,
    /// Insert and upsert statements carrying caller data.
    Data,
}

impl BackendError {
    /// Builds a [`BackendError::Configuration`].
    #[must_use]
    pub fn configuration(
        dialect: &str,
        context: &str,
        class: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            dialect: dialect.to_ascii_uppercase(),
            context: context.to_string(),
            class: class.into(),
            message: message.into(),
        }
    }

    /// Builds a [`BackendError::BadContextData`].
    #[must_use]
    pub fn bad_context_data(
        dialect: &str,
        context: &str,
        class: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::BadContextData {
            dialect: dialect.to_ascii_uppercase(),
            context: context.to_string(),
            class: class.into(),
            message: message.into(),
        }
    }

    /// Wraps a driver failure raised while obtaining a connection.
    #[must_use]
    pub fn from_acquire(dialect: &str, context: &str, error: DriverError) -> Self {
        let dialect = dialect.to_ascii_uppercase();
        let context = context.to_string();
        let DriverError {
            kind,
            class,
            message,
        } = error;
        match kind {
            DriverErrorKind::Configuration => Self::Configuration {
                dialect,
                context,
                class,
                message,
            },
            DriverErrorKind::Connection | DriverErrorKind::Timeout | DriverErrorKind::Statement => {
                Self::Connectivity {
                    dialect,
                    context,
                    class,
                    message,
                }
            }
        }
    }

    /// Wraps a driver failure raised while executing a statement.
    #[must_use]
    pub(crate) fn from_statement(
        dialect: &str,
        context: &str,
        statement: StatementKind,
        error: DriverError,
    ) -> Self {
        let dialect = dialect.to_ascii_uppercase();
        let context = context.to_string();
        let DriverError {
            kind,
            class,
            message,
        } = error;
        match (kind, statement) {
            (DriverErrorKind::Configuration, _) => Self::Configuration {
                dialect,
                context,
                class,
                message,
            },
            (DriverErrorKind::Connection, _) => Self::Connectivity {
                dialect,
                context,
                class,
                message,
            },
            (DriverErrorKind::Timeout, _)
            | (DriverErrorKind::Statement, StatementKind::Operational) => Self::Persistence {
                dialect,
                context,
                class,
                message,
            },
            (DriverErrorKind::Statement, StatementKind::Data) => Self::BadContextData {
                dialect,
                context,
                class,
                message,
            },
        }
    }

    /// Returns true when the failure may be recorded in the error table.
    #[must_use]
    pub const fn is_persistable(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::BadContextData { .. })
    }

    /// Returns true for [`BackendError::BadContextData`].
    #[must_use]
    pub const fn is_bad_context_data(&self) -> bool {
        matches!(self, Self::BadContextData { .. })
    }

    /// Returns the low-level message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Configuration { message, .. }
            | Self::Connectivity { message, .. }
            | Self::Persistence { message, .. }
            | Self::BadContextData { message, .. } => message,
        }
    }

    /// Returns the underlying failure class name.
    #[must_use]
    pub fn class(&self) -> &str {
        match self {
            Self::Configuration { class, .. }
            | Self::Connectivity { class, .. }
            | Self::Persistence { class, .. }
            | Self::BadContextData { class, .. } => class,
        }
    }

    /// Returns the dialect name recorded on the error.
    #[must_use]
    pub fn dialect(&self) -> &str {
        match self {
            Self::Configuration { dialect, .. }
            | Self::Connectivity { dialect, .. }
            | Self::Persistence { dialect, .. }
            | Self::BadContextData { dialect, .. } => dialect,
        }
    }
}

/// Statement failure paired with the offending query text.
///
/// The facade uses the query text when recording the failure in the
/// destination's error table.
#[derive(Debug, Clone)]
pub(crate) struct StatementFailure {
    /// Wrapped failure.
    pub error: BackendError,
    /// Query text, empty when no statement was issued.
    pub query: String,
    /// False keeps the failure out of the error table.
    pub record: bool,
}

impl StatementFailure {
    /// Pairs a failure with its query text.
    pub(crate) fn new(error: BackendError, query: impl Into<String>) -> Self {
        Self {
            error,
            query: query.into(),
            record: true,
        }
    }

    /// Wraps a failure that must not be recorded in the error table.
    pub(crate) fn unrecorded(error: BackendError, query: impl Into<String>) -> Self {
        Self {
            error,
            query: query.into(),
            record: false,
        }
    }
}

impl From<BackendError> for StatementFailure {
    fn from(error: BackendError) -> Self {
        Self::new(error, String::new())
    }
}
