// crates/context-sql-backend/src/timestamp.rs
// ============================================================================
// Module: Timestamps
// Description: Parsing and rendering of stored record timestamps.
// Purpose: Read timestamp columns back into comparable instants.
// Dependencies: time, thiserror
// ============================================================================

//! ## Overview
//! Timestamp columns come back from drivers as native instants, text, or
//! integer epoch milliseconds depending on the dialect. This module turns
//! each of those into an [`OffsetDateTime`]. Text without an offset is read
//! as UTC.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;
use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::UtcOffset;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

use crate::driver::SqlValue;

// ============================================================================
// SECTION: Formats
// ============================================================================

/// Canonical storage rendering (UTC, millisecond precision).
const STORAGE_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");

/// Offset-free layouts accepted on read, tried in order.
const NAIVE_FORMATS: [&[BorrowedFormatItem<'static>]; 4] = [
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Value that cannot be read as a timestamp.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unparseable timestamp '{value}'")]
pub struct TimestampParseError {
    /// Offending value rendered as text.
    pub value: String,
}

// ============================================================================
// SECTION: Operations
// ============================================================================

/// Renders an instant in the storage layout, converted to UTC.
#[must_use]
pub fn format_timestamp(value: OffsetDateTime) -> String {
    let utc = value.to_offset(UtcOffset::UTC);
    utc.format(STORAGE_FORMAT).unwrap_or_else(|_| utc.to_string())
}

/// Parses timestamp text.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (space or `T` separator,
/// read as UTC) and integer epoch milliseconds.
///
/// # Errors
///
/// Returns [`TimestampParseError`] when no layout matches.
pub fn parse_timestamp(text: &str) -> Result<OffsetDateTime, TimestampParseError> {
    let trimmed = text.trim();
    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(parsed);
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = PrimitiveDateTime::parse(trimmed, format) {
            return Ok(parsed.assume_utc());
        }
    }
    if let Ok(millis) = trimmed.parse::<i64>() {
        return from_epoch_millis(millis).ok_or_else(|| TimestampParseError {
            value: text.to_string(),
        });
    }
    Err(TimestampParseError {
        value: text.to_string(),
    })
}

/// Reads a fetched column value as an instant.
///
/// # Errors
///
/// Returns [`TimestampParseError`] for `NULL`, booleans, reals and text that
/// matches no accepted layout.
pub fn timestamp_from_value(value: &SqlValue) -> Result<OffsetDateTime, TimestampParseError> {
    match value {
        SqlValue::Timestamp(instant) => Ok(*instant),
        SqlValue::Integer(millis) => from_epoch_millis(*millis).ok_or_else(|| TimestampParseError {
            value: millis.to_string(),
        }),
        SqlValue::Text(text) => parse_timestamp(text),
        SqlValue::Null | SqlValue::Bool(_) | SqlValue::Real(_) => Err(TimestampParseError {
            value: value.to_text().unwrap_or_else(|| "NULL".to_string()),
        }),
    }
}

/// Converts epoch milliseconds, `None` when out of range.
fn from_epoch_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}
