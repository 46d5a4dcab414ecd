// crates/context-sql-backend/tests/proptest_backend.rs
// ============================================================================
// Module: Backend Property-Based Tests
// Description: Property tests for caching, quoting, timestamps and capping.
// Purpose: Check invariants across wide input ranges.
// ============================================================================

//! Property-based tests for schema cache and retention invariants.

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
    reason = "Test-only assertions and helpers are permitted."
)]

mod common;

use std::collections::BTreeSet;

use context_sql_backend::SchemaObjectCache;
use context_sql_backend::ValueEncoding;
use context_sql_backend::dialect_for;
use context_sql_backend::timestamp::format_timestamp;
use context_sql_backend::timestamp::parse_timestamp;
use proptest::prelude::*;
use tempfile::TempDir;
use time::OffsetDateTime;

use crate::common::column_values;
use crate::common::count_rows;
use crate::common::reading_batch;
use crate::common::sqlite_backend;

/// Cache mutation applied to both the cache and the model.
#[derive(Debug, Clone)]
enum CacheOp {
    Destination(String),
    Table(String, String),
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        "[a-c]".prop_map(CacheOp::Destination),
        ("[a-c]", "[x-z]{1,2}").prop_map(|(destination, table)| CacheOp::Table(destination, table)),
    ]
}

/// Un-doubles embedded quotes of a quoted identifier.
fn unquote(quoted: &str, quote: char) -> Option<String> {
    let inner = quoted.strip_prefix(quote)?.strip_suffix(quote)?;
    Some(inner.replace(&format!("{quote}{quote}"), &quote.to_string()))
}

proptest! {
    #[test]
    fn cache_agrees_with_set_model(ops in prop::collection::vec(cache_op_strategy(), 0 .. 32)) {
        let cache = SchemaObjectCache::new();
        let mut destinations = BTreeSet::new();
        let mut tables = BTreeSet::new();
        for op in ops {
            match op {
                CacheOp::Destination(destination) => {
                    cache.add_destination(&destination);
                    destinations.insert(destination);
                }
                CacheOp::Table(destination, table) => {
                    cache.add_table(&destination, &table);
                    destinations.insert(destination.clone());
                    tables.insert((destination, table));
                }
            }
        }
        for destination in ["a", "b", "c"] {
            prop_assert_eq!(cache.has_destination(destination), destinations.contains(destination));
        }
        let snapshot: BTreeSet<(String, String)> = cache.snapshot().into_iter().collect();
        prop_assert_eq!(&snapshot, &tables);
        for (destination, table) in &tables {
            prop_assert!(cache.has_table(destination, table));
        }
        cache.reset();
        prop_assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn quoted_identifiers_round_trip(identifier in "\\PC{1,16}") {
        let mysql = dialect_for("mysql");
        let ansi = dialect_for("postgresql");
        prop_assert_eq!(unquote(&mysql.quote_identifier(&identifier), '`'), Some(identifier.clone()));
        prop_assert_eq!(unquote(&ansi.quote_identifier(&identifier), '"'), Some(identifier));
    }

    #[test]
    fn storage_timestamps_parse_back(millis in 0i64 .. 4_102_444_800_000) {
        let instant =
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).unwrap();
        prop_assert_eq!(parse_timestamp(&format_timestamp(instant)).unwrap(), instant);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn cap_deletes_exactly_the_excess(rows in 0usize .. 12, cap in 0usize .. 12) {
        let dir = TempDir::new().unwrap();
        let backend = sqlite_backend(&dir);
        backend.create_table("sensors", "temp", "(entityId TEXT, recvTime TEXT, temperature REAL)")
            .unwrap();
        let stamps: Vec<String> =
            (0 .. rows).map(|index| format!("2024-01-01 00:00:{index:02}")).collect();
        if rows > 0 {
            let readings: Vec<(&str, &str, f64)> =
                stamps.iter().map(|at| ("room1", at.as_str(), 1.0)).collect();
            backend
                .insert_context_data("sensors", "temp", &reading_batch(&readings), ValueEncoding::Native)
                .unwrap();
        }
        let deleted = backend.cap_records("sensors", "temp", cap).unwrap();
        let expected = rows.saturating_sub(cap);
        prop_assert_eq!(deleted, u64::try_from(expected).unwrap());
        prop_assert_eq!(count_rows(&dir, "sensors", "temp"), i64::try_from(rows - expected).unwrap());
        prop_assert_eq!(column_values(&dir, "sensors", "temp", "recvTime"), stamps[expected ..].to_vec());
    }
}
