// crates/context-sql-backend/src/cache.rs
// ============================================================================
// Module: Schema Object Cache
// Description: In-memory record of destinations and tables known to exist.
// Purpose: Short-circuit redundant DDL round-trips.
// Dependencies: std
// ============================================================================

//! ## Overview
//! The cache is optimistic: an entry means a create call succeeded earlier
//! in this process. Absence does not mean the object is missing, and entries
//! are never invalidated by external drops. [`SchemaObjectCache::reset`] is
//! the only way to forget entries.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::PoisonError;
use std::sync::RwLock;

// ============================================================================
// SECTION: Cache
// ============================================================================

/// Concurrent destination/table membership cache.
#[derive(Debug, Default)]
pub struct SchemaObjectCache {
    /// Known destinations mapped to their known tables.
    entries: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl SchemaObjectCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `destination` is known.
    #[must_use]
    pub fn has_destination(&self, destination: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(destination)
    }

    /// Records `destination` as existing.
    pub fn add_destination(&self, destination: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.entry(destination.to_string()).or_default();
    }

    /// Returns true when `table` is known inside `destination`.
    #[must_use]
    pub fn has_table(&self, destination: &str, table: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(destination).is_some_and(|tables| tables.contains(table))
    }

    /// Records `table` inside `destination`; the destination becomes known too.
    pub fn add_table(&self, destination: &str, table: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.entry(destination.to_string()).or_default().insert(table.to_string());
    }

    /// Returns the known destinations in name order.
    #[must_use]
    pub fn destinations(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.keys().cloned().collect()
    }

    /// Returns the known tables of `destination` in name order.
    #[must_use]
    pub fn tables(&self, destination: &str) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(destination)
            .map(|tables| tables.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns every known `(destination, table)` pair.
    ///
    /// The copy is taken under one read lock so sweeps iterate a stable view.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .flat_map(|(destination, tables)| {
                tables.iter().map(move |table| (destination.clone(), table.clone()))
            })
            .collect()
    }

    /// Forgets every entry.
    pub fn reset(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::SchemaObjectCache;

    #[test]
    fn add_table_implies_destination() {
        let cache = SchemaObjectCache::new();
        assert!(!cache.has_destination("sensors"));
        cache.add_table("sensors", "temp_readings");
        assert!(cache.has_destination("sensors"));
        assert!(cache.has_table("sensors", "temp_readings"));
        assert!(!cache.has_table("sensors", "humidity"));
        assert!(!cache.has_table("other", "temp_readings"));
    }

    #[test]
    fn snapshot_lists_pairs_in_order() {
        let cache = SchemaObjectCache::new();
        cache.add_table("b", "t2");
        cache.add_table("a", "t1");
        cache.add_table("b", "t1");
        cache.add_destination("c");
        assert_eq!(cache.destinations(), vec!["a", "b", "c"]);
        assert_eq!(cache.tables("b"), vec!["t1", "t2"]);
        assert!(cache.tables("c").is_empty());
        assert_eq!(
            cache.snapshot(),
            vec![
                ("a".to_string(), "t1".to_string()),
                ("b".to_string(), "t1".to_string()),
                ("b".to_string(), "t2".to_string()),
            ]
        );
    }

    #[test]
    fn reset_forgets_everything() {
        let cache = SchemaObjectCache::new();
        cache.add_table("sensors", "temp_readings");
        cache.reset();
        assert!(!cache.has_destination("sensors"));
        assert!(cache.snapshot().is_empty());
    }
}
