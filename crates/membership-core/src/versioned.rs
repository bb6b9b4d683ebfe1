//! Versioned key/value store for node headers.
//!
//! Each key carries its own version. The map also tracks the highest
//! version ever inserted, which feeds a node's effective version in
//! gossip digests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A value tagged with the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub version: u64,
    pub value: String,
}

impl VersionedValue {
    pub fn new(version: u64, value: impl Into<String>) -> Self {
        Self {
            version,
            value: value.into(),
        }
    }
}

/// Last-writer-wins map with a cached maximum version.
///
/// `max_version()` never decreases through `put`, even when a caller
/// overwrites a key with a lower version. Only `clear()` resets it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedMap {
    entries: HashMap<String, VersionedValue>,
    max_version: u64,
}

impl VersionedMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, bumping the key's version (0 for a new key).
    ///
    /// Returns the version the value was stored at.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> u64 {
        let key = key.into();
        let version = self
            .entries
            .get(&key)
            .map(|existing| existing.version + 1)
            .unwrap_or(0);
        self.put_versioned(key, version, value);
        version
    }

    /// Insert a value at an explicit version, returning the previous entry.
    pub fn put_versioned(
        &mut self,
        key: impl Into<String>,
        version: u64,
        value: impl Into<String>,
    ) -> Option<VersionedValue> {
        self.max_version = self.max_version.max(version);
        self.entries
            .insert(key.into(), VersionedValue::new(version, value))
    }

    /// Apply a remote entry only if it is newer than what is stored.
    ///
    /// Returns true when the entry replaced (or created) the key.
    pub fn merge(&mut self, key: &str, incoming: &VersionedValue) -> bool {
        let newer = match self.entries.get(key) {
            Some(existing) => incoming.version > existing.version,
            None => true,
        };
        if newer {
            self.put_versioned(key, incoming.version, incoming.value.clone());
        }
        newer
    }

    pub fn get(&self, key: &str) -> Option<&VersionedValue> {
        self.entries.get(key)
    }

    /// Get just the value for a key.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.value.as_str())
    }

    /// Drop a key. No tombstone is kept.
    pub fn remove(&mut self, key: &str) -> Option<VersionedValue> {
        self.entries.remove(key)
    }

    /// Drop every key and reset the maximum version.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.max_version = 0;
    }

    pub fn max_version(&self) -> u64 {
        self.max_version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VersionedValue)> {
        self.entries.iter()
    }

    /// Entries written after `version`.
    pub fn newer_than(&self, version: u64) -> impl Iterator<Item = (&String, &VersionedValue)> {
        self.entries.iter().filter(move |(_, v)| v.version > version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== put ====================

    #[test]
    fn test_put_new_key_starts_at_zero() {
        let mut map = VersionedMap::new();
        assert_eq!(map.put("role", "worker"), 0);
        assert_eq!(map.value("role"), Some("worker"));
        assert_eq!(map.max_version(), 0);
    }

    #[test]
    fn test_put_existing_key_bumps_version() {
        let mut map = VersionedMap::new();
        map.put("role", "worker");
        map.put("role", "leader");
        let v = map.put("role", "worker");

        assert_eq!(v, 2);
        assert_eq!(map.get("role").unwrap().version, 2);
        assert_eq!(map.max_version(), 2);
    }

    #[test]
    fn test_max_version_tracks_largest_insert() {
        let mut map = VersionedMap::new();
        map.put_versioned("a", 7, "x");
        map.put_versioned("b", 3, "y");
        map.put("b", "z");

        assert_eq!(map.max_version(), 7);
        let largest = map.iter().map(|(_, v)| v.version).max().unwrap();
        assert!(map.max_version() >= largest);
    }

    #[test]
    fn test_lower_version_never_reduces_max() {
        let mut map = VersionedMap::new();
        map.put_versioned("a", 10, "new");
        let previous = map.put_versioned("a", 4, "old");

        assert_eq!(previous.unwrap().version, 10);
        assert_eq!(map.max_version(), 10);
    }

    // ==================== merge ====================

    #[test]
    fn test_merge_accepts_newer_only() {
        let mut map = VersionedMap::new();
        map.put_versioned("status", 5, "ready");

        assert!(!map.merge("status", &VersionedValue::new(5, "stale")));
        assert!(!map.merge("status", &VersionedValue::new(2, "older")));
        assert_eq!(map.value("status"), Some("ready"));

        assert!(map.merge("status", &VersionedValue::new(6, "busy")));
        assert_eq!(map.value("status"), Some("busy"));
    }

    #[test]
    fn test_merge_creates_missing_key() {
        let mut map = VersionedMap::new();
        assert!(map.merge("zone", &VersionedValue::new(0, "eu")));
        assert_eq!(map.len(), 1);
    }

    // ==================== remove / clear ====================

    #[test]
    fn test_remove_keeps_max_version() {
        let mut map = VersionedMap::new();
        map.put_versioned("a", 3, "x");
        map.remove("a");

        assert!(map.is_empty());
        assert_eq!(map.max_version(), 3);
    }

    #[test]
    fn test_clear_resets_max_version() {
        let mut map = VersionedMap::new();
        map.put_versioned("a", 3, "x");
        map.clear();

        assert!(map.is_empty());
        assert_eq!(map.max_version(), 0);
    }

    #[test]
    fn test_newer_than_filters_by_version() {
        let mut map = VersionedMap::new();
        map.put_versioned("a", 1, "x");
        map.put_versioned("b", 5, "y");
        map.put_versioned("c", 9, "z");

        let mut keys: Vec<_> = map.newer_than(4).map(|(k, _)| k.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["b", "c"]);
    }
}
