//! Checksum cache
//!
//! Holds the last server-confirmed value of every subscription together with
//! its checksum. The checksum is never updated speculatively: an entry is only
//! written from a full data frame or a diff whose base checksum matched.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-confirmed value of one subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub checksum: u64,
}

/// Cache of subscription values keyed by subscription id
///
/// Optionally persists to disk so a later process can subscribe with known
/// checksums and skip payloads that have not changed.
#[derive(Debug, Default)]
pub struct ChecksumCache {
    entries: HashMap<u64, CacheEntry>,
    /// Path to persist the cache
    path: Option<PathBuf>,
}

impl ChecksumCache {
    /// Create a new cache (in-memory only)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache that persists to disk
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let mut cache = Self {
            entries: HashMap::new(),
            path: Some(path.clone()),
        };

        if path.exists() {
            cache.load()?;
        }

        Ok(cache)
    }

    pub fn get(&self, id: u64) -> Option<&CacheEntry> {
        self.entries.get(&id)
    }

    /// Checksum of the cached value, if any
    pub fn checksum(&self, id: u64) -> Option<u64> {
        self.entries.get(&id).map(|entry| entry.checksum)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn insert(&mut self, id: u64, value: Value, checksum: u64) {
        self.entries.insert(id, CacheEntry { value, checksum });
    }

    pub fn remove(&mut self, id: u64) -> Option<CacheEntry> {
        self.entries.remove(&id)
    }

    /// Drop every entry for which `keep` returns false
    pub fn retain(&mut self, mut keep: impl FnMut(u64) -> bool) {
        self.entries.retain(|id, _| keep(*id));
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Save the cache to disk
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        // JSON object keys must be strings
        let data: HashMap<String, &CacheEntry> = self
            .entries
            .iter()
            .map(|(id, entry)| (id.to_string(), entry))
            .collect();

        let json = serde_json::to_string(&data)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, json).context("Failed to save checksum cache")?;
        Ok(())
    }

    /// Load the cache from disk
    fn load(&mut self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let json = fs::read_to_string(path).context("Failed to read checksum cache")?;
        let data: HashMap<String, CacheEntry> =
            serde_json::from_str(&json).context("Failed to parse checksum cache")?;

        for (id, entry) in data {
            if let Ok(id) = id.parse::<u64>() {
                self.entries.insert(id, entry);
            }
        }

        Ok(())
    }
}
