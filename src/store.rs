//! Per-session variable store.
//!
//! A flat string-to-string map that carries data between commands and into
//! the final result. Handlers write through [`VarStore::set`]; reads go
//! through the interpreter's resolution contract so they always see the
//! value current at resolution time.

use std::collections::BTreeMap;
use tracing::trace;

/// Session-scoped key/value store. Values are always strings; producers of
/// numbers or booleans stringify before storing.
#[derive(Debug, Default, Clone)]
pub struct VarStore {
    entries: BTreeMap<String, String>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from caller-supplied initial variables. Called once
    /// at session start; existing entries with the same key are replaced.
    pub fn seed<'a>(&mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) {
        for (k, v) in vars {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Insert or overwrite. Keys are never implicitly deleted.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        trace!(key = %key, value = %value, "store set");
        self.entries.insert(key, value);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    /// Snapshot for the result payload.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
