//! Copy-on-write primvar cache.
//!
//! The cache keeps the last-seen snapshot of every primvar the engine
//! uploaded. Change detection is version-stamp based: the scene delegate
//! guarantees a stamp bump on actual value change, so a flagged-but-equal
//! notification compares equal stamps and is absorbed without touching the
//! GPU. Snapshots are shared (`Arc`) with the delegate and replaced
//! wholesale, never mutated.

use crate::scene::Primvar;
use std::collections::HashMap;

#[derive(Default)]
pub struct PrimvarCache {
    sources: HashMap<String, Primvar>,
}

impl PrimvarCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `fresh` against the cached snapshot and take it if the value
    /// (or interpolation) changed. Returns true when a GPU update is due.
    pub fn apply(&mut self, name: &str, fresh: &Primvar) -> bool {
        match self.sources.get(name) {
            Some(existing)
                if existing.data.version == fresh.data.version
                    && existing.interpolation == fresh.interpolation =>
            {
                false
            }
            _ => {
                self.sources.insert(name.to_string(), fresh.clone());
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Primvar> {
        self.sources.get(name)
    }

    pub fn version(&self, name: &str) -> Option<u64> {
        self.sources.get(name).map(|p| p.data.version)
    }

    /// Drop a primvar the delegate no longer authors.
    pub fn remove(&mut self, name: &str) -> Option<Primvar> {
        self.sources.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }
}
