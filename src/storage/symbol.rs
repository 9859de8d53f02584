//! Global symbol table for dictionary-encoded string columns.
//!
//! Every symbol column stores integer ids into one process-wide table, so ids
//! from different columns and tables compare directly. Ids are dense, start at
//! zero and are never reassigned.
//!
//! # Thread Safety
//!
//! The table is wrapped in a `parking_lot::RwLock`; lookups from parallel
//! workers take the read lock only.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

/// Interned strings with dense ids.
#[derive(Debug, Default)]
pub struct SymbolTable {
    /// String to id map.
    ids: HashMap<Arc<str>, u64>,
    /// Id to string map.
    strings: Vec<Arc<str>>,
    /// Number of intern calls that found an existing symbol.
    hits: u64,
    /// Number of intern calls that created a symbol.
    misses: u64,
}

impl SymbolTable {
    /// Creates a new empty symbol table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning its id.
    pub fn intern(&mut self, s: &str) -> u64 {
        if let Some(&id) = self.ids.get(s) {
            self.hits += 1;
            return id;
        }

        self.misses += 1;
        let id = self.strings.len() as u64;
        let arc: Arc<str> = Arc::from(s);
        self.strings.push(Arc::clone(&arc));
        self.ids.insert(arc, id);
        id
    }

    /// Returns the id of an already interned string.
    #[must_use]
    pub fn lookup(&self, s: &str) -> Option<u64> {
        self.ids.get(s).copied()
    }

    /// Returns the string for an id.
    #[must_use]
    pub fn resolve(&self, id: u64) -> Option<&Arc<str>> {
        usize::try_from(id).ok().and_then(|i| self.strings.get(i))
    }

    /// Returns the number of unique symbols stored.
    #[must_use]
    pub fn unique_count(&self) -> usize {
        self.strings.len()
    }

    /// Returns the hit rate of `intern` calls (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

static GLOBAL: OnceLock<RwLock<SymbolTable>> = OnceLock::new();

/// Returns the process-wide symbol table.
pub fn global() -> &'static RwLock<SymbolTable> {
    GLOBAL.get_or_init(|| RwLock::new(SymbolTable::new()))
}

/// Interns a string in the global table.
pub fn intern(s: &str) -> u64 {
    if let Some(id) = global().read().lookup(s) {
        return id;
    }
    global().write().intern(s)
}

/// Interns many strings under one write lock.
pub fn intern_all<'a>(strings: impl IntoIterator<Item = &'a str>) -> Vec<u64> {
    let mut table = global().write();
    strings.into_iter().map(|s| table.intern(s)).collect()
}

/// Looks up the id of a string without interning it.
#[must_use]
pub fn lookup(s: &str) -> Option<u64> {
    global().read().lookup(s)
}

/// Resolves an id to its string.
#[must_use]
pub fn resolve(id: u64) -> Option<Arc<str>> {
    global().read().resolve(id).cloned()
}
