//! Usage ledger
//!
//! Per (quota, scope) counters of resources held by committed reservations.
//! The coordinator is the only caller of `reserve`/`release`; everything else
//! reads through `peek`.

use parking_lot::{Mutex, RwLock};
use quotaplane_common::{Resources, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Identity of a ledger entry and of a coordinator critical section
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey {
    pub quota: String,
    pub scope: String,
}

impl ScopeKey {
    pub fn new(quota: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            quota: quota.into(),
            scope: scope.into(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.quota, self.scope)
    }
}

/// Storage seam for usage counters
///
/// Implementations must make each call atomic per key: `peek` never observes
/// a half-applied `reserve` or `release`.
pub trait UsageLedger: Send + Sync {
    /// Consistent copy of every dimension counter for one key
    fn peek(&self, key: &ScopeKey) -> Result<Resources>;

    /// Add a delta, returning the new counters
    fn reserve(&self, key: &ScopeKey, delta: &Resources) -> Result<Resources>;

    /// Subtract a delta, clamping at zero, returning the new counters.
    /// An entry left with no usage is dropped.
    fn release(&self, key: &ScopeKey, delta: &Resources) -> Result<Resources>;

    /// Scopes of a quota holding non-zero usage, sorted
    fn scopes(&self, quota: &str) -> Result<Vec<String>>;

    /// Drop every entry of a retired quota
    fn purge(&self, quota: &str) -> Result<()>;
}

type Cell = Arc<Mutex<Resources>>;

/// In-process ledger with one lock per (quota, scope) cell
///
/// The outer map lock is only held long enough to find or create a cell, so
/// operations on different keys do not serialize behind each other.
#[derive(Default)]
pub struct ShardedLedger {
    cells: RwLock<HashMap<ScopeKey, Cell>>,
}

impl ShardedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &ScopeKey) -> Option<Cell> {
        self.cells.read().get(key).cloned()
    }

    fn cell_or_insert(&self, key: &ScopeKey) -> Cell {
        if let Some(cell) = self.cell(key) {
            return cell;
        }
        self.cells.write().entry(key.clone()).or_default().clone()
    }

    /// Remove `key` if it still maps to `cell` and the cell is empty.
    ///
    /// Cells are cloned out of the map only under the map lock, so with the
    /// write lock held a strong count of two (map plus ours) means no other
    /// caller is about to write into it.
    fn evict_if_empty(&self, key: &ScopeKey, cell: &Cell) {
        let mut cells = self.cells.write();
        let unused = cells
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && Arc::strong_count(cell) == 2);
        if unused && cell.lock().is_zero() {
            cells.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UsageLedger for ShardedLedger {
    fn peek(&self, key: &ScopeKey) -> Result<Resources> {
        Ok(self
            .cell(key)
            .map(|cell| cell.lock().clone())
            .unwrap_or_default())
    }

    fn reserve(&self, key: &ScopeKey, delta: &Resources) -> Result<Resources> {
        let cell = self.cell_or_insert(key);
        let mut counters = cell.lock();
        counters.merge(delta);
        Ok(counters.clone())
    }

    fn release(&self, key: &ScopeKey, delta: &Resources) -> Result<Resources> {
        let Some(cell) = self.cell(key) else {
            warn!(key = %key, "Release against a key with no usage; ignoring");
            return Ok(Resources::new());
        };

        let mut counters = cell.lock();
        for (dimension, amount) in delta.iter() {
            let current = counters.get(dimension);
            if amount > current {
                warn!(
                    key = %key,
                    dimension = %dimension,
                    current,
                    amount,
                    "Release exceeds recorded usage; clamping at zero"
                );
            }
            counters.set(dimension, current.saturating_sub(amount));
        }
        let remaining = counters.clone();
        drop(counters);

        if remaining.is_zero() {
            self.evict_if_empty(key, &cell);
        }
        Ok(remaining)
    }

    fn scopes(&self, quota: &str) -> Result<Vec<String>> {
        let cells = self.cells.read();
        let mut scopes: Vec<String> = cells
            .iter()
            .filter(|(key, cell)| key.quota == quota && !cell.lock().is_zero())
            .map(|(key, _)| key.scope.clone())
            .collect();
        scopes.sort();
        Ok(scopes)
    }

    fn purge(&self, quota: &str) -> Result<()> {
        self.cells.write().retain(|key, _| key.quota != quota);
        Ok(())
    }
}
