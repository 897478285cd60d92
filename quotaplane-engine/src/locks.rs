//! Admission locks
//!
//! Two levels, always acquired in this order:
//! 1. quota gates, shared for admission and exclusive for retirement,
//!    taken in lexicographic quota order
//! 2. (quota, scope) sections, taken in lexicographic key order
//!
//! Both lock types are tokio primitives, which queue waiters in FIFO order,
//! so admission within one key follows the order in which callers reach the
//! section.
//!
//! Table entries exist only while some caller holds or awaits them; the last
//! guard to drop evicts its entry.

use crate::ledger::ScopeKey;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{
    Mutex as SectionLock, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard,
    RwLock as GateLock,
};

type Table<K, L> = Arc<Mutex<HashMap<K, Arc<L>>>>;

/// Lock guard that evicts its table entry once nobody else references it
pub struct Held<K: Hash + Eq, L, G> {
    guard: Option<G>,
    key: K,
    table: Table<K, L>,
}

impl<K: Hash + Eq, L, G> Drop for Held<K, L, G> {
    fn drop(&mut self) {
        // Unlock first so our own reference to the lock is gone
        self.guard.take();

        // Holders and waiters all keep a clone, and clones are only made
        // under the table mutex, so a count of one means the table is alone
        let mut table = self.table.lock();
        if table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.key);
        }
    }
}

pub type GateGuard = Held<String, GateLock<()>, OwnedRwLockReadGuard<()>>;
pub type ExclusiveGuard = Held<String, GateLock<()>, OwnedRwLockWriteGuard<()>>;
pub type SectionGuard = Held<ScopeKey, SectionLock<()>, OwnedMutexGuard<()>>;

/// Register interest in `key`, returning the shared lock and a guard that
/// cleans the entry up even if the caller is cancelled while waiting
fn checkout<K, L, G>(table: &Table<K, L>, key: &K) -> (Arc<L>, Held<K, L, G>)
where
    K: Hash + Eq + Clone,
    L: Default,
{
    let lock = table.lock().entry(key.clone()).or_default().clone();
    let held = Held {
        guard: None,
        key: key.clone(),
        table: table.clone(),
    };
    (lock, held)
}

#[derive(Default)]
pub struct LockTable {
    gates: Table<String, GateLock<()>>,
    sections: Table<ScopeKey, SectionLock<()>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared gates for a set of quotas, deduplicated and in name order
    pub async fn shared_gates<'a, I>(&self, quotas: I) -> Vec<GateGuard>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let ordered: BTreeSet<&str> = quotas.into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for quota in ordered {
            let (lock, mut held) = checkout(&self.gates, &quota.to_string());
            held.guard = Some(lock.read_owned().await);
            guards.push(held);
        }
        guards
    }

    /// Exclusive gate for one quota; waits for in-flight admissions to finish
    pub async fn exclusive_gate(&self, quota: &str) -> ExclusiveGuard {
        let (lock, mut held) = checkout(&self.gates, &quota.to_string());
        held.guard = Some(lock.write_owned().await);
        held
    }

    /// Sections for a set of keys, deduplicated and in key order
    pub async fn sections<'a, I>(&self, keys: I) -> Vec<SectionGuard>
    where
        I: IntoIterator<Item = &'a ScopeKey>,
    {
        let ordered: BTreeSet<&ScopeKey> = keys.into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            let (lock, mut held) = checkout(&self.sections, key);
            held.guard = Some(lock.lock_owned().await);
            guards.push(held);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn table_sizes(locks: &LockTable) -> (usize, usize) {
        (locks.gates.lock().len(), locks.sections.lock().len())
    }

    #[tokio::test]
    async fn test_sections_deduplicate_keys() {
        let locks = LockTable::new();
        let a = ScopeKey::new("team-a", "global");
        let b = ScopeKey::new("team-b", "global");

        // Same key twice would self-deadlock without dedup
        let guards = locks.sections([&a, &b, &a]).await;
        assert_eq!(guards.len(), 2);
    }

    #[tokio::test]
    async fn test_section_excludes_second_holder() {
        let locks = Arc::new(LockTable::new());
        let key = ScopeKey::new("team-a", "global");

        let held = locks.sections([&key]).await;

        let contender = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guards = locks.sections([&key]).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unrelated_sections_do_not_contend() {
        let locks = LockTable::new();
        let a = ScopeKey::new("team-a", "global");
        let b = ScopeKey::new("team-a", "eu-west");

        let _held = locks.sections([&a]).await;
        let other = tokio::time::timeout(Duration::from_millis(100), locks.sections([&b])).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_exclusive_gate_waits_for_shared_holders() {
        let locks = Arc::new(LockTable::new());
        let shared = locks.shared_gates(["team-a", "team-a"]).await;
        assert_eq!(shared.len(), 1);

        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            locks.exclusive_gate("team-a"),
        )
        .await;
        assert!(pending.is_err());

        drop(shared);
        let _exclusive = locks.exclusive_gate("team-a").await;
    }

    #[tokio::test]
    async fn test_released_entries_are_evicted() {
        let locks = LockTable::new();

        for i in 0..1000 {
            let quota = format!("ghost-{}", i);
            let key = ScopeKey::new(quota.as_str(), "global");
            let _gates = locks.shared_gates([quota.as_str()]).await;
            let _sections = locks.sections([&key]).await;
        }
        drop(locks.exclusive_gate("team-a").await);

        assert_eq!(table_sizes(&locks), (0, 0));
    }

    #[tokio::test]
    async fn test_entry_survives_while_waiters_queue() {
        let locks = Arc::new(LockTable::new());
        let key = ScopeKey::new("team-a", "global");
        let held = locks.sections([&key]).await;

        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guards = locks.sections([&key]).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The holder leaves but the waiter still needs the same lock
        drop(held);
        assert_eq!(table_sizes(&locks).1, 1);

        waiter.await.unwrap();
        assert_eq!(table_sizes(&locks), (0, 0));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_evicted() {
        let locks = Arc::new(LockTable::new());
        let key = ScopeKey::new("team-a", "global");
        let held = locks.sections([&key]).await;

        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guards = locks.sections([&key]).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        drop(held);
        assert_eq!(table_sizes(&locks), (0, 0));
    }
}
