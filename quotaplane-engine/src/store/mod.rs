//! Quota specification store
//!
//! Durable mapping from quota name to its declared limits. Every write is
//! validated first; concurrent writers to the same name serialize.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteSpecStore;

use crate::validation;
use async_trait::async_trait;
use quotaplane_common::{Error, QuotaSpecification, Result};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

pub const DEFAULT_MAX_LIMITS: usize = 64;

/// Storage seam for quota specifications
#[async_trait]
pub trait SpecStore: Send + Sync {
    /// Validate and upsert by name, returning the stored record
    async fn put(&self, spec: QuotaSpecification) -> Result<QuotaSpecification>;

    /// Current specification or `NotFound`
    async fn get(&self, name: &str) -> Result<QuotaSpecification>;

    /// Remove a specification or return `NotFound`
    async fn delete(&self, name: &str) -> Result<()>;

    /// Names starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Outcome of merging an incoming specification with the stored one
pub(crate) enum Upsert {
    Unchanged(QuotaSpecification),
    Write(QuotaSpecification),
}

/// Stamp indexes on an incoming specification.
///
/// Identical content keeps the stored record so repeated registration does
/// not churn `modify_index`; `next_index` is only called when a write happens.
pub(crate) fn plan_upsert(
    existing: Option<&QuotaSpecification>,
    mut incoming: QuotaSpecification,
    next_index: impl FnOnce() -> u64,
) -> Upsert {
    match existing {
        Some(current) if current.same_content(&incoming) => Upsert::Unchanged(current.clone()),
        Some(current) => {
            incoming.create_index = current.create_index;
            incoming.modify_index = next_index();
            Upsert::Write(incoming)
        }
        None => {
            let index = next_index();
            incoming.create_index = index;
            incoming.modify_index = index;
            Upsert::Write(incoming)
        }
    }
}

#[derive(Default)]
struct MemoryState {
    specs: BTreeMap<String, QuotaSpecification>,
    index: u64,
}

/// In-memory specification store
pub struct MemorySpecStore {
    state: RwLock<MemoryState>,
    max_limits: usize,
}

impl MemorySpecStore {
    pub fn new() -> Self {
        Self::with_max_limits(DEFAULT_MAX_LIMITS)
    }

    pub fn with_max_limits(max_limits: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            max_limits,
        }
    }
}

impl Default for MemorySpecStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpecStore for MemorySpecStore {
    async fn put(&self, spec: QuotaSpecification) -> Result<QuotaSpecification> {
        validation::validate_specification(&spec, self.max_limits)?;

        let mut state = self.state.write().await;
        let MemoryState { specs, index } = &mut *state;

        let plan = plan_upsert(specs.get(&spec.name), spec, || {
            *index += 1;
            *index
        });

        match plan {
            Upsert::Unchanged(stored) => Ok(stored),
            Upsert::Write(stored) => {
                specs.insert(stored.name.clone(), stored.clone());
                Ok(stored)
            }
        }
    }

    async fn get(&self, name: &str) -> Result<QuotaSpecification> {
        self.state
            .read()
            .await
            .specs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::quota_not_found(name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.state
            .write()
            .await
            .specs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::quota_not_found(name))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .read()
            .await
            .specs
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}
