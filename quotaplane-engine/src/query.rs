//! Usage query service
//!
//! Read path for reporting. Each scope view is one ledger `peek`, so it
//! existed at a real instant; separate scopes may be read at different
//! instants. Never takes admission locks.

use crate::ledger::{ScopeKey, UsageLedger};
use crate::store::SpecStore;
use chrono::Utc;
use quotaplane_common::{
    DimensionUsage, Error, QuotaInspection, QuotaSpecification, QuotaUsageSnapshot, Result,
    ScopeUsage,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub struct UsageQueryService {
    store: Arc<dyn SpecStore>,
    ledger: Arc<dyn UsageLedger>,
}

impl UsageQueryService {
    pub fn new(store: Arc<dyn SpecStore>, ledger: Arc<dyn UsageLedger>) -> Self {
        Self { store, ledger }
    }

    /// Current usage of a quota in every scope it declares or still occupies
    pub async fn usage(&self, name: &str) -> Result<QuotaUsageSnapshot> {
        let spec = self.store.get(name).await?;
        self.snapshot(&spec)
    }

    /// Specification and usage together
    pub async fn inspect(&self, name: &str) -> Result<QuotaInspection> {
        let spec = self.store.get(name).await?;
        let usage = self.snapshot(&spec)?;
        Ok(QuotaInspection { spec, usage })
    }

    /// Quota names starting with `prefix`
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.store.list(prefix).await
    }

    /// Usage of every quota whose name starts with `prefix`
    pub async fn usages(&self, prefix: &str) -> Result<Vec<QuotaUsageSnapshot>> {
        let mut snapshots = Vec::new();
        for name in self.store.list(prefix).await? {
            match self.usage(&name).await {
                Ok(snapshot) => snapshots.push(snapshot),
                // Deleted between listing and reading
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(snapshots)
    }

    fn snapshot(&self, spec: &QuotaSpecification) -> Result<QuotaUsageSnapshot> {
        let mut scopes = BTreeMap::new();

        for limit in &spec.limits {
            let counters = self.ledger.peek(&ScopeKey::new(&spec.name, &limit.scope))?;

            let dimensions: BTreeSet<_> = limit
                .caps
                .keys()
                .copied()
                .chain(counters.dimensions())
                .collect();

            let view = ScopeUsage {
                dimensions: dimensions
                    .into_iter()
                    .map(|d| {
                        let usage = DimensionUsage {
                            used: counters.get(d),
                            limit: Some(limit.cap(d)),
                        };
                        (d, usage)
                    })
                    .collect(),
            };
            scopes.insert(limit.scope.clone(), view);
        }

        // Usage left behind in scopes the specification no longer declares
        for scope in self.ledger.scopes(&spec.name)? {
            if scopes.contains_key(&scope) {
                continue;
            }
            let counters = self.ledger.peek(&ScopeKey::new(&spec.name, &scope))?;
            let view = ScopeUsage {
                dimensions: counters
                    .dimensions()
                    .map(|d| {
                        let usage = DimensionUsage {
                            used: counters.get(d),
                            limit: None,
                        };
                        (d, usage)
                    })
                    .collect(),
            };
            scopes.insert(scope, view);
        }

        Ok(QuotaUsageSnapshot {
            name: spec.name.clone(),
            modify_index: spec.modify_index,
            scopes,
            taken_at: Utc::now(),
        })
    }
}
