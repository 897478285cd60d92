//! Engine facade
//!
//! The boundary consumed by CLIs and transports: registration, usage
//! queries, listing for autocompletion, and the scheduler-facing admission
//! calls.

use crate::config::{EngineConfig, EngineSettings, StoreBackend};
use crate::coordinator::ReservationCoordinator;
use crate::ledger::{ShardedLedger, UsageLedger};
use crate::query::UsageQueryService;
use crate::store::{MemorySpecStore, SpecStore, SqliteSpecStore};
use quotaplane_common::{
    QuotaInspection, QuotaSpecification, QuotaUsageSnapshot, Reservation, ReservationRequest,
    Result,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct QuotaEngine {
    store: Arc<dyn SpecStore>,
    coordinator: ReservationCoordinator,
    query: UsageQueryService,
}

impl QuotaEngine {
    pub fn new(
        store: Arc<dyn SpecStore>,
        ledger: Arc<dyn UsageLedger>,
        settings: &EngineSettings,
    ) -> Self {
        let coordinator = ReservationCoordinator::new(store.clone(), ledger.clone())
            .with_default_scope(settings.default_scope.clone());
        let query = UsageQueryService::new(store.clone(), ledger);

        Self {
            store,
            coordinator,
            query,
        }
    }

    /// Engine over in-memory store and ledger with default settings
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemorySpecStore::new()),
            Arc::new(ShardedLedger::new()),
            &EngineSettings::default(),
        )
    }

    /// Open the configured store backend
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        let max_limits = config.engine.max_limits_per_spec;
        let store: Arc<dyn SpecStore> = match config.store.backend {
            StoreBackend::Sqlite => Arc::new(
                SqliteSpecStore::connect(&config.store.url, config.store.max_connections)
                    .await?
                    .with_max_limits(max_limits),
            ),
            StoreBackend::Memory => Arc::new(MemorySpecStore::with_max_limits(max_limits)),
        };

        info!(
            backend = ?config.store.backend,
            default_scope = %config.engine.default_scope,
            "Quota engine started"
        );

        Ok(Self::new(store, Arc::new(ShardedLedger::new()), &config.engine))
    }

    /// Idempotent upsert of a specification
    pub async fn register(&self, spec: QuotaSpecification) -> Result<QuotaSpecification> {
        let stored = self.store.put(spec).await?;
        info!(
            quota = %stored.name,
            modify_index = stored.modify_index,
            "Quota specification registered"
        );
        Ok(stored)
    }

    pub async fn get(&self, name: &str) -> Result<QuotaSpecification> {
        self.store.get(name).await
    }

    /// Delete a specification; `Conflict` while any usage remains
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.coordinator.retire(name).await
    }

    pub async fn usage(&self, name: &str) -> Result<QuotaUsageSnapshot> {
        self.query.usage(name).await
    }

    pub async fn inspect(&self, name: &str) -> Result<QuotaInspection> {
        self.query.inspect(name).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.query.list(prefix).await
    }

    pub async fn usages(&self, prefix: &str) -> Result<Vec<QuotaUsageSnapshot>> {
        self.query.usages(prefix).await
    }

    pub async fn reserve(&self, request: ReservationRequest) -> Result<Reservation> {
        self.coordinator.reserve(request).await
    }

    pub async fn reserve_all(&self, requests: Vec<ReservationRequest>) -> Result<Vec<Reservation>> {
        self.coordinator.reserve_all(requests).await
    }

    pub async fn release(&self, id: Uuid) -> Result<bool> {
        self.coordinator.release(id).await
    }

    pub async fn transfer(
        &self,
        id: Uuid,
        quota: impl Into<String>,
        scope: impl Into<String>,
    ) -> Result<Reservation> {
        self.coordinator.transfer(id, quota, scope).await
    }

    pub fn reservation(&self, id: Uuid) -> Option<Reservation> {
        self.coordinator.reservation(id)
    }

    pub fn reservations(&self, quota: &str) -> Vec<Reservation> {
        self.coordinator.reservations(quota)
    }
}
