//! Reservation coordinator
//!
//! Admits, releases and moves reservations. Every check-then-commit runs
//! inside the (quota, scope) section of the keys it touches, so two
//! admissions against the same key can never both see the same headroom.
//! Specification lookups happen before any section is entered; nothing inside
//! a section awaits on I/O.
//!
//! Fairness is per section: callers are admitted to a key in the order they
//! reach its section queue. That order follows the specification lookup, so
//! two callers racing through a slow store may swap places before queueing.

use crate::ledger::{ScopeKey, UsageLedger};
use crate::locks::LockTable;
use crate::store::SpecStore;
use crate::{log_performance, log_reservation, validation};
use chrono::Utc;
use parking_lot::Mutex;
use quotaplane_common::{
    Error, QuotaLimit, QuotaSpecification, Reservation, ReservationRequest, Resources, Result,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ReservationCoordinator {
    store: Arc<dyn SpecStore>,
    ledger: Arc<dyn UsageLedger>,
    locks: LockTable,
    registry: Mutex<HashMap<Uuid, Reservation>>,
    default_scope: String,
}

fn scope_limit<'a>(spec: &'a QuotaSpecification, scope: &str) -> Result<&'a QuotaLimit> {
    spec.limit_for(scope).ok_or_else(|| {
        Error::NotFound(format!(
            "quota '{}' has no limit for scope '{}'",
            spec.name, scope
        ))
    })
}

/// First dimension of `delta` that does not fit under `limit` given `usage`
fn check_headroom(
    key: &ScopeKey,
    limit: &QuotaLimit,
    usage: &Resources,
    delta: &Resources,
) -> Result<()> {
    for (dimension, requested) in delta.iter().filter(|(_, amount)| *amount > 0) {
        let cap = limit.cap(dimension);
        let used = usage.get(dimension);
        if !cap.admits(used, requested) {
            let available = cap.headroom(used);
            warn!(
                quota = %key.quota,
                scope = %key.scope,
                dimension = %dimension,
                requested,
                available,
                "Admission rejected"
            );
            return Err(Error::QuotaExceeded {
                quota: key.quota.clone(),
                scope: key.scope.clone(),
                dimension,
                requested,
                available,
            });
        }
    }
    Ok(())
}

impl ReservationCoordinator {
    pub fn new(store: Arc<dyn SpecStore>, ledger: Arc<dyn UsageLedger>) -> Self {
        Self {
            store,
            ledger,
            locks: LockTable::new(),
            registry: Mutex::new(HashMap::new()),
            default_scope: "global".to_string(),
        }
    }

    pub fn with_default_scope(mut self, scope: impl Into<String>) -> Self {
        self.default_scope = scope.into();
        self
    }

    fn normalize(&self, mut request: ReservationRequest) -> Result<ReservationRequest> {
        if request.scope.is_empty() {
            request.scope = self.default_scope.clone();
        }
        validation::validate_request(&request)?;
        Ok(request)
    }

    /// Admit one reservation or reject it without side effects
    pub async fn reserve(&self, request: ReservationRequest) -> Result<Reservation> {
        let mut admitted = self.reserve_all(vec![request]).await?;
        admitted
            .pop()
            .ok_or_else(|| Error::Validation("no reservation requested".to_string()))
    }

    /// Admit every request or none of them
    ///
    /// Requests may target several quotas and scopes; amounts aimed at the
    /// same (quota, scope) are checked together.
    pub async fn reserve_all(&self, requests: Vec<ReservationRequest>) -> Result<Vec<Reservation>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();

        let requests = requests
            .into_iter()
            .map(|r| self.normalize(r))
            .collect::<Result<Vec<_>>>()?;

        let _gates = self
            .locks
            .shared_gates(requests.iter().map(|r| r.quota.as_str()))
            .await;

        let mut specs: BTreeMap<String, QuotaSpecification> = BTreeMap::new();
        for request in &requests {
            if !specs.contains_key(&request.quota) {
                let spec = self.store.get(&request.quota).await?;
                specs.insert(request.quota.clone(), spec);
            }
        }

        let mut totals: BTreeMap<ScopeKey, Resources> = BTreeMap::new();
        for request in &requests {
            let key = ScopeKey::new(&request.quota, &request.scope);
            let total = totals.entry(key).or_default();
            *total = total.checked_sum(&request.resources).map_err(|dimension| {
                Error::Validation(format!(
                    "combined {} requested against '{}/{}' overflows",
                    dimension, request.quota, request.scope
                ))
            })?;
        }

        let mut limits = Vec::with_capacity(totals.len());
        for key in totals.keys() {
            let spec = &specs[&key.quota];
            limits.push(scope_limit(spec, &key.scope)?);
        }

        let _sections = self.locks.sections(totals.keys()).await;

        for ((key, delta), limit) in totals.iter().zip(&limits) {
            let usage = self.ledger.peek(key)?;
            check_headroom(key, limit, &usage, delta)?;
        }

        let mut committed: Vec<&ScopeKey> = Vec::with_capacity(totals.len());
        for (key, delta) in &totals {
            if let Err(e) = self.ledger.reserve(key, delta) {
                self.rollback(&committed, &totals);
                return Err(e);
            }
            committed.push(key);
        }

        let now = Utc::now();
        let admitted: Vec<Reservation> = requests
            .into_iter()
            .map(|r| Reservation {
                id: Uuid::new_v4(),
                quota: r.quota,
                scope: r.scope,
                resources: r.resources,
                created_at: now,
            })
            .collect();

        {
            let mut registry = self.registry.lock();
            for reservation in &admitted {
                registry.insert(reservation.id, reservation.clone());
            }
        }

        for reservation in &admitted {
            log_reservation!("admitted", reservation);
        }
        log_performance!("reserve", started.elapsed());

        Ok(admitted)
    }

    fn rollback(&self, committed: &[&ScopeKey], totals: &BTreeMap<ScopeKey, Resources>) {
        for key in committed {
            if let Err(e) = self.ledger.release(key, &totals[*key]) {
                warn!(key = %key, error = %e, "Failed to roll back partial admission");
            }
        }
    }

    /// Release a reservation; `false` when it was unknown or already released
    pub async fn release(&self, id: Uuid) -> Result<bool> {
        loop {
            let Some(seen) = self.reservation(id) else {
                debug!(reservation_id = %id, "Release of unknown reservation ignored");
                return Ok(false);
            };
            let key = ScopeKey::new(&seen.quota, &seen.scope);

            let _gates = self.locks.shared_gates([key.quota.as_str()]).await;
            let _sections = self.locks.sections([&key]).await;

            let current = self.registry.lock().get(&id).cloned();
            match current {
                None => {
                    debug!(reservation_id = %id, "Reservation released concurrently");
                    return Ok(false);
                }
                // Moved by a transfer while we waited; retry against its new key
                Some(r) if r.quota != seen.quota || r.scope != seen.scope => continue,
                Some(r) => {
                    self.ledger.release(&key, &r.resources)?;
                    self.registry.lock().remove(&id);
                    log_reservation!("released", r);
                    return Ok(true);
                }
            }
        }
    }

    /// Move a reservation to another quota and/or scope atomically
    ///
    /// The destination must have room for the full amount; on rejection the
    /// reservation stays where it was.
    pub async fn transfer(
        &self,
        id: Uuid,
        quota: impl Into<String>,
        scope: impl Into<String>,
    ) -> Result<Reservation> {
        let mut target = ReservationRequest::new(quota, scope);
        if target.scope.is_empty() {
            target.scope = self.default_scope.clone();
        }
        validation::validate_quota_name(&target.quota)?;
        validation::validate_scope(&target.scope)?;
        let destination = ScopeKey::new(&target.quota, &target.scope);

        loop {
            let seen = self
                .reservation(id)
                .ok_or_else(|| Error::NotFound(format!("reservation '{}' not found", id)))?;
            let source = ScopeKey::new(&seen.quota, &seen.scope);
            if source == destination {
                return Ok(seen);
            }

            let _gates = self
                .locks
                .shared_gates([source.quota.as_str(), destination.quota.as_str()])
                .await;
            let spec = self.store.get(&destination.quota).await?;
            let limit = scope_limit(&spec, &destination.scope)?;

            let _sections = self.locks.sections([&source, &destination]).await;

            let current = self.registry.lock().get(&id).cloned();
            let reservation = match current {
                None => return Err(Error::NotFound(format!("reservation '{}' not found", id))),
                Some(r) if r.quota != seen.quota || r.scope != seen.scope => continue,
                Some(r) => r,
            };

            let usage = self.ledger.peek(&destination)?;
            check_headroom(&destination, limit, &usage, &reservation.resources)?;

            self.ledger.reserve(&destination, &reservation.resources)?;
            if let Err(e) = self.ledger.release(&source, &reservation.resources) {
                self.rollback(
                    &[&destination],
                    &BTreeMap::from([(destination.clone(), reservation.resources.clone())]),
                );
                return Err(e);
            }

            let mut moved = reservation;
            moved.quota = destination.quota.clone();
            moved.scope = destination.scope.clone();
            self.registry.lock().insert(id, moved.clone());

            info!(
                reservation_id = %id,
                from = %source,
                to = %destination,
                "Reservation transferred"
            );
            return Ok(moved);
        }
    }

    /// Delete a specification that has no usage left in any scope
    pub async fn retire(&self, name: &str) -> Result<()> {
        let _gate = self.locks.exclusive_gate(name).await;

        let active = self.ledger.scopes(name)?;
        if !active.is_empty() {
            return Err(Error::Conflict(format!(
                "quota '{}' has active usage in scope(s): {}",
                name,
                active.join(", ")
            )));
        }

        self.store.delete(name).await?;
        self.ledger.purge(name)?;

        info!(quota = %name, "Quota specification deleted");
        Ok(())
    }

    pub fn reservation(&self, id: Uuid) -> Option<Reservation> {
        self.registry.lock().get(&id).cloned()
    }

    /// Active reservations against a quota, oldest first
    pub fn reservations(&self, quota: &str) -> Vec<Reservation> {
        let mut held: Vec<Reservation> = self
            .registry
            .lock()
            .values()
            .filter(|r| r.quota == quota)
            .cloned()
            .collect();
        held.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ShardedLedger;
    use crate::store::MemorySpecStore;
    use quotaplane_common::{Cap, Dimension, QuotaLimit};
    use std::time::Duration;

    async fn coordinator_with(specs: Vec<QuotaSpecification>) -> ReservationCoordinator {
        let store = Arc::new(MemorySpecStore::new());
        for spec in specs {
            store.put(spec).await.unwrap();
        }
        ReservationCoordinator::new(store, Arc::new(ShardedLedger::new()))
    }

    fn cpu_quota(name: &str, cpu: i64) -> QuotaSpecification {
        QuotaSpecification::new(name)
            .with_limit(QuotaLimit::new("global").with_cap(Dimension::Cpu, Cap::Limited(cpu)))
    }

    fn cpu(quota: &str, amount: u64) -> ReservationRequest {
        ReservationRequest::new(quota, "global").with(Dimension::Cpu, amount)
    }

    #[tokio::test]
    async fn test_team_a_scenario() {
        let coordinator = coordinator_with(vec![cpu_quota("team-a", 10)]).await;

        let first = coordinator.reserve(cpu("team-a", 6)).await.unwrap();
        assert_eq!(first.resources.get(Dimension::Cpu), 6);

        let err = coordinator.reserve(cpu("team-a", 6)).await.unwrap_err();
        match err {
            Error::QuotaExceeded { dimension, requested, available, .. } => {
                assert_eq!(dimension, Dimension::Cpu);
                assert_eq!(requested, 6);
                assert_eq!(available, 4);
            }
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }

        assert!(coordinator.release(first.id).await.unwrap());
        coordinator.reserve(cpu("team-a", 6)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_quota_and_scope() {
        let coordinator = coordinator_with(vec![cpu_quota("team-a", 10)]).await;

        assert!(matches!(
            coordinator.reserve(cpu("ghost", 1)).await,
            Err(Error::NotFound(_))
        ));

        let other_scope = ReservationRequest::new("team-a", "eu-west").with(Dimension::Cpu, 1);
        assert!(matches!(
            coordinator.reserve(other_scope).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_scope_uses_default() {
        let coordinator = coordinator_with(vec![cpu_quota("team-a", 10)])
            .await
            .with_default_scope("global");

        let request = ReservationRequest::new("team-a", "").with(Dimension::Cpu, 2);
        let reservation = coordinator.reserve(request).await.unwrap();
        assert_eq!(reservation.scope, "global");
    }

    #[tokio::test]
    async fn test_uncapped_dimension_is_admitted() {
        let coordinator = coordinator_with(vec![cpu_quota("team-a", 10)]).await;
        let request = cpu("team-a", 1).with(Dimension::MemoryMb, 1 << 40);
        assert!(coordinator.reserve(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let coordinator = coordinator_with(vec![cpu_quota("team-a", 10)]).await;
        let reservation = coordinator.reserve(cpu("team-a", 4)).await.unwrap();

        assert!(coordinator.release(reservation.id).await.unwrap());
        assert!(!coordinator.release(reservation.id).await.unwrap());
        assert!(!coordinator.release(Uuid::new_v4()).await.unwrap());
        assert!(coordinator.reservation(reservation.id).is_none());
    }

    #[tokio::test]
    async fn test_reserve_all_is_all_or_nothing() {
        let coordinator =
            coordinator_with(vec![cpu_quota("team-a", 10), cpu_quota("team-b", 3)]).await;

        let err = coordinator
            .reserve_all(vec![cpu("team-a", 5), cpu("team-b", 4)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { ref quota, .. } if quota == "team-b"));
        assert!(coordinator.reservations("team-a").is_empty());

        let admitted = coordinator
            .reserve_all(vec![cpu("team-b", 2), cpu("team-a", 5)])
            .await
            .unwrap();
        assert_eq!(admitted[0].quota, "team-b");
        assert_eq!(admitted[1].quota, "team-a");
    }

    #[tokio::test]
    async fn test_reserve_all_aggregates_same_key() {
        let coordinator = coordinator_with(vec![cpu_quota("team-a", 10)]).await;

        // Each fits alone, together they do not
        let err = coordinator
            .reserve_all(vec![cpu("team-a", 6), cpu("team-a", 6)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { requested: 12, available: 10, .. }));
    }

    #[tokio::test]
    async fn test_transfer_moves_usage() {
        let coordinator =
            coordinator_with(vec![cpu_quota("team-a", 10), cpu_quota("team-b", 5)]).await;
        let reservation = coordinator.reserve(cpu("team-a", 4)).await.unwrap();

        let moved = coordinator
            .transfer(reservation.id, "team-b", "global")
            .await
            .unwrap();
        assert_eq!(moved.id, reservation.id);
        assert_eq!(moved.quota, "team-b");
        assert_eq!(coordinator.reservations("team-a").len(), 0);
        assert_eq!(coordinator.reservations("team-b").len(), 1);

        // Destination lacks room: nothing moves
        let big = coordinator.reserve(cpu("team-a", 9)).await.unwrap();
        let err = coordinator.transfer(big.id, "team-b", "global").await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { available: 1, .. }));
        assert_eq!(coordinator.reservation(big.id).unwrap().quota, "team-a");
    }

    #[tokio::test]
    async fn test_retire_blocked_by_usage() {
        let coordinator = coordinator_with(vec![cpu_quota("team-a", 10)]).await;
        let reservation = coordinator.reserve(cpu("team-a", 1)).await.unwrap();

        assert!(matches!(
            coordinator.retire("team-a").await,
            Err(Error::Conflict(_))
        ));

        coordinator.release(reservation.id).await.unwrap();
        coordinator.retire("team-a").await.unwrap();
        assert!(matches!(
            coordinator.retire("team-a").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unlimited_dimension_cannot_overflow() {
        let coordinator = coordinator_with(vec![cpu_quota("team-a", 10)]).await;
        let memory = |amount| ReservationRequest::new("team-a", "global").with(Dimension::MemoryMb, amount);

        let huge = coordinator.reserve(memory(u64::MAX)).await.unwrap();
        let err = coordinator.reserve(memory(5)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::QuotaExceeded { dimension: Dimension::MemoryMb, requested: 5, available: 0, .. }
        ));

        // Usage still equals what is held, so release restores it exactly
        assert!(coordinator.release(huge.id).await.unwrap());
        let small = coordinator.reserve(memory(5)).await.unwrap();
        let key = ScopeKey::new("team-a", "global");
        assert_eq!(coordinator.ledger.peek(&key).unwrap().get(Dimension::MemoryMb), 5);

        coordinator.release(small.id).await.unwrap();
        assert!(coordinator.ledger.peek(&key).unwrap().is_zero());
    }

    #[tokio::test]
    async fn test_reserve_all_rejects_overflowing_aggregate() {
        let coordinator = coordinator_with(vec![cpu_quota("team-a", 10)]).await;
        let memory = |amount| ReservationRequest::new("team-a", "global").with(Dimension::MemoryMb, amount);

        let err = coordinator
            .reserve_all(vec![memory(u64::MAX), memory(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(coordinator.reservations("team-a").is_empty());
        assert!(coordinator
            .ledger
            .peek(&ScopeKey::new("team-a", "global"))
            .unwrap()
            .is_zero());
    }

    #[tokio::test]
    async fn test_cancelled_reserve_leaves_no_trace() {
        let coordinator = Arc::new(coordinator_with(vec![cpu_quota("team-a", 4)]).await);
        let key = ScopeKey::new("team-a", "global");
        let held = coordinator.locks.sections([&key]).await;

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.reserve(cpu("team-a", 4)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        drop(held);

        assert!(coordinator.ledger.peek(&key).unwrap().is_zero());
        assert!(coordinator.reservations("team-a").is_empty());

        // The whole cap is still available
        coordinator.reserve(cpu("team-a", 4)).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiters_admitted_in_arrival_order() {
        let coordinator = Arc::new(coordinator_with(vec![cpu_quota("team-a", 5)]).await);
        let key = ScopeKey::new("team-a", "global");
        let held = coordinator.locks.sections([&key]).await;

        // Only arrival order admits the first and third and rejects the second
        let mut waiters = Vec::new();
        for amount in [3, 3, 2] {
            let coordinator = coordinator.clone();
            waiters.push(tokio::spawn(async move {
                coordinator.reserve(cpu("team-a", amount)).await
            }));
            // Let it queue on the section before the next one arrives
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(held);

        let mut outcomes = Vec::new();
        for waiter in waiters {
            outcomes.push(waiter.await.unwrap());
        }

        assert_eq!(outcomes[0].as_ref().unwrap().resources.get(Dimension::Cpu), 3);
        assert!(matches!(
            outcomes[1],
            Err(Error::QuotaExceeded { requested: 3, available: 2, .. })
        ));
        assert_eq!(outcomes[2].as_ref().unwrap().resources.get(Dimension::Cpu), 2);
    }
}
