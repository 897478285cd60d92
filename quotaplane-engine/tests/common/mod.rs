//! Common test utilities and helpers

#![allow(dead_code)]

use quotaplane_common::{Cap, Dimension, QuotaLimit, QuotaSpecification, ReservationRequest};
use quotaplane_engine::QuotaEngine;
use std::sync::Arc;

/// Quota with a single CPU cap in the "global" scope
pub fn cpu_quota(name: &str, cpu: i64) -> QuotaSpecification {
    QuotaSpecification::new(name)
        .with_limit(QuotaLimit::new("global").with_cap(Dimension::Cpu, Cap::Limited(cpu)))
}

/// Quota shaped like the one used by the inspect command tests
pub fn test_quota_spec() -> QuotaSpecification {
    QuotaSpecification::new("quota-test-spec")
        .with_description("Quota used in tests")
        .with_limit(
            QuotaLimit::new("global")
                .with_cap(Dimension::Cpu, Cap::Limited(2500))
                .with_cap(Dimension::MemoryMb, Cap::Limited(2000))
                .with_cap(Dimension::DiskMb, Cap::Unlimited),
        )
}

pub fn cpu(quota: &str, amount: u64) -> ReservationRequest {
    ReservationRequest::new(quota, "global").with(Dimension::Cpu, amount)
}

/// In-memory engine with the given specifications registered
pub async fn engine_with(specs: Vec<QuotaSpecification>) -> Arc<QuotaEngine> {
    let engine = QuotaEngine::in_memory();
    for spec in specs {
        engine.register(spec).await.expect("Failed to register quota");
    }
    Arc::new(engine)
}
