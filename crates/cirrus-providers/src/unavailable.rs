//! Unavailable-offerings cache
//!
//! A TTL-bounded set of `(instance type, zone, capacity type)` triples the
//! cloud recently refused on capacity grounds. The launch pipeline writes
//! it from fleet errors; the catalog reads it when computing offering
//! availability. Reads are lock-free best-effort: a stale read costs one
//! extra fleet error, never correctness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use opentelemetry::KeyValue;
use tracing::debug;

use cirrus_common::error::is_unfulfillable_capacity_code;
use cirrus_common::metrics;

use crate::instance_type::CapacityType;
use cirrus_cloud::ec2::FleetError;

/// How long a triple stays unavailable after a fleet capacity error
pub const INSUFFICIENT_CAPACITY_TTL: Duration = Duration::from_secs(180);

/// How long a triple stays unavailable after a spot interruption; an
/// interrupted pool signals sustained reclaim pressure, so this is longer
/// than the fleet-error TTL
pub const SPOT_INTERRUPTION_TTL: Duration = Duration::from_secs(600);

/// The cluster-wide unavailable-offerings cache
#[derive(Default)]
pub struct UnavailableOfferings {
    entries: DashMap<String, Instant>,
    seq_num: AtomicU64,
}

fn key(instance_type: &str, zone: &str, capacity_type: CapacityType) -> String {
    format!("{}:{instance_type}:{zone}", capacity_type.label())
}

impl UnavailableOfferings {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the triple is currently marked unavailable
    pub fn is_unavailable(
        &self,
        instance_type: &str,
        zone: &str,
        capacity_type: CapacityType,
    ) -> bool {
        let k = key(instance_type, zone, capacity_type);
        let expired = match self.entries.get(&k) {
            Some(deadline) if *deadline > Instant::now() => return true,
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(&k);
        }
        false
    }

    /// Mark a triple unavailable for `ttl`
    pub fn mark(
        &self,
        instance_type: &str,
        zone: &str,
        capacity_type: CapacityType,
        ttl: Duration,
        reason: &str,
    ) {
        debug!(
            instance_type,
            zone,
            capacity_type = capacity_type.label(),
            reason,
            ttl_secs = ttl.as_secs(),
            "marking offering unavailable"
        );
        self.entries
            .insert(key(instance_type, zone, capacity_type), Instant::now() + ttl);
        self.seq_num.fetch_add(1, Ordering::Relaxed);
        metrics::OFFERINGS_MARKED_UNAVAILABLE.add(
            1,
            &[
                KeyValue::new("capacity_type", capacity_type.label()),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
    }

    /// Mark the triple named by a fleet capacity error. Errors with other
    /// codes, or without an override, are ignored.
    pub fn mark_from_fleet_error(&self, error: &FleetError, capacity_type: CapacityType) {
        if !is_unfulfillable_capacity_code(&error.code) {
            return;
        }
        if let Some(override_) = &error.launch_template_override {
            self.mark(
                &override_.instance_type,
                &override_.availability_zone,
                capacity_type,
                INSUFFICIENT_CAPACITY_TTL,
                &error.code,
            );
        }
    }

    /// Monotonically increasing change counter; participates in the
    /// catalog's cache key so marks invalidate resolved instance types
    pub fn seq_num(&self) -> u64 {
        self.seq_num.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_cloud::ec2::FleetOverride;

    #[test]
    fn mark_then_expire() {
        let cache = UnavailableOfferings::new();
        assert!(!cache.is_unavailable("m5.large", "us-west-2a", CapacityType::Spot));

        cache.mark(
            "m5.large",
            "us-west-2a",
            CapacityType::Spot,
            Duration::from_millis(20),
            "test",
        );
        assert!(cache.is_unavailable("m5.large", "us-west-2a", CapacityType::Spot));
        // scoped by capacity type
        assert!(!cache.is_unavailable("m5.large", "us-west-2a", CapacityType::OnDemand));

        std::thread::sleep(Duration::from_millis(30));
        assert!(!cache.is_unavailable("m5.large", "us-west-2a", CapacityType::Spot));
    }

    #[test]
    fn seq_num_advances_on_mark() {
        let cache = UnavailableOfferings::new();
        let before = cache.seq_num();
        cache.mark(
            "c5.large",
            "us-west-2b",
            CapacityType::OnDemand,
            Duration::from_secs(60),
            "test",
        );
        assert!(cache.seq_num() > before);
    }

    #[test]
    fn fleet_error_marks_only_capacity_codes() {
        let cache = UnavailableOfferings::new();
        let override_ = FleetOverride {
            instance_type: "m5.large".to_string(),
            subnet_id: "subnet-1".to_string(),
            availability_zone: "us-west-2a".to_string(),
        };

        cache.mark_from_fleet_error(
            &FleetError {
                code: "UnauthorizedOperation".to_string(),
                message: "denied".to_string(),
                launch_template_override: Some(override_.clone()),
            },
            CapacityType::Spot,
        );
        assert!(!cache.is_unavailable("m5.large", "us-west-2a", CapacityType::Spot));

        cache.mark_from_fleet_error(
            &FleetError {
                code: "InsufficientInstanceCapacity".to_string(),
                message: "no capacity".to_string(),
                launch_template_override: Some(override_),
            },
            CapacityType::Spot,
        );
        assert!(cache.is_unavailable("m5.large", "us-west-2a", CapacityType::Spot));
    }
}
