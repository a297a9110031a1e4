//! Metrics registry for Cirrus observability
//!
//! Provides OpenTelemetry metrics for:
//! - NodeClass reconciliation (duration, errors)
//! - Launch pipeline (attempts, duration, capacity errors)
//! - The unavailable-offerings cache
//! - Interruption queue consumption

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Global meter for Cirrus metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("cirrus"));

/// Histogram of NodeClass reconciliation duration
///
/// Labels:
/// - `node_class`: NodeClass name
/// - `result`: success, error
pub static NODECLASS_RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("cirrus_nodeclass_reconcile_duration_seconds")
        .with_description("Duration of NodeClass status reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of instance launches
///
/// Labels:
/// - `capacity_type`: spot, on-demand
/// - `result`: success, error, insufficient_capacity
pub static INSTANCE_LAUNCHES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cirrus_instance_launches_total")
        .with_description("Total number of fleet launch attempts")
        .with_unit("{launches}")
        .build()
});

/// Counter of offerings marked unavailable after fleet capacity errors
///
/// Labels:
/// - `capacity_type`: spot, on-demand
/// - `reason`: fleet error code or "spot-interruption"
pub static OFFERINGS_MARKED_UNAVAILABLE: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cirrus_unavailable_offerings_marked_total")
        .with_description("Total number of offerings marked unavailable")
        .with_unit("{offerings}")
        .build()
});

/// Gauge of instance types discovered by the catalog
pub static INSTANCE_TYPES_DISCOVERED: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("cirrus_instance_types_discovered")
        .with_description("Number of instance types the catalog currently resolves")
        .with_unit("{types}")
        .build()
});

/// Counter of interruption-queue messages by outcome
///
/// Labels:
/// - `message_type`: spot-interruption, rebalance-recommendation,
///   scheduled-change, state-change, unknown
/// - `result`: handled, ignored, parse_error
pub static INTERRUPTION_MESSAGES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cirrus_interruption_messages_total")
        .with_description("Total number of interruption queue messages received")
        .with_unit("{messages}")
        .build()
});

/// Counter of instances terminated by garbage collection
pub static INSTANCES_GARBAGE_COLLECTED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cirrus_instances_garbage_collected_total")
        .with_description("Total number of orphaned instances terminated by GC")
        .with_unit("{instances}")
        .build()
});
