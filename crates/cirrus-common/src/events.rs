//! Kubernetes Event recording for Cirrus controllers
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "cirrus-interruption").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings
pub mod reasons {
    /// An instance was launched for a NodeClaim
    pub const LAUNCHED: &str = "Launched";
    /// Every fleet override failed with a capacity error
    pub const INSUFFICIENT_CAPACITY: &str = "InsufficientCapacity";
    /// Falling back to on-demand with few instance type options
    pub const SPOT_FALLBACK: &str = "SpotToOnDemandFallback";
    /// The cloud signaled a spot interruption for the backing instance
    pub const SPOT_INTERRUPTED: &str = "SpotInterrupted";
    /// The cloud recommends rebalancing off the backing instance
    pub const REBALANCE_RECOMMENDED: &str = "RebalanceRecommended";
    /// Scheduled maintenance will affect the backing instance
    pub const SCHEDULED_CHANGE: &str = "ScheduledChange";
    /// The backing instance changed state (stopped/terminated)
    pub const INSTANCE_STATE_CHANGED: &str = "InstanceStateChanged";
    /// An orphaned instance was terminated by garbage collection
    pub const GARBAGE_COLLECTED: &str = "GarbageCollected";
}

/// Well-known event action strings
pub mod actions {
    /// The controller is draining the claim's node
    pub const DRAINING: &str = "Draining";
    /// The controller launched cloud capacity
    pub const LAUNCHING: &str = "Launching";
    /// The controller reconciled state
    pub const RECONCILING: &str = "Reconciling";
}
