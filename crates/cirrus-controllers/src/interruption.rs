//! Interruption-queue consumer
//!
//! A single long-poll loop over the cloud message queue. Messages are
//! EventBridge-shaped JSON and parse into a four-variant union; unknown
//! detail types are acknowledged and skipped. Each message is correlated to
//! a NodeClaim by instance id and dispatched: spot interruptions mark the
//! offering unavailable and drain the claim, rebalance recommendations are
//! advisory, scheduled changes drain pre-emptively, and terminal state
//! changes release the claim. Messages are deleted only after successful
//! dispatch; unparseable messages are left for the queue's redrive policy
//! to dead-letter.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::{debug, warn};

use cirrus_cloud::ec2::{Ec2Api, Filter};
use cirrus_cloud::queue::QueueApi;
use cirrus_common::crd::{ConditionStatus, NodeClaim, CONDITION_DISRUPTED};
use cirrus_common::events::{reasons, EventPublisher};
use cirrus_common::{metrics, Error, Result};
use cirrus_providers::instance_type::CapacityType;
use cirrus_providers::unavailable::SPOT_INTERRUPTION_TTL;
use cirrus_providers::UnavailableOfferings;

const FIELD_MANAGER: &str = "cirrus-interruption";
const MAX_MESSAGES: usize = 10;
const POLL_WAIT: Duration = Duration::from_secs(20);

/// An interruption notice delivered through the queue
#[derive(Clone, Debug, PartialEq)]
pub enum InterruptionMessage {
    /// The instance will be reclaimed within the warning window
    SpotInterruption {
        /// Affected instance
        instance_id: String,
    },
    /// The instance is at elevated risk of interruption
    RebalanceRecommendation {
        /// Affected instance
        instance_id: String,
    },
    /// Scheduled maintenance will affect the listed instances
    ScheduledChange {
        /// Affected instances
        instance_ids: Vec<String>,
    },
    /// The instance changed state
    InstanceStateChange {
        /// Affected instance
        instance_id: String,
        /// The new state, e.g. "stopped"
        state: String,
    },
}

impl InterruptionMessage {
    /// The affected instance ids
    pub fn instance_ids(&self) -> Vec<&str> {
        match self {
            InterruptionMessage::SpotInterruption { instance_id }
            | InterruptionMessage::RebalanceRecommendation { instance_id }
            | InterruptionMessage::InstanceStateChange { instance_id, .. } => {
                vec![instance_id.as_str()]
            }
            InterruptionMessage::ScheduledChange { instance_ids } => {
                instance_ids.iter().map(String::as_str).collect()
            }
        }
    }

    /// Short kind label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            InterruptionMessage::SpotInterruption { .. } => "spot-interruption",
            InterruptionMessage::RebalanceRecommendation { .. } => "rebalance-recommendation",
            InterruptionMessage::ScheduledChange { .. } => "scheduled-change",
            InterruptionMessage::InstanceStateChange { .. } => "state-change",
        }
    }

    /// The event reason emitted on the claim
    pub fn event_reason(&self) -> &'static str {
        match self {
            InterruptionMessage::SpotInterruption { .. } => reasons::SPOT_INTERRUPTED,
            InterruptionMessage::RebalanceRecommendation { .. } => reasons::REBALANCE_RECOMMENDED,
            InterruptionMessage::ScheduledChange { .. } => reasons::SCHEDULED_CHANGE,
            InterruptionMessage::InstanceStateChange { .. } => reasons::INSTANCE_STATE_CHANGED,
        }
    }
}

/// What the consumer does with a message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptionAction {
    /// Cordon-and-drain: the claim is deleted so the node is replaced
    Drain,
    /// Emit an event only
    Advisory,
}

/// Map a message to its action. Spot interruptions and scheduled changes
/// drain immediately; rebalance recommendations are advisory; state
/// changes drain only for terminal states.
pub fn action_for(message: &InterruptionMessage) -> InterruptionAction {
    match message {
        InterruptionMessage::SpotInterruption { .. } => InterruptionAction::Drain,
        InterruptionMessage::RebalanceRecommendation { .. } => InterruptionAction::Advisory,
        InterruptionMessage::ScheduledChange { .. } => InterruptionAction::Drain,
        InterruptionMessage::InstanceStateChange { state, .. } => {
            match state.to_lowercase().as_str() {
                "stopping" | "stopped" | "shutting-down" | "terminated" => {
                    InterruptionAction::Drain
                }
                _ => InterruptionAction::Advisory,
            }
        }
    }
}

/// Parse an EventBridge-shaped message body. `Ok(None)` means a well-formed
/// message of a type this consumer does not handle.
pub fn parse_message(body: &str) -> Result<Option<InterruptionMessage>> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| Error::serialization(format!("interruption message: {e}")))?;
    let source = value.get("source").and_then(Value::as_str).unwrap_or("");
    let detail_type = value
        .get("detail-type")
        .and_then(Value::as_str)
        .unwrap_or("");
    let detail = value.get("detail").cloned().unwrap_or(Value::Null);

    let instance_id = || -> Result<String> {
        detail
            .get("instance-id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::serialization("interruption message without instance-id"))
    };

    match (source, detail_type) {
        ("aws.ec2", "EC2 Spot Instance Interruption Warning") => {
            Ok(Some(InterruptionMessage::SpotInterruption {
                instance_id: instance_id()?,
            }))
        }
        ("aws.ec2", "EC2 Instance Rebalance Recommendation") => {
            Ok(Some(InterruptionMessage::RebalanceRecommendation {
                instance_id: instance_id()?,
            }))
        }
        ("aws.ec2", "EC2 Instance State-change Notification") => {
            let state = detail
                .get("state")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            Ok(Some(InterruptionMessage::InstanceStateChange {
                instance_id: instance_id()?,
                state,
            }))
        }
        ("aws.health", "AWS Health Event") => {
            let instance_ids: Vec<String> = value
                .get("resources")
                .and_then(Value::as_array)
                .map(|resources| {
                    resources
                        .iter()
                        .filter_map(Value::as_str)
                        .filter_map(|arn| arn.rsplit('/').next())
                        .filter(|id| id.starts_with("i-"))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            if instance_ids.is_empty() {
                return Ok(None);
            }
            Ok(Some(InterruptionMessage::ScheduledChange { instance_ids }))
        }
        _ => Ok(None),
    }
}

/// True when the claim already absorbed an interruption; replays are no-ops
pub fn already_disrupted(claim: &NodeClaim) -> bool {
    claim.metadata.deletion_timestamp.is_some()
        || claim
            .status
            .as_ref()
            .map(|s| s.is_condition_true(CONDITION_DISRUPTED))
            .unwrap_or(false)
}

/// The single queue consumer
pub struct InterruptionConsumer {
    client: Client,
    queue: Arc<dyn QueueApi>,
    queue_name: String,
    ec2: Arc<dyn Ec2Api>,
    unavailable: Arc<UnavailableOfferings>,
    events: Arc<dyn EventPublisher>,
}

impl InterruptionConsumer {
    /// Create the consumer
    pub fn new(
        client: Client,
        queue: Arc<dyn QueueApi>,
        queue_name: impl Into<String>,
        ec2: Arc<dyn Ec2Api>,
        unavailable: Arc<UnavailableOfferings>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            queue,
            queue_name: queue_name.into(),
            ec2,
            unavailable,
            events,
        }
    }

    /// Poll forever; receive failures back off briefly and retry
    pub async fn run(self) {
        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => debug!(count = n, "processed interruption messages"),
                Err(e) => {
                    warn!(error = %e, "interruption poll failed");
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            }
        }
    }

    /// One receive-dispatch-ack round; returns the number of handled
    /// messages
    pub async fn poll_once(&self) -> Result<usize> {
        let messages = self
            .queue
            .receive_messages(&self.queue_name, MAX_MESSAGES, POLL_WAIT)
            .await?;
        let mut handled = 0;
        for message in messages {
            match parse_message(&message.body) {
                Err(e) => {
                    // No ack: after enough receives the redrive policy
                    // moves the message to the dead-letter queue
                    warn!(message_id = %message.message_id, error = %e, "unparseable interruption message");
                    metrics::INTERRUPTION_MESSAGES.add(
                        1,
                        &[
                            KeyValue::new("message_type", "unknown"),
                            KeyValue::new("result", "parse_error"),
                        ],
                    );
                }
                Ok(None) => {
                    metrics::INTERRUPTION_MESSAGES.add(
                        1,
                        &[
                            KeyValue::new("message_type", "unknown"),
                            KeyValue::new("result", "ignored"),
                        ],
                    );
                    self.queue
                        .delete_message(&self.queue_name, &message.receipt_handle)
                        .await?;
                }
                Ok(Some(parsed)) => {
                    self.handle(&parsed).await?;
                    metrics::INTERRUPTION_MESSAGES.add(
                        1,
                        &[
                            KeyValue::new("message_type", parsed.kind()),
                            KeyValue::new("result", "handled"),
                        ],
                    );
                    self.queue
                        .delete_message(&self.queue_name, &message.receipt_handle)
                        .await?;
                    handled += 1;
                }
            }
        }
        Ok(handled)
    }

    async fn handle(&self, message: &InterruptionMessage) -> Result<()> {
        let claims: Api<NodeClaim> = Api::all(self.client.clone());
        let claim_list = claims.list(&ListParams::default()).await?;

        for instance_id in message.instance_ids() {
            let claim = claim_list
                .items
                .iter()
                .find(|c| c.instance_id() == Some(instance_id));
            let Some(claim) = claim else {
                debug!(instance = instance_id, kind = message.kind(), "notice for an instance we do not own");
                continue;
            };

            if matches!(message, InterruptionMessage::SpotInterruption { .. }) {
                self.mark_offering_unavailable(instance_id).await;
            }
            let action = action_for(message);
            self.events
                .publish(
                    &claim.object_ref(&()),
                    EventType::Warning,
                    message.event_reason(),
                    match action {
                        InterruptionAction::Drain => cirrus_common::events::actions::DRAINING,
                        InterruptionAction::Advisory => cirrus_common::events::actions::RECONCILING,
                    },
                    Some(format!("instance {instance_id}: {}", message.kind())),
                )
                .await;

            if action == InterruptionAction::Drain {
                self.drain(&claims, claim, message.kind()).await?;
            }
        }
        Ok(())
    }

    /// An interrupted spot pool is under reclaim pressure; steer launches
    /// away from the triple for a while
    async fn mark_offering_unavailable(&self, instance_id: &str) {
        let described = self
            .ec2
            .describe_instances(&[Filter::new("instance-id", [instance_id])])
            .await;
        match described {
            Ok(instances) => {
                if let Some(instance) = instances.first() {
                    self.unavailable.mark(
                        &instance.instance_type,
                        &instance.availability_zone,
                        CapacityType::Spot,
                        SPOT_INTERRUPTION_TTL,
                        "spot-interruption",
                    );
                }
            }
            Err(e) => debug!(instance = instance_id, error = %e, "could not describe interrupted instance"),
        }
    }

    async fn drain(
        &self,
        claims: &Api<NodeClaim>,
        claim: &NodeClaim,
        reason: &str,
    ) -> Result<()> {
        if already_disrupted(claim) {
            debug!(claim = %claim.name_any(), "claim already disrupted, replay is a no-op");
            return Ok(());
        }
        let mut status = claim.status.clone().unwrap_or_default();
        status.set_condition(
            CONDITION_DISRUPTED,
            ConditionStatus::True,
            "Interrupted",
            reason,
        );
        claims
            .patch_status(
                &claim.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(serde_json::json!({ "status": status })),
            )
            .await?;
        match claims.delete(&claim.name_any(), &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
