//! Shared status types for Cirrus CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status of a condition: True, False, or Unknown
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The condition cannot be determined
    Unknown,
}

/// A status condition, following the Kubernetes condition conventions
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "SubnetsReady")
    #[serde(rename = "type")]
    pub type_: String,
    /// Whether the condition holds
    pub status: ConditionStatus,
    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// RFC 3339 timestamp of the last status transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Set a condition on a condition list, updating the transition time only
/// when the status actually changes
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) {
    let message = message.into();
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = Some(chrono::Utc::now().to_rfc3339());
        }
        existing.status = status;
        existing.reason = Some(reason.to_string());
        existing.message = Some(message);
        return;
    }
    conditions.push(Condition {
        type_: type_.to_string(),
        status,
        reason: Some(reason.to_string()),
        message: Some(message),
        last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
    });
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True if the condition exists and holds
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    matches!(
        find_condition(conditions, type_),
        Some(c) if c.status == ConditionStatus::True
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_transitions_once() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            "Ready",
            ConditionStatus::False,
            "NotReady",
            "still resolving",
        );
        let first_time = conditions[0].last_transition_time.clone();

        // Same status, new message: the transition time must not move
        set_condition(
            &mut conditions,
            "Ready",
            ConditionStatus::False,
            "NotReady",
            "still resolving subnets",
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first_time);

        // Flip to true: the transition time moves
        set_condition(&mut conditions, "Ready", ConditionStatus::True, "Ready", "");
        assert!(is_condition_true(&conditions, "Ready"));
    }

    #[test]
    fn missing_condition_is_not_true() {
        assert!(!is_condition_true(&[], "Ready"));
    }
}
