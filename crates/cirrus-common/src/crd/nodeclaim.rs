//! NodeClaim Custom Resource Definition
//!
//! A NodeClaim is a request for exactly one worker node, produced by the
//! upstream scheduler. Cirrus materializes it into an EC2 instance and
//! writes the provider id back to the status.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus};
use crate::scheduling::{Requirement, Requirements};

/// Reference to the Ec2NodeClass a claim launches with
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassRef {
    /// Name of the Ec2NodeClass
    pub name: String,
}

/// Resource requests the launched node must accommodate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequests {
    /// Requested quantities by resource name, e.g. cpu: "3500m"
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

/// Specification for a NodeClaim
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cirrus.sh",
    version = "v1",
    kind = "NodeClaim",
    plural = "nodeclaims",
    shortname = "nc",
    status = "NodeClaimStatus",
    printcolumn = r#"{"name":"Launched","type":"string","jsonPath":".status.conditions[?(@.type==\"Launched\")].status"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".status.providerId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    /// Scheduling requirements the launched node must satisfy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,

    /// Resource requests the node must fit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequests>,

    /// The Ec2NodeClass to launch with
    pub node_class_ref: NodeClassRef,
}

/// Status for a NodeClaim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    /// Provider id of the backing instance, e.g.
    /// `aws:///us-west-2a/i-0123456789abcdef0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Image the instance was launched from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,

    /// Capacity type of the backing offering: spot or on-demand
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_type: Option<String>,

    /// Conditions representing the claim state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodeClaimStatus {
    /// Set a condition, preserving transition times on no-op updates
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        super::types::set_condition(&mut self.conditions, type_, status, reason, message);
    }

    /// True if the condition exists and holds
    pub fn is_condition_true(&self, type_: &str) -> bool {
        super::types::is_condition_true(&self.conditions, type_)
    }
}

/// Build a provider id from a zone and instance id
pub fn provider_id(zone: &str, instance_id: &str) -> String {
    format!("aws:///{zone}/{instance_id}")
}

/// Extract the instance id from a provider id; the instance id is the last
/// path segment
pub fn parse_instance_id(provider_id: &str) -> Option<&str> {
    provider_id
        .rsplit('/')
        .next()
        .filter(|s| s.starts_with("i-"))
}

impl NodeClaim {
    /// The claim's requirements as a lookup set
    pub fn requirements(&self) -> Requirements {
        Requirements::from_list(&self.spec.requirements)
    }

    /// The backing instance id, if launched
    pub fn instance_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .and_then(parse_instance_id)
    }
}
