//! Custom Resource Definitions for Cirrus
//!
//! Two cluster-scoped resources drive the operator: [`Ec2NodeClass`], the
//! operator-authored template describing how instances are discovered and
//! configured, and [`NodeClaim`], the scheduler-produced request for exactly
//! one worker node.

mod nodeclaim;
mod nodeclass;
mod types;

pub use nodeclaim::{
    parse_instance_id, provider_id, NodeClaim, NodeClaimSpec, NodeClaimStatus, NodeClassRef,
    ResourceRequests,
};
pub use nodeclass::{
    AmiAlias, AmiFamily, AmiFamilyFeatures, AmiSelectorTerm, BlockDevice, BlockDeviceMapping,
    Ec2NodeClass, Ec2NodeClassSpec, Ec2NodeClassStatus, InstanceStorePolicy, KubeletConfiguration,
    MetadataOptions, ResolvedAmi, ResolvedSecurityGroup, ResolvedSubnet, SelectorTerm,
};
pub use types::{set_condition, Condition, ConditionStatus};

/// Condition type: subnet selector resolved to at least one subnet
pub const CONDITION_SUBNETS_READY: &str = "SubnetsReady";
/// Condition type: security-group selector resolved
pub const CONDITION_SECURITY_GROUPS_READY: &str = "SecurityGroupsReady";
/// Condition type: AMI selector resolved
pub const CONDITION_AMIS_READY: &str = "AmisReady";
/// Condition type: instance profile exists with the expected role
pub const CONDITION_INSTANCE_PROFILE_READY: &str = "InstanceProfileReady";
/// Condition type: the NodeClass can launch nodes
pub const CONDITION_READY: &str = "Ready";

/// Condition type: an instance has been launched for the claim
pub const CONDITION_LAUNCHED: &str = "Launched";
/// Condition type: the claim's instance received an interruption notice
pub const CONDITION_DISRUPTED: &str = "Disrupted";
