//! IAM capability interface, scoped to instance-profile lifecycle

use std::collections::BTreeMap;

use async_trait::async_trait;

use cirrus_common::Result;

/// An IAM instance profile
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceProfile {
    /// Profile name
    pub name: String,
    /// Attached role names; at most one role can be attached
    pub roles: Vec<String>,
    /// Profile tags
    pub tags: BTreeMap<String, String>,
}

/// Interface to IAM instance-profile operations
#[async_trait]
pub trait IamApi: Send + Sync {
    /// Get a profile by name; a missing profile surfaces as a `NoSuchEntity`
    /// cloud error
    async fn get_instance_profile(&self, name: &str) -> Result<InstanceProfile>;

    /// Create a profile with the given tags
    async fn create_instance_profile(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<InstanceProfile>;

    /// Add tags to an existing profile
    async fn tag_instance_profile(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Attach a role to the profile
    async fn add_role_to_instance_profile(&self, name: &str, role: &str) -> Result<()>;

    /// Detach a role from the profile
    async fn remove_role_from_instance_profile(&self, name: &str, role: &str) -> Result<()>;

    /// Delete the profile; it must have no roles attached
    async fn delete_instance_profile(&self, name: &str) -> Result<()>;
}
