//! Managed instance-profile lifecycle
//!
//! When a NodeClass carries a role, Cirrus owns an instance profile named
//! deterministically from `(cluster name, region, NodeClass uid)` and keeps
//! exactly the spec'd role attached, swapping a drifted role idempotently.
//! Successful reconciles are memoized by uid so repeat reconciles skip the
//! IAM round-trips; the memo is dropped on any cloud error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, info};

use cirrus_cloud::iam::IamApi;
use cirrus_common::crd::Ec2NodeClass;
use cirrus_common::error::ignore_not_found;
use cirrus_common::{
    cluster_tag_key, hash, labels, Error, Result, MANAGED_BY_TAG_KEY, NODE_CLASS_TAG_KEY,
};

use crate::cache::TtlCache;

const PROFILE_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// The deterministic name of the managed profile for a NodeClass
pub fn profile_name(cluster_name: &str, region: &str, uid: &str) -> String {
    format!("{cluster_name}_{:016x}", hash::fnv1a_parts([region, uid]))
}

/// Manages the lifecycle of NodeClass-owned instance profiles
pub struct InstanceProfileProvider {
    iam: Arc<dyn IamApi>,
    region: String,
    cluster_name: String,
    cache: TtlCache<String>,
}

impl InstanceProfileProvider {
    /// Create a provider over the given IAM interface
    pub fn new(
        iam: Arc<dyn IamApi>,
        region: impl Into<String>,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            iam,
            region: region.into(),
            cluster_name: cluster_name.into(),
            cache: TtlCache::new(PROFILE_CACHE_TTL),
        }
    }

    /// Ensure the managed profile exists, is tagged with the cluster tag,
    /// and has exactly the NodeClass's role attached. Returns the profile
    /// name.
    pub async fn create(&self, node_class: &Ec2NodeClass) -> Result<String> {
        let role = node_class.spec.role.as_deref().ok_or_else(|| {
            Error::validation(node_class.name_any(), "node class does not carry a role")
        })?;
        let uid = node_class.uid().ok_or_else(|| {
            Error::internal("instance-profile", "node class has no uid yet")
        })?;
        let name = profile_name(&self.cluster_name, &self.region, &uid);

        if self.cache.get(&uid).is_some() {
            return Ok(name);
        }
        match self.reconcile_profile(node_class, &name, role).await {
            Ok(()) => {
                self.cache.insert(uid, name.clone());
                Ok(name)
            }
            Err(e) => {
                self.cache.invalidate(&uid);
                Err(e)
            }
        }
    }

    async fn reconcile_profile(
        &self,
        node_class: &Ec2NodeClass,
        name: &str,
        role: &str,
    ) -> Result<()> {
        let cluster_tag = cluster_tag_key(&self.cluster_name);
        let tags = BTreeMap::from([
            (cluster_tag.clone(), "owned".to_string()),
            (MANAGED_BY_TAG_KEY.to_string(), self.cluster_name.clone()),
            (NODE_CLASS_TAG_KEY.to_string(), node_class.name_any()),
            (labels::REGION.to_string(), self.region.clone()),
        ]);

        let profile = match self.iam.get_instance_profile(name).await {
            Ok(profile) => {
                if !profile.tags.contains_key(&cluster_tag) {
                    self.iam.tag_instance_profile(name, &tags).await?;
                }
                profile
            }
            Err(e) if e.is_not_found() => {
                info!(profile = name, "creating instance profile");
                self.iam.create_instance_profile(name, &tags).await?
            }
            Err(e) => return Err(e),
        };

        // A profile carries at most one role
        if let Some(attached) = profile.roles.first() {
            if attached == role {
                return Ok(());
            }
            info!(
                profile = name,
                detached = %attached,
                attached = role,
                "swapping instance profile role"
            );
            self.iam
                .remove_role_from_instance_profile(name, attached)
                .await?;
        }
        self.iam.add_role_to_instance_profile(name, role).await?;
        Ok(())
    }

    /// Release the managed profile on NodeClass deletion: detach the role
    /// and delete. Missing profiles are fine; deletion must be idempotent.
    pub async fn delete(&self, node_class: &Ec2NodeClass) -> Result<()> {
        let uid = match node_class.uid() {
            Some(uid) => uid,
            None => return Ok(()),
        };
        let name = profile_name(&self.cluster_name, &self.region, &uid);
        self.cache.invalidate(&uid);

        let profile = match self.iam.get_instance_profile(&name).await {
            Ok(profile) => profile,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        for role in &profile.roles {
            self.iam
                .remove_role_from_instance_profile(&name, role)
                .await?;
        }
        debug!(profile = %name, "deleting instance profile");
        ignore_not_found(self.iam.delete_instance_profile(&name).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_cloud::fake::MemoryIam;
    use cirrus_cloud::iam::InstanceProfile;
    use cirrus_common::crd::{Ec2NodeClassSpec, SelectorTerm};

    fn node_class(role: &str) -> Ec2NodeClass {
        let mut nc = Ec2NodeClass::new(
            "default",
            Ec2NodeClassSpec {
                subnet_selector_terms: vec![SelectorTerm::default()],
                security_group_selector_terms: vec![],
                ami_selector_terms: vec![],
                ami_family: None,
                role: Some(role.to_string()),
                instance_profile: None,
                tags: Default::default(),
                block_device_mappings: vec![],
                metadata_options: None,
                user_data: None,
                kubelet: None,
                instance_store_policy: None,
            },
        );
        nc.metadata.uid = Some("uid-1234".to_string());
        nc
    }

    fn provider(iam: Arc<MemoryIam>) -> InstanceProfileProvider {
        InstanceProfileProvider::new(iam, "us-west-2", "test-cluster")
    }

    #[test]
    fn profile_name_is_stable() {
        assert_eq!(
            profile_name("c", "us-west-2", "uid"),
            profile_name("c", "us-west-2", "uid")
        );
        assert_ne!(
            profile_name("c", "us-west-2", "uid-a"),
            profile_name("c", "us-west-2", "uid-b")
        );
    }

    #[tokio::test]
    async fn creates_profile_with_role_and_tags() {
        let iam = Arc::new(MemoryIam::new());
        let provider = provider(iam.clone());
        let nc = node_class("NodeRole");

        let name = provider.create(&nc).await.unwrap();
        let profile = iam.profile(&name).unwrap();
        assert_eq!(profile.roles, vec!["NodeRole".to_string()]);
        assert_eq!(
            profile.tags.get("kubernetes.io/cluster/test-cluster"),
            Some(&"owned".to_string())
        );
    }

    #[tokio::test]
    async fn swaps_drifted_role() {
        let iam = Arc::new(MemoryIam::new());
        let nc = node_class("R1");
        let name = profile_name("test-cluster", "us-west-2", "uid-1234");
        iam.insert_profile(InstanceProfile {
            name: name.clone(),
            roles: vec!["R2".to_string()],
            tags: BTreeMap::new(),
        });
        let provider = provider(iam.clone());

        provider.create(&nc).await.unwrap();
        let profile = iam.profile(&name).unwrap();
        assert_eq!(profile.roles, vec!["R1".to_string()]);
        // the drifted profile also picked up the cluster tag
        assert!(profile.tags.contains_key("kubernetes.io/cluster/test-cluster"));

        // idempotent on repeat
        provider.create(&nc).await.unwrap();
        assert_eq!(iam.profile(&name).unwrap().roles, vec!["R1".to_string()]);
    }

    #[tokio::test]
    async fn delete_detaches_and_removes() {
        let iam = Arc::new(MemoryIam::new());
        let provider = provider(iam.clone());
        let nc = node_class("NodeRole");

        let name = provider.create(&nc).await.unwrap();
        assert!(iam.profile(&name).is_some());

        provider.delete(&nc).await.unwrap();
        assert!(iam.profile(&name).is_none());

        // deleting again is a no-op
        provider.delete(&nc).await.unwrap();
    }
}
