//! Launch-template lifecycle
//!
//! A NodeClass needs one launch template per AMI variant actually in play
//! for a launch (GPU types boot a different image than plain types).
//! Templates are named from a content hash over everything that shapes
//! them, ensured in EC2 on demand, and cached with a TTL. The fleet API's
//! "template not found" invalidates the cache entry so the next attempt
//! recreates it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use kube::ResourceExt;
use tracing::{debug, info};

use cirrus_cloud::ec2::{
    CreateLaunchTemplateRequest, Ec2Api, Filter, LaunchTemplateBlockDevice,
    LaunchTemplateMetadataOptions,
};
use cirrus_common::crd::{Ec2NodeClass, MetadataOptions};
use cirrus_common::error::ignore_not_found;
use cirrus_common::{
    cluster_tag_key, hash, Error, Result, MANAGED_BY_TAG_KEY, NODE_CLASS_TAG_KEY,
};

use crate::cache::TtlCache;
use crate::instance_type::{CapacityType, InstanceType};

const TEMPLATE_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// A launch template resolved for a subset of the candidate instance types
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedLaunchTemplate {
    /// Template name in EC2
    pub name: String,
    /// The image the template boots
    pub image_id: String,
    /// Names of the candidate types this template covers
    pub instance_type_names: Vec<String>,
}

/// Ensures launch templates exist for each required AMI bucket
pub struct LaunchTemplateProvider {
    ec2: Arc<dyn Ec2Api>,
    cluster_name: String,
    cache: TtlCache<()>,
}

impl LaunchTemplateProvider {
    /// Create a provider over the given EC2 interface
    pub fn new(ec2: Arc<dyn Ec2Api>, cluster_name: impl Into<String>) -> Self {
        Self {
            ec2,
            cluster_name: cluster_name.into(),
            cache: TtlCache::new(TEMPLATE_CACHE_TTL),
        }
    }

    /// Ensure one template per AMI bucket of the candidate types. Instance
    /// types with no compatible resolved AMI are dropped from the launch.
    pub async fn ensure_all(
        &self,
        node_class: &Ec2NodeClass,
        capacity_type: CapacityType,
        instance_types: &[InstanceType],
    ) -> Result<Vec<ResolvedLaunchTemplate>> {
        let status = node_class.status.as_ref().ok_or_else(|| {
            Error::internal("launch-template", "node class status not yet resolved")
        })?;
        if status.amis.is_empty() {
            return Err(Error::internal(
                "launch-template",
                format!("no AMIs resolved for node class {}", node_class.name_any()),
            ));
        }
        let security_group_ids: Vec<String> =
            status.security_groups.iter().map(|g| g.id.clone()).collect();
        if security_group_ids.is_empty() {
            return Err(Error::internal(
                "launch-template",
                format!(
                    "no security groups resolved for node class {}",
                    node_class.name_any()
                ),
            ));
        }
        let instance_profile = status.instance_profile.clone().ok_or_else(|| {
            Error::internal(
                "launch-template",
                format!(
                    "no instance profile resolved for node class {}",
                    node_class.name_any()
                ),
            )
        })?;

        // Bucket candidates by the first resolved AMI they can boot;
        // resolution order encodes AMI preference
        let mut buckets: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for it in instance_types {
            if let Some(ami) = status
                .amis
                .iter()
                .find(|ami| it.requirements.compatible_with(&ami.requirements))
            {
                buckets.entry(ami.id.clone()).or_default().push(it.name.clone());
            }
        }

        let mut resolved = Vec::new();
        for (image_id, instance_type_names) in buckets {
            let name = self.template_name(node_class, &image_id, capacity_type, &security_group_ids, &instance_profile);
            if self.cache.get(&name).is_none() {
                self.ensure_template(node_class, &name, &image_id, &security_group_ids, &instance_profile)
                    .await?;
                self.cache.insert(name.clone(), ());
            }
            resolved.push(ResolvedLaunchTemplate {
                name,
                image_id,
                instance_type_names,
            });
        }
        Ok(resolved)
    }

    /// Deterministic template name from the content that shapes it
    fn template_name(
        &self,
        node_class: &Ec2NodeClass,
        image_id: &str,
        capacity_type: CapacityType,
        security_group_ids: &[String],
        instance_profile: &str,
    ) -> String {
        let spec = &node_class.spec;
        let security_groups = security_group_ids.join(",");
        let metadata = format!("{:?}", spec.metadata_options);
        let block_devices = format!("{:?}", node_class.effective_block_device_mappings());
        let kubelet = format!("{:?}", spec.kubelet);
        let tags = format!("{:?}", spec.tags);
        let content_hash = hash::fnv1a_parts([
            image_id,
            capacity_type.label(),
            instance_profile,
            security_groups.as_str(),
            spec.user_data.as_deref().unwrap_or(""),
            metadata.as_str(),
            block_devices.as_str(),
            kubelet.as_str(),
            tags.as_str(),
        ]);
        format!("cirrus-{}-{content_hash:016x}", self.cluster_name)
    }

    async fn ensure_template(
        &self,
        node_class: &Ec2NodeClass,
        name: &str,
        image_id: &str,
        security_group_ids: &[String],
        instance_profile: &str,
    ) -> Result<()> {
        let existing = self
            .ec2
            .describe_launch_templates(&[Filter::new("launch-template-name", [name])])
            .await?;
        if !existing.is_empty() {
            return Ok(());
        }

        let metadata = node_class.spec.metadata_options.clone().unwrap_or_default();
        let request = CreateLaunchTemplateRequest {
            name: name.to_string(),
            image_id: image_id.to_string(),
            user_data: node_class
                .spec
                .user_data
                .as_ref()
                .map(|d| base64::engine::general_purpose::STANDARD.encode(d)),
            instance_profile_name: Some(instance_profile.to_string()),
            security_group_ids: security_group_ids.to_vec(),
            metadata_options: to_template_metadata(&metadata),
            block_device_mappings: node_class
                .effective_block_device_mappings()
                .iter()
                .map(|m| LaunchTemplateBlockDevice {
                    device_name: m.device_name.clone(),
                    volume_size_gib: m.ebs.as_ref().and_then(|e| e.volume_size_gib),
                    volume_type: m.ebs.as_ref().and_then(|e| e.volume_type.clone()),
                    iops: m.ebs.as_ref().and_then(|e| e.iops),
                    throughput: m.ebs.as_ref().and_then(|e| e.throughput),
                    encrypted: m.ebs.as_ref().and_then(|e| e.encrypted),
                    delete_on_termination: m.ebs.as_ref().and_then(|e| e.delete_on_termination),
                    kms_key_id: m.ebs.as_ref().and_then(|e| e.kms_key_id.clone()),
                    snapshot_id: m.ebs.as_ref().and_then(|e| e.snapshot_id.clone()),
                })
                .collect(),
            tags: BTreeMap::from([
                (cluster_tag_key(&self.cluster_name), "owned".to_string()),
                (MANAGED_BY_TAG_KEY.to_string(), self.cluster_name.clone()),
                (NODE_CLASS_TAG_KEY.to_string(), node_class.name_any()),
            ]),
        };
        info!(template = name, image = image_id, "creating launch template");
        self.ec2.create_launch_template(request).await?;
        Ok(())
    }

    /// Drop a template from the cache after the fleet API reported it
    /// missing; the next ensure recreates it
    pub fn invalidate(&self, name: &str) {
        debug!(template = name, "invalidating cached launch template");
        self.cache.invalidate(name);
    }

    /// Delete every template owned by the NodeClass; called under the
    /// termination finalizer
    pub async fn delete_all(&self, node_class: &Ec2NodeClass) -> Result<()> {
        let templates = self
            .ec2
            .describe_launch_templates(&[Filter::new(
                format!("tag:{NODE_CLASS_TAG_KEY}"),
                [node_class.name_any()],
            )])
            .await?;
        for template in templates {
            info!(template = %template.name, "deleting launch template");
            ignore_not_found(self.ec2.delete_launch_template(&template.name).await)?;
            self.cache.invalidate(&template.name);
        }
        Ok(())
    }
}

fn to_template_metadata(options: &MetadataOptions) -> LaunchTemplateMetadataOptions {
    LaunchTemplateMetadataOptions {
        http_endpoint: options.http_endpoint.clone(),
        http_protocol_ipv6: options.http_protocol_ipv6.clone(),
        http_put_response_hop_limit: options.http_put_response_hop_limit,
        http_tokens: options.http_tokens.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_type::Offering;
    use cirrus_cloud::fake::MemoryEc2;
    use cirrus_common::crd::{
        AmiSelectorTerm, Ec2NodeClassSpec, Ec2NodeClassStatus, ResolvedAmi, ResolvedSecurityGroup,
        SelectorTerm,
    };
    use cirrus_common::labels;
    use cirrus_common::scheduling::{Requirement, Requirements};

    fn instance_type(name: &str, gpu: bool) -> InstanceType {
        let mut requirements = Requirements::new();
        requirements.insert_value(labels::INSTANCE_TYPE, name);
        requirements.insert_value(labels::ARCH, "amd64");
        if gpu {
            requirements.insert_value(labels::INSTANCE_GPU_COUNT, "1");
        }
        InstanceType {
            name: name.to_string(),
            requirements,
            offerings: vec![Offering {
                zone: "us-west-2a".to_string(),
                zone_id: None,
                capacity_type: CapacityType::OnDemand,
                price: 0.1,
                available: true,
            }],
            capacity: Default::default(),
            overhead: Default::default(),
        }
    }

    fn node_class() -> Ec2NodeClass {
        let mut nc = Ec2NodeClass::new(
            "default",
            Ec2NodeClassSpec {
                subnet_selector_terms: vec![SelectorTerm::default()],
                security_group_selector_terms: vec![],
                ami_selector_terms: vec![AmiSelectorTerm {
                    alias: Some("al2023@latest".to_string()),
                    ..Default::default()
                }],
                ami_family: None,
                role: Some("role".to_string()),
                instance_profile: None,
                tags: Default::default(),
                block_device_mappings: vec![],
                metadata_options: None,
                user_data: Some("#!/bin/bash\necho hello".to_string()),
                kubelet: None,
                instance_store_policy: None,
            },
        );
        nc.status = Some(Ec2NodeClassStatus {
            subnets: vec![],
            security_groups: vec![ResolvedSecurityGroup {
                id: "sg-1".to_string(),
                name: "nodes".to_string(),
            }],
            amis: vec![
                ResolvedAmi {
                    id: "ami-standard".to_string(),
                    name: "standard".to_string(),
                    requirements: vec![
                        Requirement::new_in(labels::ARCH, ["amd64"]),
                        Requirement::does_not_exist(labels::INSTANCE_GPU_COUNT),
                    ],
                },
                ResolvedAmi {
                    id: "ami-gpu".to_string(),
                    name: "gpu".to_string(),
                    requirements: vec![
                        Requirement::new_in(labels::ARCH, ["amd64"]),
                        Requirement::exists(labels::INSTANCE_GPU_COUNT),
                    ],
                },
            ],
            instance_profile: Some("profile-1".to_string()),
            conditions: vec![],
        });
        nc
    }

    #[tokio::test]
    async fn buckets_types_by_ami_variant() {
        let ec2 = Arc::new(MemoryEc2::new());
        let provider = LaunchTemplateProvider::new(ec2.clone(), "test-cluster");
        let nc = node_class();
        let types = vec![
            instance_type("m5.large", false),
            instance_type("g4dn.xlarge", true),
        ];

        let resolved = provider
            .ensure_all(&nc, CapacityType::OnDemand, &types)
            .await
            .unwrap();
        assert_eq!(resolved.len(), 2);

        let standard = resolved.iter().find(|r| r.image_id == "ami-standard").unwrap();
        assert_eq!(standard.instance_type_names, vec!["m5.large".to_string()]);
        let gpu = resolved.iter().find(|r| r.image_id == "ami-gpu").unwrap();
        assert_eq!(gpu.instance_type_names, vec!["g4dn.xlarge".to_string()]);

        // both templates exist in EC2 now
        assert_eq!(ec2.launch_template_names().len(), 2);
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let ec2 = Arc::new(MemoryEc2::new());
        let provider = LaunchTemplateProvider::new(ec2.clone(), "test-cluster");
        let nc = node_class();
        let types = vec![instance_type("m5.large", false)];

        let first = provider
            .ensure_all(&nc, CapacityType::OnDemand, &types)
            .await
            .unwrap();
        let second = provider
            .ensure_all(&nc, CapacityType::OnDemand, &types)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(ec2.launch_template_names().len(), 1);
    }

    #[tokio::test]
    async fn capacity_type_changes_template_name() {
        let ec2 = Arc::new(MemoryEc2::new());
        let provider = LaunchTemplateProvider::new(ec2.clone(), "test-cluster");
        let nc = node_class();
        let types = vec![instance_type("m5.large", false)];

        let od = provider
            .ensure_all(&nc, CapacityType::OnDemand, &types)
            .await
            .unwrap();
        let spot = provider
            .ensure_all(&nc, CapacityType::Spot, &types)
            .await
            .unwrap();
        assert_ne!(od[0].name, spot[0].name);
    }

    #[tokio::test]
    async fn delete_all_removes_owned_templates() {
        let ec2 = Arc::new(MemoryEc2::new());
        let provider = LaunchTemplateProvider::new(ec2.clone(), "test-cluster");
        let nc = node_class();
        provider
            .ensure_all(&nc, CapacityType::OnDemand, &[instance_type("m5.large", false)])
            .await
            .unwrap();
        assert_eq!(ec2.launch_template_names().len(), 1);

        provider.delete_all(&nc).await.unwrap();
        assert!(ec2.launch_template_names().is_empty());
    }

    #[tokio::test]
    async fn types_without_compatible_ami_are_dropped() {
        let ec2 = Arc::new(MemoryEc2::new());
        let provider = LaunchTemplateProvider::new(ec2, "test-cluster");
        let mut nc = node_class();
        // only the GPU image remains
        nc.status.as_mut().unwrap().amis.retain(|a| a.id == "ami-gpu");

        let resolved = provider
            .ensure_all(&nc, CapacityType::OnDemand, &[instance_type("m5.large", false)])
            .await
            .unwrap();
        assert!(resolved.is_empty());
    }
}
