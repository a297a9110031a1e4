//! Ec2NodeClass Custom Resource Definition
//!
//! An Ec2NodeClass is an operator-authored template binding
//! scheduling-agnostic settings (selectors, tags, user data) to EC2. The
//! status subresource carries the resolved subnets, security groups, AMIs
//! and instance profile that the launch pipeline consumes.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus};
use crate::scheduling::Requirement;
use crate::Error;

/// Selector term for subnets and security groups
///
/// Terms are evaluated as a disjunction; the fields within one term combine
/// conjunctively. A term carrying `id` may not carry any other field.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorTerm {
    /// Select by resource id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Select by resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Select by tags; a value of "*" matches any value for the key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Selector term for AMIs; adds `alias` and `owner` to the common fields
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AmiSelectorTerm {
    /// Select the distribution-maintained AMI for a family, e.g.
    /// "al2023@latest" or "bottlerocket@v1.20.0". Exclusive with all other
    /// fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Select by image id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Select by image name (supports wildcards, e.g. "my-ami-*")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Select by image owner account id or alias (e.g. "amazon")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Select by tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// A parsed AMI alias, e.g. "al2023@latest"
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmiAlias {
    /// The AMI family the alias names
    pub family: AmiFamily,
    /// Version selector; "latest" floats to the newest image
    pub version: String,
}

impl AmiAlias {
    /// Parse an alias of the form `<family>@<version>`
    pub fn parse(alias: &str) -> Option<AmiAlias> {
        let (family, version) = alias.split_once('@')?;
        let family = match family {
            "al2" => AmiFamily::Al2,
            "al2023" => AmiFamily::Al2023,
            "bottlerocket" => AmiFamily::Bottlerocket,
            "ubuntu" => AmiFamily::Ubuntu,
            "windows" => AmiFamily::Windows,
            _ => return None,
        };
        if version.is_empty() {
            return None;
        }
        Some(AmiAlias {
            family,
            version: version.to_string(),
        })
    }
}

/// Operating-system family of the AMIs a NodeClass launches
///
/// Capability differences between families are expressed as flags on
/// [`AmiFamilyFeatures`] rather than per-family code paths.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AmiFamily {
    /// Amazon Linux 2
    #[serde(rename = "AL2")]
    Al2,
    /// Amazon Linux 2023
    #[serde(rename = "AL2023")]
    Al2023,
    /// Bottlerocket
    Bottlerocket,
    /// Ubuntu EKS images
    Ubuntu,
    /// Windows Server
    Windows,
    /// User-supplied images; no assumptions about the OS configuration
    Custom,
}

/// Capability flags for an AMI family
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AmiFamilyFeatures {
    /// The family's CNI computes pod density from ENI limits
    pub supports_eni_limited_pod_density: bool,
    /// The kubelet honors podsPerCore on this family
    pub pods_per_core_enabled: bool,
    /// kube-reserved memory is computed from the ENI-limited pod count even
    /// when maxPods overrides the density
    pub uses_eni_limited_memory_overhead: bool,
    /// The kubelet honors soft eviction thresholds on this family
    pub eviction_soft_enabled: bool,
}

impl AmiFamily {
    /// The family's capability flags
    pub fn features(&self) -> AmiFamilyFeatures {
        match self {
            AmiFamily::Al2 | AmiFamily::Al2023 | AmiFamily::Ubuntu => AmiFamilyFeatures {
                supports_eni_limited_pod_density: true,
                pods_per_core_enabled: true,
                uses_eni_limited_memory_overhead: false,
                eviction_soft_enabled: true,
            },
            AmiFamily::Bottlerocket => AmiFamilyFeatures {
                supports_eni_limited_pod_density: true,
                pods_per_core_enabled: false,
                uses_eni_limited_memory_overhead: true,
                eviction_soft_enabled: false,
            },
            AmiFamily::Windows => AmiFamilyFeatures {
                supports_eni_limited_pod_density: false,
                pods_per_core_enabled: false,
                uses_eni_limited_memory_overhead: false,
                eviction_soft_enabled: false,
            },
            AmiFamily::Custom => AmiFamilyFeatures {
                supports_eni_limited_pod_density: false,
                pods_per_core_enabled: true,
                uses_eni_limited_memory_overhead: false,
                eviction_soft_enabled: true,
            },
        }
    }

    /// The device name the family's images use for the root volume
    pub fn ephemeral_block_device(&self) -> &'static str {
        match self {
            AmiFamily::Al2 | AmiFamily::Al2023 | AmiFamily::Windows => "/dev/xvda",
            AmiFamily::Bottlerocket => "/dev/xvdb",
            AmiFamily::Ubuntu | AmiFamily::Custom => "/dev/sda1",
        }
    }

    /// Default volume size in GiB when no mapping is supplied
    pub const DEFAULT_VOLUME_SIZE_GIB: i64 = 20;

    /// The block-device mappings applied when the spec carries none
    pub fn default_block_device_mappings(&self) -> Vec<BlockDeviceMapping> {
        let default_volume = |device: &str, size: i64| BlockDeviceMapping {
            device_name: Some(device.to_string()),
            root_volume: false,
            ebs: Some(BlockDevice {
                volume_size_gib: Some(size),
                volume_type: Some("gp3".to_string()),
                encrypted: Some(true),
                delete_on_termination: Some(true),
                ..Default::default()
            }),
        };
        match self {
            // Bottlerocket splits a small boot volume from the data volume
            AmiFamily::Bottlerocket => vec![
                default_volume("/dev/xvda", 4),
                default_volume("/dev/xvdb", Self::DEFAULT_VOLUME_SIZE_GIB),
            ],
            family => vec![default_volume(
                family.ephemeral_block_device(),
                Self::DEFAULT_VOLUME_SIZE_GIB,
            )],
        }
    }
}

/// EBS parameters of a block-device mapping
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDevice {
    /// Whether the volume is deleted on instance termination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_on_termination: Option<bool>,
    /// Whether the volume is encrypted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
    /// Provisioned IOPS, io1/io2/gp3 only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,
    /// KMS key for encryption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
    /// Snapshot to create the volume from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Provisioned throughput in MiB/s, gp3 only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<i64>,
    /// Volume size in GiB, within [1, 65536]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size_gib: Option<i64>,
    /// Volume type (gp2, gp3, io1, io2, st1, sc1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
}

/// A block-device mapping on launched instances
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceMapping {
    /// Device name, e.g. "/dev/xvda"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Marks the mapping whose size backs the node's ephemeral storage
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub root_volume: bool,
    /// EBS parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ebs: Option<BlockDevice>,
}

/// Instance metadata service options
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataOptions {
    /// "enabled" or "disabled"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_endpoint: Option<String>,
    /// "enabled" or "disabled"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_protocol_ipv6: Option<String>,
    /// PUT response hop limit, within [1, 64]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_put_response_hop_limit: Option<i64>,
    /// "required" (IMDSv2) or "optional"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_tokens: Option<String>,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            http_endpoint: Some("enabled".to_string()),
            http_protocol_ipv6: Some("disabled".to_string()),
            http_put_response_hop_limit: Some(2),
            http_tokens: Some("required".to_string()),
        }
    }
}

/// Kubelet configuration passed through to launched nodes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfiguration {
    /// Maximum pods per node; overrides ENI-limited density
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pods: Option<i32>,
    /// Pods per vCPU core; 0 disables the clamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_per_core: Option<i32>,
    /// Resources reserved for Kubernetes system daemons
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kube_reserved: BTreeMap<String, String>,
    /// Resources reserved for OS system daemons
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub system_reserved: BTreeMap<String, String>,
    /// Hard eviction thresholds, e.g. memory.available: "100Mi"
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub eviction_hard: BTreeMap<String, String>,
    /// Soft eviction thresholds
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub eviction_soft: BTreeMap<String, String>,
    /// Cluster DNS addresses handed to the kubelet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_dns: Vec<String>,
}

/// How local instance-store volumes are used
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstanceStorePolicy {
    /// Join NVMe store volumes into a RAID0 array backing ephemeral storage
    #[serde(rename = "RAID0")]
    Raid0,
}

/// Specification for an Ec2NodeClass
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cirrus.sh",
    version = "v1",
    kind = "Ec2NodeClass",
    plural = "ec2nodeclasses",
    shortname = "enc",
    status = "Ec2NodeClassStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.role"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct Ec2NodeClassSpec {
    /// Subnet discovery terms, OR'd together
    pub subnet_selector_terms: Vec<SelectorTerm>,

    /// Security-group discovery terms, OR'd together
    pub security_group_selector_terms: Vec<SelectorTerm>,

    /// AMI discovery terms, OR'd together
    pub ami_selector_terms: Vec<AmiSelectorTerm>,

    /// AMI family; derived from the alias term when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami_family: Option<AmiFamily>,

    /// IAM role for the managed instance profile. Exactly one of `role` and
    /// `instanceProfile` must be set; `role` is immutable once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Pre-existing instance profile to launch with, unmanaged by Cirrus
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_profile: Option<String>,

    /// Tags applied to every launched instance and derived resource
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// Block-device mappings; the family defaults apply when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_device_mappings: Vec<BlockDeviceMapping>,

    /// Instance metadata service options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_options: Option<MetadataOptions>,

    /// User data prepended to the node bootstrap, passed through verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,

    /// Kubelet configuration for launched nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet: Option<KubeletConfiguration>,

    /// Local instance-store volume policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_store_policy: Option<InstanceStorePolicy>,
}

/// A resolved subnet recorded on the status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSubnet {
    /// Subnet id
    pub id: String,
    /// Availability zone name
    pub zone: String,
    /// Availability zone id, stable across accounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
}

/// A resolved security group recorded on the status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSecurityGroup {
    /// Security group id
    pub id: String,
    /// Security group name
    pub name: String,
}

/// A resolved AMI recorded on the status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAmi {
    /// Image id
    pub id: String,
    /// Image name
    pub name: String,
    /// Requirements an instance type must satisfy to use this image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
}

/// Status for an Ec2NodeClass
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ec2NodeClassStatus {
    /// Resolved subnets, largest free-IP count first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<ResolvedSubnet>,

    /// Resolved security groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<ResolvedSecurityGroup>,

    /// Resolved AMIs, newest per variant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub amis: Vec<ResolvedAmi>,

    /// The instance profile launched instances use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_profile: Option<String>,

    /// Conditions representing the resolution state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Ec2NodeClassStatus {
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

impl Ec2NodeClass {
    /// The effective AMI family: explicit spec field, else the alias term's
    /// family, else Custom
    pub fn ami_family(&self) -> AmiFamily {
        if let Some(family) = self.spec.ami_family {
            return family;
        }
        self.spec
            .ami_selector_terms
            .iter()
            .find_map(|t| t.alias.as_deref().and_then(AmiAlias::parse))
            .map(|a| a.family)
            .unwrap_or(AmiFamily::Custom)
    }

    /// True if Cirrus manages the instance profile (role mode)
    pub fn managed_instance_profile(&self) -> bool {
        self.spec.role.is_some()
    }

    /// The block-device mappings in effect: the spec's, or the family default
    pub fn effective_block_device_mappings(&self) -> Vec<BlockDeviceMapping> {
        if self.spec.block_device_mappings.is_empty() {
            self.ami_family().default_block_device_mappings()
        } else {
            self.spec.block_device_mappings.clone()
        }
    }
}

impl Ec2NodeClassSpec {
    /// Validate the spec, mirroring the admission rules
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        match (&self.role, &self.instance_profile) {
            (Some(_), Some(_)) => {
                return Err(Error::validation(
                    name,
                    "role and instanceProfile are mutually exclusive",
                ));
            }
            (None, None) => {
                return Err(Error::validation(
                    name,
                    "exactly one of role or instanceProfile must be set",
                ));
            }
            _ => {}
        }

        if self.subnet_selector_terms.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.subnetSelectorTerms",
                "at least one term is required",
            ));
        }
        for (i, term) in self.subnet_selector_terms.iter().enumerate() {
            if term.id.is_some() && (term.name.is_some() || !term.tags.is_empty()) {
                return Err(Error::validation_for_field(
                    name,
                    format!("spec.subnetSelectorTerms[{i}]"),
                    "a term with id may not set other fields",
                ));
            }
            if term.id.is_none() && term.name.is_none() && term.tags.is_empty() {
                return Err(Error::validation_for_field(
                    name,
                    format!("spec.subnetSelectorTerms[{i}]"),
                    "empty term",
                ));
            }
        }
        for (i, term) in self.security_group_selector_terms.iter().enumerate() {
            if term.id.is_some() && (term.name.is_some() || !term.tags.is_empty()) {
                return Err(Error::validation_for_field(
                    name,
                    format!("spec.securityGroupSelectorTerms[{i}]"),
                    "a term with id may not set other fields",
                ));
            }
        }
        for (i, term) in self.ami_selector_terms.iter().enumerate() {
            let others = term.id.is_some()
                || term.name.is_some()
                || term.owner.is_some()
                || !term.tags.is_empty();
            if term.alias.is_some() && others {
                return Err(Error::validation_for_field(
                    name,
                    format!("spec.amiSelectorTerms[{i}]"),
                    "a term with alias may not set other fields",
                ));
            }
            if let Some(alias) = &term.alias {
                if AmiAlias::parse(alias).is_none() {
                    return Err(Error::validation_for_field(
                        name,
                        format!("spec.amiSelectorTerms[{i}].alias"),
                        format!("unknown alias {alias:?}"),
                    ));
                }
            }
        }

        let mut root_volumes = 0;
        for (i, mapping) in self.block_device_mappings.iter().enumerate() {
            if mapping.root_volume {
                root_volumes += 1;
            }
            if let Some(size) = mapping.ebs.as_ref().and_then(|e| e.volume_size_gib) {
                // 64 TiB is the EBS maximum
                if !(1..=65536).contains(&size) {
                    return Err(Error::validation_for_field(
                        name,
                        format!("spec.blockDeviceMappings[{i}].ebs.volumeSizeGiB"),
                        "volume size must be within [1 GiB, 64 TiB]",
                    ));
                }
            }
        }
        if root_volumes > 1 {
            return Err(Error::validation_for_field(
                name,
                "spec.blockDeviceMappings",
                "at most one mapping may set rootVolume",
            ));
        }

        if let Some(opts) = &self.metadata_options {
            for (field, value, allowed) in [
                (
                    "httpEndpoint",
                    &opts.http_endpoint,
                    &["enabled", "disabled"][..],
                ),
                (
                    "httpProtocolIPv6",
                    &opts.http_protocol_ipv6,
                    &["enabled", "disabled"][..],
                ),
                (
                    "httpTokens",
                    &opts.http_tokens,
                    &["required", "optional"][..],
                ),
            ] {
                if let Some(v) = value {
                    if !allowed.contains(&v.as_str()) {
                        return Err(Error::validation_for_field(
                            name,
                            format!("spec.metadataOptions.{field}"),
                            format!("must be one of {allowed:?}"),
                        ));
                    }
                }
            }
            if let Some(hops) = opts.http_put_response_hop_limit {
                if !(1..=64).contains(&hops) {
                    return Err(Error::validation_for_field(
                        name,
                        "spec.metadataOptions.httpPutResponseHopLimit",
                        "must be within [1, 64]",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Validate a spec update, mirroring the admission immutability rules:
    /// `role` may not change, and a NodeClass may not switch between managed
    /// and unmanaged instance-profile modes.
    pub fn validate_update(&self, old: &Ec2NodeClassSpec, name: &str) -> Result<(), Error> {
        self.validate(name)?;
        if old.role.is_some() != self.role.is_some() {
            return Err(Error::validation(
                name,
                "cannot switch between role and instanceProfile modes",
            ));
        }
        if old.role.is_some() && old.role != self.role {
            return Err(Error::validation_for_field(
                name,
                "spec.role",
                "role is immutable",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec() -> Ec2NodeClassSpec {
        Ec2NodeClassSpec {
            subnet_selector_terms: vec![SelectorTerm {
                tags: BTreeMap::from([("cirrus-discovery".to_string(), "test".to_string())]),
                ..Default::default()
            }],
            security_group_selector_terms: vec![SelectorTerm {
                tags: BTreeMap::from([("cirrus-discovery".to_string(), "test".to_string())]),
                ..Default::default()
            }],
            ami_selector_terms: vec![AmiSelectorTerm {
                alias: Some("al2023@latest".to_string()),
                ..Default::default()
            }],
            ami_family: None,
            role: Some("CirrusNodeRole".to_string()),
            instance_profile: None,
            tags: BTreeMap::new(),
            block_device_mappings: Vec::new(),
            metadata_options: None,
            user_data: None,
            kubelet: None,
            instance_store_policy: None,
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(minimal_spec().validate("default").is_ok());
    }

    #[test]
    fn role_xor_instance_profile() {
        let mut spec = minimal_spec();
        spec.instance_profile = Some("my-profile".to_string());
        assert!(spec.validate("default").is_err());

        spec.role = None;
        assert!(spec.validate("default").is_ok());

        spec.instance_profile = None;
        assert!(spec.validate("default").is_err());
    }

    #[test]
    fn role_is_immutable() {
        let old = minimal_spec();
        let mut new = minimal_spec();
        new.role = Some("OtherRole".to_string());
        assert!(new.validate_update(&old, "default").is_err());

        // Switching modes entirely is also rejected
        let mut unmanaged = minimal_spec();
        unmanaged.role = None;
        unmanaged.instance_profile = Some("external".to_string());
        assert!(unmanaged.validate_update(&old, "default").is_err());

        // Identical role is fine
        assert!(minimal_spec().validate_update(&old, "default").is_ok());
    }

    #[test]
    fn id_term_forbids_other_fields() {
        let mut spec = minimal_spec();
        spec.subnet_selector_terms = vec![SelectorTerm {
            id: Some("subnet-123".to_string()),
            tags: BTreeMap::from([("a".to_string(), "b".to_string())]),
            ..Default::default()
        }];
        let err = spec.validate("default").unwrap_err();
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn volume_size_bounds() {
        let mut spec = minimal_spec();
        spec.block_device_mappings = vec![BlockDeviceMapping {
            device_name: Some("/dev/xvda".to_string()),
            root_volume: true,
            ebs: Some(BlockDevice {
                volume_size_gib: Some(0),
                ..Default::default()
            }),
        }];
        assert!(spec.validate("default").is_err());

        spec.block_device_mappings[0].ebs.as_mut().unwrap().volume_size_gib = Some(65537);
        assert!(spec.validate("default").is_err());

        spec.block_device_mappings[0].ebs.as_mut().unwrap().volume_size_gib = Some(65536);
        assert!(spec.validate("default").is_ok());
    }

    #[test]
    fn at_most_one_root_volume() {
        let mut spec = minimal_spec();
        let mapping = BlockDeviceMapping {
            device_name: Some("/dev/xvda".to_string()),
            root_volume: true,
            ebs: Some(BlockDevice {
                volume_size_gib: Some(100),
                ..Default::default()
            }),
        };
        spec.block_device_mappings = vec![mapping.clone(), mapping];
        assert!(spec.validate("default").is_err());
    }

    #[test]
    fn metadata_options_enums() {
        let mut spec = minimal_spec();
        spec.metadata_options = Some(MetadataOptions {
            http_tokens: Some("maybe".to_string()),
            ..Default::default()
        });
        assert!(spec.validate("default").is_err());

        spec.metadata_options = Some(MetadataOptions::default());
        assert!(spec.validate("default").is_ok());
    }

    #[test]
    fn alias_parsing() {
        let alias = AmiAlias::parse("al2023@latest").unwrap();
        assert_eq!(alias.family, AmiFamily::Al2023);
        assert_eq!(alias.version, "latest");

        let pinned = AmiAlias::parse("bottlerocket@v1.20.0").unwrap();
        assert_eq!(pinned.family, AmiFamily::Bottlerocket);
        assert_eq!(pinned.version, "v1.20.0");

        assert!(AmiAlias::parse("al2023").is_none());
        assert!(AmiAlias::parse("rhel@latest").is_none());
    }

    #[test]
    fn ami_family_from_alias() {
        let nc = Ec2NodeClass::new("default", minimal_spec());
        assert_eq!(nc.ami_family(), AmiFamily::Al2023);

        let mut custom_spec = minimal_spec();
        custom_spec.ami_selector_terms = vec![AmiSelectorTerm {
            name: Some("my-golden-image-*".to_string()),
            owner: Some("self".to_string()),
            ..Default::default()
        }];
        let nc = Ec2NodeClass::new("custom", custom_spec);
        assert_eq!(nc.ami_family(), AmiFamily::Custom);
    }

    #[test]
    fn bottlerocket_has_two_default_mappings() {
        let mappings = AmiFamily::Bottlerocket.default_block_device_mappings();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[1].device_name.as_deref(), Some("/dev/xvdb"));

        let al2023 = AmiFamily::Al2023.default_block_device_mappings();
        assert_eq!(al2023.len(), 1);
        assert_eq!(
            al2023[0].ebs.as_ref().unwrap().volume_size_gib,
            Some(AmiFamily::DEFAULT_VOLUME_SIZE_GIB)
        );
    }

    #[test]
    fn windows_disables_eni_limited_density() {
        assert!(!AmiFamily::Windows.features().supports_eni_limited_pod_density);
        assert!(AmiFamily::Al2023.features().supports_eni_limited_pod_density);
        assert!(AmiFamily::Bottlerocket.features().uses_eni_limited_memory_overhead);
    }
}
