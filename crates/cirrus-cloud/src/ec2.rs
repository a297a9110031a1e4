//! EC2 capability interface
//!
//! Request and response types are owned by this crate; implementations map
//! them onto the wire API. The filter vocabulary follows the EC2 filter
//! names so that server-side filtering remains possible.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cirrus_common::Result;

/// A name/values filter, matching the EC2 filter model
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    /// Filter name, e.g. "subnet-id", "tag-key", "tag:team"
    pub name: String,
    /// Values OR'd together
    pub values: Vec<String>,
}

impl Filter {
    /// Convenience constructor
    pub fn new(name: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Filter {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// CPU architecture of an instance type or image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    /// x86_64 / amd64
    X86_64,
    /// arm64 (Graviton)
    Arm64,
}

impl Architecture {
    /// The Kubernetes arch label value
    pub fn kube_label(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }
}

/// A GPU device on an instance type
#[derive(Clone, Debug, PartialEq)]
pub struct GpuDeviceInfo {
    /// Device name, e.g. "T4"
    pub name: String,
    /// Manufacturer, e.g. "NVIDIA", "AMD", "Habana"
    pub manufacturer: String,
    /// Number of devices
    pub count: i64,
    /// Per-device memory in MiB
    pub memory_mib: i64,
}

/// An inference accelerator on an instance type
#[derive(Clone, Debug, PartialEq)]
pub struct AcceleratorInfo {
    /// Device name, e.g. "Inferentia"
    pub name: String,
    /// Manufacturer, e.g. "AWS"
    pub manufacturer: String,
    /// Number of devices
    pub count: i64,
}

/// Local instance-store description
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceStorageInfo {
    /// Total store size in decimal GB
    pub total_size_gb: i64,
    /// Whether the store volumes are NVMe
    pub nvme_supported: bool,
}

/// Network capabilities of an instance type
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkInfo {
    /// Maximum ENIs on the default network card
    pub maximum_network_interfaces: i64,
    /// IPv4 addresses per ENI
    pub ipv4_addresses_per_interface: i64,
    /// Maximum EFA interfaces, 0 when unsupported
    pub efa_maximum_interfaces: i64,
    /// Whether in-transit encryption is supported
    pub encryption_in_transit_supported: bool,
}

/// EBS capabilities of an instance type
#[derive(Clone, Debug, PartialEq)]
pub struct EbsInfo {
    /// Maximum EBS bandwidth in Mbps
    pub maximum_bandwidth_mbps: i64,
    /// Whether the type is EBS-optimized by default
    pub optimized_by_default: bool,
}

/// Raw description of an EC2 instance type
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceTypeInfo {
    /// Type name, e.g. "m5.large"
    pub name: String,
    /// Default vCPU count
    pub vcpus: i64,
    /// Advertised memory in MiB
    pub memory_mib: i64,
    /// Supported architecture (first supported one)
    pub architecture: Architecture,
    /// Hypervisor: "nitro" or "xen"
    pub hypervisor: String,
    /// Bare-metal types carry a "metal" size
    pub bare_metal: bool,
    /// Usage classes the type can launch with ("spot", "on-demand")
    pub supported_usage_classes: Vec<String>,
    /// CPU manufacturer as reported ("Intel", "AMD", "AWS")
    pub cpu_manufacturer: Option<String>,
    /// GPU devices
    pub gpus: Vec<GpuDeviceInfo>,
    /// Inference accelerators
    pub accelerators: Vec<AcceleratorInfo>,
    /// Local instance store, if any
    pub instance_storage: Option<InstanceStorageInfo>,
    /// Network capabilities
    pub network: NetworkInfo,
    /// EBS capabilities
    pub ebs: Option<EbsInfo>,
}

/// A subnet as reported by DescribeSubnets
#[derive(Clone, Debug, PartialEq)]
pub struct Subnet {
    /// Subnet id
    pub subnet_id: String,
    /// Availability zone name
    pub availability_zone: String,
    /// Availability zone id
    pub availability_zone_id: String,
    /// Currently free IPv4 addresses
    pub available_ip_address_count: i64,
    /// Subnet tags
    pub tags: BTreeMap<String, String>,
}

/// A security group as reported by DescribeSecurityGroups
#[derive(Clone, Debug, PartialEq)]
pub struct SecurityGroup {
    /// Group id
    pub group_id: String,
    /// Group name
    pub group_name: String,
    /// Group tags
    pub tags: BTreeMap<String, String>,
}

/// An AMI as reported by DescribeImages
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    /// Image id
    pub image_id: String,
    /// Image name
    pub name: String,
    /// CPU architecture
    pub architecture: Architecture,
    /// RFC 3339 creation date
    pub creation_date: String,
    /// Image tags
    pub tags: BTreeMap<String, String>,
}

/// A launch template reference
#[derive(Clone, Debug, PartialEq)]
pub struct LaunchTemplate {
    /// Template name
    pub name: String,
    /// Template id
    pub id: String,
    /// Template tags
    pub tags: BTreeMap<String, String>,
}

/// Block device entry of a launch template
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaunchTemplateBlockDevice {
    /// Device name
    pub device_name: Option<String>,
    /// Volume size in GiB
    pub volume_size_gib: Option<i64>,
    /// Volume type
    pub volume_type: Option<String>,
    /// Provisioned IOPS
    pub iops: Option<i64>,
    /// Provisioned throughput
    pub throughput: Option<i64>,
    /// Encrypted flag
    pub encrypted: Option<bool>,
    /// Delete on termination flag
    pub delete_on_termination: Option<bool>,
    /// KMS key
    pub kms_key_id: Option<String>,
    /// Source snapshot
    pub snapshot_id: Option<String>,
}

/// Metadata options of a launch template
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaunchTemplateMetadataOptions {
    /// "enabled" / "disabled"
    pub http_endpoint: Option<String>,
    /// "enabled" / "disabled"
    pub http_protocol_ipv6: Option<String>,
    /// Hop limit
    pub http_put_response_hop_limit: Option<i64>,
    /// "required" / "optional"
    pub http_tokens: Option<String>,
}

/// Request to create a launch template
#[derive(Clone, Debug, PartialEq)]
pub struct CreateLaunchTemplateRequest {
    /// Template name; must be unique in the region
    pub name: String,
    /// Image to launch
    pub image_id: String,
    /// Base64-encoded user data
    pub user_data: Option<String>,
    /// Instance profile name
    pub instance_profile_name: Option<String>,
    /// Security group ids
    pub security_group_ids: Vec<String>,
    /// Metadata options
    pub metadata_options: LaunchTemplateMetadataOptions,
    /// Block device mappings
    pub block_device_mappings: Vec<LaunchTemplateBlockDevice>,
    /// Tags applied to the template itself
    pub tags: BTreeMap<String, String>,
}

/// An override of a fleet launch-template config: one candidate
/// (instance type, subnet) pair
#[derive(Clone, Debug, PartialEq)]
pub struct FleetOverride {
    /// Instance type name
    pub instance_type: String,
    /// Subnet to launch into
    pub subnet_id: String,
    /// The subnet's zone; redundant with the subnet but spares a lookup
    /// when parsing per-override capacity errors
    pub availability_zone: String,
}

/// One launch-template config of a fleet request
#[derive(Clone, Debug, PartialEq)]
pub struct FleetLaunchTemplateConfig {
    /// Template name
    pub launch_template_name: String,
    /// Template version; "$Latest" unless pinned
    pub version: String,
    /// Candidate overrides
    pub overrides: Vec<FleetOverride>,
}

/// Capacity type requested from the fleet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FleetCapacityType {
    /// Spot capacity
    Spot,
    /// On-demand capacity
    OnDemand,
}

/// How the fleet picks among the overrides
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Balance price against interruption likelihood; spot launches
    PriceCapacityOptimized,
    /// Cheapest override first; on-demand launches
    LowestPrice,
}

/// Request to create an instant fleet
#[derive(Clone, Debug, PartialEq)]
pub struct CreateFleetRequest {
    /// Launch template configs with their overrides
    pub launch_template_configs: Vec<FleetLaunchTemplateConfig>,
    /// Default capacity type
    pub capacity_type: FleetCapacityType,
    /// Allocation strategy over the overrides
    pub allocation_strategy: AllocationStrategy,
    /// Total instances to launch
    pub total_target_capacity: i64,
    /// Tags applied to instances, volumes, and the fleet itself
    pub tags: BTreeMap<String, String>,
}

/// A per-override error returned by CreateFleet
#[derive(Clone, Debug, PartialEq)]
pub struct FleetError {
    /// Stable error code, e.g. "InsufficientInstanceCapacity"
    pub code: String,
    /// Error message
    pub message: String,
    /// The override the error applies to, when the service reports one
    pub launch_template_override: Option<FleetOverride>,
}

/// Response of CreateFleet
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateFleetResponse {
    /// Ids of launched instances; empty when nothing launched
    pub instance_ids: Vec<String>,
    /// Per-override errors; may be non-empty even on success
    pub errors: Vec<FleetError>,
}

/// An EC2 instance
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    /// Instance id
    pub instance_id: String,
    /// Instance type name
    pub instance_type: String,
    /// Availability zone
    pub availability_zone: String,
    /// Private DNS name; unset until EC2 propagates it
    pub private_dns_name: Option<String>,
    /// Image the instance launched from
    pub image_id: String,
    /// True for spot instances
    pub spot: bool,
    /// Instance state name ("pending", "running", ...)
    pub state: String,
    /// Launch time
    pub launch_time: DateTime<Utc>,
    /// Instance tags
    pub tags: BTreeMap<String, String>,
}

/// Interface to the EC2 control plane
///
/// Implementations preserve the service's stable error codes in
/// `Error::CloudApi` and apply pagination internally.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Describe all instance types with hvm virtualization and an
    /// x86_64/arm64 architecture
    async fn describe_instance_types(&self) -> Result<Vec<InstanceTypeInfo>>;

    /// Describe per-zone offerings: instance type name to the set of zones
    /// offering it
    async fn describe_instance_type_offerings(&self)
        -> Result<BTreeMap<String, BTreeSet<String>>>;

    /// List subnets matching the filters
    async fn describe_subnets(&self, filters: &[Filter]) -> Result<Vec<Subnet>>;

    /// List security groups matching the filters
    async fn describe_security_groups(&self, filters: &[Filter]) -> Result<Vec<SecurityGroup>>;

    /// List images matching the filters, scoped to the given owners when
    /// non-empty
    async fn describe_images(&self, filters: &[Filter], owners: &[String]) -> Result<Vec<Image>>;

    /// Create a launch template
    async fn create_launch_template(
        &self,
        request: CreateLaunchTemplateRequest,
    ) -> Result<LaunchTemplate>;

    /// List launch templates matching the filters. A "launch-template-name"
    /// filter matches exact names; "tag:<key>" filters match template tags.
    async fn describe_launch_templates(&self, filters: &[Filter]) -> Result<Vec<LaunchTemplate>>;

    /// Delete a launch template by name
    async fn delete_launch_template(&self, name: &str) -> Result<()>;

    /// Create an instant fleet
    async fn create_fleet(&self, request: CreateFleetRequest) -> Result<CreateFleetResponse>;

    /// List instances matching the filters
    async fn describe_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>>;

    /// Terminate the given instances
    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()>;

    /// Create or overwrite tags on the given resources
    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Instance states the controllers consider live
pub const LIVE_INSTANCE_STATES: &[&str] =
    &["pending", "running", "stopping", "stopped", "shutting-down"];
