//! Resolved instance types
//!
//! Joins raw EC2 type descriptions with zonal offerings, prices, AMI-family
//! capabilities and kubelet configuration into the [`InstanceType`] records
//! the launch pipeline consumes. Derived on every catalog resolution; never
//! persisted.

mod provider;

pub use provider::{CatalogOptions, InstanceTypeProvider};

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use cirrus_cloud::ec2::{Architecture, InstanceTypeInfo};
use cirrus_common::crd::{
    AmiFamily, BlockDeviceMapping, InstanceStorePolicy, KubeletConfiguration,
};
use cirrus_common::resources::{self, Quantity, ResourceList, Signal};
use cirrus_common::scheduling::{Requirement, Requirements};
use cirrus_common::labels;

/// Eviction signal key for available memory
const MEMORY_AVAILABLE: &str = "memory.available";
/// Eviction signal key for available node filesystem space
const NODEFS_AVAILABLE: &str = "nodefs.available";

/// Parses category and generation out of an instance type name:
/// "m5.large" -> ("m", "5"), "d3en-6tb24xlarge..." style names included
static INSTANCE_TYPE_SCHEME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-z]+)(-[0-9]+tb)?([0-9]+).*\.").expect("valid regex"));

/// Network bandwidth in megabits for types where the description API does
/// not report a baseline
static NETWORK_BANDWIDTH_MBITS: Lazy<HashMap<&'static str, i64>> = Lazy::new(|| {
    HashMap::from([
        ("t3.medium", 256),
        ("t3.large", 512),
        ("m5.large", 750),
        ("m5.xlarge", 1250),
        ("m5.2xlarge", 2500),
        ("m5.4xlarge", 5000),
        ("m6g.large", 750),
        ("m6g.xlarge", 1250),
        ("m6i.large", 781),
        ("m6i.xlarge", 1562),
        ("m7i.large", 781),
        ("c5.large", 750),
        ("c5.xlarge", 1250),
        ("c6g.large", 750),
        ("c6i.large", 781),
        ("c6i.xlarge", 1562),
        ("c7i.large", 781),
        ("r5.large", 750),
        ("r5.xlarge", 1250),
        ("r6g.large", 750),
        ("g4dn.xlarge", 5000),
        ("g5.xlarge", 2500),
        ("p3.2xlarge", 10000),
        ("inf1.xlarge", 5000),
        ("trn1.2xlarge", 12500),
        ("trn1.32xlarge", 800000),
    ])
});

/// Capacity type of an offering
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CapacityType {
    /// Spot capacity
    Spot,
    /// On-demand capacity
    OnDemand,
}

impl CapacityType {
    /// The label/tag value for this capacity type
    pub fn label(&self) -> &'static str {
        match self {
            CapacityType::Spot => labels::CAPACITY_TYPE_SPOT,
            CapacityType::OnDemand => labels::CAPACITY_TYPE_ON_DEMAND,
        }
    }

    /// Parse a usage-class string; unknown classes return None
    pub fn from_label(label: &str) -> Option<CapacityType> {
        match label {
            labels::CAPACITY_TYPE_SPOT => Some(CapacityType::Spot),
            labels::CAPACITY_TYPE_ON_DEMAND => Some(CapacityType::OnDemand),
            _ => None,
        }
    }
}

/// A purchasable `(zone, capacity type)` option of an instance type
#[derive(Clone, Debug, PartialEq)]
pub struct Offering {
    /// Availability zone name
    pub zone: String,
    /// Availability zone id, when the subnet status knows it
    pub zone_id: Option<String>,
    /// Capacity type
    pub capacity_type: CapacityType,
    /// Price in USD per hour; meaningful only when `available`
    pub price: f64,
    /// Whether the offering can currently be launched: the price is known,
    /// the zone is in the subnet set, and the triple is not marked
    /// unavailable
    pub available: bool,
}

/// Node overhead subtracted from capacity to get allocatable
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Overhead {
    /// Resources reserved for Kubernetes system daemons
    pub kube_reserved: ResourceList,
    /// Resources reserved for OS daemons
    pub system_reserved: ResourceList,
    /// Eviction thresholds
    pub eviction_threshold: ResourceList,
}

impl Overhead {
    /// Sum of all overhead components
    pub fn total(&self) -> ResourceList {
        self.kube_reserved
            .add(&self.system_reserved)
            .add(&self.eviction_threshold)
    }
}

/// A fully resolved instance type
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceType {
    /// Type name, e.g. "m5.large"
    pub name: String,
    /// Labels the type advertises, matched against claim requirements
    pub requirements: Requirements,
    /// Purchase options
    pub offerings: Vec<Offering>,
    /// Advertised resources
    pub capacity: ResourceList,
    /// Reserved resources
    pub overhead: Overhead,
}

impl InstanceType {
    /// Offerings that can currently launch
    pub fn available_offerings(&self) -> impl Iterator<Item = &Offering> {
        self.offerings.iter().filter(|o| o.available)
    }

    /// Capacity minus overhead
    pub fn allocatable(&self) -> ResourceList {
        self.capacity.saturating_sub(&self.overhead.total())
    }

    /// The cheapest available offering admitted by the requirements
    pub fn cheapest_offering(&self, requirements: &Requirements) -> Option<&Offering> {
        self.available_offerings()
            .filter(|o| {
                requirements.get(labels::ZONE).has(&o.zone)
                    && requirements
                        .get(labels::CAPACITY_TYPE)
                        .has(o.capacity_type.label())
            })
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }

    /// True if the type's labels satisfy every claim requirement
    pub fn matches(&self, requirements: &Requirements) -> bool {
        let constraints: Vec<Requirement> = requirements.iter().cloned().collect();
        self.requirements.compatible_with(&constraints)
    }
}

/// Inputs for building a resolved instance type
pub struct BuildContext<'a> {
    /// Region the catalog is scoped to
    pub region: &'a str,
    /// Effective AMI family of the node class
    pub family: AmiFamily,
    /// Kubelet configuration, if the node class carries one
    pub kubelet: Option<&'a KubeletConfiguration>,
    /// Effective block-device mappings
    pub block_device_mappings: &'a [BlockDeviceMapping],
    /// Instance store policy
    pub instance_store_policy: Option<InstanceStorePolicy>,
    /// Hypervisor memory overhead fraction (0.075 = 7.5%)
    pub vm_memory_overhead_percent: f64,
    /// ENIs reserved for other controllers
    pub reserved_enis: u32,
}

/// Build a resolved instance type from a raw description and its offerings
pub fn build_instance_type(
    info: &InstanceTypeInfo,
    offerings: Vec<Offering>,
    ctx: &BuildContext<'_>,
) -> InstanceType {
    let capacity = compute_capacity(info, ctx);
    let pods = capacity.get(resources::PODS);
    let overhead = compute_overhead(info, &capacity, pods, ctx);
    InstanceType {
        name: info.name.clone(),
        requirements: compute_requirements(info, &offerings, ctx),
        offerings,
        capacity,
        overhead,
    }
}

fn compute_requirements(
    info: &InstanceTypeInfo,
    offerings: &[Offering],
    ctx: &BuildContext<'_>,
) -> Requirements {
    let mut reqs = Requirements::new();
    reqs.insert_value(labels::INSTANCE_TYPE, &info.name);
    reqs.insert_value(labels::ARCH, info.architecture.kube_label());
    let os = if ctx.family == AmiFamily::Windows {
        "windows"
    } else {
        "linux"
    };
    reqs.insert_value(labels::OS, os);
    reqs.insert_value(labels::REGION, ctx.region);

    let mut zones: Vec<String> = offerings
        .iter()
        .filter(|o| o.available)
        .map(|o| o.zone.clone())
        .collect();
    zones.sort();
    zones.dedup();
    if !zones.is_empty() {
        reqs.insert(Requirement::new_in(labels::ZONE, zones));
    }
    let mut zone_ids: Vec<String> = offerings
        .iter()
        .filter(|o| o.available)
        .filter_map(|o| o.zone_id.clone())
        .collect();
    zone_ids.sort();
    zone_ids.dedup();
    if !zone_ids.is_empty() {
        reqs.insert(Requirement::new_in(labels::ZONE_ID, zone_ids));
    }
    let mut capacity_types: Vec<&str> = offerings
        .iter()
        .filter(|o| o.available)
        .map(|o| o.capacity_type.label())
        .collect();
    capacity_types.sort();
    capacity_types.dedup();
    if !capacity_types.is_empty() {
        reqs.insert(Requirement::new_in(labels::CAPACITY_TYPE, capacity_types));
    }

    reqs.insert_value(labels::INSTANCE_CPU, info.vcpus.to_string());
    reqs.insert_value(labels::INSTANCE_MEMORY, info.memory_mib.to_string());
    reqs.insert_value(labels::INSTANCE_HYPERVISOR, &info.hypervisor);
    reqs.insert_value(
        labels::INSTANCE_ENCRYPTION_IN_TRANSIT,
        info.network.encryption_in_transit_supported.to_string(),
    );

    // Category and generation from the type-name scheme
    if let Some(captures) = INSTANCE_TYPE_SCHEME.captures(&info.name) {
        if let Some(category) = captures.get(1) {
            reqs.insert_value(labels::INSTANCE_CATEGORY, category.as_str());
        }
        if let Some(generation) = captures.get(3) {
            reqs.insert_value(labels::INSTANCE_GENERATION, generation.as_str());
        }
    }
    // Family and size from the "family.size" split
    if let Some((family, size)) = info.name.split_once('.') {
        reqs.insert_value(labels::INSTANCE_FAMILY, family);
        reqs.insert_value(labels::INSTANCE_SIZE, size);
    }

    if let Some(storage) = &info.instance_storage {
        if storage.nvme_supported {
            reqs.insert_value(labels::INSTANCE_LOCAL_NVME, storage.total_size_gb.to_string());
        }
    }
    if let Some(bandwidth) = NETWORK_BANDWIDTH_MBITS.get(info.name.as_str()) {
        reqs.insert_value(labels::INSTANCE_NETWORK_BANDWIDTH, bandwidth.to_string());
    }
    if let Some(manufacturer) = &info.cpu_manufacturer {
        reqs.insert_value(
            labels::INSTANCE_CPU_MANUFACTURER,
            labels::lower_kebab_case(manufacturer),
        );
    }
    if let Some(ebs) = &info.ebs {
        if ebs.optimized_by_default {
            reqs.insert_value(
                labels::INSTANCE_EBS_BANDWIDTH,
                ebs.maximum_bandwidth_mbps.to_string(),
            );
        }
    }

    // GPU labels only when the type carries a single homogeneous device
    if info.gpus.len() == 1 {
        let gpu = &info.gpus[0];
        reqs.insert_value(labels::INSTANCE_GPU_NAME, labels::lower_kebab_case(&gpu.name));
        reqs.insert_value(
            labels::INSTANCE_GPU_MANUFACTURER,
            labels::lower_kebab_case(&gpu.manufacturer),
        );
        reqs.insert_value(labels::INSTANCE_GPU_COUNT, gpu.count.to_string());
        reqs.insert_value(labels::INSTANCE_GPU_MEMORY, gpu.memory_mib.to_string());
    }
    if info.accelerators.len() == 1 {
        let acc = &info.accelerators[0];
        reqs.insert_value(
            labels::INSTANCE_ACCELERATOR_NAME,
            labels::lower_kebab_case(&acc.name),
        );
        reqs.insert_value(
            labels::INSTANCE_ACCELERATOR_MANUFACTURER,
            labels::lower_kebab_case(&acc.manufacturer),
        );
        reqs.insert_value(labels::INSTANCE_ACCELERATOR_COUNT, acc.count.to_string());
    }
    // The description API does not report trn1 accelerators
    if info.name.starts_with("trn1") {
        reqs.insert_value(labels::INSTANCE_ACCELERATOR_NAME, "trainium");
        reqs.insert_value(labels::INSTANCE_ACCELERATOR_MANUFACTURER, "aws");
        reqs.insert_value(labels::INSTANCE_ACCELERATOR_COUNT, neurons(info).to_string());
    }

    reqs
}

fn compute_capacity(info: &InstanceTypeInfo, ctx: &BuildContext<'_>) -> ResourceList {
    let mut capacity = ResourceList::new();
    capacity.insert(resources::CPU, Quantity::from_units(info.vcpus));
    capacity.insert(resources::MEMORY, memory(info, ctx.vm_memory_overhead_percent));
    capacity.insert(resources::EPHEMERAL_STORAGE, ephemeral_storage(info, ctx));
    capacity.insert(resources::PODS, pods(info, ctx));

    capacity.insert(
        resources::NVIDIA_GPU,
        Quantity::from_units(gpu_count(info, "NVIDIA")),
    );
    capacity.insert(
        resources::AMD_GPU,
        Quantity::from_units(gpu_count(info, "AMD")),
    );
    capacity.insert(
        resources::HABANA_GAUDI,
        Quantity::from_units(gpu_count(info, "Habana")),
    );
    capacity.insert(resources::AWS_NEURON, Quantity::from_units(neurons(info)));
    capacity.insert(
        resources::EFA,
        Quantity::from_units(info.network.efa_maximum_interfaces),
    );
    if ctx.family == AmiFamily::Windows {
        capacity.insert(
            resources::PRIVATE_IPV4_ADDRESS,
            Quantity::from_units((info.network.ipv4_addresses_per_interface - 1).max(0)),
        );
    }
    capacity
}

/// Advertised memory minus the Graviton CMA carve-out and the hypervisor
/// overhead fraction
fn memory(info: &InstanceTypeInfo, overhead_percent: f64) -> Quantity {
    let mut mib = info.memory_mib;
    // Gravitons reserve an extra 64 MiB of CMA memory
    if info.architecture == Architecture::Arm64 {
        mib -= 64;
    }
    let overhead_mib = (mib as f64 * overhead_percent).ceil() as i64;
    Quantity::mebibytes(mib - overhead_mib)
}

/// Ephemeral storage resolution, in priority order: RAID0 instance store,
/// explicit root volume, Custom-family last mapping, the family's
/// ephemeral-device mapping, the family default.
fn ephemeral_storage(info: &InstanceTypeInfo, ctx: &BuildContext<'_>) -> Quantity {
    if ctx.instance_store_policy == Some(InstanceStorePolicy::Raid0) {
        if let Some(storage) = &info.instance_storage {
            return Quantity::gigabytes(storage.total_size_gb);
        }
    }
    let mappings = ctx.block_device_mappings;
    if !mappings.is_empty() {
        if let Some(size) = mappings
            .iter()
            .find(|m| m.root_volume)
            .and_then(|m| m.ebs.as_ref())
            .and_then(|e| e.volume_size_gib)
        {
            return Quantity::gibibytes(size);
        }
        if ctx.family == AmiFamily::Custom {
            // A custom AMI's device layout is opaque; trust the last mapping
            return mappings
                .last()
                .and_then(|m| m.ebs.as_ref())
                .and_then(|e| e.volume_size_gib)
                .map(Quantity::gibibytes)
                .unwrap_or_else(|| Quantity::gibibytes(AmiFamily::DEFAULT_VOLUME_SIZE_GIB));
        }
        let device = ctx.family.ephemeral_block_device();
        if let Some(size) = mappings
            .iter()
            .find(|m| m.device_name.as_deref() == Some(device))
            .and_then(|m| m.ebs.as_ref())
            .and_then(|e| e.volume_size_gib)
        {
            return Quantity::gibibytes(size);
        }
    }
    let device = ctx.family.ephemeral_block_device();
    ctx.family
        .default_block_device_mappings()
        .iter()
        .find(|m| m.device_name.as_deref() == Some(device))
        .and_then(|m| m.ebs.as_ref())
        .and_then(|e| e.volume_size_gib)
        .map(Quantity::gibibytes)
        .unwrap_or_else(|| Quantity::gibibytes(AmiFamily::DEFAULT_VOLUME_SIZE_GIB))
}

/// Pod density from the ENI limit formula:
/// `ENIs * (IPv4 addresses per ENI - 1) + 2`
fn eni_limited_pods(info: &InstanceTypeInfo, reserved_enis: u32) -> i64 {
    let usable = (info.network.maximum_network_interfaces - i64::from(reserved_enis)).max(0);
    if usable == 0 {
        return 0;
    }
    usable * (info.network.ipv4_addresses_per_interface - 1) + 2
}

fn pods(info: &InstanceTypeInfo, ctx: &BuildContext<'_>) -> Quantity {
    let features = ctx.family.features();
    let max_pods = ctx.kubelet.and_then(|k| k.max_pods);
    let pods_per_core = ctx.kubelet.and_then(|k| k.pods_per_core).unwrap_or(0);

    let mut count = match max_pods {
        Some(n) => i64::from(n),
        None if features.supports_eni_limited_pod_density => {
            eni_limited_pods(info, ctx.reserved_enis)
        }
        None => 110,
    };
    if pods_per_core > 0 && features.pods_per_core_enabled {
        count = count.min(i64::from(pods_per_core) * info.vcpus);
    }
    Quantity::from_units(count)
}

fn gpu_count(info: &InstanceTypeInfo, manufacturer: &str) -> i64 {
    info.gpus
        .iter()
        .filter(|g| g.manufacturer == manufacturer)
        .map(|g| g.count)
        .sum()
}

/// Neuron device counts; the description API does not report trn1, so the
/// family is hardcoded
fn neurons(info: &InstanceTypeInfo) -> i64 {
    match info.name.as_str() {
        "trn1.2xlarge" => 1,
        "trn1.32xlarge" | "trn1n.32xlarge" => 16,
        _ => info.accelerators.iter().map(|a| a.count).sum(),
    }
}

fn compute_overhead(
    info: &InstanceTypeInfo,
    capacity: &ResourceList,
    pods: Quantity,
    ctx: &BuildContext<'_>,
) -> Overhead {
    let features = ctx.family.features();
    let reserved_pods = if features.uses_eni_limited_memory_overhead {
        Quantity::from_units(eni_limited_pods(info, ctx.reserved_enis))
    } else {
        pods
    };
    Overhead {
        kube_reserved: kube_reserved(
            info.vcpus,
            reserved_pods,
            ctx.kubelet.map(|k| &k.kube_reserved),
        ),
        system_reserved: ctx
            .kubelet
            .map(|k| ResourceList::from_string_map(&k.system_reserved))
            .unwrap_or_default(),
        eviction_threshold: eviction_threshold(
            capacity.get(resources::MEMORY),
            capacity.get(resources::EPHEMERAL_STORAGE),
            ctx,
        ),
    }
}

/// kube-reserved defaults: `11 MiB per pod + 255 MiB` of memory, 1 Gi of
/// storage, and CPU from tiered bands (6% of the first core, 1% of the
/// next, 0.5% of the next two, 0.25% of the rest). Operator-specified
/// kube-reserved entries override the computed values.
fn kube_reserved(
    vcpus: i64,
    pods: Quantity,
    overrides: Option<&std::collections::BTreeMap<String, String>>,
) -> ResourceList {
    let mut reserved = ResourceList::new();
    reserved.insert(
        resources::MEMORY,
        Quantity::mebibytes(11 * pods.units() + 255),
    );
    reserved.insert(resources::EPHEMERAL_STORAGE, Quantity::gibibytes(1));

    let cpu_millis = vcpus * 1000;
    let bands: &[(i64, i64, f64)] = &[
        (0, 1000, 0.06),
        (1000, 2000, 0.01),
        (2000, 4000, 0.005),
        (4000, i64::MAX, 0.0025),
    ];
    let mut cpu_overhead = 0i64;
    for (start, end, fraction) in bands {
        if cpu_millis >= *start {
            let band = (cpu_millis.min(*end) - start) as f64;
            cpu_overhead += (band * fraction) as i64;
        }
    }
    reserved.insert(resources::CPU, Quantity::from_milli(cpu_overhead));

    if let Some(map) = overrides {
        for (k, v) in map {
            if let Some(q) = Quantity::parse(v) {
                reserved.insert(k.clone(), q);
            }
        }
    }
    reserved
}

/// Eviction threshold: `max(100 MiB, evictionHard, evictionSoft)` for
/// memory, with the analogous `nodefs.available` rule for storage.
/// Percentage signals resolve against capacity; soft signals only count on
/// families whose kubelet honors them.
fn eviction_threshold(
    memory_capacity: Quantity,
    storage_capacity: Quantity,
    ctx: &BuildContext<'_>,
) -> ResourceList {
    let mut threshold = ResourceList::new();
    threshold.insert(resources::MEMORY, Quantity::mebibytes(100));
    threshold.insert(resources::EPHEMERAL_STORAGE, storage_capacity.percentage(10.0));

    let mut override_ = ResourceList::new();
    let mut signal_maps = Vec::new();
    if let Some(kubelet) = ctx.kubelet {
        signal_maps.push(&kubelet.eviction_hard);
        if ctx.family.features().eviction_soft_enabled {
            signal_maps.push(&kubelet.eviction_soft);
        }
    }
    for map in signal_maps {
        let mut current = ResourceList::new();
        if let Some(signal) = map.get(MEMORY_AVAILABLE).and_then(|v| Signal::parse(v)) {
            current.insert(resources::MEMORY, signal.resolve(memory_capacity));
        }
        if let Some(signal) = map.get(NODEFS_AVAILABLE).and_then(|v| Signal::parse(v)) {
            current.insert(resources::EPHEMERAL_STORAGE, signal.resolve(storage_capacity));
        }
        override_ = override_.max(&current);
    }
    for (name, q) in override_.iter() {
        threshold.insert(name.clone(), *q);
    }
    threshold
}
