//! Well-known node labels used in scheduling requirements
//!
//! Upstream Kubernetes labels keep their canonical names; Cirrus-specific
//! labels live under the `cirrus.sh` / `ec2.cirrus.sh` prefixes.

/// `node.kubernetes.io/instance-type`
pub const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
/// `kubernetes.io/arch`
pub const ARCH: &str = "kubernetes.io/arch";
/// `kubernetes.io/os`
pub const OS: &str = "kubernetes.io/os";
/// `topology.kubernetes.io/zone`
pub const ZONE: &str = "topology.kubernetes.io/zone";
/// `topology.kubernetes.io/region`
pub const REGION: &str = "topology.kubernetes.io/region";
/// Availability-zone ID, stable across accounts (zone names are not)
pub const ZONE_ID: &str = "topology.cirrus.sh/zone-id";

/// Capacity type of the backing offering: `spot` or `on-demand`
pub const CAPACITY_TYPE: &str = "cirrus.sh/capacity-type";

/// `spot` capacity type label value
pub const CAPACITY_TYPE_SPOT: &str = "spot";
/// `on-demand` capacity type label value
pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";

/// Instance category parsed from the type name (e.g. "m" for m5.large)
pub const INSTANCE_CATEGORY: &str = "ec2.cirrus.sh/instance-category";
/// Instance family (e.g. "m5")
pub const INSTANCE_FAMILY: &str = "ec2.cirrus.sh/instance-family";
/// Instance generation parsed from the type name (e.g. "5")
pub const INSTANCE_GENERATION: &str = "ec2.cirrus.sh/instance-generation";
/// Instance size (e.g. "large")
pub const INSTANCE_SIZE: &str = "ec2.cirrus.sh/instance-size";
/// vCPU count
pub const INSTANCE_CPU: &str = "ec2.cirrus.sh/instance-cpu";
/// CPU manufacturer: aws, intel, amd
pub const INSTANCE_CPU_MANUFACTURER: &str = "ec2.cirrus.sh/instance-cpu-manufacturer";
/// Advertised memory in MiB
pub const INSTANCE_MEMORY: &str = "ec2.cirrus.sh/instance-memory";
/// Network bandwidth in megabits
pub const INSTANCE_NETWORK_BANDWIDTH: &str = "ec2.cirrus.sh/instance-network-bandwidth";
/// Maximum EBS bandwidth in Mbps
pub const INSTANCE_EBS_BANDWIDTH: &str = "ec2.cirrus.sh/instance-ebs-bandwidth";
/// Total local NVMe store size in GB
pub const INSTANCE_LOCAL_NVME: &str = "ec2.cirrus.sh/instance-local-nvme";
/// Hypervisor: nitro or xen
pub const INSTANCE_HYPERVISOR: &str = "ec2.cirrus.sh/instance-hypervisor";
/// Whether in-transit encryption is supported
pub const INSTANCE_ENCRYPTION_IN_TRANSIT: &str =
    "ec2.cirrus.sh/instance-encryption-in-transit-supported";
/// GPU name (e.g. "t4")
pub const INSTANCE_GPU_NAME: &str = "ec2.cirrus.sh/instance-gpu-name";
/// GPU manufacturer (e.g. "nvidia")
pub const INSTANCE_GPU_MANUFACTURER: &str = "ec2.cirrus.sh/instance-gpu-manufacturer";
/// GPU count
pub const INSTANCE_GPU_COUNT: &str = "ec2.cirrus.sh/instance-gpu-count";
/// Per-GPU memory in MiB
pub const INSTANCE_GPU_MEMORY: &str = "ec2.cirrus.sh/instance-gpu-memory";
/// Accelerator name (e.g. "inferentia")
pub const INSTANCE_ACCELERATOR_NAME: &str = "ec2.cirrus.sh/instance-accelerator-name";
/// Accelerator manufacturer
pub const INSTANCE_ACCELERATOR_MANUFACTURER: &str =
    "ec2.cirrus.sh/instance-accelerator-manufacturer";
/// Accelerator count
pub const INSTANCE_ACCELERATOR_COUNT: &str = "ec2.cirrus.sh/instance-accelerator-count";

/// Lower-kebab-cases a manufacturer or device name ("NVIDIA T4" -> "nvidia-t4")
pub fn lower_kebab_case(s: &str) -> String {
    s.to_lowercase().replace(' ', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_casing() {
        assert_eq!(lower_kebab_case("NVIDIA"), "nvidia");
        assert_eq!(lower_kebab_case("Habana Gaudi"), "habana-gaudi");
    }
}
