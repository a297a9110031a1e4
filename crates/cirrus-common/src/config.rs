//! Operator settings derived from the environment
//!
//! Reconcilers never exit the process; misconfiguration is caught once at
//! startup and aborts with a non-zero exit.

use crate::error::Error;

/// Environment variable names
const CLUSTER_NAME: &str = "CIRRUS_CLUSTER_NAME";
const CLUSTER_ENDPOINT: &str = "CIRRUS_CLUSTER_ENDPOINT";
const REGION: &str = "CIRRUS_REGION";
const INTERRUPTION_QUEUE: &str = "CIRRUS_INTERRUPTION_QUEUE";
const VM_MEMORY_OVERHEAD_PERCENT: &str = "CIRRUS_VM_MEMORY_OVERHEAD_PERCENT";
const RESERVED_ENIS: &str = "CIRRUS_RESERVED_ENIS";
const ISOLATED_VPC: &str = "CIRRUS_ISOLATED_VPC";

/// Operator-wide configuration
#[derive(Clone, Debug)]
pub struct Settings {
    /// Name of the cluster nodes join; used in ownership tags and derived
    /// resource names
    pub cluster_name: String,
    /// API server endpoint handed to nodes, if known
    pub cluster_endpoint: Option<String>,
    /// Region all cloud calls are scoped to
    pub region: String,
    /// Interruption queue name; absent disables the interruption consumer
    pub interruption_queue: Option<String>,
    /// Fraction of advertised memory reserved by the hypervisor
    /// (0.075 = 7.5%)
    pub vm_memory_overhead_percent: f64,
    /// ENIs reserved for other controllers, subtracted from pod density
    pub reserved_enis: u32,
    /// Disables remote pricing lookups for VPCs without internet egress
    pub isolated_vpc: bool,
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self, Error> {
        let env = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());

        let cluster_name = env(CLUSTER_NAME).ok_or_else(|| {
            Error::internal("settings", format!("{CLUSTER_NAME} must be set"))
        })?;
        let region = env(REGION)
            .ok_or_else(|| Error::internal("settings", format!("{REGION} must be set")))?;

        let vm_memory_overhead_percent = parse_overhead_percent(env(VM_MEMORY_OVERHEAD_PERCENT))?;
        let reserved_enis = match env(RESERVED_ENIS) {
            Some(v) => v.parse::<u32>().map_err(|_| {
                Error::internal("settings", format!("{RESERVED_ENIS} must be an integer"))
            })?,
            None => 0,
        };
        let isolated_vpc = env(ISOLATED_VPC)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Settings {
            cluster_name,
            cluster_endpoint: env(CLUSTER_ENDPOINT),
            region,
            interruption_queue: env(INTERRUPTION_QUEUE),
            vm_memory_overhead_percent,
            reserved_enis,
            isolated_vpc,
        })
    }

    /// Settings with the given cluster name and region; used in tests
    pub fn for_cluster(cluster_name: impl Into<String>, region: impl Into<String>) -> Self {
        Settings {
            cluster_name: cluster_name.into(),
            cluster_endpoint: None,
            region: region.into(),
            interruption_queue: None,
            vm_memory_overhead_percent: 0.075,
            reserved_enis: 0,
            isolated_vpc: false,
        }
    }
}

fn parse_overhead_percent(raw: Option<String>) -> Result<f64, Error> {
    match raw {
        None => Ok(0.075),
        Some(v) => {
            let pct: f64 = v.parse().map_err(|_| {
                Error::internal(
                    "settings",
                    format!("{VM_MEMORY_OVERHEAD_PERCENT} must be a number"),
                )
            })?;
            if pct < 0.0 {
                return Err(Error::internal(
                    "settings",
                    format!("{VM_MEMORY_OVERHEAD_PERCENT} must be >= 0"),
                ));
            }
            Ok(pct)
        }
    }
}
