//! The instance-type catalog
//!
//! Joins raw type descriptions, zonal offerings, prices and the
//! unavailable-offerings cache into resolved [`InstanceType`] records.
//! Raw EC2 responses are cached with short TTLs behind a single async
//! mutex so concurrent reconciles cannot stampede the API; sequence
//! numbers advance only when the fetched shape actually changes, keeping
//! resolved-cache keys stable across no-op refreshes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tracing::{debug, warn};

use cirrus_cloud::ec2::{Ec2Api, InstanceTypeInfo};
use cirrus_common::crd::{Ec2NodeClass, KubeletConfiguration};
use cirrus_common::{hash, metrics, Result, Settings};

use crate::cache::TtlCache;
use crate::pricing::PricingProvider;
use crate::subnet::SubnetProvider;
use crate::unavailable::UnavailableOfferings;

use super::{build_instance_type, BuildContext, CapacityType, InstanceType, Offering};

const RAW_CACHE_TTL: Duration = Duration::from_secs(300);
const ZONES_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const RESOLVED_CACHE_TTL: Duration = Duration::from_secs(300);

const TYPES_CACHE_KEY: &str = "types";
const OFFERINGS_CACHE_KEY: &str = "offerings";
const ZONES_CACHE_KEY: &str = "zones";

/// Static catalog configuration derived from [`Settings`]
#[derive(Clone, Debug)]
pub struct CatalogOptions {
    /// Region the catalog is scoped to
    pub region: String,
    /// Hypervisor memory overhead fraction
    pub vm_memory_overhead_percent: f64,
    /// ENIs reserved for other controllers
    pub reserved_enis: u32,
}

impl From<&Settings> for CatalogOptions {
    fn from(settings: &Settings) -> Self {
        CatalogOptions {
            region: settings.region.clone(),
            vm_memory_overhead_percent: settings.vm_memory_overhead_percent,
            reserved_enis: settings.reserved_enis,
        }
    }
}

/// The process-wide instance-type catalog
pub struct InstanceTypeProvider {
    ec2: Arc<dyn Ec2Api>,
    subnets: Arc<SubnetProvider>,
    pricing: Arc<PricingProvider>,
    unavailable: Arc<UnavailableOfferings>,
    options: CatalogOptions,

    // Guards raw-cache read-modify-write so concurrent reconcilers make one
    // EC2 call, not N
    refresh_mu: tokio::sync::Mutex<()>,

    types_cache: TtlCache<Arc<Vec<InstanceTypeInfo>>>,
    offerings_cache: TtlCache<Arc<BTreeMap<String, BTreeSet<String>>>>,
    zones_cache: TtlCache<Arc<BTreeSet<String>>>,
    resolved_cache: TtlCache<Arc<Vec<InstanceType>>>,

    types_seq_num: AtomicU64,
    offerings_seq_num: AtomicU64,
    last_types_shape: Mutex<u64>,
    last_offerings_shape: Mutex<u64>,
}

impl InstanceTypeProvider {
    /// Create the catalog
    pub fn new(
        ec2: Arc<dyn Ec2Api>,
        subnets: Arc<SubnetProvider>,
        pricing: Arc<PricingProvider>,
        unavailable: Arc<UnavailableOfferings>,
        options: CatalogOptions,
    ) -> Self {
        Self {
            ec2,
            subnets,
            pricing,
            unavailable,
            options,
            refresh_mu: tokio::sync::Mutex::new(()),
            types_cache: TtlCache::new(RAW_CACHE_TTL),
            offerings_cache: TtlCache::new(RAW_CACHE_TTL),
            zones_cache: TtlCache::new(ZONES_CACHE_TTL),
            resolved_cache: TtlCache::new(RESOLVED_CACHE_TTL),
            types_seq_num: AtomicU64::new(0),
            offerings_seq_num: AtomicU64::new(0),
            last_types_shape: Mutex::new(0),
            last_offerings_shape: Mutex::new(0),
        }
    }

    /// Resolve instance types for a NodeClass. Cache hits are O(1) on a key
    /// composed of the raw-data sequence numbers and hashes of everything
    /// else that shapes the result.
    pub async fn list(
        &self,
        kubelet: Option<&KubeletConfiguration>,
        node_class: &Ec2NodeClass,
    ) -> Result<Vec<InstanceType>> {
        let raw_types = self.instance_types().await?;
        let offerings = self.instance_type_offerings().await?;
        let zones = self.zones(&offerings).await;

        let subnets = self.subnets.list(node_class).await?;
        let subnet_zones: BTreeSet<String> = subnets
            .iter()
            .map(|s| s.availability_zone.clone())
            .collect();
        let zone_ids: BTreeMap<String, String> = subnets
            .iter()
            .map(|s| {
                (
                    s.availability_zone.clone(),
                    s.availability_zone_id.clone(),
                )
            })
            .collect();

        let family = node_class.ami_family();
        let block_device_mappings = node_class.effective_block_device_mappings();

        let subnet_hash = hash::fnv1a_parts(subnets.iter().map(|s| {
            format!("{}/{}/{}", s.subnet_id, s.availability_zone, s.availability_zone_id)
        }));
        let kubelet_hash = hash::fnv1a(format!("{kubelet:?}").as_bytes());
        let bdm_hash = hash::fnv1a(format!("{block_device_mappings:?}").as_bytes());
        let reserved_hash = hash::fnv1a(
            format!(
                "{:?}/{:?}",
                kubelet.map(|k| &k.kube_reserved),
                kubelet.map(|k| &k.system_reserved)
            )
            .as_bytes(),
        );
        let key = format!(
            "{}-{}-{}-{:016x}-{:016x}-{:016x}-{:?}-{:?}-{:016x}",
            self.types_seq_num.load(Ordering::Relaxed),
            self.offerings_seq_num.load(Ordering::Relaxed),
            self.unavailable.seq_num(),
            subnet_hash,
            kubelet_hash,
            bdm_hash,
            family,
            node_class.spec.instance_store_policy,
            reserved_hash,
        );
        if let Some(cached) = self.resolved_cache.get(&key) {
            return Ok((*cached).clone());
        }

        let ctx = BuildContext {
            region: &self.options.region,
            family,
            kubelet,
            block_device_mappings: &block_device_mappings,
            instance_store_policy: node_class.spec.instance_store_policy,
            vm_memory_overhead_percent: self.options.vm_memory_overhead_percent,
            reserved_enis: self.options.reserved_enis,
        };
        let empty = BTreeSet::new();
        let result: Vec<InstanceType> = raw_types
            .iter()
            .map(|info| {
                let type_zones = offerings.get(&info.name).unwrap_or(&empty);
                let its_offerings =
                    self.build_offerings(info, type_zones, &zones, &subnet_zones, &zone_ids);
                build_instance_type(info, its_offerings, &ctx)
            })
            .collect();

        metrics::INSTANCE_TYPES_DISCOVERED.record(
            result.len() as i64,
            &[KeyValue::new("region", self.options.region.clone())],
        );
        self.resolved_cache.insert(key, Arc::new(result.clone()));
        Ok(result)
    }

    /// Fetch-or-cache the raw instance type descriptions
    pub async fn instance_types(&self) -> Result<Arc<Vec<InstanceTypeInfo>>> {
        let _guard = self.refresh_mu.lock().await;
        if let Some(cached) = self.types_cache.get(TYPES_CACHE_KEY) {
            return Ok(cached);
        }
        let types = Arc::new(self.ec2.describe_instance_types().await?);
        let shape = hash::fnv1a(format!("{types:?}").as_bytes());
        {
            let mut last = self.last_types_shape.lock();
            if *last != shape {
                *last = shape;
                self.types_seq_num.fetch_add(1, Ordering::Relaxed);
                debug!(count = types.len(), "discovered instance types");
            }
        }
        self.types_cache.insert(TYPES_CACHE_KEY, types.clone());
        Ok(types)
    }

    /// Fetch-or-cache the per-zone offerings
    async fn instance_type_offerings(&self) -> Result<Arc<BTreeMap<String, BTreeSet<String>>>> {
        let _guard = self.refresh_mu.lock().await;
        if let Some(cached) = self.offerings_cache.get(OFFERINGS_CACHE_KEY) {
            return Ok(cached);
        }
        let offerings = Arc::new(self.ec2.describe_instance_type_offerings().await?);
        let shape = hash::fnv1a(format!("{offerings:?}").as_bytes());
        {
            let mut last = self.last_offerings_shape.lock();
            if *last != shape {
                *last = shape;
                self.offerings_seq_num.fetch_add(1, Ordering::Relaxed);
                debug!(
                    instance_type_count = offerings.len(),
                    "discovered offerings for instance types"
                );
            }
        }
        self.offerings_cache
            .insert(OFFERINGS_CACHE_KEY, offerings.clone());
        Ok(offerings)
    }

    /// All zones any type is offered in; derived from the offerings and
    /// cached for a day
    async fn zones(
        &self,
        offerings: &BTreeMap<String, BTreeSet<String>>,
    ) -> Arc<BTreeSet<String>> {
        if let Some(cached) = self.zones_cache.get(ZONES_CACHE_KEY) {
            return cached;
        }
        let zones: Arc<BTreeSet<String>> =
            Arc::new(offerings.values().flatten().cloned().collect());
        self.zones_cache.insert(ZONES_CACHE_KEY, zones.clone());
        zones
    }

    fn build_offerings(
        &self,
        info: &InstanceTypeInfo,
        type_zones: &BTreeSet<String>,
        zones: &BTreeSet<String>,
        subnet_zones: &BTreeSet<String>,
        zone_ids: &BTreeMap<String, String>,
    ) -> Vec<Offering> {
        let mut offerings = Vec::new();
        for zone in zones {
            for usage_class in &info.supported_usage_classes {
                let capacity_type = match CapacityType::from_label(usage_class) {
                    Some(ct) => ct,
                    None => {
                        // capacity-block and future classes are skipped silently
                        if usage_class != "capacity-block" {
                            warn!(
                                usage_class,
                                instance_type = %info.name,
                                "unknown usage class"
                            );
                        }
                        continue;
                    }
                };
                let price = match capacity_type {
                    CapacityType::Spot => self.pricing.spot_price(&info.name, zone),
                    CapacityType::OnDemand => self.pricing.on_demand_price(&info.name),
                };
                let unavailable = self.unavailable.is_unavailable(&info.name, zone, capacity_type);
                let available = price.is_some()
                    && !unavailable
                    && type_zones.contains(zone)
                    && subnet_zones.contains(zone);
                offerings.push(Offering {
                    zone: zone.clone(),
                    zone_id: zone_ids.get(zone).cloned(),
                    capacity_type,
                    price: price.unwrap_or_default(),
                    available,
                });
            }
        }
        offerings
    }
}
