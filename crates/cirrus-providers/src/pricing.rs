//! Pricing catalog
//!
//! Holds on-demand prices per instance type and spot prices per
//! `(instance type, zone)`, refreshed by periodic operator tasks. Until the
//! first spot refresh lands, spot lookups fall back to the on-demand price
//! so that offerings are not spuriously unavailable. Missing prices make an
//! offering unavailable, never free.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use cirrus_cloud::pricing::PricingApi;
use cirrus_common::Result;

/// Fallback on-demand prices used before the first successful refresh and
/// in isolated VPCs where the pricing endpoint is unreachable.
const DEFAULT_ON_DEMAND_PRICES: &[(&str, f64)] = &[
    ("t3.medium", 0.0416),
    ("t3.large", 0.0832),
    ("m5.large", 0.096),
    ("m5.xlarge", 0.192),
    ("m5.2xlarge", 0.384),
    ("m5.4xlarge", 0.768),
    ("m5.metal", 4.608),
    ("m6g.large", 0.077),
    ("m6g.xlarge", 0.154),
    ("m6i.large", 0.096),
    ("m6i.xlarge", 0.192),
    ("m7i.large", 0.1008),
    ("c5.large", 0.085),
    ("c5.xlarge", 0.17),
    ("c6g.large", 0.068),
    ("c6i.large", 0.085),
    ("c6i.xlarge", 0.17),
    ("c7i.large", 0.08925),
    ("r5.large", 0.126),
    ("r5.xlarge", 0.252),
    ("r6g.large", 0.1008),
    ("g4dn.xlarge", 0.526),
    ("g5.xlarge", 1.006),
    ("p3.2xlarge", 3.06),
    ("inf1.xlarge", 0.228),
    ("trn1.2xlarge", 1.3438),
    ("trn1.32xlarge", 21.50),
];

fn spot_key(instance_type: &str, zone: &str) -> String {
    format!("{instance_type}/{zone}")
}

/// Cluster-wide pricing catalog
pub struct PricingProvider {
    api: Arc<dyn PricingApi>,
    region: String,
    isolated_vpc: bool,
    on_demand: RwLock<HashMap<String, f64>>,
    spot: RwLock<HashMap<String, f64>>,
}

impl PricingProvider {
    /// Create a catalog seeded with the static defaults
    pub fn new(api: Arc<dyn PricingApi>, region: impl Into<String>, isolated_vpc: bool) -> Self {
        let defaults: HashMap<String, f64> = DEFAULT_ON_DEMAND_PRICES
            .iter()
            .map(|(t, p)| (t.to_string(), *p))
            .collect();
        Self {
            api,
            region: region.into(),
            isolated_vpc,
            on_demand: RwLock::new(defaults),
            spot: RwLock::new(HashMap::new()),
        }
    }

    /// On-demand price for an instance type; `None` means unknown, and the
    /// catalog treats the offering as unavailable
    pub fn on_demand_price(&self, instance_type: &str) -> Option<f64> {
        self.on_demand.read().get(instance_type).copied()
    }

    /// Spot price for an instance type in a zone, falling back to the
    /// on-demand price until real spot data has been observed
    pub fn spot_price(&self, instance_type: &str, zone: &str) -> Option<f64> {
        if let Some(price) = self.spot.read().get(&spot_key(instance_type, zone)) {
            return Some(*price);
        }
        self.on_demand_price(instance_type)
    }

    /// Number of on-demand prices currently known
    pub fn on_demand_price_count(&self) -> usize {
        self.on_demand.read().len()
    }

    /// Refresh on-demand prices from the pricing service. A no-op in
    /// isolated VPCs.
    pub async fn update_on_demand_pricing(&self) -> Result<()> {
        if self.isolated_vpc {
            debug!("isolated VPC, skipping on-demand pricing refresh");
            return Ok(());
        }
        let prices = self.api.on_demand_prices(&self.region).await?;
        if prices.is_empty() {
            warn!("pricing service returned no on-demand prices, keeping previous data");
            return Ok(());
        }
        let mut map = self.on_demand.write();
        map.clear();
        for p in &prices {
            map.insert(p.instance_type.clone(), p.price);
        }
        info!(count = prices.len(), "refreshed on-demand prices");
        Ok(())
    }

    /// Refresh spot prices from the pricing service. A no-op in isolated
    /// VPCs.
    pub async fn update_spot_pricing(&self) -> Result<()> {
        if self.isolated_vpc {
            debug!("isolated VPC, skipping spot pricing refresh");
            return Ok(());
        }
        let prices = self.api.spot_prices(&self.region).await?;
        if prices.is_empty() {
            warn!("pricing service returned no spot prices, keeping previous data");
            return Ok(());
        }
        let mut map = self.spot.write();
        map.clear();
        for p in &prices {
            map.insert(spot_key(&p.instance_type, &p.zone), p.price);
        }
        info!(count = prices.len(), "refreshed spot prices");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_cloud::fake::MemoryPricing;
    use cirrus_cloud::pricing::{OnDemandPrice, SpotPrice};

    fn provider(isolated: bool) -> (Arc<MemoryPricing>, PricingProvider) {
        let api = Arc::new(MemoryPricing::new());
        let provider = PricingProvider::new(api.clone(), "us-west-2", isolated);
        (api, provider)
    }

    #[test]
    fn defaults_are_seeded() {
        let (_, provider) = provider(false);
        assert!(provider.on_demand_price("m5.large").is_some());
        assert!(provider.on_demand_price("nonexistent.large").is_none());
    }

    #[test]
    fn spot_falls_back_to_on_demand() {
        let (_, provider) = provider(false);
        assert_eq!(
            provider.spot_price("m5.large", "us-west-2a"),
            provider.on_demand_price("m5.large")
        );
    }

    #[tokio::test]
    async fn refresh_replaces_prices() {
        let (api, provider) = provider(false);
        api.set_on_demand(vec![OnDemandPrice {
            instance_type: "m5.large".to_string(),
            price: 0.111,
        }]);
        api.set_spot(vec![SpotPrice {
            instance_type: "m5.large".to_string(),
            zone: "us-west-2a".to_string(),
            price: 0.033,
        }]);

        provider.update_on_demand_pricing().await.unwrap();
        provider.update_spot_pricing().await.unwrap();

        assert_eq!(provider.on_demand_price("m5.large"), Some(0.111));
        assert_eq!(provider.spot_price("m5.large", "us-west-2a"), Some(0.033));
        // zone without spot data falls back to on-demand
        assert_eq!(provider.spot_price("m5.large", "us-west-2b"), Some(0.111));
        // the refresh replaced the default table entirely
        assert!(provider.on_demand_price("c5.large").is_none());
    }

    #[tokio::test]
    async fn empty_refresh_keeps_previous_data() {
        let (_, provider) = provider(false);
        provider.update_on_demand_pricing().await.unwrap();
        assert!(provider.on_demand_price("m5.large").is_some());
    }

    #[tokio::test]
    async fn isolated_vpc_skips_refresh() {
        let (api, provider) = provider(true);
        api.set_on_demand(vec![OnDemandPrice {
            instance_type: "m5.large".to_string(),
            price: 9.99,
        }]);
        provider.update_on_demand_pricing().await.unwrap();
        // still the static default, not 9.99
        assert_eq!(provider.on_demand_price("m5.large"), Some(0.096));
    }
}
