//! Pricing capability interface

use async_trait::async_trait;

use cirrus_common::Result;

/// An on-demand price record
#[derive(Clone, Debug, PartialEq)]
pub struct OnDemandPrice {
    /// Instance type name
    pub instance_type: String,
    /// Price in USD per hour
    pub price: f64,
}

/// A spot price record
#[derive(Clone, Debug, PartialEq)]
pub struct SpotPrice {
    /// Instance type name
    pub instance_type: String,
    /// Availability zone
    pub zone: String,
    /// Price in USD per hour
    pub price: f64,
}

/// Interface to the pricing service
#[async_trait]
pub trait PricingApi: Send + Sync {
    /// Current on-demand prices for the region
    async fn on_demand_prices(&self, region: &str) -> Result<Vec<OnDemandPrice>>;

    /// Recent spot prices per (type, zone) for the region
    async fn spot_prices(&self, region: &str) -> Result<Vec<SpotPrice>>;
}
