//! The launch pipeline
//!
//! Turns a NodeClaim plus candidate instance types into one EC2 instance:
//! filter exotic and overpriced-spot types, order by price, pick a capacity
//! type, cross candidates with zonal subnets into fleet overrides, issue an
//! instant fleet, and interpret the result. Fleet calls are never retried
//! internally except for the single documented template-not-found retry, to
//! avoid duplicate instance creation.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use cirrus_cloud::ec2::{
    AllocationStrategy, CreateFleetRequest, Ec2Api, Filter, FleetCapacityType, FleetError,
    FleetLaunchTemplateConfig, FleetOverride, Instance, LIVE_INSTANCE_STATES,
};
use cirrus_common::crd::{Ec2NodeClass, NodeClaim};
use cirrus_common::error::is_unfulfillable_capacity_code;
use cirrus_common::retry::{retry_with_backoff, RetryConfig};
use cirrus_common::scheduling::Requirements;
use cirrus_common::{
    cluster_tag_key, filter_restricted_tags, labels, metrics, Error, Result, Settings,
    NODE_CLAIM_TAG_KEY, NODE_CLASS_TAG_KEY,
};

use crate::instance_type::{CapacityType, InstanceType};
use crate::launch_template::LaunchTemplateProvider;
use crate::subnet::{zonal_subnets, SubnetProvider};
use crate::unavailable::UnavailableOfferings;

/// Number of instance type options passed to the fleet request
pub const MAX_INSTANCE_TYPES: usize = 60;

/// Falling back to on-demand with fewer distinct types than this risks
/// insufficient-capacity errors, so it earns an advisory warning
const FLEXIBILITY_THRESHOLD: usize = 5;

/// Launches, queries, tags and terminates instances
pub struct InstanceProvider {
    ec2: Arc<dyn Ec2Api>,
    settings: Settings,
    unavailable: Arc<UnavailableOfferings>,
    subnets: Arc<SubnetProvider>,
    launch_templates: Arc<LaunchTemplateProvider>,
}

impl InstanceProvider {
    /// Create the provider
    pub fn new(
        ec2: Arc<dyn Ec2Api>,
        settings: Settings,
        unavailable: Arc<UnavailableOfferings>,
        subnets: Arc<SubnetProvider>,
        launch_templates: Arc<LaunchTemplateProvider>,
    ) -> Self {
        Self {
            ec2,
            settings,
            unavailable,
            subnets,
            launch_templates,
        }
    }

    /// Launch one instance for the claim from the candidate types
    pub async fn create(
        &self,
        node_class: &Ec2NodeClass,
        node_claim: &NodeClaim,
        instance_types: Vec<InstanceType>,
    ) -> Result<Instance> {
        let requirements = node_claim.requirements();
        let mut candidates = filter_instance_types(instance_types, &requirements);
        order_by_price(&mut candidates, &requirements);
        candidates.truncate(MAX_INSTANCE_TYPES);
        if candidates.is_empty() {
            return Err(Error::insufficient_capacity(
                "no instance types have an available offering for the claim's requirements",
            ));
        }

        let launched = match self
            .launch(node_class, node_claim, &candidates, &requirements)
            .await
        {
            // A stale template cache earns exactly one full retry
            Err(e) if e.is_launch_template_not_found() => {
                warn!(error = %e, "launch template disappeared, retrying launch once");
                self.launch(node_class, node_claim, &candidates, &requirements)
                    .await
            }
            other => other,
        };
        let capacity_label = match &launched {
            Ok((_, capacity_type)) => capacity_type.label(),
            Err(_) => "unknown",
        };
        let result_label = match &launched {
            Ok(_) => "success",
            Err(e) if e.is_insufficient_capacity() => "insufficient_capacity",
            Err(_) => "error",
        };
        metrics::INSTANCE_LAUNCHES.add(
            1,
            &[
                KeyValue::new("capacity_type", capacity_label.to_string()),
                KeyValue::new("result", result_label),
            ],
        );
        let (instance_id, _) = launched?;

        // EC2 is eventually consistent: poll until the instance is visible
        // with its PrivateDnsName populated
        let instance = retry_with_backoff(
            &RetryConfig::eventual_consistency(),
            "describe-launched-instance",
            || self.get(&instance_id),
        )
        .await?;

        info!(
            id = %instance.instance_id,
            hostname = instance.private_dns_name.as_deref().unwrap_or(""),
            instance_type = %instance.instance_type,
            zone = %instance.availability_zone,
            capacity_type = if instance.spot { "spot" } else { "on-demand" },
            "launched instance"
        );
        Ok(instance)
    }

    async fn launch(
        &self,
        node_class: &Ec2NodeClass,
        node_claim: &NodeClaim,
        candidates: &[InstanceType],
        requirements: &Requirements,
    ) -> Result<(String, CapacityType)> {
        let capacity_type = select_capacity_type(requirements, candidates);

        let subnets = self.subnets.list(node_class).await?;
        let subnets_by_zone = zonal_subnets(&subnets);

        let templates = self
            .launch_templates
            .ensure_all(node_class, capacity_type, candidates)
            .await?;

        let mut configs = Vec::new();
        for template in &templates {
            let covered: Vec<&InstanceType> = candidates
                .iter()
                .filter(|it| template.instance_type_names.contains(&it.name))
                .collect();
            let overrides =
                build_overrides(&covered, &subnets_by_zone, requirements, capacity_type);
            if !overrides.is_empty() {
                configs.push(FleetLaunchTemplateConfig {
                    launch_template_name: template.name.clone(),
                    version: "$Latest".to_string(),
                    overrides,
                });
            }
        }
        if configs.is_empty() {
            return Err(Error::insufficient_capacity(
                "no capacity offerings are currently available given the constraints",
            ));
        }

        if let Some(warning) = od_fallback_warning(requirements, candidates, capacity_type) {
            warn!("{warning}");
        }

        let mut tags = filter_restricted_tags(&node_class.spec.tags);
        tags.insert("Name".to_string(), node_claim.name_any());
        tags.insert(
            cluster_tag_key(&self.settings.cluster_name),
            "owned".to_string(),
        );
        tags.insert(NODE_CLAIM_TAG_KEY.to_string(), node_claim.name_any());
        tags.insert(NODE_CLASS_TAG_KEY.to_string(), node_class.name_any());

        let response = match self
            .ec2
            .create_fleet(CreateFleetRequest {
                launch_template_configs: configs,
                capacity_type: match capacity_type {
                    CapacityType::Spot => FleetCapacityType::Spot,
                    CapacityType::OnDemand => FleetCapacityType::OnDemand,
                },
                allocation_strategy: match capacity_type {
                    CapacityType::Spot => AllocationStrategy::PriceCapacityOptimized,
                    CapacityType::OnDemand => AllocationStrategy::LowestPrice,
                },
                total_target_capacity: 1,
                tags,
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.is_launch_template_not_found() {
                    for template in &templates {
                        self.launch_templates.invalidate(&template.name);
                    }
                }
                return Err(e);
            }
        };

        for fleet_error in &response.errors {
            self.unavailable.mark_from_fleet_error(fleet_error, capacity_type);
        }
        match response.instance_ids.first() {
            Some(id) => Ok((id.clone(), capacity_type)),
            None => Err(combine_fleet_errors(&response.errors)),
        }
    }

    /// Fetch a live instance; errors until the PrivateDnsName is populated
    /// so that callers can poll with backoff
    pub async fn get(&self, instance_id: &str) -> Result<Instance> {
        let instances = self
            .ec2
            .describe_instances(&[
                Filter::new("instance-id", [instance_id]),
                live_state_filter(),
            ])
            .await?;
        let instance = instances.into_iter().next().ok_or_else(|| {
            Error::cloud(
                "InvalidInstanceID.NotFound",
                format!("instance {instance_id} not found"),
            )
        })?;
        if instance.private_dns_name.as_deref().unwrap_or("").is_empty() {
            return Err(Error::internal(
                "launch",
                format!("instance {instance_id} found but PrivateDnsName is not yet set"),
            ));
        }
        Ok(instance)
    }

    /// All live instances owned by this cluster
    pub async fn list(&self) -> Result<Vec<Instance>> {
        self.ec2
            .describe_instances(&[
                Filter::new("tag-key", [NODE_CLAIM_TAG_KEY]),
                Filter::new("tag-key", [cluster_tag_key(&self.settings.cluster_name)]),
                live_state_filter(),
            ])
            .await
    }

    /// Terminate an instance; already-gone instances are not an error
    pub async fn terminate(&self, instance_id: &str) -> Result<()> {
        match self.ec2.terminate_instances(&[instance_id.to_string()]).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Back-fill ownership tags on an instance, polling until the write is
    /// observable to absorb EC2's eventual consistency
    pub async fn tag(
        &self,
        instance_id: &str,
        node_claim_name: &str,
        node_class_name: &str,
    ) -> Result<()> {
        let tags = BTreeMap::from([
            ("Name".to_string(), node_claim_name.to_string()),
            (
                cluster_tag_key(&self.settings.cluster_name),
                "owned".to_string(),
            ),
            (NODE_CLAIM_TAG_KEY.to_string(), node_claim_name.to_string()),
            (NODE_CLASS_TAG_KEY.to_string(), node_class_name.to_string()),
        ]);
        self.ec2
            .create_tags(&[instance_id.to_string()], &tags)
            .await?;

        retry_with_backoff(
            &RetryConfig::eventual_consistency(),
            "observe-instance-tags",
            || async {
                let instance = self.get(instance_id).await?;
                if instance.tags.get(NODE_CLAIM_TAG_KEY).map(String::as_str)
                    == Some(node_claim_name)
                {
                    Ok(())
                } else {
                    Err(Error::internal(
                        "tagging",
                        format!("tag write on {instance_id} not yet observable"),
                    ))
                }
            },
        )
        .await
    }
}

fn live_state_filter() -> Filter {
    Filter::new("instance-state-name", LIVE_INSTANCE_STATES.iter().copied())
}

/// Spot iff the requirements admit spot and at least one candidate has an
/// available spot offering in an admitted zone; on-demand otherwise
pub fn select_capacity_type(
    requirements: &Requirements,
    candidates: &[InstanceType],
) -> CapacityType {
    if requirements
        .get(labels::CAPACITY_TYPE)
        .has(labels::CAPACITY_TYPE_SPOT)
    {
        for it in candidates {
            for offering in it.available_offerings() {
                if offering.capacity_type == CapacityType::Spot
                    && requirements.get(labels::ZONE).has(&offering.zone)
                {
                    return CapacityType::Spot;
                }
            }
        }
    }
    CapacityType::OnDemand
}

/// Drop exotic types when generic alternatives exist, and overpriced spot
/// types on mixed-capacity launches
pub fn filter_instance_types(
    instance_types: Vec<InstanceType>,
    requirements: &Requirements,
) -> Vec<InstanceType> {
    let filtered = filter_exotic_instance_types(instance_types);
    if is_mixed_capacity_launch(requirements, &filtered) {
        filter_unwanted_spot(filtered)
    } else {
        filtered
    }
}

/// Deprioritize metal and accelerator types unless nothing generic fits
fn filter_exotic_instance_types(instance_types: Vec<InstanceType>) -> Vec<InstanceType> {
    let generic: Vec<InstanceType> = instance_types
        .iter()
        .filter(|it| {
            if it.requirements.get(labels::INSTANCE_SIZE).has("metal") {
                return false;
            }
            [
                cirrus_common::resources::NVIDIA_GPU,
                cirrus_common::resources::AMD_GPU,
                cirrus_common::resources::AWS_NEURON,
                cirrus_common::resources::HABANA_GAUDI,
            ]
            .iter()
            .all(|r| it.capacity.get(r).is_zero())
        })
        .cloned()
        .collect();
    if generic.is_empty() {
        instance_types
    } else {
        generic
    }
}

/// True when the requirements admit both capacity types and the candidate
/// offerings actually contain both in admitted zones
fn is_mixed_capacity_launch(requirements: &Requirements, candidates: &[InstanceType]) -> bool {
    let capacity_types = requirements.get(labels::CAPACITY_TYPE);
    if !capacity_types.has(labels::CAPACITY_TYPE_SPOT)
        || !capacity_types.has(labels::CAPACITY_TYPE_ON_DEMAND)
    {
        return false;
    }
    let mut has_spot = false;
    let mut has_on_demand = false;
    for it in candidates {
        for offering in it.available_offerings() {
            if requirements.get(labels::ZONE).has(&offering.zone) {
                match offering.capacity_type {
                    CapacityType::Spot => has_spot = true,
                    CapacityType::OnDemand => has_on_demand = true,
                }
            }
        }
    }
    has_spot && has_on_demand
}

/// On mixed-capacity launches, drop types whose cheapest offering is a spot
/// offering priced above the cheapest on-demand option discounted by the
/// long-term-commitment factor; a pricier spot instance would cost more
/// than simply buying on-demand
fn filter_unwanted_spot(instance_types: Vec<InstanceType>) -> Vec<InstanceType> {
    let mut cheapest_on_demand = f64::MAX;
    for it in &instance_types {
        for offering in it.available_offerings() {
            if offering.capacity_type == CapacityType::OnDemand
                && offering.price < cheapest_on_demand
            {
                cheapest_on_demand = offering.price;
            }
        }
    }

    instance_types
        .into_iter()
        .filter(|it| {
            let cheapest = it
                .available_offerings()
                .min_by(|a, b| a.price.total_cmp(&b.price));
            match cheapest {
                None => false,
                Some(o) if o.capacity_type == CapacityType::OnDemand => {
                    o.price <= cheapest_on_demand
                }
                Some(o) => o.price <= cheapest_on_demand * 0.72,
            }
        })
        .collect()
}

/// Order candidates by their cheapest admitted offering; ties prefer newer
/// generations, which sort lexicographically higher (c6i before c5)
pub fn order_by_price(instance_types: &mut [InstanceType], requirements: &Requirements) {
    instance_types.sort_by(|a, b| {
        let a_price = a
            .cheapest_offering(requirements)
            .map(|o| o.price)
            .unwrap_or(f64::MAX);
        let b_price = b
            .cheapest_offering(requirements)
            .map(|o| o.price)
            .unwrap_or(f64::MAX);
        a_price
            .total_cmp(&b_price)
            .then_with(|| b.name.cmp(&a.name))
    });
}

/// Advisory warning when falling back to on-demand with little type
/// flexibility although spot was admitted
fn od_fallback_warning(
    requirements: &Requirements,
    candidates: &[InstanceType],
    capacity_type: CapacityType,
) -> Option<String> {
    if capacity_type != CapacityType::OnDemand
        || !requirements
            .get(labels::CAPACITY_TYPE)
            .has(labels::CAPACITY_TYPE_SPOT)
    {
        return None;
    }
    if candidates.len() < FLEXIBILITY_THRESHOLD {
        return Some(format!(
            "at least {FLEXIBILITY_THRESHOLD} instance types are recommended when flexible to \
             spot but requesting on-demand; this request only has {} instance type options",
            candidates.len()
        ));
    }
    None
}

/// The cross product of candidate offerings and zonal subnets, constrained
/// by the selected capacity type and the claim's zone requirement
pub fn build_overrides(
    candidates: &[&InstanceType],
    subnets_by_zone: &BTreeMap<String, cirrus_cloud::ec2::Subnet>,
    requirements: &Requirements,
    capacity_type: CapacityType,
) -> Vec<FleetOverride> {
    let mut overrides = Vec::new();
    for it in candidates {
        for offering in it.available_offerings() {
            if offering.capacity_type != capacity_type {
                continue;
            }
            if !requirements.get(labels::ZONE).has(&offering.zone) {
                continue;
            }
            let subnet = match subnets_by_zone.get(&offering.zone) {
                Some(subnet) => subnet,
                None => continue,
            };
            overrides.push(FleetOverride {
                instance_type: it.name.clone(),
                subnet_id: subnet.subnet_id.clone(),
                availability_zone: offering.zone.clone(),
            });
        }
    }
    overrides
}

/// Combine per-override fleet errors into one error; all-capacity-code
/// failures collapse into the dedicated insufficient-capacity error so the
/// scheduler can retry with a different shape
fn combine_fleet_errors(errors: &[FleetError]) -> Error {
    let mut unique: Vec<String> = errors
        .iter()
        .map(|e| format!("{}: {}", e.code, e.message))
        .collect();
    unique.sort();
    unique.dedup();
    let combined = unique.join("; ");

    if !errors.is_empty()
        && errors
            .iter()
            .all(|e| is_unfulfillable_capacity_code(&e.code))
    {
        return Error::insufficient_capacity(format!("with fleet error(s): {combined}"));
    }
    Error::internal("launch", format!("with fleet error(s): {combined}"))
}
