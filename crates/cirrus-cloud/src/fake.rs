//! Deterministic in-memory implementations of the capability interfaces
//!
//! These back the workspace's tests: they model just enough EC2/IAM/queue
//! behavior for the providers and controllers to be exercised end-to-end,
//! including scripted fleet outcomes for capacity-error scenarios.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use cirrus_common::{Error, Result};

use crate::ec2::{
    CreateFleetRequest, CreateFleetResponse, CreateLaunchTemplateRequest, Ec2Api, Filter, Image,
    Instance, InstanceTypeInfo, LaunchTemplate, SecurityGroup, Subnet,
};
use crate::iam::{IamApi, InstanceProfile};
use crate::pricing::{OnDemandPrice, PricingApi, SpotPrice};
use crate::queue::{QueueApi, QueueMessage};

/// A scripted outcome for the next `create_fleet` call
pub enum FleetOutcome {
    /// Fail the whole request with this error
    Fail(Error),
    /// Return this response verbatim
    Respond(CreateFleetResponse),
}

#[derive(Default)]
struct Ec2State {
    instance_types: Vec<InstanceTypeInfo>,
    offerings: BTreeMap<String, BTreeSet<String>>,
    subnets: Vec<Subnet>,
    security_groups: Vec<SecurityGroup>,
    images: Vec<Image>,
    launch_templates: BTreeMap<String, (LaunchTemplate, CreateLaunchTemplateRequest)>,
    instances: BTreeMap<String, Instance>,
    fleet_requests: Vec<CreateFleetRequest>,
    fleet_outcomes: VecDeque<FleetOutcome>,
    deleted_launch_templates: Vec<String>,
    next_instance: u64,
    next_template: u64,
}

/// In-memory EC2
#[derive(Default)]
pub struct MemoryEc2 {
    state: Mutex<Ec2State>,
}

impl MemoryEc2 {
    /// Empty EC2
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed instance types
    pub fn set_instance_types(&self, types: Vec<InstanceTypeInfo>) {
        self.state.lock().instance_types = types;
    }

    /// Seed per-zone offerings
    pub fn set_offerings(&self, offerings: BTreeMap<String, BTreeSet<String>>) {
        self.state.lock().offerings = offerings;
    }

    /// Seed subnets
    pub fn set_subnets(&self, subnets: Vec<Subnet>) {
        self.state.lock().subnets = subnets;
    }

    /// Seed security groups
    pub fn set_security_groups(&self, groups: Vec<SecurityGroup>) {
        self.state.lock().security_groups = groups;
    }

    /// Seed images
    pub fn set_images(&self, images: Vec<Image>) {
        self.state.lock().images = images;
    }

    /// Insert an instance directly, bypassing the fleet path
    pub fn insert_instance(&self, instance: Instance) {
        self.state
            .lock()
            .instances
            .insert(instance.instance_id.clone(), instance);
    }

    /// Script the outcome of the next fleet call; outcomes apply in order,
    /// and an empty script means organic success
    pub fn push_fleet_outcome(&self, outcome: FleetOutcome) {
        self.state.lock().fleet_outcomes.push_back(outcome);
    }

    /// Fleet requests observed so far
    pub fn fleet_requests(&self) -> Vec<CreateFleetRequest> {
        self.state.lock().fleet_requests.clone()
    }

    /// Names of launch templates that currently exist
    pub fn launch_template_names(&self) -> Vec<String> {
        self.state.lock().launch_templates.keys().cloned().collect()
    }

    /// Names of deleted launch templates
    pub fn deleted_launch_templates(&self) -> Vec<String> {
        self.state.lock().deleted_launch_templates.clone()
    }

    /// Fetch an instance by id for assertions
    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.state.lock().instances.get(id).cloned()
    }

    /// Clear a tag from an instance, simulating eventual consistency of
    /// tag writes
    pub fn remove_instance_tag(&self, id: &str, key: &str) {
        if let Some(instance) = self.state.lock().instances.get_mut(id) {
            instance.tags.remove(key);
        }
    }
}

fn matches_tag_filters(tags: &BTreeMap<String, String>, filter: &Filter) -> Option<bool> {
    if filter.name == "tag-key" {
        return Some(filter.values.iter().any(|k| tags.contains_key(k)));
    }
    if let Some(key) = filter.name.strip_prefix("tag:") {
        return Some(match tags.get(key) {
            Some(v) => filter.values.iter().any(|fv| fv == "*" || fv == v),
            None => false,
        });
    }
    None
}

/// Simple glob match supporting `*` wildcards
fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(idx) => {
                if i == 0 && idx != 0 {
                    return false;
                }
                rest = &rest[idx + part.len()..];
            }
            None => return false,
        }
    }
    if let Some(last) = parts.last() {
        if !last.is_empty() && !pattern.ends_with('*') && !value.ends_with(last) {
            return false;
        }
    }
    true
}

#[async_trait]
impl Ec2Api for MemoryEc2 {
    async fn describe_instance_types(&self) -> Result<Vec<InstanceTypeInfo>> {
        Ok(self.state.lock().instance_types.clone())
    }

    async fn describe_instance_type_offerings(
        &self,
    ) -> Result<BTreeMap<String, BTreeSet<String>>> {
        Ok(self.state.lock().offerings.clone())
    }

    async fn describe_subnets(&self, filters: &[Filter]) -> Result<Vec<Subnet>> {
        let state = self.state.lock();
        Ok(state
            .subnets
            .iter()
            .filter(|s| {
                filters.iter().all(|f| {
                    if let Some(m) = matches_tag_filters(&s.tags, f) {
                        return m;
                    }
                    match f.name.as_str() {
                        "subnet-id" => f.values.iter().any(|v| *v == s.subnet_id),
                        "availability-zone" => {
                            f.values.iter().any(|v| *v == s.availability_zone)
                        }
                        _ => false,
                    }
                })
            })
            .cloned()
            .collect())
    }

    async fn describe_security_groups(&self, filters: &[Filter]) -> Result<Vec<SecurityGroup>> {
        let state = self.state.lock();
        Ok(state
            .security_groups
            .iter()
            .filter(|g| {
                filters.iter().all(|f| {
                    if let Some(m) = matches_tag_filters(&g.tags, f) {
                        return m;
                    }
                    match f.name.as_str() {
                        "group-id" => f.values.iter().any(|v| *v == g.group_id),
                        "group-name" => f.values.iter().any(|v| *v == g.group_name),
                        _ => false,
                    }
                })
            })
            .cloned()
            .collect())
    }

    async fn describe_images(&self, filters: &[Filter], _owners: &[String]) -> Result<Vec<Image>> {
        let state = self.state.lock();
        Ok(state
            .images
            .iter()
            .filter(|img| {
                filters.iter().all(|f| {
                    if let Some(m) = matches_tag_filters(&img.tags, f) {
                        return m;
                    }
                    match f.name.as_str() {
                        "image-id" => f.values.iter().any(|v| *v == img.image_id),
                        "name" => f.values.iter().any(|v| glob_match(v, &img.name)),
                        _ => false,
                    }
                })
            })
            .cloned()
            .collect())
    }

    async fn create_launch_template(
        &self,
        request: CreateLaunchTemplateRequest,
    ) -> Result<LaunchTemplate> {
        let mut state = self.state.lock();
        if state.launch_templates.contains_key(&request.name) {
            return Err(Error::cloud(
                "InvalidLaunchTemplateName.AlreadyExistsException",
                format!("launch template {} already exists", request.name),
            ));
        }
        state.next_template += 1;
        let template = LaunchTemplate {
            name: request.name.clone(),
            id: format!("lt-{:017x}", state.next_template),
            tags: request.tags.clone(),
        };
        state
            .launch_templates
            .insert(request.name.clone(), (template.clone(), request));
        Ok(template)
    }

    async fn describe_launch_templates(&self, filters: &[Filter]) -> Result<Vec<LaunchTemplate>> {
        let state = self.state.lock();
        Ok(state
            .launch_templates
            .values()
            .map(|(t, _)| t)
            .filter(|t| {
                filters.iter().all(|f| {
                    if let Some(m) = matches_tag_filters(&t.tags, f) {
                        return m;
                    }
                    match f.name.as_str() {
                        "launch-template-name" => f.values.iter().any(|v| *v == t.name),
                        _ => false,
                    }
                })
            })
            .cloned()
            .collect())
    }

    async fn delete_launch_template(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.launch_templates.remove(name).is_none() {
            return Err(Error::cloud(
                "InvalidLaunchTemplateName.NotFoundException",
                format!("launch template {name} does not exist"),
            ));
        }
        state.deleted_launch_templates.push(name.to_string());
        Ok(())
    }

    async fn create_fleet(&self, request: CreateFleetRequest) -> Result<CreateFleetResponse> {
        let mut state = self.state.lock();
        state.fleet_requests.push(request.clone());

        if let Some(outcome) = state.fleet_outcomes.pop_front() {
            return match outcome {
                FleetOutcome::Fail(e) => Err(e),
                FleetOutcome::Respond(r) => Ok(r),
            };
        }

        // Organic path: launch the first override of the first config
        let config = request
            .launch_template_configs
            .first()
            .ok_or_else(|| Error::internal("fake-ec2", "fleet request without configs"))?;
        let (_, template_request) = state
            .launch_templates
            .get(&config.launch_template_name)
            .cloned()
            .ok_or_else(|| {
                Error::cloud(
                    "InvalidLaunchTemplateName.NotFoundException",
                    format!(
                        "launch template {} does not exist",
                        config.launch_template_name
                    ),
                )
            })?;
        let override_ = config
            .overrides
            .first()
            .ok_or_else(|| Error::internal("fake-ec2", "fleet config without overrides"))?;

        state.next_instance += 1;
        let id = format!("i-{:017x}", state.next_instance);
        let instance = Instance {
            instance_id: id.clone(),
            instance_type: override_.instance_type.clone(),
            availability_zone: override_.availability_zone.clone(),
            private_dns_name: Some(format!("ip-10-0-0-{}.ec2.internal", state.next_instance)),
            image_id: template_request.image_id.clone(),
            spot: matches!(
                request.capacity_type,
                crate::ec2::FleetCapacityType::Spot
            ),
            state: "pending".to_string(),
            launch_time: Utc::now(),
            tags: request.tags.clone(),
        };
        state.instances.insert(id.clone(), instance);

        Ok(CreateFleetResponse {
            instance_ids: vec![id],
            errors: Vec::new(),
        })
    }

    async fn describe_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>> {
        let state = self.state.lock();
        Ok(state
            .instances
            .values()
            .filter(|i| {
                filters.iter().all(|f| {
                    if let Some(m) = matches_tag_filters(&i.tags, f) {
                        return m;
                    }
                    match f.name.as_str() {
                        "instance-id" => f.values.iter().any(|v| *v == i.instance_id),
                        "instance-state-name" => f.values.iter().any(|v| *v == i.state),
                        _ => false,
                    }
                })
            })
            .cloned()
            .collect())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        for id in instance_ids {
            match state.instances.get_mut(id) {
                Some(instance) => instance.state = "terminated".to_string(),
                None => {
                    return Err(Error::cloud(
                        "InvalidInstanceID.NotFound",
                        format!("instance {id} does not exist"),
                    ))
                }
            }
        }
        Ok(())
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        for id in resource_ids {
            match state.instances.get_mut(id) {
                Some(instance) => instance.tags.extend(tags.clone()),
                None => {
                    return Err(Error::cloud(
                        "InvalidInstanceID.NotFound",
                        format!("instance {id} does not exist"),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// In-memory IAM
#[derive(Default)]
pub struct MemoryIam {
    profiles: Mutex<BTreeMap<String, InstanceProfile>>,
}

impl MemoryIam {
    /// Empty IAM
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a profile directly
    pub fn insert_profile(&self, profile: InstanceProfile) {
        self.profiles.lock().insert(profile.name.clone(), profile);
    }

    /// Fetch a profile for assertions
    pub fn profile(&self, name: &str) -> Option<InstanceProfile> {
        self.profiles.lock().get(name).cloned()
    }
}

fn no_such_entity(name: &str) -> Error {
    Error::cloud("NoSuchEntity", format!("instance profile {name} not found"))
}

#[async_trait]
impl IamApi for MemoryIam {
    async fn get_instance_profile(&self, name: &str) -> Result<InstanceProfile> {
        self.profiles
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| no_such_entity(name))
    }

    async fn create_instance_profile(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<InstanceProfile> {
        let mut profiles = self.profiles.lock();
        if profiles.contains_key(name) {
            return Err(Error::cloud(
                "EntityAlreadyExists",
                format!("instance profile {name} already exists"),
            ));
        }
        let profile = InstanceProfile {
            name: name.to_string(),
            roles: Vec::new(),
            tags: tags.clone(),
        };
        profiles.insert(name.to_string(), profile.clone());
        Ok(profile)
    }

    async fn tag_instance_profile(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut profiles = self.profiles.lock();
        let profile = profiles.get_mut(name).ok_or_else(|| no_such_entity(name))?;
        profile.tags.extend(tags.clone());
        Ok(())
    }

    async fn add_role_to_instance_profile(&self, name: &str, role: &str) -> Result<()> {
        let mut profiles = self.profiles.lock();
        let profile = profiles.get_mut(name).ok_or_else(|| no_such_entity(name))?;
        if !profile.roles.is_empty() {
            return Err(Error::cloud(
                "LimitExceeded",
                "cannot exceed quota for roles per instance profile",
            ));
        }
        profile.roles.push(role.to_string());
        Ok(())
    }

    async fn remove_role_from_instance_profile(&self, name: &str, role: &str) -> Result<()> {
        let mut profiles = self.profiles.lock();
        let profile = profiles.get_mut(name).ok_or_else(|| no_such_entity(name))?;
        let before = profile.roles.len();
        profile.roles.retain(|r| r != role);
        if profile.roles.len() == before {
            return Err(Error::cloud(
                "NoSuchEntity",
                format!("role {role} is not attached to {name}"),
            ));
        }
        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str) -> Result<()> {
        let mut profiles = self.profiles.lock();
        match profiles.get(name) {
            None => Err(no_such_entity(name)),
            Some(p) if !p.roles.is_empty() => Err(Error::cloud(
                "DeleteConflict",
                "cannot delete entity, must remove roles from instance profile first",
            )),
            Some(_) => {
                profiles.remove(name);
                Ok(())
            }
        }
    }
}

/// In-memory pricing service
#[derive(Default)]
pub struct MemoryPricing {
    on_demand: Mutex<Vec<OnDemandPrice>>,
    spot: Mutex<Vec<SpotPrice>>,
}

impl MemoryPricing {
    /// Empty pricing service
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed on-demand prices
    pub fn set_on_demand(&self, prices: Vec<OnDemandPrice>) {
        *self.on_demand.lock() = prices;
    }

    /// Seed spot prices
    pub fn set_spot(&self, prices: Vec<SpotPrice>) {
        *self.spot.lock() = prices;
    }
}

#[async_trait]
impl PricingApi for MemoryPricing {
    async fn on_demand_prices(&self, _region: &str) -> Result<Vec<OnDemandPrice>> {
        Ok(self.on_demand.lock().clone())
    }

    async fn spot_prices(&self, _region: &str) -> Result<Vec<SpotPrice>> {
        Ok(self.spot.lock().clone())
    }
}

/// In-memory message queue
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<VecDeque<QueueMessage>>,
    deleted: Mutex<Vec<String>>,
    next_id: Mutex<u64>,
}

impl MemoryQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message body; returns the message id
    pub fn push(&self, body: impl Into<String>) -> String {
        let mut next = self.next_id.lock();
        *next += 1;
        let id = format!("msg-{next}", next = *next);
        self.messages.lock().push_back(QueueMessage {
            message_id: id.clone(),
            receipt_handle: format!("{id}-rh"),
            body: body.into(),
        });
        id
    }

    /// Receipt handles acknowledged so far
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// Messages still queued
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// True if no messages are queued
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

#[async_trait]
impl QueueApi for MemoryQueue {
    async fn receive_messages(
        &self,
        _queue: &str,
        max_messages: usize,
        _wait: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let mut messages = self.messages.lock();
        let n = max_messages.min(messages.len());
        Ok(messages.drain(..n).collect())
    }

    async fn delete_message(&self, _queue: &str, receipt_handle: &str) -> Result<()> {
        self.deleted.lock().push(receipt_handle.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_match("al2023-ami-*", "al2023-ami-2023.4.20240611-kernel-6.1-x86_64"));
        assert!(glob_match("*-arm64-*", "amzn2-ami-hvm-2.0-arm64-gp2"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(!glob_match("al2023-ami-*", "bottlerocket-aws-k8s-1.30"));
    }

    #[tokio::test]
    async fn subnet_tag_filters() {
        let ec2 = MemoryEc2::new();
        ec2.set_subnets(vec![
            Subnet {
                subnet_id: "subnet-1".to_string(),
                availability_zone: "us-west-2a".to_string(),
                availability_zone_id: "usw2-az1".to_string(),
                available_ip_address_count: 100,
                tags: BTreeMap::from([("cirrus-discovery".to_string(), "test".to_string())]),
            },
            Subnet {
                subnet_id: "subnet-2".to_string(),
                availability_zone: "us-west-2b".to_string(),
                availability_zone_id: "usw2-az2".to_string(),
                available_ip_address_count: 50,
                tags: BTreeMap::new(),
            },
        ]);

        let matched = ec2
            .describe_subnets(&[Filter::new("tag:cirrus-discovery", ["*"])])
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].subnet_id, "subnet-1");
    }

    #[tokio::test]
    async fn queue_receive_and_ack() {
        let queue = MemoryQueue::new();
        queue.push(r#"{"hello":"world"}"#);
        queue.push(r#"{"second":true}"#);

        let received = queue
            .receive_messages("q", 1, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(queue.len(), 1);

        queue
            .delete_message("q", &received[0].receipt_handle)
            .await
            .unwrap();
        assert_eq!(queue.deleted(), vec![received[0].receipt_handle.clone()]);
    }

    #[tokio::test]
    async fn fleet_without_template_is_not_found() {
        let ec2 = MemoryEc2::new();
        let err = ec2
            .create_fleet(CreateFleetRequest {
                launch_template_configs: vec![crate::ec2::FleetLaunchTemplateConfig {
                    launch_template_name: "missing".to_string(),
                    version: "$Latest".to_string(),
                    overrides: vec![],
                }],
                capacity_type: crate::ec2::FleetCapacityType::OnDemand,
                allocation_strategy: crate::ec2::AllocationStrategy::LowestPrice,
                total_target_capacity: 1,
                tags: BTreeMap::new(),
            })
            .await
            .unwrap_err();
        assert!(err.is_launch_template_not_found());
    }
}
