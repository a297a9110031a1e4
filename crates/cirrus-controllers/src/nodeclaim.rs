//! NodeClaim lifecycle
//!
//! Materializes claims into instances: waits for the referenced NodeClass
//! to be Ready, resolves candidate instance types against the claim's
//! requirements and resource requests, drives the launch pipeline, and
//! writes the provider id back. Deletion terminates the backing instance
//! under a finalizer.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use cirrus_common::crd::{
    provider_id, ConditionStatus, Ec2NodeClass, NodeClaim, NodeClaimStatus, CONDITION_LAUNCHED,
    CONDITION_READY,
};
use cirrus_common::resources::ResourceList;
use cirrus_common::{Error, TERMINATION_FINALIZER};
use cirrus_providers::instance_type::InstanceType;
use cirrus_providers::{InstanceProvider, InstanceTypeProvider};

const FIELD_MANAGER: &str = "cirrus-nodeclaim";
const LAUNCHED_REQUEUE: Duration = Duration::from_secs(5 * 60);

/// Shared state for the NodeClaim controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// The instance-type catalog
    pub instance_types: Arc<InstanceTypeProvider>,
    /// The launch pipeline
    pub instances: Arc<InstanceProvider>,
}

/// Reconcile one NodeClaim
pub async fn reconcile(claim: Arc<NodeClaim>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = claim.name_any();

    if claim.metadata.deletion_timestamp.is_some() {
        finalize(&claim, &ctx).await?;
        return Ok(Action::await_change());
    }
    ensure_finalizer(&claim, &ctx.client).await?;

    if claim
        .status
        .as_ref()
        .and_then(|s| s.provider_id.as_ref())
        .is_some()
    {
        return Ok(Action::requeue(LAUNCHED_REQUEUE));
    }

    let node_class_name = &claim.spec.node_class_ref.name;
    let node_classes: Api<Ec2NodeClass> = Api::all(ctx.client.clone());
    let node_class = match node_classes.get(node_class_name).await {
        Ok(nc) => nc,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(claim = %name, node_class = %node_class_name, "node class does not exist yet");
            return Ok(Action::requeue(Duration::from_secs(15)));
        }
        Err(e) => return Err(e.into()),
    };
    let ready = node_class
        .status
        .as_ref()
        .map(|s| s.is_condition_true(CONDITION_READY))
        .unwrap_or(false);
    if !ready {
        debug!(claim = %name, node_class = %node_class_name, "node class is not ready");
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    let instance_types = ctx
        .instance_types
        .list(node_class.spec.kubelet.as_ref(), &node_class)
        .await?;
    let candidates = filter_candidates(instance_types, &claim);
    if candidates.is_empty() {
        return Err(Error::insufficient_capacity(format!(
            "no instance types satisfy the requirements of claim {name}"
        )));
    }

    let instance = ctx.instances.create(&node_class, &claim, candidates).await?;

    let mut status = claim.status.clone().unwrap_or_else(NodeClaimStatus::default);
    status.provider_id = Some(provider_id(
        &instance.availability_zone,
        &instance.instance_id,
    ));
    status.image_id = Some(instance.image_id.clone());
    status.capacity_type = Some(if instance.spot { "spot" } else { "on-demand" }.to_string());
    status.set_condition(CONDITION_LAUNCHED, ConditionStatus::True, "Launched", "");

    let claims: Api<NodeClaim> = Api::all(ctx.client.clone());
    claims
        .patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;

    info!(claim = %name, instance = %instance.instance_id, "node claim launched");
    Ok(Action::requeue(LAUNCHED_REQUEUE))
}

/// Requeue policy: capacity exhaustion waits out the unavailability TTL
/// window before the shape is retried; everything else backs off briefly
pub fn error_policy(claim: Arc<NodeClaim>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(claim = %claim.name_any(), error = %error, "reconcile error, will retry");
    if error.is_insufficient_capacity() {
        Action::requeue(Duration::from_secs(15))
    } else {
        Action::requeue(Duration::from_secs(30))
    }
}

/// Candidates are the resolved types whose labels satisfy the claim's
/// requirements and whose allocatable fits the resource requests
pub fn filter_candidates(instance_types: Vec<InstanceType>, claim: &NodeClaim) -> Vec<InstanceType> {
    let requirements = claim.requirements();
    let requests = claim
        .spec
        .resources
        .as_ref()
        .map(|r| ResourceList::from_string_map(&r.requests))
        .unwrap_or_default();

    instance_types
        .into_iter()
        .filter(|it| it.matches(&requirements))
        .filter(|it| it.allocatable().fits(&requests))
        .filter(|it| it.available_offerings().next().is_some())
        .collect()
}

async fn ensure_finalizer(claim: &NodeClaim, client: &Client) -> Result<(), Error> {
    if claim.finalizers().iter().any(|f| f == TERMINATION_FINALIZER) {
        return Ok(());
    }
    let mut finalizers = claim.finalizers().to_vec();
    finalizers.push(TERMINATION_FINALIZER.to_string());
    let api: Api<NodeClaim> = Api::all(client.clone());
    api.patch(
        &claim.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

/// Terminate the backing instance, then drop the finalizer
async fn finalize(claim: &NodeClaim, ctx: &Context) -> Result<(), Error> {
    if !claim.finalizers().iter().any(|f| f == TERMINATION_FINALIZER) {
        return Ok(());
    }
    if let Some(instance_id) = claim.instance_id() {
        info!(claim = %claim.name_any(), instance = instance_id, "terminating instance");
        ctx.instances.terminate(instance_id).await?;
    }
    let finalizers: Vec<String> = claim
        .finalizers()
        .iter()
        .filter(|f| *f != TERMINATION_FINALIZER)
        .cloned()
        .collect();
    let api: Api<NodeClaim> = Api::all(ctx.client.clone());
    api.patch(
        &claim.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_common::crd::{NodeClaimSpec, NodeClassRef, ResourceRequests};
    use cirrus_common::labels;
    use cirrus_common::resources::{self, Quantity};
    use cirrus_common::scheduling::{Requirement, Requirements};
    use cirrus_providers::instance_type::{CapacityType, Offering, Overhead};
    use std::collections::BTreeMap;

    fn instance_type(name: &str, cpu: i64, available: bool) -> InstanceType {
        let mut requirements = Requirements::new();
        requirements.insert_value(labels::INSTANCE_TYPE, name);
        requirements.insert_value(labels::ARCH, "amd64");
        requirements.insert_value(labels::INSTANCE_CPU, cpu.to_string());
        let mut capacity = ResourceList::new();
        capacity.insert(resources::CPU, Quantity::from_units(cpu));
        capacity.insert(resources::MEMORY, Quantity::gibibytes(cpu * 4));
        InstanceType {
            name: name.to_string(),
            requirements,
            offerings: vec![Offering {
                zone: "us-west-2a".to_string(),
                zone_id: None,
                capacity_type: CapacityType::OnDemand,
                price: 0.1,
                available,
            }],
            capacity,
            overhead: Overhead::default(),
        }
    }

    fn claim(requirements: Vec<Requirement>, requests: &[(&str, &str)]) -> NodeClaim {
        NodeClaim::new(
            "claim-1",
            NodeClaimSpec {
                requirements,
                resources: if requests.is_empty() {
                    None
                } else {
                    Some(ResourceRequests {
                        requests: requests
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    })
                },
                node_class_ref: NodeClassRef {
                    name: "default".to_string(),
                },
            },
        )
    }

    #[test]
    fn candidates_filtered_by_requirements() {
        let types = vec![
            instance_type("m5.large", 2, true),
            instance_type("m5.xlarge", 4, true),
        ];
        let claim = claim(
            vec![Requirement::new_in(labels::INSTANCE_TYPE, ["m5.xlarge"])],
            &[],
        );
        let candidates = filter_candidates(types, &claim);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "m5.xlarge");
    }

    #[test]
    fn candidates_must_fit_requests() {
        let types = vec![
            instance_type("m5.large", 2, true),
            instance_type("m5.2xlarge", 8, true),
        ];
        let claim = claim(vec![], &[("cpu", "3500m")]);
        let candidates = filter_candidates(types, &claim);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "m5.2xlarge");
    }

    #[test]
    fn candidates_need_an_available_offering() {
        let types = vec![instance_type("m5.large", 2, false)];
        let candidates = filter_candidates(types, &claim(vec![], &[]));
        assert!(candidates.is_empty());
    }

    #[test]
    fn unschedulable_resource_requests_filter_everything() {
        let types = vec![instance_type("m5.large", 2, true)];
        let claim = claim(vec![], &[("nvidia.com/gpu", "1")]);
        assert!(filter_candidates(types, &claim).is_empty());

        let mut gpu = instance_type("g4dn.xlarge", 4, true);
        gpu.capacity.insert(resources::NVIDIA_GPU, Quantity::from_units(1));
        let types = vec![gpu];
        let claim2 = NodeClaim::new(
            "claim-2",
            NodeClaimSpec {
                requirements: vec![],
                resources: Some(ResourceRequests {
                    requests: BTreeMap::from([(
                        "nvidia.com/gpu".to_string(),
                        "1".to_string(),
                    )]),
                }),
                node_class_ref: NodeClassRef {
                    name: "default".to_string(),
                },
            },
        );
        assert_eq!(filter_candidates(types, &claim2).len(), 1);
    }
}
