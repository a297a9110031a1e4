//! Ec2NodeClass status reconciliation
//!
//! Runs the resolvers sequentially (AMI, subnet, security group, instance
//! profile, readiness), accumulating errors instead of short-circuiting so
//! that every status segment reflects the latest resolution. The status
//! subresource is only patched when the resolved content differs from the
//! stored copy. A termination finalizer is added on first observation;
//! deletion releases launch templates and the managed instance profile
//! before removing it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use cirrus_common::crd::{
    ConditionStatus, Ec2NodeClass, ResolvedAmi, ResolvedSecurityGroup, ResolvedSubnet,
    CONDITION_AMIS_READY, CONDITION_INSTANCE_PROFILE_READY, CONDITION_READY,
    CONDITION_SECURITY_GROUPS_READY, CONDITION_SUBNETS_READY,
};
use cirrus_common::{metrics, Error, TERMINATION_FINALIZER};
use cirrus_providers::{
    AmiProvider, InstanceProfileProvider, LaunchTemplateProvider, SecurityGroupProvider,
    SubnetProvider,
};

const DEFAULT_REQUEUE: Duration = Duration::from_secs(5 * 60);
const FIELD_MANAGER: &str = "cirrus-nodeclass";

/// Shared state for the NodeClass controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Subnet resolver
    pub subnets: Arc<SubnetProvider>,
    /// Security-group resolver
    pub security_groups: Arc<SecurityGroupProvider>,
    /// AMI resolver
    pub amis: Arc<AmiProvider>,
    /// Managed instance-profile lifecycle
    pub instance_profiles: Arc<InstanceProfileProvider>,
    /// Launch-template lifecycle, needed for termination
    pub launch_templates: Arc<LaunchTemplateProvider>,
}

/// Reconcile one Ec2NodeClass
pub async fn reconcile(
    node_class: Arc<Ec2NodeClass>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = node_class.name_any();
    let started = Instant::now();
    debug!(node_class = %name, "reconciling node class");

    if node_class.metadata.deletion_timestamp.is_some() {
        finalize(&node_class, &ctx).await?;
        return Ok(Action::await_change());
    }

    ensure_finalizer(&node_class, &ctx.client).await?;

    let mut resolved = (*node_class).clone();
    if resolved.status.is_none() {
        resolved.status = Some(Default::default());
    }
    let (requeue, errors) = resolve(&mut resolved, &ctx).await;

    if resolved.status != node_class.status {
        let api: Api<Ec2NodeClass> = Api::all(ctx.client.clone());
        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(serde_json::json!({ "status": resolved.status })),
        )
        .await?;
    }

    let result = if errors.is_empty() { "success" } else { "error" };
    metrics::NODECLASS_RECONCILE_DURATION.record(
        started.elapsed().as_secs_f64(),
        &[
            KeyValue::new("node_class", name.clone()),
            KeyValue::new("result", result),
        ],
    );

    if let Some(first) = errors.into_iter().next() {
        return Err(first);
    }
    Ok(Action::requeue(requeue))
}

/// Requeue policy on reconcile errors: transient failures retry quickly,
/// user errors re-evaluate on a slow cadence
pub fn error_policy(node_class: Arc<Ec2NodeClass>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(node_class = %node_class.name_any(), error = %error, "reconcile error, will retry");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::requeue(Duration::from_secs(2 * 60))
    }
}

/// Run every resolver in order, accumulating errors; the composition's
/// requeue is the minimum of the individual results
pub async fn resolve(node_class: &mut Ec2NodeClass, ctx: &Context) -> (Duration, Vec<Error>) {
    let mut requeue = DEFAULT_REQUEUE;
    let mut errors = Vec::new();

    match reconcile_amis(node_class, &ctx.amis).await {
        Ok(d) => requeue = requeue.min(d),
        Err(e) => errors.push(e),
    }
    match reconcile_subnets(node_class, &ctx.subnets).await {
        Ok(d) => requeue = requeue.min(d),
        Err(e) => errors.push(e),
    }
    match reconcile_security_groups(node_class, &ctx.security_groups).await {
        Ok(d) => requeue = requeue.min(d),
        Err(e) => errors.push(e),
    }
    match reconcile_instance_profile(node_class, &ctx.instance_profiles).await {
        Ok(d) => requeue = requeue.min(d),
        Err(e) => errors.push(e),
    }
    reconcile_readiness(node_class);

    (requeue, errors)
}

/// Resolve AMI selector terms into the status
pub async fn reconcile_amis(
    node_class: &mut Ec2NodeClass,
    provider: &AmiProvider,
) -> Result<Duration, Error> {
    let name = node_class.name_any();
    let amis = provider.list(node_class).await?;
    let status = node_class.status.get_or_insert_with(Default::default);
    if amis.is_empty() {
        status.amis.clear();
        status.set_condition(
            CONDITION_AMIS_READY,
            ConditionStatus::False,
            "AMIsNotFound",
            format!("AMI selector on {name} did not match any images"),
        );
        return Ok(DEFAULT_REQUEUE);
    }
    status.amis = amis
        .into_iter()
        .map(|a| ResolvedAmi {
            id: a.id,
            name: a.name,
            requirements: a.requirements,
        })
        .collect();
    status.set_condition(CONDITION_AMIS_READY, ConditionStatus::True, "AMIsReady", "");
    Ok(DEFAULT_REQUEUE)
}

/// Resolve subnet selector terms into the status. An empty result is an
/// error because no nodes could launch.
pub async fn reconcile_subnets(
    node_class: &mut Ec2NodeClass,
    provider: &SubnetProvider,
) -> Result<Duration, Error> {
    let name = node_class.name_any();
    let subnets = provider.list(node_class).await?;
    let status = node_class.status.get_or_insert_with(Default::default);
    if subnets.is_empty() {
        status.subnets.clear();
        status.set_condition(
            CONDITION_SUBNETS_READY,
            ConditionStatus::False,
            "SubnetsNotFound",
            format!("subnet selector on {name} did not match any subnets"),
        );
        return Err(Error::validation(
            name,
            format!(
                "no subnets exist given constraints {:?}",
                node_class.spec.subnet_selector_terms
            ),
        ));
    }
    status.subnets = subnets
        .iter()
        .map(|s| ResolvedSubnet {
            id: s.subnet_id.clone(),
            zone: s.availability_zone.clone(),
            zone_id: Some(s.availability_zone_id.clone()),
        })
        .collect();
    status.set_condition(
        CONDITION_SUBNETS_READY,
        ConditionStatus::True,
        "SubnetsReady",
        "",
    );
    Ok(DEFAULT_REQUEUE)
}

/// Resolve security-group selector terms into the status. An empty result
/// with selectors present is a false condition, not an error.
pub async fn reconcile_security_groups(
    node_class: &mut Ec2NodeClass,
    provider: &SecurityGroupProvider,
) -> Result<Duration, Error> {
    let name = node_class.name_any();
    let groups = provider.list(node_class).await?;
    let has_terms = !node_class.spec.security_group_selector_terms.is_empty();
    let status = node_class.status.get_or_insert_with(Default::default);
    if groups.is_empty() && has_terms {
        status.security_groups.clear();
        status.set_condition(
            CONDITION_SECURITY_GROUPS_READY,
            ConditionStatus::False,
            "SecurityGroupsNotFound",
            format!("security group selector on {name} did not match any groups"),
        );
        return Ok(DEFAULT_REQUEUE);
    }
    status.security_groups = groups
        .into_iter()
        .map(|g| ResolvedSecurityGroup {
            id: g.group_id,
            name: g.group_name,
        })
        .collect();
    status.set_condition(
        CONDITION_SECURITY_GROUPS_READY,
        ConditionStatus::True,
        "SecurityGroupsReady",
        "",
    );
    Ok(DEFAULT_REQUEUE)
}

/// Ensure the instance profile: pass through an unmanaged one, or create
/// and converge the managed one
pub async fn reconcile_instance_profile(
    node_class: &mut Ec2NodeClass,
    provider: &InstanceProfileProvider,
) -> Result<Duration, Error> {
    if let Some(profile) = node_class.spec.instance_profile.clone() {
        let status = node_class.status.get_or_insert_with(Default::default);
        status.instance_profile = Some(profile);
        status.set_condition(
            CONDITION_INSTANCE_PROFILE_READY,
            ConditionStatus::True,
            "InstanceProfileReady",
            "",
        );
        return Ok(DEFAULT_REQUEUE);
    }

    match provider.create(node_class).await {
        Ok(profile) => {
            let status = node_class.status.get_or_insert_with(Default::default);
            status.instance_profile = Some(profile);
            status.set_condition(
                CONDITION_INSTANCE_PROFILE_READY,
                ConditionStatus::True,
                "InstanceProfileReady",
                "",
            );
            Ok(DEFAULT_REQUEUE)
        }
        Err(e) => {
            let status = node_class.status.get_or_insert_with(Default::default);
            status.set_condition(
                CONDITION_INSTANCE_PROFILE_READY,
                ConditionStatus::False,
                "InstanceProfileCreationFailed",
                e.to_string(),
            );
            Err(e)
        }
    }
}

/// Derive the Ready condition from the resolver conditions
pub fn reconcile_readiness(node_class: &mut Ec2NodeClass) {
    let status = node_class.status.get_or_insert_with(Default::default);
    let unready: Vec<&str> = [
        CONDITION_AMIS_READY,
        CONDITION_SUBNETS_READY,
        CONDITION_SECURITY_GROUPS_READY,
        CONDITION_INSTANCE_PROFILE_READY,
    ]
    .into_iter()
    .filter(|c| !status.is_condition_true(c))
    .collect();

    if unready.is_empty() {
        status.set_condition(CONDITION_READY, ConditionStatus::True, "Ready", "");
    } else {
        status.set_condition(
            CONDITION_READY,
            ConditionStatus::False,
            "NotReady",
            format!("unready conditions: {}", unready.join(", ")),
        );
    }
}

async fn ensure_finalizer(node_class: &Ec2NodeClass, client: &Client) -> Result<(), Error> {
    if node_class
        .finalizers()
        .iter()
        .any(|f| f == TERMINATION_FINALIZER)
    {
        return Ok(());
    }
    let mut finalizers = node_class.finalizers().to_vec();
    finalizers.push(TERMINATION_FINALIZER.to_string());
    let api: Api<Ec2NodeClass> = Api::all(client.clone());
    api.patch(
        &node_class.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

/// Release derived cloud resources, then drop the termination finalizer
async fn finalize(node_class: &Ec2NodeClass, ctx: &Context) -> Result<(), Error> {
    let name = node_class.name_any();
    if !node_class
        .finalizers()
        .iter()
        .any(|f| f == TERMINATION_FINALIZER)
    {
        return Ok(());
    }
    info!(node_class = %name, "releasing derived cloud resources");
    ctx.launch_templates.delete_all(node_class).await?;
    if node_class.managed_instance_profile() {
        ctx.instance_profiles.delete(node_class).await?;
    }

    let finalizers: Vec<String> = node_class
        .finalizers()
        .iter()
        .filter(|f| *f != TERMINATION_FINALIZER)
        .cloned()
        .collect();
    let api: Api<Ec2NodeClass> = Api::all(ctx.client.clone());
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}
