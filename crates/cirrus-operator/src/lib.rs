//! Operator wiring: provider construction and controller startup
//!
//! The cloud is reached through the `cirrus-cloud` capability traits; this
//! crate wires whichever binding the binary was given into the providers
//! and starts the controllers. The network binding is the integration seam:
//! anything implementing the four traits (a SigV4 client set, a localstack
//! harness, the in-memory cloud) slots in here unchanged.

#![deny(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher;
use kube::{Client, CustomResourceExt};
use tracing::{debug, info, warn};

use cirrus_cloud::{Ec2Api, IamApi, PricingApi, QueueApi};
use cirrus_common::crd::{Ec2NodeClass, NodeClaim};
use cirrus_common::events::KubeEventPublisher;
use cirrus_common::Settings;
use cirrus_controllers::gc::{self, GarbageCollector};
use cirrus_controllers::interruption::InterruptionConsumer;
use cirrus_controllers::{nodeclaim, nodeclass};
use cirrus_providers::instance_type::CatalogOptions;
use cirrus_providers::{
    AmiProvider, InstanceProfileProvider, InstanceProvider, InstanceTypeProvider,
    LaunchTemplateProvider, PricingProvider, SecurityGroupProvider, SubnetProvider,
    UnavailableOfferings,
};

/// Up to this many distinct objects reconcile concurrently per controller
const MAX_CONCURRENT_RECONCILES: u16 = 10;

const ON_DEMAND_PRICING_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const SPOT_PRICING_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The capability bindings the operator runs against
pub struct CloudClients {
    /// EC2 control plane
    pub ec2: Arc<dyn Ec2Api>,
    /// IAM instance-profile operations
    pub iam: Arc<dyn IamApi>,
    /// Pricing service
    pub pricing: Arc<dyn PricingApi>,
    /// Interruption queue
    pub queue: Arc<dyn QueueApi>,
}

/// Install the Cirrus CRDs with server-side apply so their versions always
/// match the operator version
pub async fn install_crds(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("cirrus-operator").force();

    info!("installing Ec2NodeClass CRD");
    crds.patch(
        "ec2nodeclasses.cirrus.sh",
        &params,
        &Patch::Apply(&Ec2NodeClass::crd()),
    )
    .await?;

    info!("installing NodeClaim CRD");
    crds.patch(
        "nodeclaims.cirrus.sh",
        &params,
        &Patch::Apply(&NodeClaim::crd()),
    )
    .await?;

    Ok(())
}

/// Build the providers and run every controller until shutdown
pub async fn run_controllers(client: Client, clouds: CloudClients, settings: Settings) {
    let unavailable = Arc::new(UnavailableOfferings::new());
    let pricing = Arc::new(PricingProvider::new(
        clouds.pricing.clone(),
        settings.region.clone(),
        settings.isolated_vpc,
    ));
    let subnets = Arc::new(SubnetProvider::new(clouds.ec2.clone()));
    let security_groups = Arc::new(SecurityGroupProvider::new(clouds.ec2.clone()));
    let amis = Arc::new(AmiProvider::new(clouds.ec2.clone()));
    let instance_profiles = Arc::new(InstanceProfileProvider::new(
        clouds.iam.clone(),
        settings.region.clone(),
        settings.cluster_name.clone(),
    ));
    let launch_templates = Arc::new(LaunchTemplateProvider::new(
        clouds.ec2.clone(),
        settings.cluster_name.clone(),
    ));
    let instance_types = Arc::new(InstanceTypeProvider::new(
        clouds.ec2.clone(),
        subnets.clone(),
        pricing.clone(),
        unavailable.clone(),
        CatalogOptions::from(&settings),
    ));
    let instances = Arc::new(InstanceProvider::new(
        clouds.ec2.clone(),
        settings.clone(),
        unavailable.clone(),
        subnets.clone(),
        launch_templates.clone(),
    ));

    let nodeclass_ctx = Arc::new(nodeclass::Context {
        client: client.clone(),
        subnets,
        security_groups,
        amis,
        instance_profiles,
        launch_templates,
    });
    let nodeclaim_ctx = Arc::new(nodeclaim::Context {
        client: client.clone(),
        instance_types,
        instances: instances.clone(),
    });

    let controller_config = controller::Config::default().concurrency(MAX_CONCURRENT_RECONCILES);

    let node_classes: Api<Ec2NodeClass> = Api::all(client.clone());
    let nodeclass_controller = Controller::new(node_classes, watcher::Config::default())
        .with_config(controller_config.clone())
        .shutdown_on_signal()
        .run(nodeclass::reconcile, nodeclass::error_policy, nodeclass_ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(object = ?obj, "nodeclass reconciled"),
                Err(e) => warn!(error = %e, "nodeclass reconcile failed"),
            }
        });

    let node_claims: Api<NodeClaim> = Api::all(client.clone());
    let nodeclaim_controller = Controller::new(node_claims, watcher::Config::default())
        .with_config(controller_config)
        .shutdown_on_signal()
        .run(nodeclaim::reconcile, nodeclaim::error_policy, nodeclaim_ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(object = ?obj, "nodeclaim reconciled"),
                Err(e) => warn!(error = %e, "nodeclaim reconcile failed"),
            }
        });

    let collector = GarbageCollector::new(client.clone(), instances);
    let gc_task = collector.run(gc::DEFAULT_INTERVAL);

    let pricing_task = {
        let pricing = pricing.clone();
        async move {
            let mut on_demand = tokio::time::interval(ON_DEMAND_PRICING_INTERVAL);
            let mut spot = tokio::time::interval(SPOT_PRICING_INTERVAL);
            loop {
                tokio::select! {
                    _ = on_demand.tick() => {
                        if let Err(e) = pricing.update_on_demand_pricing().await {
                            warn!(error = %e, "on-demand pricing refresh failed");
                        }
                    }
                    _ = spot.tick() => {
                        if let Err(e) = pricing.update_spot_pricing().await {
                            warn!(error = %e, "spot pricing refresh failed");
                        }
                    }
                }
            }
        }
    };

    let interruption_task = async {
        match &settings.interruption_queue {
            Some(queue_name) => {
                let consumer = InterruptionConsumer::new(
                    client.clone(),
                    clouds.queue.clone(),
                    queue_name.clone(),
                    clouds.ec2.clone(),
                    unavailable.clone(),
                    Arc::new(KubeEventPublisher::new(client.clone(), "cirrus-interruption")),
                );
                consumer.run().await;
            }
            None => {
                info!("no interruption queue configured, consumer disabled");
                std::future::pending::<()>().await;
            }
        }
    };

    info!("starting Cirrus controllers");
    tokio::select! {
        _ = nodeclass_controller => info!("NodeClass controller completed"),
        _ = nodeclaim_controller => info!("NodeClaim controller completed"),
        _ = gc_task => info!("garbage collector completed"),
        _ = pricing_task => info!("pricing refresher completed"),
        _ = interruption_task => info!("interruption consumer completed"),
    }
}
