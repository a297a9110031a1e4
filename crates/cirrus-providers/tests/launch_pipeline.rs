//! End-to-end launch pipeline scenarios against the in-memory cloud

use std::sync::Arc;

use cirrus_cloud::ec2::{
    AllocationStrategy, CreateFleetResponse, FleetCapacityType, FleetError, FleetOverride, Subnet,
};
use cirrus_cloud::fake::{FleetOutcome, MemoryEc2};
use cirrus_common::crd::{
    AmiSelectorTerm, Ec2NodeClass, Ec2NodeClassSpec, Ec2NodeClassStatus, NodeClaim, NodeClaimSpec,
    NodeClassRef, ResolvedAmi, ResolvedSecurityGroup, ResolvedSubnet, SelectorTerm,
};
use cirrus_common::scheduling::{Requirement, Requirements};
use cirrus_common::{labels, Error, Settings};
use cirrus_providers::instance_type::{CapacityType, InstanceType, Offering};
use cirrus_providers::{
    InstanceProvider, LaunchTemplateProvider, SubnetProvider, UnavailableOfferings,
};

fn subnet(id: &str, zone: &str) -> Subnet {
    Subnet {
        subnet_id: id.to_string(),
        availability_zone: zone.to_string(),
        availability_zone_id: format!("{zone}-id"),
        available_ip_address_count: 100,
        tags: [("cirrus-discovery".to_string(), "test".to_string())].into(),
    }
}

fn node_class() -> Ec2NodeClass {
    let mut nc = Ec2NodeClass::new(
        "default",
        Ec2NodeClassSpec {
            subnet_selector_terms: vec![SelectorTerm {
                tags: [("cirrus-discovery".to_string(), "test".to_string())].into(),
                ..Default::default()
            }],
            security_group_selector_terms: vec![],
            ami_selector_terms: vec![AmiSelectorTerm {
                alias: Some("al2023@latest".to_string()),
                ..Default::default()
            }],
            ami_family: None,
            role: Some("NodeRole".to_string()),
            instance_profile: None,
            tags: [("team".to_string(), "platform".to_string())].into(),
            block_device_mappings: vec![],
            metadata_options: None,
            user_data: None,
            kubelet: None,
            instance_store_policy: None,
        },
    );
    nc.status = Some(Ec2NodeClassStatus {
        subnets: vec![
            ResolvedSubnet {
                id: "subnet-a".to_string(),
                zone: "us-west-2a".to_string(),
                zone_id: Some("usw2-az1".to_string()),
            },
            ResolvedSubnet {
                id: "subnet-b".to_string(),
                zone: "us-west-2b".to_string(),
                zone_id: Some("usw2-az2".to_string()),
            },
        ],
        security_groups: vec![ResolvedSecurityGroup {
            id: "sg-1".to_string(),
            name: "nodes".to_string(),
        }],
        amis: vec![ResolvedAmi {
            id: "ami-standard".to_string(),
            name: "standard".to_string(),
            requirements: vec![Requirement::new_in(labels::ARCH, ["amd64"])],
        }],
        instance_profile: Some("node-profile".to_string()),
        conditions: vec![],
    });
    nc
}

fn node_claim(capacity_types: &[&str]) -> NodeClaim {
    NodeClaim::new(
        "claim-1",
        NodeClaimSpec {
            requirements: vec![Requirement::new_in(
                labels::CAPACITY_TYPE,
                capacity_types.iter().copied(),
            )],
            resources: None,
            node_class_ref: NodeClassRef {
                name: "default".to_string(),
            },
        },
    )
}

fn candidate(name: &str, offerings: Vec<Offering>) -> InstanceType {
    let mut requirements = Requirements::new();
    requirements.insert_value(labels::INSTANCE_TYPE, name);
    requirements.insert_value(labels::ARCH, "amd64");
    InstanceType {
        name: name.to_string(),
        requirements,
        offerings,
        capacity: Default::default(),
        overhead: Default::default(),
    }
}

fn offering(zone: &str, capacity_type: CapacityType, price: f64) -> Offering {
    Offering {
        zone: zone.to_string(),
        zone_id: None,
        capacity_type,
        price,
        available: true,
    }
}

struct Harness {
    ec2: Arc<MemoryEc2>,
    unavailable: Arc<UnavailableOfferings>,
    provider: InstanceProvider,
}

fn harness() -> Harness {
    let ec2 = Arc::new(MemoryEc2::new());
    ec2.set_subnets(vec![subnet("subnet-a", "us-west-2a"), subnet("subnet-b", "us-west-2b")]);
    let unavailable = Arc::new(UnavailableOfferings::new());
    let provider = InstanceProvider::new(
        ec2.clone(),
        Settings::for_cluster("test-cluster", "us-west-2"),
        unavailable.clone(),
        Arc::new(SubnetProvider::new(ec2.clone())),
        Arc::new(LaunchTemplateProvider::new(ec2.clone(), "test-cluster")),
    );
    Harness {
        ec2,
        unavailable,
        provider,
    }
}

/// Requirements admit both capacity types but only on-demand offerings
/// exist and only 3 candidate types: the launch falls back to on-demand,
/// warns about flexibility, and still succeeds without recording any ICE.
#[tokio::test]
async fn spot_to_on_demand_fallback_with_low_flexibility() {
    let h = harness();
    let candidates = vec![
        candidate("m5.large", vec![offering("us-west-2a", CapacityType::OnDemand, 0.096)]),
        candidate("c5.large", vec![offering("us-west-2a", CapacityType::OnDemand, 0.085)]),
        candidate("r5.large", vec![offering("us-west-2b", CapacityType::OnDemand, 0.126)]),
    ];

    let instance = h
        .provider
        .create(&node_class(), &node_claim(&["spot", "on-demand"]), candidates)
        .await
        .unwrap();
    assert!(!instance.spot);

    let requests = h.ec2.fleet_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].capacity_type, FleetCapacityType::OnDemand);
    assert_eq!(h.unavailable.seq_num(), 0);

    // ownership tags made it onto the fleet request, restricted keys intact
    assert_eq!(
        requests[0].tags.get("cirrus.sh/nodeclaim"),
        Some(&"claim-1".to_string())
    );
    assert_eq!(requests[0].tags.get("team"), Some(&"platform".to_string()));
}

/// Every override fails with InsufficientInstanceCapacity: all triples are
/// marked unavailable and the caller receives the dedicated
/// insufficient-capacity error.
#[tokio::test]
async fn ice_across_all_overrides_marks_and_errors() {
    let h = harness();
    let candidates: Vec<InstanceType> = ["m5.large", "c5.large", "r5.large"]
        .iter()
        .map(|name| {
            candidate(
                name,
                vec![
                    offering("us-west-2a", CapacityType::Spot, 0.03),
                    offering("us-west-2b", CapacityType::Spot, 0.04),
                ],
            )
        })
        .collect();

    let errors: Vec<FleetError> = ["m5.large", "c5.large", "r5.large"]
        .iter()
        .flat_map(|name| {
            ["us-west-2a", "us-west-2b"].iter().map(move |zone| FleetError {
                code: "InsufficientInstanceCapacity".to_string(),
                message: "no spot capacity".to_string(),
                launch_template_override: Some(FleetOverride {
                    instance_type: name.to_string(),
                    subnet_id: "subnet-a".to_string(),
                    availability_zone: zone.to_string(),
                }),
            })
        })
        .collect();
    h.ec2.push_fleet_outcome(FleetOutcome::Respond(CreateFleetResponse {
        instance_ids: vec![],
        errors,
    }));

    let err = h
        .provider
        .create(&node_class(), &node_claim(&["spot"]), candidates)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientCapacity { .. }));

    for name in ["m5.large", "c5.large", "r5.large"] {
        for zone in ["us-west-2a", "us-west-2b"] {
            assert!(h.unavailable.is_unavailable(name, zone, CapacityType::Spot));
        }
    }
    assert_eq!(h.unavailable.seq_num(), 6);
}

/// The first fleet call reports the launch template missing: templates are
/// invalidated and the pipeline retries exactly once, succeeding on the
/// second attempt.
#[tokio::test]
async fn launch_template_not_found_retries_once() {
    let h = harness();
    h.ec2.push_fleet_outcome(FleetOutcome::Fail(Error::cloud(
        "InvalidLaunchTemplateName.NotFoundException",
        "The specified launch template does not exist",
    )));

    let candidates = vec![candidate(
        "m5.large",
        vec![offering("us-west-2a", CapacityType::OnDemand, 0.096)],
    )];
    let instance = h
        .provider
        .create(&node_class(), &node_claim(&["on-demand"]), candidates)
        .await
        .unwrap();
    assert_eq!(instance.instance_type, "m5.large");
    assert_eq!(h.ec2.fleet_requests().len(), 2);
}

/// A second template-not-found in a row is surfaced, not retried again.
#[tokio::test]
async fn launch_template_not_found_twice_surfaces() {
    let h = harness();
    for _ in 0..2 {
        h.ec2.push_fleet_outcome(FleetOutcome::Fail(Error::cloud(
            "InvalidLaunchTemplateName.NotFoundException",
            "The specified launch template does not exist",
        )));
    }

    let candidates = vec![candidate(
        "m5.large",
        vec![offering("us-west-2a", CapacityType::OnDemand, 0.096)],
    )];
    let err = h
        .provider
        .create(&node_class(), &node_claim(&["on-demand"]), candidates)
        .await
        .unwrap_err();
    assert!(err.is_launch_template_not_found());
    assert_eq!(h.ec2.fleet_requests().len(), 2);
}

/// Spot is selected when admitted and offered, and the fleet request uses
/// the spot capacity type.
#[tokio::test]
async fn spot_launch_when_admitted_and_offered() {
    let h = harness();
    let candidates = vec![candidate(
        "m5.large",
        vec![
            offering("us-west-2a", CapacityType::Spot, 0.03),
            offering("us-west-2a", CapacityType::OnDemand, 0.096),
        ],
    )];

    let instance = h
        .provider
        .create(&node_class(), &node_claim(&["spot", "on-demand"]), candidates)
        .await
        .unwrap();
    assert!(instance.spot);
    let request = &h.ec2.fleet_requests()[0];
    assert_eq!(request.capacity_type, FleetCapacityType::Spot);
    assert_eq!(
        request.allocation_strategy,
        AllocationStrategy::PriceCapacityOptimized
    );
}

/// Tag back-fill retries until the write is observable.
#[tokio::test]
async fn tag_backfill_is_observable() {
    let h = harness();
    let candidates = vec![candidate(
        "m5.large",
        vec![offering("us-west-2a", CapacityType::OnDemand, 0.096)],
    )];
    let instance = h
        .provider
        .create(&node_class(), &node_claim(&["on-demand"]), candidates)
        .await
        .unwrap();

    h.ec2.remove_instance_tag(&instance.instance_id, "cirrus.sh/nodeclaim");
    h.provider
        .tag(&instance.instance_id, "claim-1", "default")
        .await
        .unwrap();
    let tagged = h.ec2.instance(&instance.instance_id).unwrap();
    assert_eq!(
        tagged.tags.get("cirrus.sh/nodeclaim"),
        Some(&"claim-1".to_string())
    );
    assert_eq!(tagged.tags.get("Name"), Some(&"claim-1".to_string()));
}
