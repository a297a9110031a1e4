//! Instance garbage collection and tag back-fill
//!
//! Periodically diffs cluster-owned instances against the live NodeClaim
//! set: instances no claim points at are terminated once past a grace
//! period (the window between fleet create and the provider-id write-back),
//! claims whose backing instance is gone are deleted, and ownership tags
//! dropped by EC2 eventual consistency are re-applied.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use opentelemetry::KeyValue;
use tracing::{info, warn};

use cirrus_cloud::ec2::Instance;
use cirrus_common::crd::NodeClaim;
use cirrus_common::{metrics, Error, NODE_CLAIM_TAG_KEY};
use cirrus_providers::InstanceProvider;

/// How often the collector runs
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Instances younger than this are never treated as orphans
pub const DEFAULT_GRACE_PERIOD: chrono::Duration = chrono::Duration::seconds(60);

/// The garbage collector
pub struct GarbageCollector {
    client: Client,
    instances: Arc<InstanceProvider>,
    grace_period: chrono::Duration,
}

impl GarbageCollector {
    /// Create a collector with the default grace period
    pub fn new(client: Client, instances: Arc<InstanceProvider>) -> Self {
        Self {
            client,
            instances,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Run forever on the given interval; failures are logged and the next
    /// tick retries
    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "garbage collection failed");
            }
        }
    }

    /// One collection pass
    pub async fn reconcile(&self) -> Result<(), Error> {
        let cloud_instances = self.instances.list().await?;
        let claims: Api<NodeClaim> = Api::all(self.client.clone());
        let claim_list = claims.list(&ListParams::default()).await?;

        let known_ids: BTreeSet<String> = claim_list
            .items
            .iter()
            .filter_map(|c| c.instance_id().map(str::to_string))
            .collect();

        // Terminate instances the claim set no longer references
        let now = Utc::now();
        for orphan in find_orphans(&cloud_instances, &known_ids, self.grace_period, now) {
            info!(
                instance = %orphan.instance_id,
                launched = %orphan.launch_time,
                "terminating orphaned instance"
            );
            self.instances.terminate(&orphan.instance_id).await?;
            metrics::INSTANCES_GARBAGE_COLLECTED.add(1, &[KeyValue::new("reason", "orphaned")]);
        }

        // Back-fill ownership tags EC2 has not yet made visible
        let cloud_ids: BTreeSet<&str> = cloud_instances
            .iter()
            .map(|i| i.instance_id.as_str())
            .collect();
        for claim in &claim_list.items {
            let Some(instance_id) = claim.instance_id() else {
                continue;
            };
            if let Some(instance) = cloud_instances
                .iter()
                .find(|i| i.instance_id == instance_id)
            {
                if needs_tag_backfill(instance, &claim.name_any()) {
                    self.instances
                        .tag(
                            instance_id,
                            &claim.name_any(),
                            &claim.spec.node_class_ref.name,
                        )
                        .await?;
                }
            } else if !cloud_ids.contains(instance_id) && past_grace(claim, self.grace_period, now)
            {
                // The backing instance is gone; release the claim so the
                // scheduler can replace it
                info!(claim = %claim.name_any(), instance = instance_id, "deleting claim for terminated instance");
                match claims.delete(&claim.name_any(), &Default::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

/// Instances owned by the cluster that no claim references and that are
/// older than the grace period
pub fn find_orphans<'a>(
    instances: &'a [Instance],
    known_ids: &BTreeSet<String>,
    grace_period: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<&'a Instance> {
    instances
        .iter()
        .filter(|i| i.state != "terminated")
        .filter(|i| !known_ids.contains(&i.instance_id))
        .filter(|i| now.signed_duration_since(i.launch_time) > grace_period)
        .collect()
}

/// True when the claim-name tag is missing or stale
pub fn needs_tag_backfill(instance: &Instance, claim_name: &str) -> bool {
    instance.tags.get("Name").map(String::as_str) != Some(claim_name)
        || instance.tags.get(NODE_CLAIM_TAG_KEY).map(String::as_str) != Some(claim_name)
}

fn past_grace(claim: &NodeClaim, grace_period: chrono::Duration, now: DateTime<Utc>) -> bool {
    claim
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| now.signed_duration_since(t.0) > grace_period)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn instance(id: &str, age_secs: i64, state: &str) -> Instance {
        Instance {
            instance_id: id.to_string(),
            instance_type: "m5.large".to_string(),
            availability_zone: "us-west-2a".to_string(),
            private_dns_name: Some("ip-10-0-0-1.ec2.internal".to_string()),
            image_id: "ami-1".to_string(),
            spot: false,
            state: state.to_string(),
            launch_time: Utc::now() - chrono::Duration::seconds(age_secs),
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn orphans_are_unknown_and_past_grace() {
        let instances = vec![
            instance("i-known", 600, "running"),
            instance("i-orphan-old", 600, "running"),
            instance("i-orphan-young", 10, "running"),
            instance("i-orphan-dead", 600, "terminated"),
        ];
        let known = BTreeSet::from(["i-known".to_string()]);

        let orphans = find_orphans(&instances, &known, DEFAULT_GRACE_PERIOD, Utc::now());
        let ids: Vec<&str> = orphans.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["i-orphan-old"]);
    }

    #[test]
    fn tag_backfill_detection() {
        let mut tagged = instance("i-1", 600, "running");
        tagged
            .tags
            .insert("Name".to_string(), "claim-1".to_string());
        tagged
            .tags
            .insert(NODE_CLAIM_TAG_KEY.to_string(), "claim-1".to_string());
        assert!(!needs_tag_backfill(&tagged, "claim-1"));

        let untagged = instance("i-2", 600, "running");
        assert!(needs_tag_backfill(&untagged, "claim-1"));

        // claim-name tag present but stale
        let mut stale = instance("i-3", 600, "running");
        stale
            .tags
            .insert(NODE_CLAIM_TAG_KEY.to_string(), "other-claim".to_string());
        assert!(needs_tag_backfill(&stale, "claim-1"));
    }
}
