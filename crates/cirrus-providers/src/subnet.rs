//! Subnet resolution
//!
//! Evaluates a NodeClass's subnet selector terms (a disjunction of
//! conjunctive terms) against EC2 and keeps the result briefly cached.
//! Results are sorted largest-free-IP-count first so that launches land in
//! subnets with headroom.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cirrus_cloud::ec2::{Ec2Api, Filter, Subnet};
use cirrus_common::crd::{Ec2NodeClass, SelectorTerm};
use cirrus_common::{hash, Result};
use kube::ResourceExt as _;

use crate::cache::TtlCache;

const CACHE_TTL: Duration = Duration::from_secs(60);

/// Resolves subnet selector terms to concrete subnets
pub struct SubnetProvider {
    ec2: Arc<dyn Ec2Api>,
    cache: TtlCache<Vec<Subnet>>,
}

impl SubnetProvider {
    /// Create a provider over the given EC2 interface
    pub fn new(ec2: Arc<dyn Ec2Api>) -> Self {
        Self {
            ec2,
            cache: TtlCache::new(CACHE_TTL),
        }
    }

    /// List subnets matching any selector term, deduplicated by id and
    /// sorted by free IP count descending, then id ascending
    pub async fn list(&self, node_class: &Ec2NodeClass) -> Result<Vec<Subnet>> {
        let key = format!(
            "{:016x}",
            hash::fnv1a(format!("{:?}", node_class.spec.subnet_selector_terms).as_bytes())
        );
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let mut by_id: BTreeMap<String, Subnet> = BTreeMap::new();
        for term in &node_class.spec.subnet_selector_terms {
            let filters = term_filters(term);
            if filters.is_empty() {
                continue;
            }
            for subnet in self.ec2.describe_subnets(&filters).await? {
                by_id.insert(subnet.subnet_id.clone(), subnet);
            }
        }
        let mut subnets: Vec<Subnet> = by_id.into_values().collect();
        sort_largest_first(&mut subnets);

        self.cache.insert(key, subnets.clone());
        tracing::debug!(
            node_class = %node_class.name_any(),
            count = subnets.len(),
            "discovered subnets"
        );
        Ok(subnets)
    }
}

/// Sort subnets by free IP count descending, breaking ties on id ascending
/// for a stable "largest first" order
pub fn sort_largest_first(subnets: &mut [Subnet]) {
    subnets.sort_by(|a, b| {
        b.available_ip_address_count
            .cmp(&a.available_ip_address_count)
            .then_with(|| a.subnet_id.cmp(&b.subnet_id))
    });
}

/// Pick one subnet per zone, the one with the most free IPs
pub fn zonal_subnets(subnets: &[Subnet]) -> BTreeMap<String, Subnet> {
    let mut by_zone: BTreeMap<String, Subnet> = BTreeMap::new();
    for subnet in subnets {
        match by_zone.get(&subnet.availability_zone) {
            Some(existing)
                if existing.available_ip_address_count >= subnet.available_ip_address_count => {}
            _ => {
                by_zone.insert(subnet.availability_zone.clone(), subnet.clone());
            }
        }
    }
    by_zone
}

fn term_filters(term: &SelectorTerm) -> Vec<Filter> {
    if let Some(id) = &term.id {
        return vec![Filter::new("subnet-id", [id.clone()])];
    }
    let mut filters = Vec::new();
    for (k, v) in &term.tags {
        if v == "*" {
            filters.push(Filter::new("tag-key", [k.clone()]));
        } else {
            filters.push(Filter::new(format!("tag:{k}"), [v.clone()]));
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_cloud::fake::MemoryEc2;
    use cirrus_common::crd::Ec2NodeClassSpec;

    fn subnet(id: &str, zone: &str, free: i64, tags: &[(&str, &str)]) -> Subnet {
        Subnet {
            subnet_id: id.to_string(),
            availability_zone: zone.to_string(),
            availability_zone_id: format!("{zone}-id"),
            available_ip_address_count: free,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn node_class(terms: Vec<SelectorTerm>) -> Ec2NodeClass {
        Ec2NodeClass::new(
            "default",
            Ec2NodeClassSpec {
                subnet_selector_terms: terms,
                security_group_selector_terms: vec![],
                ami_selector_terms: vec![],
                ami_family: None,
                role: Some("role".to_string()),
                instance_profile: None,
                tags: Default::default(),
                block_device_mappings: vec![],
                metadata_options: None,
                user_data: None,
                kubelet: None,
                instance_store_policy: None,
            },
        )
    }

    #[tokio::test]
    async fn terms_are_a_disjunction() {
        let ec2 = Arc::new(MemoryEc2::new());
        ec2.set_subnets(vec![
            subnet("subnet-a", "us-west-2a", 10, &[("team", "a")]),
            subnet("subnet-b", "us-west-2b", 20, &[("team", "b")]),
            subnet("subnet-c", "us-west-2c", 30, &[("team", "c")]),
        ]);
        let provider = SubnetProvider::new(ec2);

        let nc = node_class(vec![
            SelectorTerm {
                tags: [("team".to_string(), "a".to_string())].into(),
                ..Default::default()
            },
            SelectorTerm {
                id: Some("subnet-b".to_string()),
                ..Default::default()
            },
        ]);
        let subnets = provider.list(&nc).await.unwrap();
        let ids: Vec<&str> = subnets.iter().map(|s| s.subnet_id.as_str()).collect();
        // sorted largest-free-first
        assert_eq!(ids, vec!["subnet-b", "subnet-a"]);
    }

    #[tokio::test]
    async fn duplicate_matches_are_deduplicated() {
        let ec2 = Arc::new(MemoryEc2::new());
        ec2.set_subnets(vec![subnet("subnet-a", "us-west-2a", 10, &[("team", "a")])]);
        let provider = SubnetProvider::new(ec2);

        let nc = node_class(vec![
            SelectorTerm {
                tags: [("team".to_string(), "a".to_string())].into(),
                ..Default::default()
            },
            SelectorTerm {
                tags: [("team".to_string(), "*".to_string())].into(),
                ..Default::default()
            },
        ]);
        assert_eq!(provider.list(&nc).await.unwrap().len(), 1);
    }

    #[test]
    fn stable_sort_on_equal_free_ips() {
        let mut subnets = vec![
            subnet("subnet-b", "us-west-2a", 10, &[]),
            subnet("subnet-a", "us-west-2a", 10, &[]),
        ];
        sort_largest_first(&mut subnets);
        assert_eq!(subnets[0].subnet_id, "subnet-a");
    }

    #[test]
    fn zonal_selection_takes_most_free_ips() {
        let subnets = vec![
            subnet("subnet-a", "us-west-2a", 10, &[]),
            subnet("subnet-b", "us-west-2a", 50, &[]),
            subnet("subnet-c", "us-west-2b", 5, &[]),
        ];
        let zonal = zonal_subnets(&subnets);
        assert_eq!(zonal.len(), 2);
        assert_eq!(zonal["us-west-2a"].subnet_id, "subnet-b");
        assert_eq!(zonal["us-west-2b"].subnet_id, "subnet-c");
    }
}
