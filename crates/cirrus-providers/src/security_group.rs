//! Security-group resolution
//!
//! Same selector-term model as subnets. An empty result is not an error
//! here; the status reconciler surfaces it as a false condition instead,
//! since a NodeClass may legitimately be mid-provisioning.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cirrus_cloud::ec2::{Ec2Api, Filter, SecurityGroup};
use cirrus_common::crd::{Ec2NodeClass, SelectorTerm};
use cirrus_common::{hash, Result};

use crate::cache::TtlCache;

const CACHE_TTL: Duration = Duration::from_secs(60);

/// Resolves security-group selector terms to concrete groups
pub struct SecurityGroupProvider {
    ec2: Arc<dyn Ec2Api>,
    cache: TtlCache<Vec<SecurityGroup>>,
}

impl SecurityGroupProvider {
    /// Create a provider over the given EC2 interface
    pub fn new(ec2: Arc<dyn Ec2Api>) -> Self {
        Self {
            ec2,
            cache: TtlCache::new(CACHE_TTL),
        }
    }

    /// List groups matching any selector term, deduplicated and sorted by
    /// group id
    pub async fn list(&self, node_class: &Ec2NodeClass) -> Result<Vec<SecurityGroup>> {
        let key = format!(
            "{:016x}",
            hash::fnv1a(format!("{:?}", node_class.spec.security_group_selector_terms).as_bytes())
        );
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let mut by_id: BTreeMap<String, SecurityGroup> = BTreeMap::new();
        for term in &node_class.spec.security_group_selector_terms {
            let filters = term_filters(term);
            if filters.is_empty() {
                continue;
            }
            for group in self.ec2.describe_security_groups(&filters).await? {
                by_id.insert(group.group_id.clone(), group);
            }
        }
        let groups: Vec<SecurityGroup> = by_id.into_values().collect();
        self.cache.insert(key, groups.clone());
        Ok(groups)
    }
}

fn term_filters(term: &SelectorTerm) -> Vec<Filter> {
    if let Some(id) = &term.id {
        return vec![Filter::new("group-id", [id.clone()])];
    }
    let mut filters = Vec::new();
    if let Some(name) = &term.name {
        filters.push(Filter::new("group-name", [name.clone()]));
    }
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

    fn group(id: &str, name: &str, tags: &[(&str, &str)]) -> SecurityGroup {
        SecurityGroup {
            group_id: id.to_string(),
            group_name: name.to_string(),
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
                subnet_selector_terms: vec![],
                security_group_selector_terms: terms,
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
    async fn matches_by_name_and_tags_conjunctively() {
        let ec2 = Arc::new(MemoryEc2::new());
        ec2.set_security_groups(vec![
            group("sg-1", "nodes", &[("env", "prod")]),
            group("sg-2", "nodes", &[("env", "dev")]),
        ]);
        let provider = SecurityGroupProvider::new(ec2);

        let nc = node_class(vec![SelectorTerm {
            name: Some("nodes".to_string()),
            tags: [("env".to_string(), "prod".to_string())].into(),
            ..Default::default()
        }]);
        let groups = provider.list(&nc).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_id, "sg-1");
    }

    #[tokio::test]
    async fn empty_result_is_not_an_error() {
        let ec2 = Arc::new(MemoryEc2::new());
        let provider = SecurityGroupProvider::new(ec2);
        let nc = node_class(vec![SelectorTerm {
            id: Some("sg-missing".to_string()),
            ..Default::default()
        }]);
        assert!(provider.list(&nc).await.unwrap().is_empty());
    }
}
