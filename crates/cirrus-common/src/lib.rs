//! Common types for Cirrus: CRDs, scheduling model, errors, and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod hash;
pub mod labels;
pub mod metrics;
pub mod resources;
pub mod retry;
pub mod scheduling;
pub mod telemetry;

pub use config::Settings;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Cirrus custom resources
pub const API_GROUP: &str = "cirrus.sh";

/// Finalizer guarding NodeClass deletion until derived cloud resources are released
pub const TERMINATION_FINALIZER: &str = "cirrus.sh/termination";

/// Tag key identifying the NodeClaim an instance was launched for
pub const NODE_CLAIM_TAG_KEY: &str = "cirrus.sh/nodeclaim";

/// Tag key identifying the Ec2NodeClass an instance or launch template belongs to
pub const NODE_CLASS_TAG_KEY: &str = "cirrus.sh/ec2nodeclass";

/// Tag key marking a cloud resource as managed by a Cirrus installation
pub const MANAGED_BY_TAG_KEY: &str = "cirrus.sh/managed-by";

/// Tag prefixes that callers may not override on launched instances
pub const RESTRICTED_TAG_PREFIXES: &[&str] = &["cirrus.sh/", "kubernetes.io/cluster/"];

/// The `kubernetes.io/cluster/<name>` ownership tag key for this cluster
pub fn cluster_tag_key(cluster_name: &str) -> String {
    format!("kubernetes.io/cluster/{cluster_name}")
}

/// Returns `tags` minus any entry whose key collides with a restricted prefix
pub fn filter_restricted_tags(
    tags: &std::collections::BTreeMap<String, String>,
) -> std::collections::BTreeMap<String, String> {
    tags.iter()
        .filter(|(k, _)| !RESTRICTED_TAG_PREFIXES.iter().any(|p| k.starts_with(p)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn restricted_tags_are_dropped() {
        let tags = BTreeMap::from([
            ("team".to_string(), "platform".to_string()),
            ("cirrus.sh/nodeclaim".to_string(), "spoofed".to_string()),
            (
                "kubernetes.io/cluster/other".to_string(),
                "owned".to_string(),
            ),
        ]);
        let filtered = filter_restricted_tags(&tags);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("team"));
    }

    #[test]
    fn cluster_tag_key_format() {
        assert_eq!(cluster_tag_key("prod"), "kubernetes.io/cluster/prod");
    }
}
