//! AMI resolution
//!
//! Resolves alias terms ("al2023@latest") and selector terms to concrete
//! image ids. Alias terms expand into owner+name-pattern queries per
//! architecture and hardware variant; each query contributes the
//! requirements an instance type must satisfy to boot the image (GPU
//! images for GPU types, and so on). Results are sorted newest-first and
//! only the newest image per distinct requirement set is kept.

use std::sync::Arc;
use std::time::Duration;

use cirrus_cloud::ec2::{Ec2Api, Filter, Image};
use cirrus_common::crd::{AmiAlias, AmiFamily, AmiSelectorTerm, Ec2NodeClass};
use cirrus_common::scheduling::Requirement;
use cirrus_common::{hash, labels, Result};

use crate::cache::TtlCache;

const CACHE_TTL: Duration = Duration::from_secs(300);

/// A resolved AMI with the requirements it imposes on instance types
#[derive(Clone, Debug, PartialEq)]
pub struct Ami {
    /// Image id
    pub id: String,
    /// Image name
    pub name: String,
    /// RFC 3339 creation date
    pub creation_date: String,
    /// Requirements an instance type must satisfy to use the image
    pub requirements: Vec<Requirement>,
}

/// Hardware variant of a distribution image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Variant {
    Standard,
    Nvidia,
    Neuron,
}

impl Variant {
    fn requirements(&self) -> Vec<Requirement> {
        match self {
            Variant::Standard => vec![
                Requirement::does_not_exist(labels::INSTANCE_GPU_COUNT),
                Requirement::does_not_exist(labels::INSTANCE_ACCELERATOR_COUNT),
            ],
            Variant::Nvidia => vec![Requirement::exists(labels::INSTANCE_GPU_COUNT)],
            Variant::Neuron => vec![Requirement::exists(labels::INSTANCE_ACCELERATOR_COUNT)],
        }
    }
}

/// An expanded image query: filters + owners + the requirements known for
/// the images it returns
struct ImageQuery {
    filters: Vec<Filter>,
    owners: Vec<String>,
    known_requirements: Vec<Requirement>,
}

/// Resolves AMI selector terms to concrete images
pub struct AmiProvider {
    ec2: Arc<dyn Ec2Api>,
    cache: TtlCache<Vec<Ami>>,
}

impl AmiProvider {
    /// Create a provider over the given EC2 interface
    pub fn new(ec2: Arc<dyn Ec2Api>) -> Self {
        Self {
            ec2,
            cache: TtlCache::new(CACHE_TTL),
        }
    }

    /// Resolve the NodeClass's AMI terms. Returns the newest image per
    /// distinct requirement set, sorted by creation date descending then id
    /// ascending.
    pub async fn list(&self, node_class: &Ec2NodeClass) -> Result<Vec<Ami>> {
        let key = format!(
            "{:016x}",
            hash::fnv1a(format!("{:?}", node_class.spec.ami_selector_terms).as_bytes())
        );
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let mut amis: Vec<Ami> = Vec::new();
        for term in &node_class.spec.ami_selector_terms {
            for query in term_queries(term) {
                if query.filters.is_empty() {
                    continue;
                }
                for image in self
                    .ec2
                    .describe_images(&query.filters, &query.owners)
                    .await?
                {
                    amis.push(to_ami(image, &query.known_requirements));
                }
            }
        }

        sort_amis(&mut amis);
        let amis = newest_per_requirement_set(amis);
        self.cache.insert(key, amis.clone());
        Ok(amis)
    }
}

fn to_ami(image: Image, known: &[Requirement]) -> Ami {
    let mut requirements = vec![Requirement::new_in(
        labels::ARCH,
        [image.architecture.kube_label()],
    )];
    requirements.extend(known.iter().cloned());
    Ami {
        id: image.image_id,
        name: image.name,
        creation_date: image.creation_date,
        requirements,
    }
}

/// Sort newest-first; ties (including unparseable dates) break on id
/// ascending so the order is total and stable
pub fn sort_amis(amis: &mut [Ami]) {
    use chrono::DateTime;
    amis.sort_by(|a, b| {
        let atime = DateTime::parse_from_rfc3339(&a.creation_date)
            .map(|t| t.timestamp())
            .unwrap_or(0);
        let btime = DateTime::parse_from_rfc3339(&b.creation_date)
            .map(|t| t.timestamp())
            .unwrap_or(0);
        btime.cmp(&atime).then_with(|| a.id.cmp(&b.id))
    });
}

/// Keep the first (newest) image for each distinct requirement set
fn newest_per_requirement_set(amis: Vec<Ami>) -> Vec<Ami> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for ami in amis {
        let fingerprint = hash::fnv1a(format!("{:?}", ami.requirements).as_bytes());
        if seen.insert(fingerprint) {
            out.push(ami);
        }
    }
    out
}

fn term_queries(term: &AmiSelectorTerm) -> Vec<ImageQuery> {
    if let Some(alias) = term.alias.as_deref().and_then(AmiAlias::parse) {
        return alias_queries(&alias);
    }
    if let Some(id) = &term.id {
        return vec![ImageQuery {
            filters: vec![Filter::new("image-id", [id.clone()])],
            owners: Vec::new(),
            known_requirements: Vec::new(),
        }];
    }
    let mut filters = Vec::new();
    if let Some(name) = &term.name {
        filters.push(Filter::new("name", [name.clone()]));
    }
    for (k, v) in &term.tags {
        if v == "*" {
            filters.push(Filter::new("tag-key", [k.clone()]));
        } else {
            filters.push(Filter::new(format!("tag:{k}"), [v.clone()]));
        }
    }
    vec![ImageQuery {
        filters,
        owners: term.owner.iter().cloned().collect(),
        known_requirements: Vec::new(),
    }]
}

/// Expand an alias into the distribution's name patterns per architecture
/// and hardware variant
fn alias_queries(alias: &AmiAlias) -> Vec<ImageQuery> {
    let version = if alias.version == "latest" {
        "*".to_string()
    } else {
        format!("*{}*", alias.version)
    };
    let mut queries = Vec::new();
    let mut push = |pattern: String, variant: Variant| {
        queries.push(ImageQuery {
            filters: vec![Filter::new("name", [pattern])],
            owners: vec!["amazon".to_string()],
            known_requirements: variant.requirements(),
        });
    };

    match alias.family {
        AmiFamily::Al2 => {
            push(format!("amazon-eks-node-{version}"), Variant::Standard);
            push(format!("amazon-eks-arm64-node-{version}"), Variant::Standard);
            push(format!("amazon-eks-gpu-node-{version}"), Variant::Nvidia);
            push(format!("amazon-eks-gpu-node-{version}"), Variant::Neuron);
        }
        AmiFamily::Al2023 => {
            push(
                format!("amazon-eks-node-al2023-x86_64-standard-{version}"),
                Variant::Standard,
            );
            push(
                format!("amazon-eks-node-al2023-arm64-standard-{version}"),
                Variant::Standard,
            );
            push(
                format!("amazon-eks-node-al2023-x86_64-nvidia-{version}"),
                Variant::Nvidia,
            );
            push(
                format!("amazon-eks-node-al2023-x86_64-neuron-{version}"),
                Variant::Neuron,
            );
        }
        AmiFamily::Bottlerocket => {
            push(
                format!("bottlerocket-aws-k8s-{version}-x86_64-*"),
                Variant::Standard,
            );
            push(
                format!("bottlerocket-aws-k8s-{version}-aarch64-*"),
                Variant::Standard,
            );
            push(
                format!("bottlerocket-aws-k8s-{version}-nvidia-x86_64-*"),
                Variant::Nvidia,
            );
        }
        AmiFamily::Ubuntu => {
            push(
                format!("ubuntu-eks/k8s_*/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-{version}"),
                Variant::Standard,
            );
            push(
                format!("ubuntu-eks/k8s_*/images/hvm-ssd/ubuntu-jammy-22.04-arm64-server-{version}"),
                Variant::Standard,
            );
        }
        AmiFamily::Windows => {
            push(
                format!("Windows_Server-2022-English-Core-EKS_Optimized-{version}"),
                Variant::Standard,
            );
        }
        // Custom has no distribution images; selector terms must name them
        AmiFamily::Custom => {}
    }
    queries
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_cloud::ec2::Architecture;
    use cirrus_cloud::fake::MemoryEc2;
    use cirrus_common::crd::Ec2NodeClassSpec;
    use cirrus_common::scheduling::Requirements;
    use std::collections::BTreeMap;

    fn image(id: &str, name: &str, arch: Architecture, created: &str) -> Image {
        Image {
            image_id: id.to_string(),
            name: name.to_string(),
            architecture: arch,
            creation_date: created.to_string(),
            tags: BTreeMap::new(),
        }
    }

    fn node_class(terms: Vec<AmiSelectorTerm>) -> Ec2NodeClass {
        Ec2NodeClass::new(
            "default",
            Ec2NodeClassSpec {
                subnet_selector_terms: vec![],
                security_group_selector_terms: vec![],
                ami_selector_terms: terms,
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
    async fn alias_resolves_newest_per_variant() {
        let ec2 = Arc::new(MemoryEc2::new());
        ec2.set_images(vec![
            image(
                "ami-old",
                "amazon-eks-node-al2023-x86_64-standard-1.30-v20240401",
                Architecture::X86_64,
                "2024-04-01T00:00:00Z",
            ),
            image(
                "ami-new",
                "amazon-eks-node-al2023-x86_64-standard-1.30-v20240601",
                Architecture::X86_64,
                "2024-06-01T00:00:00Z",
            ),
            image(
                "ami-arm",
                "amazon-eks-node-al2023-arm64-standard-1.30-v20240601",
                Architecture::Arm64,
                "2024-06-01T00:00:00Z",
            ),
        ]);
        let provider = AmiProvider::new(ec2);
        let nc = node_class(vec![AmiSelectorTerm {
            alias: Some("al2023@latest".to_string()),
            ..Default::default()
        }]);

        let amis = provider.list(&nc).await.unwrap();
        let ids: Vec<&str> = amis.iter().map(|a| a.id.as_str()).collect();
        // one standard x86 image (the newest), one arm64 image
        assert!(ids.contains(&"ami-new"));
        assert!(ids.contains(&"ami-arm"));
        assert!(!ids.contains(&"ami-old"));
    }

    #[tokio::test]
    async fn variant_requirements_gate_gpu_images() {
        let ec2 = Arc::new(MemoryEc2::new());
        ec2.set_images(vec![image(
            "ami-gpu",
            "amazon-eks-node-al2023-x86_64-nvidia-1.30-v20240601",
            Architecture::X86_64,
            "2024-06-01T00:00:00Z",
        )]);
        let provider = AmiProvider::new(ec2);
        let nc = node_class(vec![AmiSelectorTerm {
            alias: Some("al2023@latest".to_string()),
            ..Default::default()
        }]);

        let amis = provider.list(&nc).await.unwrap();
        assert_eq!(amis.len(), 1);

        let mut gpu_type = Requirements::new();
        gpu_type.insert_value(labels::ARCH, "amd64");
        gpu_type.insert_value(labels::INSTANCE_GPU_COUNT, "1");
        assert!(gpu_type.compatible_with(&amis[0].requirements));

        let mut plain_type = Requirements::new();
        plain_type.insert_value(labels::ARCH, "amd64");
        assert!(!plain_type.compatible_with(&amis[0].requirements));
    }

    #[test]
    fn sort_is_creation_date_desc_then_id_asc() {
        let mut amis = vec![
            Ami {
                id: "ami-b".to_string(),
                name: "b".to_string(),
                creation_date: "2024-06-01T00:00:00Z".to_string(),
                requirements: vec![],
            },
            Ami {
                id: "ami-a".to_string(),
                name: "a".to_string(),
                creation_date: "2024-06-01T00:00:00Z".to_string(),
                requirements: vec![],
            },
            Ami {
                id: "ami-c".to_string(),
                name: "c".to_string(),
                creation_date: "2024-07-01T00:00:00Z".to_string(),
                requirements: vec![],
            },
        ];
        sort_amis(&mut amis);
        let ids: Vec<&str> = amis.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["ami-c", "ami-a", "ami-b"]);
    }

    #[tokio::test]
    async fn id_term_resolves_directly() {
        let ec2 = Arc::new(MemoryEc2::new());
        ec2.set_images(vec![image(
            "ami-mine",
            "my-golden-image",
            Architecture::X86_64,
            "2024-01-01T00:00:00Z",
        )]);
        let provider = AmiProvider::new(ec2);
        let nc = node_class(vec![AmiSelectorTerm {
            id: Some("ami-mine".to_string()),
            ..Default::default()
        }]);
        let amis = provider.list(&nc).await.unwrap();
        assert_eq!(amis.len(), 1);
        assert_eq!(amis[0].id, "ami-mine");
    }
}
