//! Node-selector requirements model
//!
//! Scheduling constraints arrive on NodeClaims as a list of label
//! requirements and are matched against the requirements each instance type
//! advertises. Lookup of an unconstrained key returns an open requirement,
//! so `requirements.get(ZONE).has("us-west-2a")` is true when the claim
//! places no zone constraint.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Node-selector operator
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Operator {
    /// Value must be one of the listed values
    In,
    /// Value must not be one of the listed values
    NotIn,
    /// The label must be present
    Exists,
    /// The label must be absent
    DoesNotExist,
    /// Numeric greater-than against a single value
    Gt,
    /// Numeric less-than against a single value
    Lt,
}

/// A single label requirement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    /// Label key
    pub key: String,
    /// Match operator
    pub operator: Operator,
    /// Values, meaningful for In/NotIn/Gt/Lt
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Requirement {
    /// An `In` requirement over the given values
    pub fn new_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            operator: Operator::In,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// An `Exists` requirement
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::Exists,
            values: Vec::new(),
        }
    }

    /// A `DoesNotExist` requirement
    pub fn does_not_exist(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::DoesNotExist,
            values: Vec::new(),
        }
    }

    /// True if this requirement admits the given value
    pub fn has(&self, value: &str) -> bool {
        match self.operator {
            Operator::In => self.values.iter().any(|v| v == value),
            Operator::NotIn => !self.values.iter().any(|v| v == value),
            Operator::Exists => true,
            Operator::DoesNotExist => false,
            Operator::Gt => match (value.parse::<i64>(), self.bound()) {
                (Ok(v), Some(b)) => v > b,
                _ => false,
            },
            Operator::Lt => match (value.parse::<i64>(), self.bound()) {
                (Ok(v), Some(b)) => v < b,
                _ => false,
            },
        }
    }

    /// True if this requirement admits any of the given values
    pub fn has_any<'a, I: IntoIterator<Item = &'a String>>(&self, values: I) -> bool {
        values.into_iter().any(|v| self.has(v))
    }

    fn bound(&self) -> Option<i64> {
        self.values.first().and_then(|v| v.parse().ok())
    }
}

/// A set of requirements keyed by label
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Requirements(BTreeMap<String, Requirement>);

impl Requirements {
    /// Empty requirement set (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a requirement list; later entries on the same key replace
    /// earlier ones
    pub fn from_list(list: &[Requirement]) -> Self {
        let mut out = Requirements::new();
        for r in list {
            out.insert(r.clone());
        }
        out
    }

    /// Insert a requirement
    pub fn insert(&mut self, requirement: Requirement) {
        self.0.insert(requirement.key.clone(), requirement);
    }

    /// Insert an `In` requirement over a single value
    pub fn insert_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.insert(Requirement::new_in(key, [value.into()]));
    }

    /// Lookup. A key with no requirement reads as an open `Exists`
    /// requirement, which admits every value.
    pub fn get(&self, key: &str) -> Requirement {
        self.0
            .get(key)
            .cloned()
            .unwrap_or_else(|| Requirement::exists(key))
    }

    /// True if the key carries an explicit requirement
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The values of an `In` requirement on the key, empty otherwise
    pub fn values(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(r) if r.operator == Operator::In => r.values.clone(),
            _ => Vec::new(),
        }
    }

    /// Number of constrained keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no keys are constrained
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the requirements
    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.0.values()
    }

    /// True if every requirement in `constraints` is satisfiable against
    /// this set. Used to pick the AMI variant whose known requirements are
    /// compatible with an instance type's advertised labels.
    pub fn compatible_with(&self, constraints: &[Requirement]) -> bool {
        constraints.iter().all(|c| match c.operator {
            Operator::Exists => self.contains_key(&c.key),
            Operator::DoesNotExist => !self.contains_key(&c.key),
            _ => {
                // Unconstrained keys admit everything
                if !self.contains_key(&c.key) {
                    return true;
                }
                self.values(&c.key).iter().any(|v| c.has(v))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels;

    #[test]
    fn in_requirement_matches_listed_values() {
        let r = Requirement::new_in(labels::ZONE, ["us-west-2a", "us-west-2b"]);
        assert!(r.has("us-west-2a"));
        assert!(!r.has("us-west-2c"));
    }

    #[test]
    fn unconstrained_key_is_open() {
        let reqs = Requirements::new();
        assert!(reqs.get(labels::ZONE).has("anything"));
        assert!(!reqs.contains_key(labels::ZONE));
    }

    #[test]
    fn not_in_excludes() {
        let r = Requirement {
            key: labels::INSTANCE_SIZE.to_string(),
            operator: Operator::NotIn,
            values: vec!["metal".to_string()],
        };
        assert!(!r.has("metal"));
        assert!(r.has("large"));
    }

    #[test]
    fn gt_lt_numeric() {
        let gt = Requirement {
            key: labels::INSTANCE_CPU.to_string(),
            operator: Operator::Gt,
            values: vec!["4".to_string()],
        };
        assert!(gt.has("8"));
        assert!(!gt.has("4"));
        assert!(!gt.has("not-a-number"));

        let lt = Requirement {
            key: labels::INSTANCE_CPU.to_string(),
            operator: Operator::Lt,
            values: vec!["16".to_string()],
        };
        assert!(lt.has("8"));
        assert!(!lt.has("32"));
    }

    #[test]
    fn compatibility_with_variant_constraints() {
        // A GPU instance type advertises a gpu-count label
        let mut gpu_type = Requirements::new();
        gpu_type.insert_value(labels::INSTANCE_GPU_COUNT, "1");

        let mut plain_type = Requirements::new();
        plain_type.insert_value(labels::INSTANCE_CPU, "4");

        let nvidia_variant = vec![Requirement::exists(labels::INSTANCE_GPU_COUNT)];
        let standard_variant = vec![
            Requirement::does_not_exist(labels::INSTANCE_GPU_COUNT),
            Requirement::does_not_exist(labels::INSTANCE_ACCELERATOR_COUNT),
        ];

        assert!(gpu_type.compatible_with(&nvidia_variant));
        assert!(!gpu_type.compatible_with(&standard_variant));
        assert!(plain_type.compatible_with(&standard_variant));
        assert!(!plain_type.compatible_with(&nvidia_variant));
    }

    #[test]
    fn from_list_last_write_wins() {
        let reqs = Requirements::from_list(&[
            Requirement::new_in(labels::ZONE, ["us-west-2a"]),
            Requirement::new_in(labels::ZONE, ["us-west-2b"]),
        ]);
        assert!(reqs.get(labels::ZONE).has("us-west-2b"));
        assert!(!reqs.get(labels::ZONE).has("us-west-2a"));
    }
}
