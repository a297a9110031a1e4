//! Resource quantities and resource lists
//!
//! A [`Quantity`] is a fixed-point value in milli-units: 1 CPU core is
//! `1000m`, one byte of memory is `1000` milli-bytes. This keeps kube-style
//! arithmetic (`255Mi + 11 * pods`, percentage eviction signals) exact
//! without dragging a full API-machinery quantity model along.

use std::collections::BTreeMap;
use std::fmt;

/// Resource name for CPU cores
pub const CPU: &str = "cpu";
/// Resource name for memory bytes
pub const MEMORY: &str = "memory";
/// Resource name for ephemeral storage bytes
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";
/// Resource name for schedulable pods
pub const PODS: &str = "pods";
/// NVIDIA GPU device plugin resource
pub const NVIDIA_GPU: &str = "nvidia.com/gpu";
/// AMD GPU device plugin resource
pub const AMD_GPU: &str = "amd.com/gpu";
/// AWS Neuron accelerator resource
pub const AWS_NEURON: &str = "aws.amazon.com/neuron";
/// Habana Gaudi accelerator resource
pub const HABANA_GAUDI: &str = "habana.ai/gaudi";
/// Elastic Fabric Adapter interfaces
pub const EFA: &str = "vpc.amazonaws.com/efa";
/// Branch network interfaces for pod ENI trunking
pub const POD_ENI: &str = "vpc.amazonaws.com/pod-eni";
/// Secondary private IPv4 addresses (Windows only)
pub const PRIVATE_IPV4_ADDRESS: &str = "vpc.amazonaws.com/PrivateIPv4Address";

const MEBIBYTE: i64 = 1024 * 1024;
const GIBIBYTE: i64 = 1024 * 1024 * 1024;

/// A fixed-point resource quantity in milli-units
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quantity(i64);

impl Quantity {
    /// Zero quantity
    pub const ZERO: Quantity = Quantity(0);

    /// From whole units (cores, pods, devices)
    pub fn from_units(units: i64) -> Self {
        Quantity(units.saturating_mul(1000))
    }

    /// From milli-units (e.g. millicores)
    pub fn from_milli(milli: i64) -> Self {
        Quantity(milli)
    }

    /// From bytes
    pub fn from_bytes(bytes: i64) -> Self {
        Self::from_units(bytes)
    }

    /// From mebibytes (1024^2 bytes)
    pub fn mebibytes(mib: i64) -> Self {
        Self::from_bytes(mib.saturating_mul(MEBIBYTE))
    }

    /// From gibibytes (1024^3 bytes)
    pub fn gibibytes(gib: i64) -> Self {
        Self::from_bytes(gib.saturating_mul(GIBIBYTE))
    }

    /// From decimal gigabytes (10^9 bytes), the unit EC2 reports instance
    /// store sizes in
    pub fn gigabytes(gb: i64) -> Self {
        Self::from_bytes(gb.saturating_mul(1_000_000_000))
    }

    /// The milli-unit value
    pub fn milli(&self) -> i64 {
        self.0
    }

    /// The value in whole units, truncating
    pub fn units(&self) -> i64 {
        self.0 / 1000
    }

    /// The value in whole units as a float
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// The value in mebibytes, truncating. Only meaningful for byte quantities.
    pub fn to_mebibytes(&self) -> i64 {
        self.units() / MEBIBYTE
    }

    /// True if zero
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Saturating addition
    pub fn add(&self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction, floored at zero
    pub fn saturating_sub(&self, other: Quantity) -> Quantity {
        Quantity((self.0 - other.0).max(0))
    }

    /// The given percentage of this quantity, rounded up to a whole unit
    pub fn percentage(&self, pct: f64) -> Quantity {
        Quantity::from_units((self.as_f64() / 100.0 * pct).ceil() as i64)
    }

    /// Parse a kube-style quantity string: `"110"`, `"100m"`, `"255Mi"`,
    /// `"1Gi"`, `"20G"`. Unsupported forms return `None`.
    pub fn parse(s: &str) -> Option<Quantity> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.'));
        let (num, suffix) = match split {
            Some(idx) => s.split_at(idx),
            None => (s, ""),
        };
        let value: f64 = num.parse().ok()?;
        let quantity = match suffix {
            "" => Quantity::from_milli((value * 1000.0).round() as i64),
            "m" => Quantity::from_milli(value.round() as i64),
            "Ki" => Quantity::from_bytes((value * 1024.0).round() as i64),
            "Mi" => Quantity::from_bytes((value * MEBIBYTE as f64).round() as i64),
            "Gi" => Quantity::from_bytes((value * GIBIBYTE as f64).round() as i64),
            "Ti" => Quantity::from_bytes((value * GIBIBYTE as f64 * 1024.0).round() as i64),
            "k" => Quantity::from_bytes((value * 1e3).round() as i64),
            "M" => Quantity::from_bytes((value * 1e6).round() as i64),
            "G" => Quantity::from_bytes((value * 1e9).round() as i64),
            "T" => Quantity::from_bytes((value * 1e12).round() as i64),
            _ => return None,
        };
        Some(quantity)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

/// An eviction signal value: either an absolute quantity or a percentage of
/// the node's capacity
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Signal {
    /// Absolute threshold, e.g. `"100Mi"`
    Absolute(Quantity),
    /// Percentage of capacity, e.g. `"10%"`. 100% disables the threshold.
    Percent(f64),
}

impl Signal {
    /// Parse an eviction signal value
    pub fn parse(s: &str) -> Option<Signal> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let p: f64 = pct.trim().parse().ok()?;
            // 100% means the threshold is disabled
            return Some(Signal::Percent(if p == 100.0 { 0.0 } else { p }));
        }
        Quantity::parse(s).map(Signal::Absolute)
    }

    /// Resolve against a capacity: percentages become `capacity * p / 100`
    pub fn resolve(&self, capacity: Quantity) -> Quantity {
        match self {
            Signal::Absolute(q) => *q,
            Signal::Percent(p) => capacity.percentage(*p),
        }
    }
}

/// An ordered map of resource name to quantity
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceList(BTreeMap<String, Quantity>);

impl ResourceList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a quantity
    pub fn insert(&mut self, name: impl Into<String>, quantity: Quantity) {
        self.0.insert(name.into(), quantity);
    }

    /// Lookup; missing names read as zero
    pub fn get(&self, name: &str) -> Quantity {
        self.0.get(name).copied().unwrap_or(Quantity::ZERO)
    }

    /// Iterate entries
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Quantity)> {
        self.0.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entry-wise sum
    pub fn add(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, q) in other.iter() {
            let merged = out.get(name).add(*q);
            out.insert(name.clone(), merged);
        }
        out
    }

    /// Entry-wise maximum
    pub fn max(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, q) in other.iter() {
            let merged = out.get(name).max(*q);
            out.insert(name.clone(), merged);
        }
        out
    }

    /// Entry-wise `self - other`, floored at zero
    pub fn saturating_sub(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, q) in other.iter() {
            let merged = out.get(name).saturating_sub(*q);
            out.insert(name.clone(), merged);
        }
        out
    }

    /// True if every entry of `requests` fits within this list
    pub fn fits(&self, requests: &ResourceList) -> bool {
        requests.iter().all(|(name, q)| self.get(name) >= *q)
    }

    /// Parse a string map (as stored in kubelet configuration) into a list,
    /// skipping unparseable values
    pub fn from_string_map(map: &BTreeMap<String, String>) -> ResourceList {
        let mut out = ResourceList::new();
        for (k, v) in map {
            if let Some(q) = Quantity::parse(v) {
                out.insert(k.clone(), q);
            }
        }
        out
    }
}

impl FromIterator<(String, Quantity)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (String, Quantity)>>(iter: T) -> Self {
        ResourceList(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_milli() {
        assert_eq!(Quantity::parse("110"), Some(Quantity::from_units(110)));
        assert_eq!(Quantity::parse("100m"), Some(Quantity::from_milli(100)));
        assert_eq!(Quantity::parse("2.5"), Some(Quantity::from_milli(2500)));
    }

    #[test]
    fn parse_binary_suffixes() {
        assert_eq!(Quantity::parse("255Mi"), Some(Quantity::mebibytes(255)));
        assert_eq!(Quantity::parse("1Gi"), Some(Quantity::gibibytes(1)));
        assert_eq!(Quantity::parse("64Ti"), Some(Quantity::gibibytes(64 * 1024)));
    }

    #[test]
    fn parse_decimal_suffixes() {
        assert_eq!(Quantity::parse("20G"), Some(Quantity::gigabytes(20)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(Quantity::parse(""), None);
        assert_eq!(Quantity::parse("Mi"), None);
        assert_eq!(Quantity::parse("10Qi"), None);
    }

    #[test]
    fn percentage_rounds_up() {
        // 10% of 15 units = 1.5, rounded up to 2
        assert_eq!(
            Quantity::from_units(15).percentage(10.0),
            Quantity::from_units(2)
        );
    }

    #[test]
    fn signal_percent_of_capacity() {
        let capacity = Quantity::gibibytes(100);
        let signal = Signal::parse("10%").unwrap();
        assert_eq!(signal.resolve(capacity), capacity.percentage(10.0));

        // 100% disables the threshold
        let disabled = Signal::parse("100%").unwrap();
        assert_eq!(disabled.resolve(capacity), Quantity::ZERO);
    }

    #[test]
    fn signal_absolute() {
        let signal = Signal::parse("100Mi").unwrap();
        assert_eq!(signal.resolve(Quantity::ZERO), Quantity::mebibytes(100));
    }

    #[test]
    fn resource_list_fits() {
        let mut capacity = ResourceList::new();
        capacity.insert(CPU, Quantity::from_units(4));
        capacity.insert(MEMORY, Quantity::gibibytes(16));

        let mut requests = ResourceList::new();
        requests.insert(CPU, Quantity::from_milli(3500));
        assert!(capacity.fits(&requests));

        requests.insert(NVIDIA_GPU, Quantity::from_units(1));
        assert!(!capacity.fits(&requests));
    }

    #[test]
    fn resource_list_max_and_sub() {
        let mut a = ResourceList::new();
        a.insert(MEMORY, Quantity::mebibytes(100));
        let mut b = ResourceList::new();
        b.insert(MEMORY, Quantity::mebibytes(300));
        b.insert(CPU, Quantity::from_units(1));

        let merged = a.max(&b);
        assert_eq!(merged.get(MEMORY), Quantity::mebibytes(300));
        assert_eq!(merged.get(CPU), Quantity::from_units(1));

        let diff = b.saturating_sub(&merged);
        assert_eq!(diff.get(MEMORY), Quantity::ZERO);
    }
}
