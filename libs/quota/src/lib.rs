//! Resource budget value type.
//!
//! `QuotaInformation` tracks a budget of named resources (cores, instances,
//! ram, plus arbitrary provider-specific names) as floating point values.
//! A value of `f64::INFINITY` means "unbounded".
//!
//! # Invariants
//!
//! - `add` and `subtract` are commutative and associative per key
//! - `non_negative()` holds iff every stored value is >= 0
//! - Instances are short-lived value objects; there is no shared mutable state

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known resource name for CPU cores.
pub const CORES: &str = "cores";

/// Well-known resource name for instance count.
pub const INSTANCES: &str = "instances";

/// Well-known resource name for RAM in megabytes.
pub const RAM: &str = "ram";

/// A budget of named resources.
///
/// Keys absent from the map take the configured `default` when first
/// touched by `add`/`subtract`, so a budget built with
/// [`QuotaInformation::unlimited`] stays unbounded for every resource a
/// caller subtracts from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaInformation {
    default: f64,
    resources: BTreeMap<String, f64>,
}

impl Default for QuotaInformation {
    /// An empty zero-defaulted budget.
    fn default() -> Self {
        Self::zero()
    }
}

impl QuotaInformation {
    /// Create an empty budget where absent keys start at `default`.
    pub fn new(default: f64) -> Self {
        Self {
            default,
            resources: BTreeMap::new(),
        }
    }

    /// An empty budget where absent keys start at zero.
    pub fn zero() -> Self {
        Self::new(0.0)
    }

    /// An empty budget where absent keys are unbounded.
    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY)
    }

    /// A budget holding the three conventional compute resources.
    pub fn from_resources(cores: f64, instances: f64, ram: f64) -> Self {
        let mut quota = Self::zero();
        quota.set(CORES, cores);
        quota.set(INSTANCES, instances);
        quota.set(RAM, ram);
        quota
    }

    /// Builder-style variant of [`set`](Self::set).
    pub fn with_resource(mut self, name: &str, value: f64) -> Self {
        self.set(name, value);
        self
    }

    /// Set a resource value, replacing any existing value.
    pub fn set(&mut self, name: &str, value: f64) {
        self.resources.insert(name.to_string(), value);
    }

    /// Get a resource value, falling back to the default for absent keys.
    pub fn get(&self, name: &str) -> f64 {
        self.resources.get(name).copied().unwrap_or(self.default)
    }

    /// CPU cores in this budget.
    pub fn cores(&self) -> f64 {
        self.get(CORES)
    }

    /// Instance count in this budget.
    pub fn instances(&self) -> f64 {
        self.get(INSTANCES)
    }

    /// RAM (megabytes) in this budget.
    pub fn ram(&self) -> f64 {
        self.get(RAM)
    }

    /// True if no resource has been set.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Iterate over the stored (name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.resources.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Add every resource in `other` to this budget.
    pub fn add(&mut self, other: &QuotaInformation) {
        for (name, value) in &other.resources {
            let entry = self
                .resources
                .entry(name.clone())
                .or_insert(self.default);
            *entry += value;
        }
    }

    /// Subtract every resource in `other` from this budget.
    pub fn subtract(&mut self, other: &QuotaInformation) {
        for (name, value) in &other.resources {
            let entry = self
                .resources
                .entry(name.clone())
                .or_insert(self.default);
            *entry -= value;
        }
    }

    /// True iff every stored value is >= 0.
    ///
    /// An unbounded (`+inf`) value is non-negative; a NaN produced by
    /// inf-minus-inf arithmetic is treated as negative.
    pub fn non_negative(&self) -> bool {
        self.resources.values().all(|v| *v >= 0.0)
    }
}

impl fmt::Display for QuotaInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuotaInformation {{")?;
        for (i, (name, value)) in self.resources.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {name}={value}")?;
        }
        write!(f, " }}")
    }
}
