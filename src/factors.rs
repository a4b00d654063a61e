//! Typed experiment factors.
//!
//! Solvers and problems are configured from a `Factors` map (factor name to
//! typed value). Each adapter owns a typed config struct that reads the map
//! through a [`FactorReader`], so unknown keys, wrong types, and values outside
//! the declared domain are rejected at construction instead of at first use.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A single factor value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FactorValue {
    /// Boolean switch.
    Bool(bool),
    /// Integer, e.g. a count or budget.
    Int(i64),
    /// Real scalar.
    Float(f64),
    /// Real vector.
    Vector(Vec<f64>),
    /// Free-form text.
    Text(String),
}

impl FactorValue {
    /// Name of the value's type, used in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Vector(_) => "vector",
            Self::Text(_) => "text",
        }
    }

    /// Numeric view; integers widen to `f64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view; floats do not narrow.
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Vector view; a numeric scalar is treated as a one-component vector.
    #[must_use]
    pub fn as_vector(&self) -> Option<Vec<f64>> {
        match self {
            Self::Vector(v) => Some(v.clone()),
            Self::Int(_) | Self::Float(_) => self.as_f64().map(|x| vec![x]),
            _ => None,
        }
    }

    fn digest_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(self.type_name().as_bytes());
        match self {
            Self::Bool(v) => {
                hasher.update(&[u8::from(*v)]);
            }
            Self::Int(v) => {
                hasher.update(&v.to_le_bytes());
            }
            Self::Float(v) => {
                hasher.update(&v.to_bits().to_le_bytes());
            }
            Self::Vector(values) => {
                hasher.update(&(values.len() as u64).to_le_bytes());
                for v in values {
                    hasher.update(&v.to_bits().to_le_bytes());
                }
            }
            Self::Text(s) => {
                hasher.update(&(s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
        }
    }
}

impl fmt::Display for FactorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Vector(v) => write!(f, "{v:?}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for FactorValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FactorValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FactorValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Vec<f64>> for FactorValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

impl From<&str> for FactorValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Ordered mapping from factor name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Factors(BTreeMap<String, FactorValue>);

impl Factors {
    /// Creates an empty factor map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FactorValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Inserts or replaces a factor.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FactorValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Value of factor `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FactorValue> {
        self.0.get(name)
    }

    /// Whether factor `name` is set.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Number of factors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no factor is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates factors in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FactorValue)> {
        self.0.iter()
    }

    /// Returns a copy of `self` with every factor in `overrides` applied on top.
    #[must_use]
    pub fn overlay(&self, overrides: &Factors) -> Factors {
        let mut merged = self.clone();
        for (name, value) in overrides.iter() {
            merged.0.insert(name.clone(), value.clone());
        }
        merged
    }

    /// Stable digest of the factor settings (hex-encoded BLAKE3).
    ///
    /// Two maps with the same entries always produce the same digest,
    /// independent of insertion order.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        self.digest_into(&mut hasher);
        hasher.finalize().to_hex().to_string()
    }

    pub(crate) fn digest_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&(self.0.len() as u64).to_le_bytes());
        for (name, value) in &self.0 {
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            value.digest_into(hasher);
        }
    }
}

impl FromIterator<(String, FactorValue)> for Factors {
    fn from_iter<I: IntoIterator<Item = (String, FactorValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Typed, exhaustive reader over a `Factors` map.
///
/// Every lookup marks the factor as recognized; [`FactorReader::finish`]
/// rejects whatever was left over.
#[derive(Debug)]
pub struct FactorReader<'a> {
    owner: String,
    factors: &'a Factors,
    recognized: BTreeSet<String>,
}

impl<'a> FactorReader<'a> {
    /// Starts reading `factors` on behalf of `owner` (a solver or problem key).
    pub fn new(owner: impl Into<String>, factors: &'a Factors) -> Self {
        Self {
            owner: owner.into(),
            factors,
            recognized: BTreeSet::new(),
        }
    }

    fn lookup(&mut self, name: &str) -> Option<&'a FactorValue> {
        self.recognized.insert(name.to_string());
        self.factors.get(name)
    }

    fn mismatch(&self, name: &str, expected: &str, actual: &FactorValue) -> ValidationError {
        ValidationError::FactorTypeMismatch {
            owner: self.owner.clone(),
            factor: name.to_string(),
            expected: expected.to_string(),
            actual: actual.type_name().to_string(),
        }
    }

    /// Builds an out-of-domain error for `factor`.
    pub fn out_of_domain(&self, factor: &str, reason: impl Into<String>) -> ValidationError {
        ValidationError::FactorOutOfDomain {
            owner: self.owner.clone(),
            factor: factor.to_string(),
            reason: reason.into(),
        }
    }

    /// Reads a real-valued factor. Integers are accepted.
    pub fn float(&mut self, name: &str, default: f64) -> Result<f64, ValidationError> {
        match self.lookup(name) {
            None => Ok(default),
            Some(value) => {
                let v = value.as_f64().ok_or_else(|| self.mismatch(name, "float", value))?;
                if v.is_finite() {
                    Ok(v)
                } else {
                    Err(self.out_of_domain(name, "must be finite"))
                }
            }
        }
    }

    /// Reads a non-negative integer factor that must be at least `min`.
    pub fn count(&mut self, name: &str, default: u64, min: u64) -> Result<u64, ValidationError> {
        let v = match self.lookup(name) {
            None => return Ok(default),
            Some(value) => value.as_i64().ok_or_else(|| self.mismatch(name, "int", value))?,
        };
        match u64::try_from(v) {
            Ok(v) if v >= min => Ok(v),
            _ => Err(self.out_of_domain(name, format!("must be >= {min} (got {v})"))),
        }
    }

    /// Reads a boolean factor, or `default` when absent.
    pub fn bool(&mut self, name: &str, default: bool) -> Result<bool, ValidationError> {
        match self.lookup(name) {
            None => Ok(default),
            Some(value) => value.as_bool().ok_or_else(|| self.mismatch(name, "bool", value)),
        }
    }

    /// Reads a vector factor. A numeric scalar is read as a one-component vector.
    pub fn vector(&mut self, name: &str, default: Vec<f64>) -> Result<Vec<f64>, ValidationError> {
        let v = match self.lookup(name) {
            None => return Ok(default),
            Some(value) => value.as_vector().ok_or_else(|| self.mismatch(name, "vector", value))?,
        };
        if v.iter().all(|x| x.is_finite()) {
            Ok(v)
        } else {
            Err(self.out_of_domain(name, "components must be finite"))
        }
    }

    /// Ensures every supplied factor was recognized.
    pub fn finish(self) -> Result<(), ValidationError> {
        let unknown = self
            .factors
            .iter()
            .map(|(name, _)| name)
            .find(|name| !self.recognized.contains(*name))
            .cloned();
        match unknown {
            Some(factor) => Err(ValidationError::UnknownFactor {
                owner: self.owner,
                factor,
            }),
            None => Ok(()),
        }
    }
}
