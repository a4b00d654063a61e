//! Problem adapter contract and registry.
//!
//! A `Problem` wraps a simulation oracle together with everything an
//! optimizer needs to know about it: dimension, bounds, objective sense,
//! budget, initial solution, and (when known) the optimum. Implementations
//! must be deterministic given the streams they are handed and must draw only
//! from those streams.

mod builtin;

use std::str::FromStr;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{SimoptResult, ValidationError};
use crate::factors::Factors;
use crate::rng::generator::SimRng;

pub use builtin::{IdentityConfig, IdentityProblem, QuadraticConfig, QuadraticProblem};

/// Direction of optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sense {
    /// Smaller objective values are better.
    Minimize,
    /// Larger objective values are better.
    Maximize,
}

impl Sense {
    /// Returns true if objective value `a` is strictly better than `b`.
    #[must_use]
    pub fn better(self, a: f64, b: f64) -> bool {
        match self {
            Self::Minimize => a < b,
            Self::Maximize => a > b,
        }
    }

    /// Optimality gap of `estimate` relative to `optimum`, oriented so that
    /// smaller is always better.
    #[must_use]
    pub fn gap(self, estimate: f64, optimum: f64) -> f64 {
        match self {
            Self::Minimize => estimate - optimum,
            Self::Maximize => optimum - estimate,
        }
    }
}

/// Responses from one simulation replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replication {
    /// Objective estimate.
    pub objective: f64,
    /// Gradient estimate, when the oracle provides one.
    pub gradient: Option<Vec<f64>>,
    /// Stochastic constraint estimates (left-hand sides of `g(x) <= 0`).
    pub stoch_constraints: Vec<f64>,
}

impl Replication {
    /// A response carrying only an objective.
    #[must_use]
    pub fn objective_only(objective: f64) -> Self {
        Self {
            objective,
            gradient: None,
            stoch_constraints: Vec::new(),
        }
    }
}

/// Problem adapter contract.
pub trait Problem: Send + Sync {
    /// Registry key or user-chosen name of the problem.
    fn key(&self) -> &str;

    /// Factor settings that reproduce this problem instance.
    fn factors(&self) -> Factors;

    /// Number of decision variables.
    fn dim(&self) -> usize;

    /// Whether the objective is minimized or maximized.
    fn sense(&self) -> Sense;

    /// Number of independent random sources the oracle draws from.
    fn n_rngs(&self) -> usize;

    /// Total simulation budget (replications) per macroreplication.
    fn budget(&self) -> u64;

    /// Starting point of every solver.
    fn initial_solution(&self) -> Vec<f64>;

    /// Best-known solution, if any.
    fn optimal_solution(&self) -> Option<Vec<f64>> {
        None
    }

    /// Exactly known optimal objective value, if any.
    fn optimal_value(&self) -> Option<f64> {
        None
    }

    /// Box bounds `(lower, upper)` on the decision vector.
    fn bounds(&self) -> (Vec<f64>, Vec<f64>);

    /// Deterministic feasibility check.
    fn is_feasible(&self, x: &[f64]) -> bool {
        let (lower, upper) = self.bounds();
        x.len() == self.dim()
            && x
                .iter()
                .zip(lower.iter().zip(&upper))
                .all(|(v, (lo, hi))| v >= lo && v <= hi)
    }

    /// Draws a feasible solution uniformly from the bounds.
    fn random_solution(&self, rng: &mut SimRng) -> Vec<f64> {
        let (lower, upper) = self.bounds();
        lower
            .iter()
            .zip(&upper)
            .map(|(lo, hi)| if hi > lo { rng.gen_range(*lo..*hi) } else { *lo })
            .collect()
    }

    /// Runs one replication of the oracle at `x` using `rngs`.
    fn replicate(&self, x: &[f64], rngs: &mut [SimRng]) -> SimoptResult<Replication>;
}

/// Built-in problems, selected by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProblemKind {
    /// Deterministic: objective is the sum of `x`.
    Identity,
    /// Noisy shifted sphere with gradient estimates.
    Quadratic,
}

impl ProblemKind {
    /// All registered problems.
    pub const ALL: [ProblemKind; 2] = [Self::Identity, Self::Quadratic];

    /// Registry key.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Identity => "IDENTITY-1",
            Self::Quadratic => "QUADRATIC-1",
        }
    }

    /// Builds the problem from its factor settings.
    pub fn build(self, factors: &Factors) -> Result<Arc<dyn Problem>, ValidationError> {
        Ok(match self {
            Self::Identity => Arc::new(IdentityProblem::new(IdentityConfig::from_factors(factors)?)),
            Self::Quadratic => {
                Arc::new(QuadraticProblem::new(QuadraticConfig::from_factors(factors)?))
            }
        })
    }
}

impl FromStr for ProblemKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.key() == s)
            .ok_or_else(|| ValidationError::UnknownProblem { name: s.to_string() })
    }
}

/// Looks up `name` in the registry and builds it with `factors`.
pub fn build_problem(name: &str, factors: &Factors) -> Result<Arc<dyn Problem>, ValidationError> {
    name.parse::<ProblemKind>()?.build(factors)
}
