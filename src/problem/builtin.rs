//! Built-in problems.

use rand_distr::{Distribution, Normal};

use crate::error::{SimoptError, SimoptResult, ValidationError};
use crate::factors::{FactorReader, Factors};
use crate::rng::generator::SimRng;

use super::{Problem, Replication, Sense};

fn check_box(
    reader: &FactorReader<'_>,
    dim: usize,
    initial: &[f64],
    lower: f64,
    upper: f64,
) -> Result<(), ValidationError> {
    if lower >= upper {
        return Err(reader.out_of_domain("lower_bound", format!("must be < upper_bound ({upper})")));
    }
    if initial.len() != dim {
        return Err(reader.out_of_domain(
            "initial_solution",
            format!("has {} components, expected {dim}", initial.len()),
        ));
    }
    if initial.iter().any(|v| *v < lower || *v > upper) {
        return Err(reader.out_of_domain("initial_solution", "lies outside the bounds"));
    }
    Ok(())
}

fn usize_factor(reader: &FactorReader<'_>, name: &str, v: u64) -> Result<usize, ValidationError> {
    usize::try_from(v).map_err(|_| reader.out_of_domain(name, "too large"))
}

/// Configuration of [`IdentityProblem`].
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityConfig {
    /// Number of decision variables.
    pub dim: usize,
    /// Starting point; defaults to the upper bound in every component.
    pub initial_solution: Vec<f64>,
    /// Lower bound of every component.
    pub lower_bound: f64,
    /// Upper bound of every component.
    pub upper_bound: f64,
    /// Replications per macroreplication.
    pub budget: u64,
}

impl IdentityConfig {
    const KEY: &'static str = "IDENTITY-1";

    /// Reads the configuration; recognized factors are `dim`,
    /// `initial_solution`, `lower_bound`, `upper_bound` and `budget`.
    pub fn from_factors(factors: &Factors) -> Result<Self, ValidationError> {
        let mut reader = FactorReader::new(Self::KEY, factors);
        let dim_raw = reader.count("dim", 1, 1)?;
        let dim = usize_factor(&reader, "dim", dim_raw)?;
        let lower_bound = reader.float("lower_bound", 0.0)?;
        let upper_bound = reader.float("upper_bound", 10.0)?;
        let initial_solution = reader.vector("initial_solution", vec![upper_bound; dim])?;
        let budget = reader.count("budget", 100, 1)?;
        check_box(&reader, dim, &initial_solution, lower_bound, upper_bound)?;
        reader.finish()?;
        Ok(Self {
            dim,
            initial_solution,
            lower_bound,
            upper_bound,
            budget,
        })
    }

    /// Factor settings that reproduce this configuration.
    #[must_use]
    pub fn to_factors(&self) -> Factors {
        Factors::new()
            .with("dim", self.dim as i64)
            .with("initial_solution", self.initial_solution.clone())
            .with("lower_bound", self.lower_bound)
            .with("upper_bound", self.upper_bound)
            .with("budget", i64::try_from(self.budget).unwrap_or(i64::MAX))
    }
}

/// Deterministic problem whose objective is the sum of the decision vector.
///
/// Minimized at the lower bound. Draws nothing from its stream.
#[derive(Debug, Clone)]
pub struct IdentityProblem {
    config: IdentityConfig,
}

impl IdentityProblem {
    /// Problem with the given configuration.
    #[must_use]
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }
}

impl Problem for IdentityProblem {
    fn key(&self) -> &str {
        IdentityConfig::KEY
    }

    fn factors(&self) -> Factors {
        self.config.to_factors()
    }

    fn dim(&self) -> usize {
        self.config.dim
    }

    fn sense(&self) -> Sense {
        Sense::Minimize
    }

    fn n_rngs(&self) -> usize {
        1
    }

    fn budget(&self) -> u64 {
        self.config.budget
    }

    fn initial_solution(&self) -> Vec<f64> {
        self.config.initial_solution.clone()
    }

    fn optimal_solution(&self) -> Option<Vec<f64>> {
        Some(vec![self.config.lower_bound; self.config.dim])
    }

    fn optimal_value(&self) -> Option<f64> {
        Some(self.config.lower_bound * self.config.dim as f64)
    }

    fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (
            vec![self.config.lower_bound; self.config.dim],
            vec![self.config.upper_bound; self.config.dim],
        )
    }

    fn replicate(&self, x: &[f64], _rngs: &mut [SimRng]) -> SimoptResult<Replication> {
        Ok(Replication {
            objective: x.iter().sum(),
            gradient: Some(vec![1.0; x.len()]),
            stoch_constraints: Vec::new(),
        })
    }
}

/// Configuration of [`QuadraticProblem`].
#[derive(Debug, Clone, PartialEq)]
pub struct QuadraticConfig {
    /// Number of decision variables.
    pub dim: usize,
    /// Minimizer; must lie within the bounds.
    pub center: Vec<f64>,
    /// Standard deviation of the additive noise.
    pub noise_sd: f64,
    /// Starting point.
    pub initial_solution: Vec<f64>,
    /// Lower bound of every component.
    pub lower_bound: f64,
    /// Upper bound of every component.
    pub upper_bound: f64,
    /// Replications per macroreplication.
    pub budget: u64,
}

impl QuadraticConfig {
    const KEY: &'static str = "QUADRATIC-1";

    /// Reads the configuration; recognized factors are `dim`, `center`,
    /// `noise_sd`, `initial_solution`, `lower_bound`, `upper_bound` and `budget`.
    pub fn from_factors(factors: &Factors) -> Result<Self, ValidationError> {
        let mut reader = FactorReader::new(Self::KEY, factors);
        let dim_raw = reader.count("dim", 2, 1)?;
        let dim = usize_factor(&reader, "dim", dim_raw)?;
        let center = reader.vector("center", vec![0.0; dim])?;
        let noise_sd = reader.float("noise_sd", 1.0)?;
        let lower_bound = reader.float("lower_bound", -10.0)?;
        let upper_bound = reader.float("upper_bound", 10.0)?;
        let initial_solution = reader.vector("initial_solution", vec![5.0; dim])?;
        let budget = reader.count("budget", 1000, 1)?;
        if noise_sd < 0.0 {
            return Err(reader.out_of_domain("noise_sd", "must be >= 0"));
        }
        check_box(&reader, dim, &initial_solution, lower_bound, upper_bound)?;
        if center.len() != dim {
            return Err(reader.out_of_domain(
                "center",
                format!("has {} components, expected {dim}", center.len()),
            ));
        }
        if center.iter().any(|c| *c < lower_bound || *c > upper_bound) {
            return Err(reader.out_of_domain("center", "lies outside the bounds"));
        }
        reader.finish()?;
        Ok(Self {
            dim,
            center,
            noise_sd,
            initial_solution,
            lower_bound,
            upper_bound,
            budget,
        })
    }

    /// Factor settings that reproduce this configuration.
    #[must_use]
    pub fn to_factors(&self) -> Factors {
        Factors::new()
            .with("dim", self.dim as i64)
            .with("center", self.center.clone())
            .with("noise_sd", self.noise_sd)
            .with("initial_solution", self.initial_solution.clone())
            .with("lower_bound", self.lower_bound)
            .with("upper_bound", self.upper_bound)
            .with("budget", i64::try_from(self.budget).unwrap_or(i64::MAX))
    }
}

/// Minimize `||x - center||^2 + noise`, noise ~ Normal(0, `noise_sd`).
#[derive(Debug, Clone)]
pub struct QuadraticProblem {
    config: QuadraticConfig,
}

impl QuadraticProblem {
    /// Problem with the given configuration.
    #[must_use]
    pub fn new(config: QuadraticConfig) -> Self {
        Self { config }
    }
}

impl Problem for QuadraticProblem {
    fn key(&self) -> &str {
        QuadraticConfig::KEY
    }

    fn factors(&self) -> Factors {
        self.config.to_factors()
    }

    fn dim(&self) -> usize {
        self.config.dim
    }

    fn sense(&self) -> Sense {
        Sense::Minimize
    }

    fn n_rngs(&self) -> usize {
        1
    }

    fn budget(&self) -> u64 {
        self.config.budget
    }

    fn initial_solution(&self) -> Vec<f64> {
        self.config.initial_solution.clone()
    }

    fn optimal_solution(&self) -> Option<Vec<f64>> {
        Some(self.config.center.clone())
    }

    fn optimal_value(&self) -> Option<f64> {
        Some(0.0)
    }

    fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (
            vec![self.config.lower_bound; self.config.dim],
            vec![self.config.upper_bound; self.config.dim],
        )
    }

    fn replicate(&self, x: &[f64], rngs: &mut [SimRng]) -> SimoptResult<Replication> {
        let rng = rngs
            .first_mut()
            .ok_or_else(|| SimoptError::adapter(self.key(), "no stream attached"))?;
        let noise = Normal::new(0.0, self.config.noise_sd)
            .map_err(|e| SimoptError::adapter(self.key(), e.to_string()))?
            .sample(rng);

        let diff: Vec<f64> = x.iter().zip(&self.config.center).map(|(a, c)| a - c).collect();
        Ok(Replication {
            objective: diff.iter().map(|d| d * d).sum::<f64>() + noise,
            gradient: Some(diff.iter().map(|d| 2.0 * d).collect()),
            stoch_constraints: Vec::new(),
        })
    }
}
