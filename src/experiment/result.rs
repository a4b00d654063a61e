//! Versioned experiment result schema.
//!
//! Everything an `Experiment` learns is held here, field by field, so it can
//! be persisted through a stable encoding and restored exactly.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::rng::StreamIndex;
use crate::solution::{mean, sample_variance, Solution};

/// Current schema version of [`ExperimentResult`].
pub const RESULT_SCHEMA_VERSION: u32 = 1;

/// A recommended solution and the budget consumed when it was recommended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Replications consumed when the recommendation was made.
    pub budget: u64,
    /// Recommended decision vector.
    pub x: Vec<f64>,
}

/// Output of one successful macroreplication run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacrorepRecord {
    /// Index of the macroreplication.
    pub macrorep: usize,
    /// Recommendations, non-decreasing in budget, last one at the full budget.
    pub recommendations: Vec<Recommendation>,
    /// Every stream issued during the run, in first-issue order.
    pub streams: Vec<StreamIndex>,
}

/// Outcome of one macroreplication run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MacrorepOutcome {
    /// The run finished within budget.
    Completed(MacrorepRecord),
    /// The run failed.
    Failed {
        /// Index of the macroreplication.
        macrorep: usize,
        /// Adapter or validation message.
        error: String,
    },
}

impl MacrorepOutcome {
    /// Index of the macroreplication.
    #[must_use]
    pub const fn macrorep(&self) -> usize {
        match self {
            Self::Completed(record) => record.macrorep,
            Self::Failed { macrorep, .. } => *macrorep,
        }
    }

    /// The run output, unless it failed.
    #[must_use]
    pub const fn record(&self) -> Option<&MacrorepRecord> {
        match self {
            Self::Completed(record) => Some(record),
            Self::Failed { .. } => None,
        }
    }

    /// True for a failed run.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Post-replicated objective estimates of one solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    /// Solution the estimate belongs to.
    pub x: Vec<f64>,
    /// Streams the estimate was drawn from (as attached).
    pub streams: Vec<StreamIndex>,
    /// One objective estimate per post-replication.
    pub objectives: Vec<f64>,
}

impl Estimate {
    /// Captures the responses accumulated on `solution`.
    #[must_use]
    pub fn from_solution(solution: &Solution) -> Self {
        Self {
            x: solution.x().to_vec(),
            streams: solution.streams().to_vec(),
            objectives: solution.objectives(),
        }
    }

    /// Mean objective; `NaN` if there are no replications.
    #[must_use]
    pub fn mean(&self) -> f64 {
        mean(&self.objectives).unwrap_or(f64::NAN)
    }

    /// Sample variance of the objective; `NaN` with fewer than two replications.
    #[must_use]
    pub fn variance(&self) -> f64 {
        sample_variance(&self.objectives).unwrap_or(f64::NAN)
    }
}

/// Post-replication outcome of one macroreplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PostRepOutcome {
    /// Every recommendation was re-evaluated.
    Completed {
        /// One estimate per recommendation, in recommendation order.
        estimates: Vec<Estimate>,
    },
    /// Post-replication of this macroreplication failed.
    Failed {
        /// Adapter or validation message.
        error: String,
    },
    /// The macroreplication run itself failed.
    Skipped,
}

impl PostRepOutcome {
    /// Estimates, when post-replication completed.
    #[must_use]
    pub fn estimates(&self) -> Option<&[Estimate]> {
        match self {
            Self::Completed { estimates } => Some(estimates),
            _ => None,
        }
    }
}

/// Estimates at the reference points shared by every macroreplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEstimates {
    /// Estimate at the problem's initial solution.
    pub initial: Estimate,
    /// Present when the problem declares an optimal solution.
    pub optimal: Option<Estimate>,
}

/// Settings of a post-replication pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRepSettings {
    /// Replications per recommended solution.
    pub n_postreps: u64,
    /// Replications at the initial and optimal reference solutions.
    pub n_postreps_init_opt: u64,
    /// Evaluate all recommendations of one macroreplication on identical streams.
    pub crn_across_budget: bool,
    /// Evaluate every macroreplication on identical streams.
    pub crn_across_macroreps: bool,
}

impl PostRepSettings {
    /// Settings with CRN across budget and independent macroreplications.
    #[must_use]
    pub const fn new(n_postreps: u64, n_postreps_init_opt: u64) -> Self {
        Self {
            n_postreps,
            n_postreps_init_opt,
            crn_across_budget: true,
            crn_across_macroreps: false,
        }
    }

    /// Use identical streams for every recommendation of a macroreplication.
    #[must_use]
    pub const fn crn_across_budget(mut self, enabled: bool) -> Self {
        self.crn_across_budget = enabled;
        self
    }

    /// Use identical streams for every macroreplication.
    #[must_use]
    pub const fn crn_across_macroreps(mut self, enabled: bool) -> Self {
        self.crn_across_macroreps = enabled;
        self
    }

    /// Rejects zero replication counts.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.n_postreps == 0 {
            return Err(ValidationError::invalid("n_postreps", "must be > 0"));
        }
        if self.n_postreps_init_opt == 0 {
            return Err(ValidationError::invalid("n_postreps_init_opt", "must be > 0"));
        }
        Ok(self)
    }
}

/// Output of a post-replication pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostReplication {
    /// Settings the pass ran with.
    pub settings: PostRepSettings,
    /// Indexed by macroreplication.
    pub macroreps: Vec<PostRepOutcome>,
    /// Shared reference estimates.
    pub reference: ReferenceEstimates,
}

/// Everything one experiment produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// Version of this schema the result was written with.
    pub schema_version: u32,
    /// Budget of every macroreplication.
    pub budget: u64,
    /// Indexed by macroreplication.
    pub macroreps: Vec<MacrorepOutcome>,
    /// Present once post-replication has run.
    pub post_replication: Option<PostReplication>,
}

impl ExperimentResult {
    /// Empty result for macroreplications of `budget` replications.
    #[must_use]
    pub fn new(budget: u64) -> Self {
        Self {
            schema_version: RESULT_SCHEMA_VERSION,
            budget,
            macroreps: Vec::new(),
            post_replication: None,
        }
    }

    /// Number of macroreplications attempted.
    #[must_use]
    pub fn n_macroreps(&self) -> usize {
        self.macroreps.len()
    }

    /// `(macrorep, error)` for every failed run or post-replication.
    #[must_use]
    pub fn failures(&self) -> Vec<(usize, String)> {
        let mut failures: Vec<(usize, String)> = self
            .macroreps
            .iter()
            .filter_map(|outcome| match outcome {
                MacrorepOutcome::Failed { macrorep, error } => Some((*macrorep, error.clone())),
                MacrorepOutcome::Completed(_) => None,
            })
            .collect();
        if let Some(post) = &self.post_replication {
            for (r, outcome) in post.macroreps.iter().enumerate() {
                if let PostRepOutcome::Failed { error } = outcome {
                    failures.push((r, error.clone()));
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_validation() {
        assert!(PostRepSettings::new(0, 10).validate().is_err());
        assert!(PostRepSettings::new(10, 0).validate().is_err());
        let s = PostRepSettings::new(10, 20).crn_across_macroreps(true).validate().unwrap();
        assert!(s.crn_across_budget);
        assert!(s.crn_across_macroreps);
    }

    #[test]
    fn outcome_encoding_is_tagged() {
        let outcome = MacrorepOutcome::Failed {
            macrorep: 2,
            error: "boom".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains(r#""status":"failed""#));
        let back: MacrorepOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome);
        assert!(back.is_failed());
        assert_eq!(back.macrorep(), 2);
    }

    #[test]
    fn failures_collects_run_and_postrep() {
        let mut result = ExperimentResult::new(100);
        result.macroreps.push(MacrorepOutcome::Failed {
            macrorep: 0,
            error: "run failed".to_string(),
        });
        result.macroreps.push(MacrorepOutcome::Completed(MacrorepRecord {
            macrorep: 1,
            recommendations: vec![Recommendation { budget: 100, x: vec![1.0] }],
            streams: Vec::new(),
        }));
        result.post_replication = Some(PostReplication {
            settings: PostRepSettings::new(1, 1),
            macroreps: vec![
                PostRepOutcome::Skipped,
                PostRepOutcome::Failed {
                    error: "postrep failed".to_string(),
                },
            ],
            reference: ReferenceEstimates {
                initial: Estimate {
                    x: vec![1.0],
                    streams: Vec::new(),
                    objectives: vec![1.0],
                },
                optimal: None,
            },
        });
        let failures = result.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[1], (1, "postrep failed".to_string()));
    }
}
