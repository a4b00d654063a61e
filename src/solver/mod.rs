//! Solver adapter contract and registry.
//!
//! A `Solver` receives a problem and a [`SolverContext`] holding the
//! macroreplication's budget and streams, and returns the sequence of
//! solutions it recommended along the way. Solvers obtain randomness and
//! attach streams to solutions only through the context.

mod builtin;

use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ExecutionError, SimoptResult, ValidationError};
use crate::experiment::result::Recommendation;
use crate::factors::Factors;
use crate::problem::Problem;
use crate::rng::generator::SimRng;
use crate::rng::{MacrorepStreams, StreamLedger};
use crate::solution::Solution;

pub use builtin::{FixedPoint, FixedPointConfig, RandomSearch, RandomSearchConfig};

/// Time-stamped recommendations produced by one macroreplication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecommendedSequence {
    entries: Vec<Recommendation>,
}

impl RecommendedSequence {
    /// Empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `x` as the recommendation after `budget` replications.
    pub fn push(&mut self, budget: u64, x: &[f64]) {
        self.entries.push(Recommendation {
            budget,
            x: x.to_vec(),
        });
    }

    /// Records `solution` as the recommendation after `budget` replications.
    pub fn recommend(&mut self, budget: u64, solution: &Solution) {
        self.push(budget, solution.x());
    }

    /// Recommendations in the order they were made.
    #[must_use]
    pub fn entries(&self) -> &[Recommendation] {
        &self.entries
    }

    /// Consumes the sequence, returning its entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<Recommendation> {
        self.entries
    }

    /// Number of recommendations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True before the first recommendation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Budget and stream access for one macroreplication's optimization run.
#[derive(Debug)]
pub struct SolverContext {
    budget: u64,
    consumed: u64,
    streams: MacrorepStreams,
    ledger: StreamLedger,
    next_ordinal: u64,
}

impl SolverContext {
    pub(crate) fn new(budget: u64, streams: MacrorepStreams) -> Self {
        Self {
            budget,
            consumed: 0,
            streams,
            ledger: StreamLedger::new(),
            // Ordinal 0 is shared by every solution created under CRN.
            next_ordinal: 1,
        }
    }

    /// Total budget of this macroreplication.
    #[must_use]
    pub const fn budget(&self) -> u64 {
        self.budget
    }

    /// Replications charged so far.
    #[must_use]
    pub const fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Replications left.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.consumed)
    }

    /// Streams of this macroreplication.
    #[must_use]
    pub const fn streams(&self) -> MacrorepStreams {
        self.streams
    }

    /// Generator for the solver's `k`-th internal random source.
    pub fn solver_rng(&mut self, k: u64) -> SimoptResult<SimRng> {
        let index = self.streams.solver_stream(k)?;
        self.ledger.issue(index, false)?;
        Ok(SimRng::new(index))
    }

    /// Creates a solution with fresh streams attached, or with the shared
    /// CRN streams when `crn` is set.
    pub fn new_solution(
        &mut self,
        problem: &dyn Problem,
        x: Vec<f64>,
        crn: bool,
    ) -> SimoptResult<Solution> {
        let ordinal = if crn {
            0
        } else {
            let ordinal = self.next_ordinal;
            self.next_ordinal += 1;
            ordinal
        };
        let streams = self.streams.solution_streams(ordinal, problem.n_rngs());
        self.ledger.issue_all(&streams, crn)?;
        Ok(Solution::with_streams(x, streams))
    }

    /// Simulates `solution` `m` times, charging the budget.
    pub fn simulate(
        &mut self,
        problem: &dyn Problem,
        solution: &mut Solution,
        m: u64,
    ) -> SimoptResult<()> {
        if m > self.remaining() {
            return Err(ExecutionError::BudgetExhausted {
                requested: m,
                remaining: self.remaining(),
            }
            .into());
        }
        solution.simulate(problem, m)?;
        self.consumed += m;
        Ok(())
    }

    pub(crate) fn into_ledger(self) -> StreamLedger {
        self.ledger
    }
}

/// Solver adapter contract.
pub trait Solver: Send + Sync {
    /// Registry key or user-chosen name of the solver.
    fn key(&self) -> &str;

    /// Factor settings that reproduce this solver.
    fn factors(&self) -> Factors;

    /// Rejects problems this solver cannot handle.
    fn check_compatible(&self, _problem: &dyn Problem) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Runs one macroreplication.
    fn optimize(
        &self,
        problem: &dyn Problem,
        ctx: &mut SolverContext,
    ) -> SimoptResult<RecommendedSequence>;
}

/// Built-in solvers, selected by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolverKind {
    /// Random search.
    RandomSearch,
    /// Recommends one fixed point at the full budget.
    FixedPoint,
}

impl SolverKind {
    /// All registered solvers.
    pub const ALL: [SolverKind; 2] = [Self::RandomSearch, Self::FixedPoint];

    /// Registry key.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::RandomSearch => "RNDSRCH",
            Self::FixedPoint => "FIXED",
        }
    }

    /// Builds the solver from its factor settings.
    pub fn build(self, factors: &Factors) -> Result<Arc<dyn Solver>, ValidationError> {
        Ok(match self {
            Self::RandomSearch => {
                Arc::new(RandomSearch::new(RandomSearchConfig::from_factors(factors)?))
            }
            Self::FixedPoint => Arc::new(FixedPoint::new(FixedPointConfig::from_factors(factors)?)),
        })
    }
}

impl FromStr for SolverKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.key() == s)
            .ok_or_else(|| ValidationError::UnknownSolver { name: s.to_string() })
    }
}

/// Looks up `name` in the registry and builds it with `factors`.
pub fn build_solver(name: &str, factors: &Factors) -> Result<Arc<dyn Solver>, ValidationError> {
    name.parse::<SolverKind>()?.build(factors)
}
