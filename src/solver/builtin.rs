//! Built-in solvers.

use crate::error::{SimoptError, SimoptResult, ValidationError};
use crate::factors::{FactorReader, Factors};
use crate::problem::Problem;

use super::{RecommendedSequence, Solver, SolverContext};

/// Configuration of [`RandomSearch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomSearchConfig {
    /// Replications spent on every visited solution.
    pub sample_size: u64,
    /// Attach the same streams to every visited solution.
    pub crn_across_solutions: bool,
}

impl RandomSearchConfig {
    const KEY: &'static str = "RNDSRCH";

    /// Reads the configuration; recognized factors are `sample_size` and
    /// `crn_across_solutions`.
    pub fn from_factors(factors: &Factors) -> Result<Self, ValidationError> {
        let mut reader = FactorReader::new(Self::KEY, factors);
        let sample_size = reader.count("sample_size", 10, 1)?;
        let crn_across_solutions = reader.bool("crn_across_solutions", true)?;
        reader.finish()?;
        Ok(Self {
            sample_size,
            crn_across_solutions,
        })
    }

    /// Factor settings that reproduce this configuration.
    #[must_use]
    pub fn to_factors(&self) -> Factors {
        Factors::new()
            .with("sample_size", i64::try_from(self.sample_size).unwrap_or(i64::MAX))
            .with("crn_across_solutions", self.crn_across_solutions)
    }
}

/// Samples feasible solutions uniformly, keeping the best sample mean.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    config: RandomSearchConfig,
}

impl RandomSearch {
    /// Solver with the given configuration.
    #[must_use]
    pub fn new(config: RandomSearchConfig) -> Self {
        Self { config }
    }
}

impl Solver for RandomSearch {
    fn key(&self) -> &str {
        RandomSearchConfig::KEY
    }

    fn factors(&self) -> Factors {
        self.config.to_factors()
    }

    fn optimize(
        &self,
        problem: &dyn Problem,
        ctx: &mut SolverContext,
    ) -> SimoptResult<RecommendedSequence> {
        let n = self.config.sample_size;
        let crn = self.config.crn_across_solutions;
        let sense = problem.sense();
        let mut search_rng = ctx.solver_rng(0)?;
        let mut recommended = RecommendedSequence::new();

        let mut best = ctx.new_solution(problem, problem.initial_solution(), crn)?;
        if ctx.remaining() < n {
            recommended.recommend(0, &best);
            return Ok(recommended);
        }
        ctx.simulate(problem, &mut best, n)?;
        recommended.recommend(ctx.consumed(), &best);
        let mut best_mean = best
            .objective_mean()
            .ok_or_else(|| SimoptError::internal("initial solution has no replications"))?;

        while ctx.remaining() >= n {
            let x = problem.random_solution(&mut search_rng);
            let mut candidate = ctx.new_solution(problem, x, crn)?;
            ctx.simulate(problem, &mut candidate, n)?;
            let mean = candidate
                .objective_mean()
                .ok_or_else(|| SimoptError::internal("candidate has no replications"))?;
            if sense.better(mean, best_mean) {
                best = candidate;
                best_mean = mean;
                recommended.recommend(ctx.consumed(), &best);
            }
        }
        Ok(recommended)
    }
}

/// Configuration of [`FixedPoint`].
#[derive(Debug, Clone, PartialEq)]
pub struct FixedPointConfig {
    /// Point to recommend; empty means the problem's initial solution.
    pub solution: Vec<f64>,
}

impl FixedPointConfig {
    const KEY: &'static str = "FIXED";

    /// Reads the configuration; the only recognized factor is `solution`.
    pub fn from_factors(factors: &Factors) -> Result<Self, ValidationError> {
        let mut reader = FactorReader::new(Self::KEY, factors);
        let solution = reader.vector("solution", Vec::new())?;
        reader.finish()?;
        Ok(Self { solution })
    }

    /// Factor settings that reproduce this configuration.
    #[must_use]
    pub fn to_factors(&self) -> Factors {
        Factors::new().with("solution", self.solution.clone())
    }
}

/// Recommends a single fixed point at the full budget without simulating.
///
/// A baseline for comparisons and a deterministic fixture.
#[derive(Debug, Clone)]
pub struct FixedPoint {
    config: FixedPointConfig,
}

impl FixedPoint {
    /// Solver with the given configuration.
    #[must_use]
    pub fn new(config: FixedPointConfig) -> Self {
        Self { config }
    }
}

impl Solver for FixedPoint {
    fn key(&self) -> &str {
        FixedPointConfig::KEY
    }

    fn factors(&self) -> Factors {
        self.config.to_factors()
    }

    fn check_compatible(&self, problem: &dyn Problem) -> Result<(), ValidationError> {
        if !self.config.solution.is_empty() && self.config.solution.len() != problem.dim() {
            return Err(ValidationError::DimensionMismatch {
                expected: problem.dim(),
                actual: self.config.solution.len(),
            });
        }
        Ok(())
    }

    fn optimize(
        &self,
        problem: &dyn Problem,
        ctx: &mut SolverContext,
    ) -> SimoptResult<RecommendedSequence> {
        let x = if self.config.solution.is_empty() {
            problem.initial_solution()
        } else {
            self.config.solution.clone()
        };
        let mut recommended = RecommendedSequence::new();
        recommended.push(ctx.budget(), &x);
        Ok(recommended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::build_problem;
    use crate::rng::StreamAllocator;

    #[test]
    fn random_search_respects_budget_and_improves() {
        let problem = build_problem(
            "QUADRATIC-1",
            &Factors::new().with("budget", 200_i64).with("noise_sd", 0.0),
        )
        .unwrap();
        let solver = RandomSearch::new(
            RandomSearchConfig::from_factors(&Factors::new().with("sample_size", 5_i64)).unwrap(),
        );
        let mut ctx = SolverContext::new(problem.budget(), StreamAllocator::new().macrorep(0));
        let seq = solver.optimize(problem.as_ref(), &mut ctx).unwrap();

        assert_eq!(ctx.consumed(), 200);
        assert!(!seq.is_empty());
        assert_eq!(seq.entries()[0].budget, 5);
        assert_eq!(seq.entries()[0].x, vec![5.0, 5.0]);
        let budgets: Vec<u64> = seq.entries().iter().map(|r| r.budget).collect();
        assert!(budgets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn random_search_with_tiny_budget_recommends_initial() {
        let problem = build_problem("IDENTITY-1", &Factors::new().with("budget", 3_i64)).unwrap();
        let solver = RandomSearch::new(RandomSearchConfig::from_factors(&Factors::new()).unwrap());
        let mut ctx = SolverContext::new(problem.budget(), StreamAllocator::new().macrorep(0));
        let seq = solver.optimize(problem.as_ref(), &mut ctx).unwrap();
        assert_eq!(seq.len(), 1);
        assert_eq!(seq.entries()[0].budget, 0);
    }

    #[test]
    fn fixed_point_recommends_at_full_budget() {
        let problem = build_problem("IDENTITY-1", &Factors::new()).unwrap();
        let solver =
            FixedPoint::new(FixedPointConfig::from_factors(&Factors::new().with("solution", 5.0)).unwrap());
        solver.check_compatible(problem.as_ref()).unwrap();
        let mut ctx = SolverContext::new(problem.budget(), StreamAllocator::new().macrorep(0));
        let seq = solver.optimize(problem.as_ref(), &mut ctx).unwrap();
        assert_eq!(seq.entries()[0].budget, problem.budget());
        assert_eq!(seq.entries()[0].x, vec![5.0]);
    }

    #[test]
    fn fixed_point_rejects_wrong_dimension() {
        let problem = build_problem("QUADRATIC-1", &Factors::new()).unwrap();
        let solver =
            FixedPoint::new(FixedPointConfig::from_factors(&Factors::new().with("solution", 5.0)).unwrap());
        assert!(solver.check_compatible(problem.as_ref()).is_err());
    }
}
