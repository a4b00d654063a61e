//! Solutions and their accumulated simulation responses.

use crate::error::{SimoptResult, ValidationError};
use crate::problem::{Problem, Replication};
use crate::rng::generator::SimRng;
use crate::rng::StreamIndex;

/// Arithmetic mean, `None` for an empty slice.
#[must_use]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Unbiased sample variance; zero for a single value, `None` for none.
#[must_use]
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    if values.len() < 2 {
        return Some(0.0);
    }
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    Some(ss / (values.len() - 1) as f64)
}

/// A decision vector with attached random streams and accumulated responses.
///
/// Each solution is owned by exactly one macroreplication (or one
/// post-replication task); it is never shared across execution contexts.
#[derive(Debug, Clone)]
pub struct Solution {
    x: Vec<f64>,
    streams: Vec<StreamIndex>,
    rngs: Vec<SimRng>,
    replications: Vec<Replication>,
}

impl Solution {
    /// Creates a solution with no attached streams.
    #[must_use]
    pub fn new(x: Vec<f64>) -> Self {
        Self {
            x,
            streams: Vec::new(),
            rngs: Vec::new(),
            replications: Vec::new(),
        }
    }

    /// Creates a solution with one stream attached per oracle random source.
    #[must_use]
    pub fn with_streams(x: Vec<f64>, streams: Vec<StreamIndex>) -> Self {
        let mut solution = Self::new(x);
        solution.attach_streams(streams);
        solution
    }

    /// Replaces the attached streams. Accumulated responses are kept.
    pub fn attach_streams(&mut self, streams: Vec<StreamIndex>) {
        self.rngs = streams.iter().copied().map(SimRng::new).collect();
        self.streams = streams;
    }

    /// Decision vector.
    #[must_use]
    pub fn x(&self) -> &[f64] {
        &self.x
    }

    /// Stream indices as attached (before any replication advanced them).
    #[must_use]
    pub fn streams(&self) -> &[StreamIndex] {
        &self.streams
    }

    /// Replications accumulated so far.
    #[must_use]
    pub fn n_reps(&self) -> usize {
        self.replications.len()
    }

    /// Accumulated responses, in replication order.
    #[must_use]
    pub fn replications(&self) -> &[Replication] {
        &self.replications
    }

    /// Runs `m` replications of `problem` at this solution and accumulates the
    /// responses. After each replication every attached stream advances to its
    /// next subsubstream.
    ///
    /// All or nothing: if any replication fails, no response is kept and the
    /// streams stay where they were.
    pub fn simulate(&mut self, problem: &dyn Problem, m: u64) -> SimoptResult<()> {
        if self.x.len() != problem.dim() {
            return Err(ValidationError::DimensionMismatch {
                expected: problem.dim(),
                actual: self.x.len(),
            }
            .into());
        }
        if self.rngs.len() != problem.n_rngs() {
            return Err(ValidationError::invalid(
                "streams",
                format!(
                    "{} streams attached, problem '{}' draws from {}",
                    self.rngs.len(),
                    problem.key(),
                    problem.n_rngs()
                ),
            )
            .into());
        }

        // Work on copies so a failed call leaves responses and streams untouched.
        let mut rngs = self.rngs.clone();
        let mut batch = Vec::new();
        for _ in 0..m {
            batch.push(problem.replicate(&self.x, &mut rngs)?);
            for rng in &mut rngs {
                rng.advance_subsubstream();
            }
        }
        self.replications.append(&mut batch);
        self.rngs = rngs;
        Ok(())
    }

    /// Objective estimates, one per replication.
    #[must_use]
    pub fn objectives(&self) -> Vec<f64> {
        self.replications.iter().map(|r| r.objective).collect()
    }

    /// Mean objective; `None` before any replication.
    #[must_use]
    pub fn objective_mean(&self) -> Option<f64> {
        mean(&self.objectives())
    }

    /// Sample variance of the objective; `None` with fewer than two replications.
    #[must_use]
    pub fn objective_variance(&self) -> Option<f64> {
        sample_variance(&self.objectives())
    }

    /// Standard error of the objective mean.
    #[must_use]
    pub fn objective_std_error(&self) -> Option<f64> {
        let var = self.objective_variance()?;
        Some((var / self.n_reps() as f64).sqrt())
    }

    /// Component-wise mean of the gradient estimates; `None` unless every
    /// replication produced one.
    #[must_use]
    pub fn gradient_mean(&self) -> Option<Vec<f64>> {
        let gradients: Option<Vec<&Vec<f64>>> =
            self.replications.iter().map(|r| r.gradient.as_ref()).collect();
        let gradients = gradients?;
        let first = gradients.first()?;
        let n = gradients.len() as f64;
        Some(
            (0..first.len())
                .map(|i| gradients.iter().map(|g| g.get(i).copied().unwrap_or(0.0)).sum::<f64>() / n)
                .collect(),
        )
    }

    /// Mean of each stochastic constraint estimate.
    #[must_use]
    pub fn stoch_constraint_means(&self) -> Vec<f64> {
        let Some(first) = self.replications.first() else {
            return Vec::new();
        };
        let n = self.replications.len() as f64;
        (0..first.stoch_constraints.len())
            .map(|i| {
                self.replications
                    .iter()
                    .map(|r| r.stoch_constraints.get(i).copied().unwrap_or(0.0))
                    .sum::<f64>()
                    / n
            })
            .collect()
    }

    /// Drops accumulated responses and rewinds the attached streams.
    pub fn reset(&mut self) {
        self.replications.clear();
        let streams = std::mem::take(&mut self.streams);
        self.attach_streams(streams);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rand::Rng;

    use super::*;
    use crate::factors::Factors;
    use crate::problem::{build_problem, Sense};

    #[test]
    fn statistics_helpers() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(sample_variance(&[4.0]), Some(0.0));
        assert_eq!(sample_variance(&[1.0, 2.0, 3.0]), Some(1.0));
    }

    #[test]
    fn simulate_accumulates_and_advances() {
        let problem = build_problem("QUADRATIC-1", &Factors::new()).unwrap();
        let start = StreamIndex::new(3, 0, 0);
        let mut solution = Solution::with_streams(vec![1.0, 1.0], vec![start]);
        solution.simulate(problem.as_ref(), 5).unwrap();
        solution.simulate(problem.as_ref(), 5).unwrap();
        assert_eq!(solution.n_reps(), 10);
        assert_eq!(solution.streams(), &[start]);

        // Two calls of five draw the same subsubstreams as one call of ten.
        let mut again = Solution::with_streams(vec![1.0, 1.0], vec![start]);
        again.simulate(problem.as_ref(), 10).unwrap();
        assert_eq!(again.objectives(), solution.objectives());
    }

    #[test]
    fn simulate_rejects_missing_streams() {
        let problem = build_problem("IDENTITY-1", &Factors::new()).unwrap();
        let mut solution = Solution::new(vec![1.0]);
        assert!(solution.simulate(problem.as_ref(), 1).is_err());

        let mut wrong_dim = Solution::with_streams(vec![1.0, 2.0], vec![StreamIndex::new(0, 0, 0)]);
        assert!(wrong_dim.simulate(problem.as_ref(), 1).is_err());
    }

    #[test]
    fn reset_rewinds_streams() {
        let problem = build_problem("QUADRATIC-1", &Factors::new()).unwrap();
        let mut solution = Solution::with_streams(vec![0.0, 0.0], vec![StreamIndex::new(5, 1, 0)]);
        solution.simulate(problem.as_ref(), 3).unwrap();
        let first = solution.objectives();
        solution.reset();
        assert_eq!(solution.n_reps(), 0);
        solution.simulate(problem.as_ref(), 3).unwrap();
        assert_eq!(solution.objectives(), first);
    }

    /// Draws one uniform per replication and fails on the `fail_at`-th call.
    struct Flaky {
        calls: AtomicUsize,
        fail_at: usize,
    }

    impl Problem for Flaky {
        fn key(&self) -> &str {
            "FLAKY"
        }

        fn factors(&self) -> Factors {
            Factors::new()
        }

        fn dim(&self) -> usize {
            1
        }

        fn sense(&self) -> Sense {
            Sense::Minimize
        }

        fn n_rngs(&self) -> usize {
            1
        }

        fn budget(&self) -> u64 {
            100
        }

        fn initial_solution(&self) -> Vec<f64> {
            vec![0.0]
        }

        fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![0.0], vec![1.0])
        }

        fn replicate(&self, _x: &[f64], rngs: &mut [SimRng]) -> SimoptResult<Replication> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_at {
                return Err(crate::SimoptError::adapter("problem FLAKY", "oracle crashed"));
            }
            Ok(Replication::objective_only(rngs[0].gen::<f64>()))
        }
    }

    #[test]
    fn failed_simulate_keeps_previous_state() {
        let problem = Flaky {
            calls: AtomicUsize::new(0),
            fail_at: 4,
        };
        let start = StreamIndex::new(7, 0, 0);
        let mut solution = Solution::with_streams(vec![0.5], vec![start]);
        solution.simulate(&problem, 2).unwrap();
        let before = solution.objectives();

        // Calls 2 and 3 succeed, call 4 fails: nothing from this batch is kept.
        assert!(solution.simulate(&problem, 3).is_err());
        assert_eq!(solution.objectives(), before);

        solution.simulate(&problem, 2).unwrap();
        let mut clean = Solution::with_streams(vec![0.5], vec![start]);
        let ok = Flaky {
            calls: AtomicUsize::new(0),
            fail_at: usize::MAX,
        };
        clean.simulate(&ok, 4).unwrap();
        assert_eq!(solution.objectives(), clean.objectives());
    }

    #[test]
    fn gradient_and_constraint_means() {
        let problem = build_problem("IDENTITY-1", &Factors::new().with("dim", 2_i64)).unwrap();
        let mut solution = Solution::with_streams(vec![1.0, 2.0], vec![StreamIndex::new(0, 0, 0)]);
        solution.simulate(problem.as_ref(), 4).unwrap();
        assert_eq!(solution.gradient_mean(), Some(vec![1.0, 1.0]));
        assert!(solution.stoch_constraint_means().is_empty());
        assert_eq!(solution.objective_variance(), Some(0.0));
    }
}
