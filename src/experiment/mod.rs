//! One solver on one problem, across many macroreplications.
//!
//! An `Experiment` moves through a fixed lifecycle:
//!
//! ```text
//! Created --run--> RunComplete --post_replicate--> PostComplete
//!                       ^                              |
//!                       +--------post_replicate--------+ (overwrites)
//! ```
//!
//! `Running` and `PostReplicating` are held only while the corresponding call
//! is in progress. Errors from a single macroreplication's adapters are
//! recorded against that macroreplication and never abort its siblings; logic
//! defects (stream collisions, lifecycle misuse) abort the whole call and
//! leave the experiment in the state it started from.

mod parallel;
pub mod result;

use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::curve::Curve;
use crate::error::{ExecutionError, SimoptError, SimoptResult, StorageError, ValidationError};
use crate::factors::Factors;
use crate::problem::{build_problem, Problem};
use crate::rng::{StreamAllocator, StreamLedger, MAX_MACROREPS};
use crate::solution::Solution;
use crate::solver::{build_solver, Solver, SolverContext};
use crate::storage::{ExperimentRecord, ExperimentStore, StoreKey};

use parallel::{catch_panic, map_indexed};
use result::{
    Estimate, ExperimentResult, MacrorepOutcome, MacrorepRecord, PostRepOutcome, PostReplication,
    Recommendation, ReferenceEstimates, RESULT_SCHEMA_VERSION,
};

pub use result::PostRepSettings;

/// Lifecycle state of an [`Experiment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    /// Built, not yet run.
    Created,
    /// Macroreplications in progress.
    Running,
    /// All macroreplications attempted.
    RunComplete,
    /// Post-replication in progress.
    PostReplicating,
    /// Post-replication done; statistics are available.
    PostComplete,
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::RunComplete => "run_complete",
            Self::PostReplicating => "post_replicating",
            Self::PostComplete => "post_complete",
        };
        f.write_str(s)
    }
}

/// Execution settings of an experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentConfig {
    /// Worker threads for macroreplications; 1 runs them inline.
    pub workers: usize,
    /// When set, results are saved here after every completed stage.
    pub store_dir: Option<PathBuf>,
    /// Stream namespace; experiments in different families never share streams.
    pub stream_family: u32,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            store_dir: None,
            stream_family: 0,
        }
    }
}

impl ExperimentConfig {
    /// Rejects zero workers.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.workers == 0 {
            return Err(ValidationError::invalid("workers", "must be at least 1"));
        }
        Ok(self)
    }

    /// Runs macroreplications on `workers` threads.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Autosave after each completed stage into `dir`.
    #[must_use]
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    /// Draws streams from `family`.
    #[must_use]
    pub const fn with_stream_family(mut self, family: u32) -> Self {
        self.stream_family = family;
        self
    }
}

/// Objective values anchoring progress curves: the initial solution at gap 1
/// and the optimum at gap 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceValues {
    /// Mean objective at the initial solution.
    pub initial: f64,
    /// Objective standing in for the optimum.
    pub optimal: f64,
}

/// A solver paired with a problem, with its results.
pub struct Experiment {
    solver_name: String,
    problem_name: String,
    solver: Arc<dyn Solver>,
    problem: Arc<dyn Problem>,
    config: ExperimentConfig,
    allocator: StreamAllocator,
    state: ExperimentState,
    result: ExperimentResult,
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("solver", &self.solver_name)
            .field("problem", &self.problem_name)
            .field("state", &self.state)
            .field("config", &self.config)
            .field("macroreps", &self.result.n_macroreps())
            .finish_non_exhaustive()
    }
}

impl Experiment {
    /// Pairs two adapters. Fails if the solver cannot handle the problem.
    pub fn new(
        solver: Arc<dyn Solver>,
        problem: Arc<dyn Problem>,
        config: ExperimentConfig,
    ) -> SimoptResult<Self> {
        let config = config.validate()?;
        solver.check_compatible(problem.as_ref())?;
        Ok(Self {
            solver_name: solver.key().to_string(),
            problem_name: problem.key().to_string(),
            allocator: StreamAllocator::with_family(config.stream_family),
            result: ExperimentResult::new(problem.budget()),
            state: ExperimentState::Created,
            solver,
            problem,
            config,
        })
    }

    /// Builds both adapters from the registries.
    pub fn from_names(
        solver_name: &str,
        problem_name: &str,
        solver_factors: &Factors,
        problem_factors: &Factors,
        config: ExperimentConfig,
    ) -> SimoptResult<Self> {
        let solver = build_solver(solver_name, solver_factors)?;
        let problem = build_problem(problem_name, problem_factors)?;
        Self::new(solver, problem, config)
    }

    /// Overrides the display names used in reports and store keys.
    #[must_use]
    pub fn with_labels(mut self, solver_name: impl Into<String>, problem_name: impl Into<String>) -> Self {
        self.solver_name = solver_name.into();
        self.problem_name = problem_name.into();
        self
    }

    /// Display name of the solver.
    #[must_use]
    pub fn solver_name(&self) -> &str {
        &self.solver_name
    }

    /// Display name of the problem.
    #[must_use]
    pub fn problem_name(&self) -> &str {
        &self.problem_name
    }

    /// The solver adapter.
    #[must_use]
    pub fn solver(&self) -> &Arc<dyn Solver> {
        &self.solver
    }

    /// The problem adapter.
    #[must_use]
    pub fn problem(&self) -> &Arc<dyn Problem> {
        &self.problem
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ExperimentState {
        self.state
    }

    /// Execution settings.
    #[must_use]
    pub const fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Allocator the experiment draws its streams from.
    #[must_use]
    pub const fn allocator(&self) -> StreamAllocator {
        self.allocator
    }

    /// Everything learned so far.
    #[must_use]
    pub const fn result(&self) -> &ExperimentResult {
        &self.result
    }

    fn require(&self, operation: &str, allowed: &[ExperimentState]) -> Result<(), ExecutionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ExecutionError::InvalidState {
                operation: operation.to_string(),
                state: self.state.to_string(),
            })
        }
    }

    /// Runs `n_macroreps` independent macroreplications of the solver.
    ///
    /// Macroreplication `r` draws only from streams derived from `r`, so the
    /// result does not depend on the number of workers.
    pub fn run(&mut self, n_macroreps: usize) -> SimoptResult<()> {
        self.require("run", &[ExperimentState::Created])?;
        if n_macroreps == 0 || n_macroreps > MAX_MACROREPS {
            return Err(ValidationError::invalid(
                "n_macroreps",
                format!("must be in 1..={MAX_MACROREPS} (got {n_macroreps})"),
            )
            .into());
        }

        info!(
            solver = %self.solver_name,
            problem = %self.problem_name,
            n_macroreps,
            workers = self.config.workers,
            "running macroreplications"
        );
        self.state = ExperimentState::Running;

        let solver = self.solver.as_ref();
        let problem = self.problem.as_ref();
        let allocator = self.allocator;
        let outcomes = map_indexed(n_macroreps, self.config.workers, |r| {
            run_macrorep(solver, problem, allocator, r)
        });
        let outcomes = match outcomes.into_iter().collect::<SimoptResult<Vec<_>>>() {
            Ok(outcomes) => outcomes,
            Err(err) => {
                self.state = ExperimentState::Created;
                return Err(err);
            }
        };

        for outcome in &outcomes {
            if let MacrorepOutcome::Failed { macrorep, error } = outcome {
                warn!(
                    solver = %self.solver_name,
                    problem = %self.problem_name,
                    macrorep,
                    error = %error,
                    "macroreplication failed"
                );
            }
        }
        let failed = outcomes.iter().filter(|o| o.is_failed()).count();

        self.result = ExperimentResult::new(problem.budget());
        self.result.macroreps = outcomes;
        self.state = ExperimentState::RunComplete;
        info!(
            solver = %self.solver_name,
            problem = %self.problem_name,
            failed,
            "macroreplications complete"
        );
        self.autosave()
    }

    /// Re-evaluates every recommended solution, plus the initial and optimal
    /// reference solutions, with fresh replications.
    ///
    /// Re-invoking replaces the previous post-replication entirely.
    pub fn post_replicate(&mut self, settings: PostRepSettings) -> SimoptResult<()> {
        self.require(
            "post_replicate",
            &[ExperimentState::RunComplete, ExperimentState::PostComplete],
        )?;
        let settings = settings.validate()?;

        info!(
            solver = %self.solver_name,
            problem = %self.problem_name,
            n_postreps = settings.n_postreps,
            n_postreps_init_opt = settings.n_postreps_init_opt,
            crn_across_budget = settings.crn_across_budget,
            crn_across_macroreps = settings.crn_across_macroreps,
            "post-replicating"
        );
        let previous = self.state;
        self.state = ExperimentState::PostReplicating;

        let problem = self.problem.as_ref();
        let allocator = self.allocator;
        let reference = match evaluate_reference(problem, allocator, settings.n_postreps_init_opt) {
            Ok(reference) => reference,
            Err(err) => {
                self.state = previous;
                return Err(err);
            }
        };

        let runs = &self.result.macroreps;
        let outcomes = map_indexed(runs.len(), self.config.workers, |r| {
            postrep_macrorep(problem, allocator, settings, &runs[r])
        });
        let outcomes = match outcomes.into_iter().collect::<SimoptResult<Vec<_>>>() {
            Ok(outcomes) => outcomes,
            Err(err) => {
                self.state = previous;
                return Err(err);
            }
        };

        for (macrorep, outcome) in outcomes.iter().enumerate() {
            if let PostRepOutcome::Failed { error } = outcome {
                warn!(
                    solver = %self.solver_name,
                    problem = %self.problem_name,
                    macrorep,
                    error = %error,
                    "post-replication failed"
                );
            }
        }

        self.result.post_replication = Some(PostReplication {
            settings,
            macroreps: outcomes,
            reference,
        });
        self.state = ExperimentState::PostComplete;
        info!(solver = %self.solver_name, problem = %self.problem_name, "post-replication complete");
        self.autosave()
    }

    fn post(&self, operation: &str) -> SimoptResult<&PostReplication> {
        self.require(operation, &[ExperimentState::PostComplete])?;
        self.result.post_replication.as_ref().ok_or_else(|| {
            SimoptError::internal("post_complete experiment has no post-replication data")
        })
    }

    /// Best post-replicated mean among all recommended solutions of all
    /// macroreplications.
    #[must_use]
    pub fn best_estimate(&self) -> Option<f64> {
        let post = self.result.post_replication.as_ref()?;
        let sense = self.problem.sense();
        post.macroreps
            .iter()
            .filter_map(PostRepOutcome::estimates)
            .flatten()
            .map(Estimate::mean)
            .filter(|m| m.is_finite())
            .reduce(|best, m| if sense.better(m, best) { m } else { best })
    }

    /// Reference values of this experiment alone.
    ///
    /// The optimum is, in order of preference, the post-replicated estimate
    /// at the known optimal solution, the known optimal value, and the best
    /// post-replicated recommendation.
    pub fn reference_values(&self) -> SimoptResult<ReferenceValues> {
        let post = self.post("compute reference values")?;
        let optimal = if let Some(estimate) = &post.reference.optimal {
            estimate.mean()
        } else if let Some(value) = self.problem.optimal_value() {
            value
        } else {
            self.best_estimate().ok_or_else(|| ExecutionError::InsufficientData {
                reason: format!(
                    "no post-replicated recommendation to stand in for the optimum of '{}'",
                    self.problem_name
                ),
            })?
        };
        Ok(ReferenceValues {
            initial: post.reference.initial.mean(),
            optimal,
        })
    }

    /// Progress curves of every macroreplication that completed both stages,
    /// as `(macrorep, curve)` pairs. The x-axis is the fraction of budget
    /// consumed.
    pub fn progress_curves(&self, normalize: bool) -> SimoptResult<Vec<(usize, Curve)>> {
        let reference = self.reference_values()?;
        self.progress_curves_with(reference, normalize)
    }

    /// Progress curves against externally supplied reference values.
    ///
    /// Raw curves plot the sense-adjusted optimality gap; normalized curves
    /// divide it by the gap of the initial solution.
    pub fn progress_curves_with(
        &self,
        reference: ReferenceValues,
        normalize: bool,
    ) -> SimoptResult<Vec<(usize, Curve)>> {
        let post = self.post("compute progress curves")?;
        let sense = self.problem.sense();
        let scale = if normalize {
            let denominator = sense.gap(reference.initial, reference.optimal);
            if denominator == 0.0 || !denominator.is_finite() {
                return Err(ExecutionError::DegenerateNormalization {
                    problem: self.problem_name.clone(),
                }
                .into());
            }
            denominator
        } else {
            1.0
        };
        let transform = |value: f64| sense.gap(value, reference.optimal) / scale;
        let budget = self.result.budget as f64;

        let mut curves = Vec::new();
        for (macrorep, (run, postrep)) in self.result.macroreps.iter().zip(&post.macroreps).enumerate() {
            let (Some(record), Some(estimates)) = (run.record(), postrep.estimates()) else {
                continue;
            };
            let mut points = vec![(0.0, transform(reference.initial))];
            for (rec, estimate) in record.recommendations.iter().zip(estimates) {
                if rec.budget == 0 {
                    continue;
                }
                points.push((rec.budget as f64 / budget, transform(estimate.mean())));
            }
            curves.push((macrorep, Curve::new(points)));
        }
        Ok(curves)
    }

    /// Fraction of budget at which each macroreplication's normalized curve
    /// first reaches `solve_tol`; infinite when it never does.
    pub fn solve_times(&self, solve_tol: f64) -> SimoptResult<Vec<(usize, f64)>> {
        Ok(self
            .progress_curves(true)?
            .into_iter()
            .map(|(r, curve)| (r, curve.solve_time(solve_tol).unwrap_or(f64::INFINITY)))
            .collect())
    }

    /// Whether each macroreplication is solved to `solve_tol` by the end of its budget.
    pub fn solvability_indicators(&self, solve_tol: f64) -> SimoptResult<Vec<(usize, bool)>> {
        Ok(self
            .solve_times(solve_tol)?
            .into_iter()
            .map(|(r, t)| (r, t.is_finite()))
            .collect())
    }

    /// Area under each macroreplication's normalized progress curve.
    pub fn areas(&self) -> SimoptResult<Vec<(usize, f64)>> {
        Ok(self
            .progress_curves(true)?
            .into_iter()
            .map(|(r, curve)| (r, curve.area()))
            .collect())
    }

    /// Pointwise mean of the progress curves.
    pub fn mean_progress_curve(&self, normalize: bool) -> SimoptResult<Curve> {
        let curves: Vec<Curve> = self.progress_curves(normalize)?.into_iter().map(|(_, c)| c).collect();
        Curve::mean_of(&curves).ok_or_else(|| no_curves(&self.problem_name))
    }

    /// Pointwise `beta`-quantile of the progress curves.
    pub fn quantile_progress_curve(&self, beta: f64, normalize: bool) -> SimoptResult<Curve> {
        if !(0.0..=1.0).contains(&beta) {
            return Err(ValidationError::invalid("beta", "must be in [0, 1]").into());
        }
        let curves: Vec<Curve> = self.progress_curves(normalize)?.into_iter().map(|(_, c)| c).collect();
        Curve::quantile_of(&curves, beta).ok_or_else(|| no_curves(&self.problem_name))
    }

    /// Empirical CDF of solve times over the budget fraction `[0, 1]`.
    pub fn solvability_curve(&self, solve_tol: f64) -> SimoptResult<Curve> {
        let times: Vec<f64> = self.solve_times(solve_tol)?.into_iter().map(|(_, t)| t).collect();
        Ok(Curve::cdf(&times, 1.0))
    }

    /// Key under which this experiment is stored.
    #[must_use]
    pub fn store_key(&self) -> StoreKey {
        StoreKey::new(
            &self.solver_name,
            &self.problem_name,
            &self.solver.factors(),
            &self.problem.factors(),
        )
    }

    /// Snapshot of this experiment for the store.
    #[must_use]
    pub fn to_record(&self) -> ExperimentRecord {
        ExperimentRecord::new(
            self.store_key(),
            self.solver.key(),
            self.problem.key(),
            self.solver.factors(),
            self.problem.factors(),
            self.state,
            self.result.clone(),
        )
        .with_stream_family(self.allocator.family())
    }

    /// Writes the current result to `store`, replacing any previous record.
    pub fn save(&self, store: &ExperimentStore) -> SimoptResult<PathBuf> {
        store.save(&self.to_record())
    }

    fn autosave(&self) -> SimoptResult<()> {
        if let Some(dir) = &self.config.store_dir {
            let store = ExperimentStore::open(dir)?;
            self.save(&store)?;
        }
        Ok(())
    }

    /// Restores an experiment whose adapters come from the registries.
    ///
    /// The stream family is taken from the record, not from `config`, so a
    /// restored experiment keeps drawing from the streams it ran on.
    pub fn load(store: &ExperimentStore, key: &StoreKey, config: ExperimentConfig) -> SimoptResult<Self> {
        let record = store.load(key)?;
        let solver = build_solver(&record.solver_key, &record.solver_factors)?;
        let problem = build_problem(&record.problem_key, &record.problem_factors)?;
        Self::from_record(record, solver, problem, config, store.path_for(key).as_path())
    }

    /// Restores an experiment around caller-supplied adapters, which must
    /// reproduce the stored factor settings.
    pub fn load_with(
        store: &ExperimentStore,
        key: &StoreKey,
        solver: Arc<dyn Solver>,
        problem: Arc<dyn Problem>,
        config: ExperimentConfig,
    ) -> SimoptResult<Self> {
        let record = store.load(key)?;
        Self::from_record(record, solver, problem, config, store.path_for(key).as_path())
    }

    fn from_record(
        record: ExperimentRecord,
        solver: Arc<dyn Solver>,
        problem: Arc<dyn Problem>,
        config: ExperimentConfig,
        path: &Path,
    ) -> SimoptResult<Self> {
        let corrupt = |reason: String| -> SimoptError {
            StorageError::Corrupt {
                path: path.to_path_buf(),
                reason,
            }
            .into()
        };

        if record.result.schema_version != RESULT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchema {
                found: record.result.schema_version,
                expected: RESULT_SCHEMA_VERSION,
            }
            .into());
        }
        match record.state {
            ExperimentState::Created | ExperimentState::RunComplete => {}
            ExperimentState::PostComplete if record.result.post_replication.is_some() => {}
            state => return Err(corrupt(format!("record saved in state {state}"))),
        }

        if config.stream_family != record.stream_family {
            debug!(
                requested = config.stream_family,
                stored = record.stream_family,
                "using the stored stream family"
            );
        }
        let config = config.with_stream_family(record.stream_family);
        let mut experiment = Self::new(solver, problem, config)?
            .with_labels(record.key.solver_name.clone(), record.key.problem_name.clone());
        if experiment.store_key() != record.key {
            return Err(ValidationError::invalid(
                "adapters",
                "factor settings do not match the stored experiment",
            )
            .into());
        }
        if record.result.budget != experiment.problem.budget() {
            return Err(corrupt(format!(
                "stored budget {} differs from problem budget {}",
                record.result.budget,
                experiment.problem.budget()
            )));
        }

        experiment.state = record.state;
        experiment.result = record.result;
        debug!(
            solver = %experiment.solver_name,
            problem = %experiment.problem_name,
            state = %experiment.state,
            "experiment restored"
        );
        Ok(experiment)
    }
}

fn no_curves(problem: &str) -> SimoptError {
    ExecutionError::InsufficientData {
        reason: format!("no completed macroreplications on '{problem}'"),
    }
    .into()
}

fn failed(macrorep: usize, error: impl Into<String>) -> MacrorepOutcome {
    MacrorepOutcome::Failed {
        macrorep,
        error: error.into(),
    }
}

fn run_macrorep(
    solver: &dyn Solver,
    problem: &dyn Problem,
    allocator: StreamAllocator,
    macrorep: usize,
) -> SimoptResult<MacrorepOutcome> {
    debug!(solver = solver.key(), problem = problem.key(), macrorep, "macroreplication started");
    let mut ctx = SolverContext::new(problem.budget(), allocator.macrorep(macrorep));
    let sequence = match catch_panic(|| solver.optimize(problem, &mut ctx)) {
        Ok(Ok(sequence)) => sequence,
        Ok(Err(err)) if err.is_fatal() => return Err(err),
        Ok(Err(err)) => return Ok(failed(macrorep, err.to_string())),
        Err(panic) => {
            return Ok(failed(macrorep, format!("solver '{}' panicked: {panic}", solver.key())));
        }
    };
    match canonicalize(sequence.into_entries(), problem) {
        Ok(recommendations) => Ok(MacrorepOutcome::Completed(MacrorepRecord {
            macrorep,
            recommendations,
            streams: ctx.into_ledger().into_issued(),
        })),
        Err(reason) => Ok(failed(macrorep, format!("solver '{}' {reason}", solver.key()))),
    }
}

/// Checks a recommended sequence and makes it terminal at the full budget.
fn canonicalize(mut recs: Vec<Recommendation>, problem: &dyn Problem) -> Result<Vec<Recommendation>, String> {
    let budget = problem.budget();
    let last = recs
        .last()
        .cloned()
        .ok_or_else(|| "returned no recommendations".to_string())?;
    if let Some(bad) = recs.iter().find(|r| r.x.len() != problem.dim()) {
        return Err(format!(
            "recommended a {}-dimensional solution for a {}-dimensional problem",
            bad.x.len(),
            problem.dim()
        ));
    }
    if recs.windows(2).any(|w| w[1].budget < w[0].budget) {
        return Err("recommended solutions out of budget order".to_string());
    }
    if last.budget > budget {
        return Err(format!("consumed {} of a {budget} budget", last.budget));
    }
    if last.budget < budget {
        recs.push(Recommendation { budget, x: last.x });
    }
    Ok(recs)
}

fn evaluate_reference(
    problem: &dyn Problem,
    allocator: StreamAllocator,
    n_postreps: u64,
) -> SimoptResult<ReferenceEstimates> {
    // Initial and optimal solutions share one set of streams.
    let streams = StreamAllocator::solution_streams(allocator.reference_base(), 0, problem.n_rngs());
    let estimate = |x: Vec<f64>| -> SimoptResult<Estimate> {
        let mut solution = Solution::with_streams(x, streams.clone());
        catch_panic(|| solution.simulate(problem, n_postreps))
            .map_err(|panic| SimoptError::adapter(format!("problem '{}'", problem.key()), panic))??;
        Ok(Estimate::from_solution(&solution))
    };
    let initial = estimate(problem.initial_solution())?;
    let optimal = problem.optimal_solution().map(estimate).transpose()?;
    Ok(ReferenceEstimates { initial, optimal })
}

fn postrep_macrorep(
    problem: &dyn Problem,
    allocator: StreamAllocator,
    settings: PostRepSettings,
    run: &MacrorepOutcome,
) -> SimoptResult<PostRepOutcome> {
    let Some(record) = run.record() else {
        return Ok(PostRepOutcome::Skipped);
    };
    let base = allocator.postrep_base(record.macrorep, settings.crn_across_macroreps);
    let mut ledger = StreamLedger::new();
    let mut estimates = Vec::with_capacity(record.recommendations.len());

    for (ordinal, rec) in record.recommendations.iter().enumerate() {
        let ordinal = if settings.crn_across_budget { 0 } else { ordinal as u64 };
        let streams = StreamAllocator::solution_streams(base, ordinal, problem.n_rngs());
        ledger.issue_all(&streams, settings.crn_across_budget)?;

        let mut solution = Solution::with_streams(rec.x.clone(), streams);
        match catch_panic(|| solution.simulate(problem, settings.n_postreps)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_fatal() => return Err(err),
            Ok(Err(err)) => {
                return Ok(PostRepOutcome::Failed {
                    error: err.to_string(),
                })
            }
            Err(panic) => {
                return Ok(PostRepOutcome::Failed {
                    error: format!("problem '{}' panicked: {panic}", problem.key()),
                })
            }
        }
        estimates.push(Estimate::from_solution(&solution));
    }
    Ok(PostRepOutcome::Completed { estimates })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::Sense;
    use crate::solver::RecommendedSequence;

    fn identity_fixed(x: f64) -> Experiment {
        Experiment::from_names(
            "FIXED",
            "IDENTITY-1",
            &Factors::new().with("solution", x),
            &Factors::new(),
            ExperimentConfig::default().with_workers(2),
        )
        .unwrap()
    }

    #[test]
    fn lifecycle_rejects_misuse() {
        let mut exp = identity_fixed(5.0);
        assert!(matches!(
            exp.post_replicate(PostRepSettings::new(5, 5)),
            Err(SimoptError::Execution(ExecutionError::InvalidState { .. }))
        ));
        assert!(exp.run(0).is_err());
        assert_eq!(exp.state(), ExperimentState::Created);

        exp.run(2).unwrap();
        assert_eq!(exp.state(), ExperimentState::RunComplete);
        assert!(matches!(
            exp.run(2),
            Err(SimoptError::Execution(ExecutionError::InvalidState { .. }))
        ));
        assert!(exp.progress_curves(true).is_err());
    }

    #[test]
    fn fixed_point_sequence_is_terminal() {
        let mut exp = identity_fixed(5.0);
        exp.run(3).unwrap();
        for outcome in &exp.result().macroreps {
            let record = outcome.record().unwrap();
            assert_eq!(record.recommendations.len(), 1);
            assert_eq!(record.recommendations[0].budget, 100);
        }
    }

    #[test]
    fn canonicalize_appends_full_budget() {
        let problem = build_problem("IDENTITY-1", &Factors::new()).unwrap();
        let recs = vec![
            Recommendation { budget: 0, x: vec![10.0] },
            Recommendation { budget: 40, x: vec![3.0] },
        ];
        let out = canonicalize(recs, problem.as_ref()).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2], Recommendation { budget: 100, x: vec![3.0] });

        let unordered = vec![
            Recommendation { budget: 40, x: vec![3.0] },
            Recommendation { budget: 10, x: vec![3.0] },
        ];
        assert!(canonicalize(unordered, problem.as_ref()).is_err());
        assert!(canonicalize(Vec::new(), problem.as_ref()).is_err());
        let wrong_dim = vec![Recommendation { budget: 100, x: vec![1.0, 2.0] }];
        assert!(canonicalize(wrong_dim, problem.as_ref()).is_err());
    }

    #[test]
    fn post_replication_at_known_optimum() {
        let mut exp = identity_fixed(0.0);
        exp.run(2).unwrap();
        exp.post_replicate(PostRepSettings::new(4, 4)).unwrap();
        let reference = exp.reference_values().unwrap();
        assert_eq!(reference, ReferenceValues { initial: 10.0, optimal: 0.0 });

        let curves = exp.progress_curves(true).unwrap();
        assert_eq!(curves.len(), 2);
        let (_, curve) = &curves[0];
        assert_eq!(curve.x(), &[0.0, 1.0]);
        assert_eq!(curve.y(), &[1.0, 0.0]);
        assert_eq!(exp.areas().unwrap()[0].1, 1.0);
        assert_eq!(exp.solve_times(0.0).unwrap()[1], (1, 1.0));

        let raw = exp.progress_curves(false).unwrap();
        assert_eq!(raw[0].1.y(), &[10.0, 0.0]);
    }

    #[test]
    fn degenerate_normalization_is_reported() {
        let mut exp = Experiment::from_names(
            "FIXED",
            "IDENTITY-1",
            &Factors::new(),
            &Factors::new().with("initial_solution", 0.0),
            ExperimentConfig::default().with_workers(1),
        )
        .unwrap();
        exp.run(1).unwrap();
        exp.post_replicate(PostRepSettings::new(2, 2)).unwrap();
        assert!(matches!(
            exp.progress_curves(true),
            Err(SimoptError::Execution(ExecutionError::DegenerateNormalization { .. }))
        ));
        assert!(exp.progress_curves(false).is_ok());
    }

    struct Failing;

    impl Solver for Failing {
        fn key(&self) -> &str {
            "FAILING"
        }

        fn factors(&self) -> Factors {
            Factors::new()
        }

        fn optimize(&self, _problem: &dyn Problem, ctx: &mut SolverContext) -> SimoptResult<RecommendedSequence> {
            if ctx.streams().base().stream % 4 == 0 {
                return Err(SimoptError::adapter("solver FAILING", "diverged"));
            }
            let mut seq = RecommendedSequence::new();
            seq.push(ctx.budget(), &[1.0]);
            Ok(seq)
        }
    }

    #[test]
    fn adapter_failures_are_isolated() {
        let problem = build_problem("IDENTITY-1", &Factors::new()).unwrap();
        let mut exp = Experiment::new(Arc::new(Failing), problem, ExperimentConfig::default()).unwrap();
        exp.run(4).unwrap();
        // Run streams are 2 + 2r: macroreps 1 and 3 land on multiples of 4.
        let failed: Vec<usize> = exp.result().failures().into_iter().map(|(r, _)| r).collect();
        assert_eq!(failed, vec![1, 3]);

        exp.post_replicate(PostRepSettings::new(3, 3)).unwrap();
        let post = exp.result().post_replication.as_ref().unwrap();
        assert_eq!(post.macroreps[1], PostRepOutcome::Skipped);
        assert_eq!(exp.progress_curves(true).unwrap().len(), 2);
        assert_eq!(exp.problem().sense(), Sense::Minimize);
    }

    #[test]
    fn config_validation() {
        assert!(ExperimentConfig::default().with_workers(0).validate().is_err());
        let config = ExperimentConfig::default().with_stream_family(7).validate().unwrap();
        assert_eq!(config.stream_family, 7);
    }
}
