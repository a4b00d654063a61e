//! Cross-experiment statistics over every (solver, problem) pair.
//!
//! A `MetaExperiment` owns one [`Experiment`] per pair. All solvers run on a
//! problem are judged against one shared reference (initial value and
//! optimum), so their curves are directly comparable.
//!
//! Profiles and area statistics can carry bootstrap confidence intervals;
//! see [`crate::bootstrap`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bootstrap::{replicate_rng, resample, BootstrapSettings, ConfidenceBand, Interval};
use crate::curve::{quantile, Curve};
use crate::error::{ExecutionError, SimoptResult, ValidationError};
use crate::experiment::{Experiment, ExperimentConfig, ExperimentState, PostRepSettings, ReferenceValues};
use crate::factors::Factors;
use crate::problem::{build_problem, Problem};
use crate::rng::{StreamAllocator, MAX_MACROREPS};
use crate::solution::{mean, sample_variance};
use crate::solver::{build_solver, Solver};

/// Stage at which a pair failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStage {
    /// `run` failed for the pair.
    Run,
    /// `post_replicate` failed for the pair.
    PostReplicate,
}

/// A (solver, problem) pair whose experiment could not complete a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairFailure {
    /// Solver label.
    pub solver: String,
    /// Problem label.
    pub problem: String,
    /// Stage that failed.
    pub stage: PairStage,
    /// Error message.
    pub error: String,
}

/// How macroreplications are aggregated into a solvability profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    /// Mean over problems of each pair's solve-time CDF.
    Mean,
    /// Fraction of problems whose `beta`-quantile solve time has passed.
    Quantile,
}

/// Parameters of [`MetaExperiment::solvability_profiles`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvabilityRequest {
    /// A macroreplication is solved once its normalized gap is at or below this.
    pub solve_tol: f64,
    /// Quantile used by [`ProfileKind::Quantile`].
    pub beta: f64,
    /// Aggregation over macroreplications.
    pub kind: ProfileKind,
    /// Solver the difference profiles are taken against.
    pub ref_solver: Option<String>,
    /// When set, profiles come with bootstrap confidence bands.
    pub bootstrap: Option<BootstrapSettings>,
}

impl SolvabilityRequest {
    /// Request with `beta = 0.5`, no reference solver and no bootstrap.
    #[must_use]
    pub const fn new(solve_tol: f64, kind: ProfileKind) -> Self {
        Self {
            solve_tol,
            beta: 0.5,
            kind,
            ref_solver: None,
            bootstrap: None,
        }
    }

    /// Quantile level for [`ProfileKind::Quantile`].
    #[must_use]
    pub const fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// Also compute difference profiles against `solver`.
    #[must_use]
    pub fn with_ref_solver(mut self, solver: impl Into<String>) -> Self {
        self.ref_solver = Some(solver.into());
        self
    }

    /// Also compute bootstrap bands.
    #[must_use]
    pub const fn with_bootstrap(mut self, settings: BootstrapSettings) -> Self {
        self.bootstrap = Some(settings);
        self
    }

    /// Checks tolerance, quantile level and bootstrap settings.
    pub fn validate(mut self) -> Result<Self, ValidationError> {
        if let Some(settings) = self.bootstrap {
            self.bootstrap = Some(settings.validate()?);
        }
        if !self.solve_tol.is_finite() || self.solve_tol < 0.0 {
            return Err(ValidationError::invalid("solve_tol", "must be finite and >= 0"));
        }
        if !(0.0..=1.0).contains(&self.beta) {
            return Err(ValidationError::invalid("beta", "must be in [0, 1]"));
        }
        Ok(self)
    }
}

/// Solvability profiles, keyed by solver name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvabilityReport {
    /// Solvability profile of each solver with at least one completed pair.
    pub profiles: BTreeMap<String, Curve>,
    /// `profile(solver) - profile(ref_solver)` for every other solver.
    pub differences: BTreeMap<String, Curve>,
    /// Bootstrap bands around `profiles`; empty unless requested.
    pub intervals: BTreeMap<String, ConfidenceBand>,
    /// Bootstrap bands around `differences`; empty unless requested.
    pub difference_intervals: BTreeMap<String, ConfidenceBand>,
}

/// Distribution of normalized progress-curve areas for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaStatistic {
    /// Solver label.
    pub solver: String,
    /// Problem label.
    pub problem: String,
    /// Mean area.
    pub mean: f64,
    /// Sample standard deviation of the areas; 0 for a single area.
    pub std_dev: f64,
    /// One area per completed macroreplication.
    pub areas: Vec<f64>,
    /// Bootstrap interval of `mean`, when requested.
    pub mean_interval: Option<Interval>,
    /// Bootstrap interval of `std_dev`, when requested.
    pub std_dev_interval: Option<Interval>,
}

/// Normalized curves of one completed pair.
struct PairCurves {
    solver: usize,
    problem: usize,
    curves: Vec<(usize, Curve)>,
}

/// The cross product of solvers and problems.
#[derive(Debug)]
pub struct MetaExperiment {
    solver_names: Vec<String>,
    problem_names: Vec<String>,
    /// Indexed `[solver][problem]`.
    experiments: Vec<Vec<Experiment>>,
    failures: Vec<PairFailure>,
    /// Source of bootstrap streams.
    allocator: StreamAllocator,
}

impl MetaExperiment {
    /// Builds every pair from labeled adapters.
    pub fn new(
        solvers: Vec<(String, Arc<dyn Solver>)>,
        problems: Vec<(String, Arc<dyn Problem>)>,
        config: ExperimentConfig,
    ) -> SimoptResult<Self> {
        if solvers.is_empty() || problems.is_empty() {
            return Err(ValidationError::invalid(
                "meta_experiment",
                "needs at least one solver and one problem",
            )
            .into());
        }
        check_unique("solvers", solvers.iter().map(|(name, _)| name))?;
        check_unique("problems", problems.iter().map(|(name, _)| name))?;
        let config = config.validate()?;

        let mut experiments = Vec::with_capacity(solvers.len());
        for (solver_name, solver) in &solvers {
            let mut row = Vec::with_capacity(problems.len());
            for (problem_name, problem) in &problems {
                row.push(
                    Experiment::new(Arc::clone(solver), Arc::clone(problem), config.clone())?
                        .with_labels(solver_name.clone(), problem_name.clone()),
                );
            }
            experiments.push(row);
        }

        Ok(Self {
            solver_names: solvers.into_iter().map(|(name, _)| name).collect(),
            problem_names: problems.into_iter().map(|(name, _)| name).collect(),
            experiments,
            failures: Vec::new(),
            allocator: StreamAllocator::with_family(config.stream_family),
        })
    }

    /// Builds every pair from registry names. Factors are looked up by name;
    /// names without an entry use defaults.
    pub fn from_names(
        solver_names: &[&str],
        problem_names: &[&str],
        solver_factors: &BTreeMap<String, Factors>,
        problem_factors: &BTreeMap<String, Factors>,
        config: ExperimentConfig,
    ) -> SimoptResult<Self> {
        let empty = Factors::new();
        let solvers = solver_names
            .iter()
            .map(|name| {
                let factors = solver_factors.get(*name).unwrap_or(&empty);
                Ok(((*name).to_string(), build_solver(name, factors)?))
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;
        let problems = problem_names
            .iter()
            .map(|name| {
                let factors = problem_factors.get(*name).unwrap_or(&empty);
                Ok(((*name).to_string(), build_problem(name, factors)?))
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;
        Self::new(solvers, problems, config)
    }

    /// Solver labels, in construction order.
    #[must_use]
    pub fn solver_names(&self) -> &[String] {
        &self.solver_names
    }

    /// Problem labels, in construction order.
    #[must_use]
    pub fn problem_names(&self) -> &[String] {
        &self.problem_names
    }

    /// Failures recorded by the latest `run` and `post_replicate`.
    #[must_use]
    pub fn failures(&self) -> &[PairFailure] {
        &self.failures
    }

    /// Experiment of one pair.
    #[must_use]
    pub fn experiment(&self, solver: &str, problem: &str) -> Option<&Experiment> {
        let (s, p) = self.position(solver, problem)?;
        Some(&self.experiments[s][p])
    }

    /// Mutable experiment of one pair.
    #[must_use]
    pub fn experiment_mut(&mut self, solver: &str, problem: &str) -> Option<&mut Experiment> {
        let (s, p) = self.position(solver, problem)?;
        Some(&mut self.experiments[s][p])
    }

    fn position(&self, solver: &str, problem: &str) -> Option<(usize, usize)> {
        let s = self.solver_names.iter().position(|n| n == solver)?;
        let p = self.problem_names.iter().position(|n| n == problem)?;
        Some((s, p))
    }

    /// Experiments in `(solver, problem)` order.
    pub fn experiments(&self) -> impl Iterator<Item = &Experiment> {
        self.experiments.iter().flatten()
    }

    /// Runs every pair. A pair that fails is recorded and skipped.
    pub fn run(&mut self, n_macroreps: usize) -> SimoptResult<()> {
        if n_macroreps == 0 || n_macroreps > MAX_MACROREPS {
            return Err(ValidationError::invalid(
                "n_macroreps",
                format!("must be in 1..={MAX_MACROREPS} (got {n_macroreps})"),
            )
            .into());
        }
        info!(
            solvers = self.solver_names.len(),
            problems = self.problem_names.len(),
            n_macroreps,
            "running meta-experiment"
        );
        self.failures.clear();
        self.for_each_pair(PairStage::Run, |exp| exp.run(n_macroreps));
        Ok(())
    }

    /// Post-replicates every pair that completed its run.
    pub fn post_replicate(&mut self, settings: PostRepSettings) -> SimoptResult<()> {
        let settings = settings.validate()?;
        self.failures.retain(|f| f.stage != PairStage::PostReplicate);
        self.for_each_pair(PairStage::PostReplicate, |exp| exp.post_replicate(settings));
        Ok(())
    }

    fn for_each_pair(&mut self, stage: PairStage, mut op: impl FnMut(&mut Experiment) -> SimoptResult<()>) {
        let mut failures = Vec::new();
        for exp in self.experiments.iter_mut().flatten() {
            if stage == PairStage::PostReplicate && exp.state() == ExperimentState::Created {
                continue;
            }
            if let Err(err) = op(&mut *exp) {
                warn!(
                    solver = exp.solver_name(),
                    problem = exp.problem_name(),
                    error = %err,
                    "pair failed"
                );
                failures.push(PairFailure {
                    solver: exp.solver_name().to_string(),
                    problem: exp.problem_name().to_string(),
                    stage,
                    error: err.to_string(),
                });
            }
        }
        self.failures.extend(failures);
    }

    /// Reference values shared by every solver on `problem`.
    ///
    /// The optimum is the post-replicated estimate at the known optimal
    /// solution, else the known optimal value, else the best post-replicated
    /// recommendation of any solver.
    pub fn reference_values(&self, problem: &str) -> SimoptResult<ReferenceValues> {
        let p = self
            .problem_names
            .iter()
            .position(|n| n == problem)
            .ok_or_else(|| ValidationError::UnknownProblem {
                name: problem.to_string(),
            })?;
        self.reference_for(p)
    }

    fn reference_for(&self, p: usize) -> SimoptResult<ReferenceValues> {
        let completed: Vec<&Experiment> = self
            .experiments
            .iter()
            .map(|row| &row[p])
            .filter(|exp| exp.state() == ExperimentState::PostComplete)
            .collect();
        let insufficient = || ExecutionError::InsufficientData {
            reason: format!("no post-replicated experiment on '{}'", self.problem_names[p]),
        };
        let first = completed.first().ok_or_else(insufficient)?;
        let reference = &first
            .result()
            .post_replication
            .as_ref()
            .ok_or_else(insufficient)?
            .reference;
        let problem = first.problem();

        let optimal = if let Some(estimate) = &reference.optimal {
            estimate.mean()
        } else if let Some(value) = problem.optimal_value() {
            value
        } else {
            let sense = problem.sense();
            completed
                .iter()
                .filter_map(|exp| exp.best_estimate())
                .reduce(|best, m| if sense.better(m, best) { m } else { best })
                .ok_or_else(insufficient)?
        };
        Ok(ReferenceValues {
            initial: reference.initial.mean(),
            optimal,
        })
    }

    /// Progress curves of one pair against the problem's shared reference.
    pub fn progress_curves(&self, solver: &str, problem: &str, normalize: bool) -> SimoptResult<Vec<(usize, Curve)>> {
        let (s, p) = self.position(solver, problem).ok_or_else(|| ValidationError::invalid(
            "pair",
            format!("no experiment for solver '{solver}' on problem '{problem}'"),
        ))?;
        self.experiments[s][p].progress_curves_with(self.reference_for(p)?, normalize)
    }

    /// Normalized curves of every post-replicated pair. Pairs that never
    /// completed post-replication are left out.
    fn pair_curves(&self) -> SimoptResult<Vec<PairCurves>> {
        let mut out = Vec::new();
        for p in 0..self.problem_names.len() {
            let has_completed = self
                .experiments
                .iter()
                .any(|row| row[p].state() == ExperimentState::PostComplete);
            if !has_completed {
                warn!(problem = %self.problem_names[p], "no post-replicated pairs; problem skipped");
                continue;
            }
            let reference = self.reference_for(p)?;
            for (s, row) in self.experiments.iter().enumerate() {
                let exp = &row[p];
                if exp.state() != ExperimentState::PostComplete {
                    continue;
                }
                out.push(PairCurves {
                    solver: s,
                    problem: p,
                    curves: exp.progress_curves_with(reference, true)?,
                });
            }
        }
        Ok(out)
    }

    /// Per pair and macroreplication, whether it was solved to `solve_tol`.
    pub fn solvability_indicators(
        &self,
        solve_tol: f64,
    ) -> SimoptResult<BTreeMap<(String, String), Vec<(usize, bool)>>> {
        Ok(self
            .pair_curves()?
            .into_iter()
            .map(|pair| {
                let indicators = pair
                    .curves
                    .iter()
                    .map(|(r, curve)| (*r, curve.solve_time(solve_tol).is_some()))
                    .collect();
                (
                    (self.solver_names[pair.solver].clone(), self.problem_names[pair.problem].clone()),
                    indicators,
                )
            })
            .collect())
    }

    /// Solvability profile of every solver, over budget fractions `[0, 1]`.
    pub fn solvability_profiles(&self, request: SolvabilityRequest) -> SimoptResult<SolvabilityReport> {
        let request = request.validate()?;
        let reference = match &request.ref_solver {
            Some(name) => Some(
                self.solver_names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| ValidationError::UnknownSolver { name: name.clone() })?,
            ),
            None => None,
        };

        // Solve times per solver, one vector per problem.
        let mut times: BTreeMap<usize, Vec<Vec<f64>>> = BTreeMap::new();
        for pair in self.pair_curves()? {
            if pair.curves.is_empty() {
                continue;
            }
            let pair_times = pair
                .curves
                .iter()
                .map(|(_, curve)| curve.solve_time(request.solve_tol).unwrap_or(f64::INFINITY))
                .collect();
            times.entry(pair.solver).or_default().push(pair_times);
        }

        let profiles = profiles_of(&times, &request);
        let differences = match reference {
            Some(r) if !profiles.contains_key(&r) => {
                return Err(ExecutionError::InsufficientData {
                    reason: format!("reference solver '{}' has no completed pairs", self.solver_names[r]),
                }
                .into());
            }
            Some(r) => differences_of(&profiles, r),
            None => BTreeMap::new(),
        };

        let mut intervals = BTreeMap::new();
        let mut difference_intervals = BTreeMap::new();
        if let Some(settings) = request.bootstrap {
            info!(n_bootstraps = settings.n_bootstraps, "bootstrapping solvability profiles");
            let mut profile_reps: BTreeMap<usize, Vec<Curve>> = BTreeMap::new();
            let mut difference_reps: BTreeMap<usize, Vec<Curve>> = BTreeMap::new();
            for b in 0..settings.n_bootstraps {
                let mut rng = replicate_rng(self.allocator, b);
                let mut resampled: BTreeMap<usize, Vec<Vec<f64>>> = BTreeMap::new();
                for (s, per_problem) in &times {
                    let mut drawn = Vec::with_capacity(per_problem.len());
                    for pair_times in per_problem {
                        drawn.push(resample(pair_times, &mut rng));
                    }
                    resampled.insert(*s, drawn);
                }
                let boot = profiles_of(&resampled, &request);
                if let Some(r) = reference {
                    for (s, diff) in differences_of(&boot, r) {
                        difference_reps.entry(s).or_default().push(diff);
                    }
                }
                for (s, profile) in boot {
                    profile_reps.entry(s).or_default().push(profile);
                }
            }
            intervals = self.bands(&profile_reps, &settings);
            difference_intervals = self.bands(&difference_reps, &settings);
        }

        Ok(SolvabilityReport {
            profiles: self.by_name(profiles),
            differences: self.by_name(differences),
            intervals,
            difference_intervals,
        })
    }

    fn by_name<T>(&self, by_index: BTreeMap<usize, T>) -> BTreeMap<String, T> {
        by_index
            .into_iter()
            .map(|(s, value)| (self.solver_names[s].clone(), value))
            .collect()
    }

    fn bands(&self, replicates: &BTreeMap<usize, Vec<Curve>>, settings: &BootstrapSettings) -> BTreeMap<String, ConfidenceBand> {
        replicates
            .iter()
            .filter_map(|(s, reps)| {
                ConfidenceBand::from_replicates(reps, settings).map(|band| (self.solver_names[*s].clone(), band))
            })
            .collect()
    }

    /// Areas under normalized progress curves, grouped by solver.
    pub fn area_statistics(&self) -> SimoptResult<BTreeMap<String, Vec<AreaStatistic>>> {
        self.collect_area_statistics(None)
    }

    /// Area statistics with bootstrap intervals on each mean and standard deviation.
    pub fn area_statistics_with_intervals(
        &self,
        settings: BootstrapSettings,
    ) -> SimoptResult<BTreeMap<String, Vec<AreaStatistic>>> {
        let settings = settings.validate()?;
        self.collect_area_statistics(Some(settings))
    }

    fn collect_area_statistics(
        &self,
        bootstrap: Option<BootstrapSettings>,
    ) -> SimoptResult<BTreeMap<String, Vec<AreaStatistic>>> {
        let pairs: Vec<(PairCurves, Vec<f64>)> = self
            .pair_curves()?
            .into_iter()
            .map(|pair| {
                let areas: Vec<f64> = pair.curves.iter().map(|(_, c)| c.area()).collect();
                (pair, areas)
            })
            .filter(|(_, areas)| !areas.is_empty())
            .collect();

        // Replicated (mean, std_dev) per pair, in pair order.
        let mut replicates: Vec<(Vec<f64>, Vec<f64>)> = vec![(Vec::new(), Vec::new()); pairs.len()];
        if let Some(settings) = bootstrap {
            info!(n_bootstraps = settings.n_bootstraps, "bootstrapping area statistics");
            for b in 0..settings.n_bootstraps {
                let mut rng = replicate_rng(self.allocator, b);
                for ((_, areas), (means, std_devs)) in pairs.iter().zip(&mut replicates) {
                    let drawn = resample(areas, &mut rng);
                    if let Some((m, sd)) = mean_and_std(&drawn) {
                        means.push(m);
                        std_devs.push(sd);
                    }
                }
            }
        }

        let mut out: BTreeMap<String, Vec<AreaStatistic>> = BTreeMap::new();
        for ((pair, areas), (means, std_devs)) in pairs.into_iter().zip(replicates) {
            let Some((mean_area, std_dev)) = mean_and_std(&areas) else {
                continue;
            };
            let (mean_interval, std_dev_interval) = match &bootstrap {
                Some(settings) => (
                    Interval::from_replicates(&means, settings),
                    Interval::from_replicates(&std_devs, settings),
                ),
                None => (None, None),
            };
            let solver = self.solver_names[pair.solver].clone();
            out.entry(solver.clone()).or_default().push(AreaStatistic {
                solver,
                problem: self.problem_names[pair.problem].clone(),
                mean: mean_area,
                std_dev,
                areas,
                mean_interval,
                std_dev_interval,
            });
        }
        Ok(out)
    }
}

fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    let m = mean(values)?;
    Some((m, sample_variance(values).unwrap_or(0.0).sqrt()))
}

/// Profile of each solver from its per-problem solve times.
fn profiles_of(times: &BTreeMap<usize, Vec<Vec<f64>>>, request: &SolvabilityRequest) -> BTreeMap<usize, Curve> {
    let mut profiles = BTreeMap::new();
    for (s, per_problem) in times {
        let profile = match request.kind {
            ProfileKind::Mean => {
                let cdfs: Vec<Curve> = per_problem.iter().map(|t| Curve::cdf(t, 1.0)).collect();
                Curve::mean_of(&cdfs)
            }
            ProfileKind::Quantile => {
                let quantiles: Vec<f64> = per_problem
                    .iter()
                    .filter_map(|t| quantile(t, request.beta))
                    .collect();
                Some(Curve::cdf(&quantiles, 1.0))
            }
        };
        if let Some(profile) = profile {
            profiles.insert(*s, profile);
        }
    }
    profiles
}

/// `profile - profile[reference]` for every solver but the reference.
fn differences_of(profiles: &BTreeMap<usize, Curve>, reference: usize) -> BTreeMap<usize, Curve> {
    let Some(base) = profiles.get(&reference) else {
        return BTreeMap::new();
    };
    profiles
        .iter()
        .filter(|(s, _)| **s != reference)
        .map(|(s, profile)| (*s, profile.difference(base)))
        .collect()
}

fn check_unique<'a>(field: &str, names: impl Iterator<Item = &'a String>) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ValidationError::invalid(field, format!("duplicate name '{name}'")));
        }
    }
    Ok(())
}
