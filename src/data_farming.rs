//! Batch experiments over a grid of factor settings.
//!
//! Each design point overlays its factor values onto fixed base factors and
//! gets an experiment of its own. Unless CRN across design points is
//! requested, every design point draws from its own stream family, so no
//! stream or solution state is shared between points.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{SimoptResult, ValidationError};
use crate::experiment::{Experiment, ExperimentConfig, ExperimentState, PostRepSettings};
use crate::factors::{FactorValue, Factors};
use crate::meta::{MetaExperiment, PairStage};
use crate::problem::{build_problem, Problem};
use crate::rng::MAX_MACROREPS;
use crate::solver::{build_solver, Solver};

/// One cell of a factor grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignPoint {
    /// Position in the grid.
    pub index: usize,
    /// Factor overrides of this point.
    pub factors: Factors,
}

/// Ordered design points sharing one set of factor headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorGrid {
    headers: Vec<String>,
    points: Vec<DesignPoint>,
}

impl FactorGrid {
    /// Builds a grid from externally parsed rows. Every row must set exactly
    /// the factors named in `headers`.
    pub fn from_rows(headers: &[String], rows: Vec<Factors>) -> Result<Self, ValidationError> {
        let header_set = unique_headers(headers)?;
        let mut points = Vec::with_capacity(rows.len());
        for (index, factors) in rows.into_iter().enumerate() {
            if let Some(missing) = header_set.iter().find(|h| !factors.contains(h)) {
                return Err(ValidationError::MalformedDesignPoint {
                    index,
                    reason: format!("missing factor '{missing}'"),
                });
            }
            if let Some((extra, _)) = factors.iter().find(|(name, _)| !header_set.contains(name.as_str())) {
                return Err(ValidationError::MalformedDesignPoint {
                    index,
                    reason: format!("factor '{extra}' is not among the headers"),
                });
            }
            points.push(DesignPoint { index, factors });
        }
        Ok(Self {
            headers: headers.to_vec(),
            points,
        })
    }

    /// Every combination of the given factor levels. The first factor varies
    /// slowest.
    pub fn full_factorial(levels: &[(String, Vec<FactorValue>)]) -> Result<Self, ValidationError> {
        let headers: Vec<String> = levels.iter().map(|(name, _)| name.clone()).collect();
        unique_headers(&headers)?;
        if let Some((name, _)) = levels.iter().find(|(_, values)| values.is_empty()) {
            return Err(ValidationError::invalid(name.as_str(), "needs at least one level"));
        }

        let mut combos = vec![Factors::new()];
        for (name, values) in levels {
            combos = combos
                .into_iter()
                .flat_map(|base| {
                    values
                        .iter()
                        .map(move |value| base.clone().with(name.clone(), value.clone()))
                })
                .collect();
        }
        let points = combos
            .into_iter()
            .enumerate()
            .map(|(index, factors)| DesignPoint { index, factors })
            .collect();
        Ok(Self { headers, points })
    }

    /// Factor names, one per column.
    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Points in grid order.
    #[must_use]
    pub fn points(&self) -> &[DesignPoint] {
        &self.points
    }

    /// Number of design points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True for a grid with no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn unique_headers(headers: &[String]) -> Result<BTreeSet<&str>, ValidationError> {
    if headers.is_empty() {
        return Err(ValidationError::invalid("headers", "at least one factor header is required"));
    }
    let mut set = BTreeSet::new();
    for header in headers {
        if !set.insert(header.as_str()) {
            return Err(ValidationError::invalid("headers", format!("duplicate header '{header}'")));
        }
    }
    Ok(set)
}

/// Which adapter the design factors configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorTarget {
    /// Design factors override solver factors.
    Solver,
    /// Design factors override problem factors.
    Problem,
}

/// Base configuration the design points are overlaid on.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFarmingBase {
    /// Registry key of the solver.
    pub solver_name: String,
    /// Registry key of the problem.
    pub problem_name: String,
    /// Solver factors shared by every design point.
    pub solver_fixed_factors: Factors,
    /// Problem factors shared by every design point.
    pub problem_fixed_factors: Factors,
    /// Which adapter the design factors apply to.
    pub target: FactorTarget,
    /// Give every design point the same streams.
    pub crn_across_design_points: bool,
}

impl DataFarmingBase {
    /// Base with no fixed factors and independent streams per design point.
    #[must_use]
    pub fn new(solver_name: impl Into<String>, problem_name: impl Into<String>, target: FactorTarget) -> Self {
        Self {
            solver_name: solver_name.into(),
            problem_name: problem_name.into(),
            solver_fixed_factors: Factors::new(),
            problem_fixed_factors: Factors::new(),
            target,
            crn_across_design_points: false,
        }
    }

    /// Factors applied to the solver of every design point.
    #[must_use]
    pub fn with_solver_factors(mut self, factors: Factors) -> Self {
        self.solver_fixed_factors = factors;
        self
    }

    /// Factors applied to the problem of every design point.
    #[must_use]
    pub fn with_problem_factors(mut self, factors: Factors) -> Self {
        self.problem_fixed_factors = factors;
        self
    }

    /// Toggles common random numbers across design points.
    #[must_use]
    pub const fn crn_across_design_points(mut self, enabled: bool) -> Self {
        self.crn_across_design_points = enabled;
        self
    }
}

/// Outcome of one design point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignPointSummary {
    /// Position of the design point in its grid.
    pub index: usize,
    /// Factor overrides of the design point.
    pub factors: Factors,
    /// Lifecycle state the point reached.
    pub state: ExperimentState,
    /// `(macrorep, mean)` of the post-replicated estimate at the final recommendation.
    pub final_objectives: Vec<(usize, f64)>,
    /// `(macrorep, area)` under the normalized progress curve; empty when the
    /// curves cannot be normalized.
    pub areas: Vec<(usize, f64)>,
}

/// A design point whose experiment could not complete a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignPointFailure {
    /// Position of the design point in its grid.
    pub index: usize,
    /// Stage that failed.
    pub stage: PairStage,
    /// Error message.
    pub error: String,
}

/// One experiment per design point.
#[derive(Debug)]
pub struct DataFarmingExperiment {
    grid: FactorGrid,
    experiments: Vec<Experiment>,
    failures: Vec<DesignPointFailure>,
}

impl DataFarmingExperiment {
    /// Builds one experiment per design point.
    ///
    /// Each point draws from its own stream family unless the base asks for
    /// common random numbers across design points. An invalid point is a
    /// `MalformedDesignPoint` error naming its index.
    pub fn new(base: &DataFarmingBase, grid: FactorGrid, config: ExperimentConfig) -> SimoptResult<Self> {
        if grid.is_empty() {
            return Err(ValidationError::invalid("grid", "has no design points").into());
        }
        let config = config.validate()?;

        let mut experiments = Vec::with_capacity(grid.len());
        for point in grid.points() {
            let (solver_factors, problem_factors) = match base.target {
                FactorTarget::Solver => (base.solver_fixed_factors.overlay(&point.factors), base.problem_fixed_factors.clone()),
                FactorTarget::Problem => (base.solver_fixed_factors.clone(), base.problem_fixed_factors.overlay(&point.factors)),
            };
            let family = if base.crn_across_design_points {
                config.stream_family
            } else {
                u32::try_from(point.index)
                    .ok()
                    .and_then(|i| config.stream_family.checked_add(i))
                    .ok_or_else(|| ValidationError::invalid("grid", "too many design points for distinct stream families"))?
            };
            let experiment = Experiment::from_names(
                &base.solver_name,
                &base.problem_name,
                &solver_factors,
                &problem_factors,
                config.clone().with_stream_family(family),
            )
            .map_err(|err| match err {
                crate::SimoptError::Validation(e) => ValidationError::MalformedDesignPoint {
                    index: point.index,
                    reason: e.to_string(),
                }
                .into(),
                other => other,
            })?;
            experiments.push(experiment);
        }
        Ok(Self {
            grid,
            experiments,
            failures: Vec::new(),
        })
    }

    /// The design being farmed.
    #[must_use]
    pub fn grid(&self) -> &FactorGrid {
        &self.grid
    }

    /// Experiments in grid order.
    #[must_use]
    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    /// Failures recorded by the latest `run` and `post_replicate`.
    #[must_use]
    pub fn failures(&self) -> &[DesignPointFailure] {
        &self.failures
    }

    /// Runs every design point. A point that fails is recorded in
    /// [`failures`](Self::failures) and does not stop the others.
    pub fn run(&mut self, n_macroreps: usize) -> SimoptResult<()> {
        if n_macroreps == 0 || n_macroreps > MAX_MACROREPS {
            return Err(ValidationError::invalid(
                "n_macroreps",
                format!("must be in 1..={MAX_MACROREPS} (got {n_macroreps})"),
            )
            .into());
        }
        info!(design_points = self.grid.len(), n_macroreps, "data farming run");
        self.failures.clear();
        self.for_each_point(PairStage::Run, |exp| exp.run(n_macroreps));
        Ok(())
    }

    /// Post-replicates every point that has run. Points still in `Created`
    /// are skipped; run failures recorded earlier are kept.
    pub fn post_replicate(&mut self, settings: PostRepSettings) -> SimoptResult<()> {
        let settings = settings.validate()?;
        info!(design_points = self.grid.len(), n_postreps = settings.n_postreps, "data farming post-replication");
        self.failures.retain(|f| f.stage != PairStage::PostReplicate);
        self.for_each_point(PairStage::PostReplicate, |exp| {
            if exp.state() == ExperimentState::Created {
                Ok(())
            } else {
                exp.post_replicate(settings)
            }
        });
        Ok(())
    }

    fn for_each_point(&mut self, stage: PairStage, mut op: impl FnMut(&mut Experiment) -> SimoptResult<()>) {
        for (index, exp) in self.experiments.iter_mut().enumerate() {
            if let Err(err) = op(&mut *exp) {
                warn!(design_point = index, ?stage, error = %err, "design point failed");
                self.failures.push(DesignPointFailure {
                    index,
                    stage,
                    error: err.to_string(),
                });
            }
        }
    }

    /// Per design point, final objective estimates and areas.
    #[must_use]
    pub fn summaries(&self) -> Vec<DesignPointSummary> {
        self.grid
            .points()
            .iter()
            .zip(&self.experiments)
            .map(|(point, exp)| summarize(point, exp))
            .collect()
    }
}

fn summarize(point: &DesignPoint, exp: &Experiment) -> DesignPointSummary {
    let mut final_objectives = Vec::new();
    if let Some(post) = &exp.result().post_replication {
        for (macrorep, outcome) in post.macroreps.iter().enumerate() {
            if let Some(last) = outcome.estimates().and_then(<[_]>::last) {
                final_objectives.push((macrorep, last.mean()));
            }
        }
    }
    let areas = if exp.state() == ExperimentState::PostComplete {
        exp.areas().unwrap_or_else(|err| {
            warn!(design_point = point.index, error = %err, "areas unavailable");
            Vec::new()
        })
    } else {
        Vec::new()
    };
    DesignPointSummary {
        index: point.index,
        factors: point.factors.clone(),
        state: exp.state(),
        final_objectives,
        areas,
    }
}

/// Solver design points compared head to head on a set of problems.
///
/// Each design point becomes a solver labeled `{solver}_dp{index}`; all of
/// them run inside one [`MetaExperiment`].
#[derive(Debug)]
pub struct DataFarmingMetaExperiment {
    grid: FactorGrid,
    meta: MetaExperiment,
}

impl DataFarmingMetaExperiment {
    /// Builds one labeled solver per design point and crosses them with
    /// `problem_names`.
    pub fn new(
        solver_name: &str,
        solver_fixed_factors: &Factors,
        grid: FactorGrid,
        problem_names: &[&str],
        problem_fixed_factors: &BTreeMap<String, Factors>,
        config: ExperimentConfig,
    ) -> SimoptResult<Self> {
        if grid.is_empty() {
            return Err(ValidationError::invalid("grid", "has no design points").into());
        }
        let mut solvers: Vec<(String, Arc<dyn Solver>)> = Vec::with_capacity(grid.len());
        for point in grid.points() {
            let factors = solver_fixed_factors.overlay(&point.factors);
            let solver = build_solver(solver_name, &factors).map_err(|e| ValidationError::MalformedDesignPoint {
                index: point.index,
                reason: e.to_string(),
            })?;
            solvers.push((design_point_label(solver_name, point.index), solver));
        }

        let empty = Factors::new();
        let problems = problem_names
            .iter()
            .map(|name| {
                let factors = problem_fixed_factors.get(*name).unwrap_or(&empty);
                Ok(((*name).to_string(), build_problem(name, factors)?))
            })
            .collect::<Result<Vec<(String, Arc<dyn Problem>)>, ValidationError>>()?;

        Ok(Self {
            meta: MetaExperiment::new(solvers, problems, config)?,
            grid,
        })
    }

    /// The design being farmed.
    #[must_use]
    pub fn grid(&self) -> &FactorGrid {
        &self.grid
    }

    /// The underlying cross product.
    #[must_use]
    pub fn meta(&self) -> &MetaExperiment {
        &self.meta
    }

    /// Mutable access to the underlying cross product.
    pub fn meta_mut(&mut self) -> &mut MetaExperiment {
        &mut self.meta
    }

    /// Runs every pair; see [`MetaExperiment::run`].
    pub fn run(&mut self, n_macroreps: usize) -> SimoptResult<()> {
        self.meta.run(n_macroreps)
    }

    /// Post-replicates every pair; see [`MetaExperiment::post_replicate`].
    pub fn post_replicate(&mut self, settings: PostRepSettings) -> SimoptResult<()> {
        self.meta.post_replicate(settings)
    }
}

/// Solver label of design point `index`.
#[must_use]
pub fn design_point_label(solver_name: &str, index: usize) -> String {
    format!("{solver_name}_dp{index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn full_factorial_enumerates_combinations() {
        let grid = FactorGrid::full_factorial(&[
            ("a".to_string(), vec![1_i64.into(), 2_i64.into()]),
            ("b".to_string(), vec![true.into(), false.into(), true.into()]),
        ])
        .unwrap();
        assert_eq!(grid.len(), 6);
        assert_eq!(grid.points()[0].factors.get("a"), Some(&FactorValue::Int(1)));
        assert_eq!(grid.points()[3].factors.get("a"), Some(&FactorValue::Int(2)));
        assert_eq!(grid.points()[5].index, 5);

        assert!(FactorGrid::full_factorial(&[("a".to_string(), Vec::new())]).is_err());
    }

    #[test]
    fn from_rows_validates_headers() {
        let h = headers(&["sample_size"]);
        let ok = FactorGrid::from_rows(&h, vec![Factors::new().with("sample_size", 5_i64)]).unwrap();
        assert_eq!(ok.headers(), h.as_slice());

        let missing = FactorGrid::from_rows(&h, vec![Factors::new().with("sample_size", 5_i64), Factors::new()]);
        assert!(matches!(missing, Err(ValidationError::MalformedDesignPoint { index: 1, .. })));

        let extra = FactorGrid::from_rows(&h, vec![Factors::new().with("sample_size", 5_i64).with("x", 1.0)]);
        assert!(matches!(extra, Err(ValidationError::MalformedDesignPoint { index: 0, .. })));

        assert!(FactorGrid::from_rows(&headers(&["a", "a"]), Vec::new()).is_err());
    }

    #[test]
    fn design_points_get_distinct_families() {
        let grid = FactorGrid::from_rows(
            &headers(&["sample_size"]),
            vec![Factors::new().with("sample_size", 5_i64), Factors::new().with("sample_size", 10_i64)],
        )
        .unwrap();
        let base = DataFarmingBase::new("RNDSRCH", "IDENTITY-1", FactorTarget::Solver);
        let df = DataFarmingExperiment::new(&base, grid.clone(), ExperimentConfig::default()).unwrap();
        let families: Vec<u32> = df.experiments().iter().map(|e| e.allocator().family()).collect();
        assert_eq!(families, vec![0, 1]);

        let shared = DataFarmingExperiment::new(
            &base.clone().crn_across_design_points(true),
            grid,
            ExperimentConfig::default(),
        )
        .unwrap();
        assert!(shared.experiments().iter().all(|e| e.allocator().family() == 0));
    }

    #[test]
    fn bad_design_point_is_reported_with_index() {
        let grid = FactorGrid::from_rows(
            &headers(&["sample_size"]),
            vec![Factors::new().with("sample_size", 5_i64), Factors::new().with("sample_size", 0_i64)],
        )
        .unwrap();
        let base = DataFarmingBase::new("RNDSRCH", "IDENTITY-1", FactorTarget::Solver);
        let err = DataFarmingExperiment::new(&base, grid, ExperimentConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            crate::SimoptError::Validation(ValidationError::MalformedDesignPoint { index: 1, .. })
        ));
    }

    #[test]
    fn labels_follow_design_point_index() {
        assert_eq!(design_point_label("RNDSRCH", 3), "RNDSRCH_dp3");
    }
}
