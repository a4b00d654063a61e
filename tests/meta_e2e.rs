//! End-to-end tests of cross-experiment statistics.

use std::collections::BTreeMap;
use std::sync::Arc;

use simopt::problem::build_problem;
use simopt::solver::build_solver;
use simopt::{
    BootstrapSettings, Experiment, ExperimentConfig, Factors, MetaExperiment, PairStage, PostRepSettings,
    Problem, ProfileKind, RecommendedSequence, Replication, Sense, SimRng, SimoptError, SimoptResult,
    SolvabilityRequest, Solver, SolverContext,
};

fn two_fixed_solvers() -> MetaExperiment {
    let solvers: Vec<(String, Arc<dyn Solver>)> = vec![
        (
            "EXACT".to_string(),
            build_solver("FIXED", &Factors::new().with("solution", 0.0)).unwrap(),
        ),
        (
            "NEVER".to_string(),
            build_solver("FIXED", &Factors::new().with("solution", 5.0)).unwrap(),
        ),
    ];
    let problems: Vec<(String, Arc<dyn Problem>)> = vec![(
        "IDENTITY-1".to_string(),
        build_problem("IDENTITY-1", &Factors::new()).unwrap(),
    )];
    MetaExperiment::new(solvers, problems, ExperimentConfig::default().with_workers(2)).unwrap()
}

#[test]
fn exact_solver_is_solved_and_other_is_not() {
    let mut meta = two_fixed_solvers();
    meta.run(4).unwrap();
    meta.post_replicate(PostRepSettings::new(5, 5)).unwrap();
    assert!(meta.failures().is_empty());

    for kind in [ProfileKind::Mean, ProfileKind::Quantile] {
        let report = meta
            .solvability_profiles(SolvabilityRequest::new(0.0, kind).with_beta(0.5))
            .unwrap();
        assert_eq!(report.profiles["EXACT"].value_at(1.0), 1.0);
        assert_eq!(report.profiles["NEVER"].value_at(1.0), 0.0);
        assert_eq!(report.profiles["EXACT"].value_at(0.5), 0.0);
        assert!(report.differences.is_empty());
    }

    let indicators = meta.solvability_indicators(0.0).unwrap();
    let exact = &indicators[&("EXACT".to_string(), "IDENTITY-1".to_string())];
    assert_eq!(exact.len(), 4);
    assert!(exact.iter().all(|(_, solved)| *solved));
    let never = &indicators[&("NEVER".to_string(), "IDENTITY-1".to_string())];
    assert!(never.iter().all(|(_, solved)| !*solved));
}

#[test]
fn looser_tolerance_solves_more() {
    let mut meta = two_fixed_solvers();
    meta.run(2).unwrap();
    meta.post_replicate(PostRepSettings::new(3, 3)).unwrap();

    // NEVER ends at a normalized gap of 0.5.
    let strict = meta.solvability_indicators(0.4).unwrap();
    let loose = meta.solvability_indicators(0.5).unwrap();
    let key = ("NEVER".to_string(), "IDENTITY-1".to_string());
    assert!(strict[&key].iter().all(|(_, s)| !*s));
    assert!(loose[&key].iter().all(|(_, s)| *s));
}

#[test]
fn shared_reference_uses_known_optimum() {
    let mut meta = two_fixed_solvers();
    meta.run(2).unwrap();
    meta.post_replicate(PostRepSettings::new(3, 3)).unwrap();
    let reference = meta.reference_values("IDENTITY-1").unwrap();
    assert_eq!(reference.initial, 10.0);
    assert_eq!(reference.optimal, 0.0);

    let raw = meta.progress_curves("NEVER", "IDENTITY-1", false).unwrap();
    assert_eq!(raw[0].1.y(), &[10.0, 5.0]);
    let normalized = meta.progress_curves("NEVER", "IDENTITY-1", true).unwrap();
    assert_eq!(normalized[0].1.y(), &[1.0, 0.5]);
}

#[test]
fn from_names_builds_full_cross_product() {
    let mut solver_factors = BTreeMap::new();
    solver_factors.insert("RNDSRCH".to_string(), Factors::new().with("sample_size", 5_i64));
    let mut problem_factors = BTreeMap::new();
    problem_factors.insert("QUADRATIC-1".to_string(), Factors::new().with("budget", 60_i64));
    problem_factors.insert("IDENTITY-1".to_string(), Factors::new().with("budget", 60_i64));

    let mut meta = MetaExperiment::from_names(
        &["RNDSRCH", "FIXED"],
        &["QUADRATIC-1", "IDENTITY-1"],
        &solver_factors,
        &problem_factors,
        ExperimentConfig::default().with_workers(2),
    )
    .unwrap();
    assert_eq!(meta.experiments().count(), 4);
    meta.run(3).unwrap();
    meta.post_replicate(PostRepSettings::new(4, 4)).unwrap();

    let stats = meta.area_statistics().unwrap();
    assert_eq!(stats["RNDSRCH"].len(), 2);
    assert_eq!(stats["FIXED"].len(), 2);
    for stat in stats.values().flatten() {
        assert_eq!(stat.areas.len(), 3);
        assert!(stat.std_dev >= 0.0);
    }
}

/// Fails on every macroreplication.
struct AlwaysFails;

impl Solver for AlwaysFails {
    fn key(&self) -> &str {
        "ALWAYS-FAILS"
    }

    fn factors(&self) -> Factors {
        Factors::new()
    }

    fn optimize(&self, _problem: &dyn Problem, _ctx: &mut SolverContext) -> SimoptResult<RecommendedSequence> {
        Err(SimoptError::adapter("solver ALWAYS-FAILS", "no progress"))
    }
}

/// Leaves its experiment stuck in `Created` by refusing the first call.
struct WrongDimension;

impl Solver for WrongDimension {
    fn key(&self) -> &str {
        "WRONG-DIM"
    }

    fn factors(&self) -> Factors {
        Factors::new()
    }

    fn optimize(&self, _problem: &dyn Problem, ctx: &mut SolverContext) -> SimoptResult<RecommendedSequence> {
        let mut seq = RecommendedSequence::new();
        seq.push(ctx.budget(), &[1.0, 2.0, 3.0]);
        Ok(seq)
    }
}

#[test]
fn failing_pairs_do_not_disturb_others() {
    let problem = build_problem("IDENTITY-1", &Factors::new()).unwrap();
    let solvers: Vec<(String, Arc<dyn Solver>)> = vec![
        ("FAILS".to_string(), Arc::new(AlwaysFails)),
        ("WRONG".to_string(), Arc::new(WrongDimension)),
        (
            "EXACT".to_string(),
            build_solver("FIXED", &Factors::new().with("solution", 0.0)).unwrap(),
        ),
    ];
    let mut meta = MetaExperiment::new(
        solvers,
        vec![("IDENTITY-1".to_string(), problem)],
        ExperimentConfig::default(),
    )
    .unwrap();
    meta.run(2).unwrap();
    meta.post_replicate(PostRepSettings::new(3, 3)).unwrap();

    // Adapter errors are recorded per macroreplication, not per pair.
    let fails = meta.experiment("FAILS", "IDENTITY-1").unwrap();
    assert_eq!(fails.result().failures().len(), 2);
    let wrong = meta.experiment("WRONG", "IDENTITY-1").unwrap();
    assert!(wrong.result().failures()[0].1.contains("dimensional"));

    let report = meta
        .solvability_profiles(SolvabilityRequest::new(0.0, ProfileKind::Mean).with_ref_solver("EXACT"))
        .unwrap();
    assert_eq!(report.profiles["EXACT"].value_at(1.0), 1.0);
    assert!(!report.profiles.contains_key("FAILS"));
    assert!(report.differences.is_empty());

    // A second run of an already-run pair is a recorded pair failure.
    meta.run(2).unwrap();
    assert_eq!(meta.failures().len(), 3);
    assert!(meta.failures().iter().all(|f| f.stage == PairStage::Run));
}

/// Maximize `x` on `[0, 10]`. Neither the optimal solution nor its value is declared.
struct Peak;

impl Problem for Peak {
    fn key(&self) -> &str {
        "PEAK"
    }

    fn factors(&self) -> Factors {
        Factors::new()
    }

    fn dim(&self) -> usize {
        1
    }

    fn sense(&self) -> Sense {
        Sense::Maximize
    }

    fn n_rngs(&self) -> usize {
        1
    }

    fn budget(&self) -> u64 {
        100
    }

    fn initial_solution(&self) -> Vec<f64> {
        vec![2.0]
    }

    fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (vec![0.0], vec![10.0])
    }

    fn replicate(&self, x: &[f64], _rngs: &mut [SimRng]) -> SimoptResult<Replication> {
        Ok(Replication::objective_only(x[0]))
    }
}

fn fixed_at(x: f64) -> Arc<dyn Solver> {
    build_solver("FIXED", &Factors::new().with("solution", x)).unwrap()
}

#[test]
fn experiment_without_known_optimum_uses_its_best_recommendation() {
    let mut exp = Experiment::new(fixed_at(4.0), Arc::new(Peak), ExperimentConfig::default()).unwrap();
    exp.run(2).unwrap();
    exp.post_replicate(PostRepSettings::new(3, 3)).unwrap();
    assert!(exp.result().post_replication.as_ref().unwrap().reference.optimal.is_none());

    let reference = exp.reference_values().unwrap();
    assert_eq!(reference.initial, 2.0);
    assert_eq!(reference.optimal, 4.0);
    for (_, curve) in exp.progress_curves(true).unwrap() {
        assert_eq!(curve.y(), &[1.0, 0.0]);
    }
    assert!(exp.solvability_indicators(0.0).unwrap().iter().all(|(_, solved)| *solved));
}

#[test]
fn meta_without_known_optimum_shares_the_best_recommendation_of_any_solver() {
    let solvers: Vec<(String, Arc<dyn Solver>)> =
        vec![("LOW".to_string(), fixed_at(4.0)), ("HIGH".to_string(), fixed_at(8.0))];
    let problems: Vec<(String, Arc<dyn Problem>)> = vec![("PEAK".to_string(), Arc::new(Peak))];
    let mut meta = MetaExperiment::new(solvers, problems, ExperimentConfig::default()).unwrap();
    meta.run(2).unwrap();
    meta.post_replicate(PostRepSettings::new(3, 3)).unwrap();

    let reference = meta.reference_values("PEAK").unwrap();
    assert_eq!(reference.initial, 2.0);
    assert_eq!(reference.optimal, 8.0);

    // LOW alone would be its own optimum; against the shared one it is 4/6 short.
    let low = meta.progress_curves("LOW", "PEAK", true).unwrap();
    assert_eq!(low[0].1.y(), &[1.0, 4.0 / 6.0]);
    let high = meta.progress_curves("HIGH", "PEAK", true).unwrap();
    assert_eq!(high[0].1.y(), &[1.0, 0.0]);

    let report = meta
        .solvability_profiles(SolvabilityRequest::new(0.0, ProfileKind::Mean))
        .unwrap();
    assert_eq!(report.profiles["LOW"].value_at(1.0), 0.0);
    assert_eq!(report.profiles["HIGH"].value_at(1.0), 1.0);
}

#[test]
fn bootstrap_intervals_are_reproducible_and_ordered() {
    let mut solver_factors = BTreeMap::new();
    solver_factors.insert("RNDSRCH".to_string(), Factors::new().with("sample_size", 4_i64));
    let mut problem_factors = BTreeMap::new();
    problem_factors.insert("QUADRATIC-1".to_string(), Factors::new().with("budget", 80_i64));
    let mut meta = MetaExperiment::from_names(
        &["RNDSRCH", "FIXED"],
        &["QUADRATIC-1"],
        &solver_factors,
        &problem_factors,
        ExperimentConfig::default().with_workers(2),
    )
    .unwrap();
    meta.run(6).unwrap();
    meta.post_replicate(PostRepSettings::new(4, 4)).unwrap();

    let settings = BootstrapSettings::new(40, 0.9);
    let request = SolvabilityRequest::new(0.2, ProfileKind::Mean)
        .with_ref_solver("FIXED")
        .with_bootstrap(settings);
    let first = meta.solvability_profiles(request.clone()).unwrap();
    let second = meta.solvability_profiles(request).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.intervals.len(), first.profiles.len());
    assert_eq!(first.difference_intervals.len(), first.differences.len());
    for band in first.intervals.values().chain(first.difference_intervals.values()) {
        for i in 0..=20 {
            let t = f64::from(i) / 20.0;
            assert!(band.lower.value_at(t) <= band.upper.value_at(t));
        }
    }

    let stats = meta.area_statistics_with_intervals(settings).unwrap();
    assert_eq!(stats, meta.area_statistics_with_intervals(settings).unwrap());
    for stat in stats.values().flatten() {
        let min = stat.areas.iter().copied().fold(f64::INFINITY, f64::min);
        let max = stat.areas.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = stat.mean_interval.unwrap();
        assert!(mean.lower <= mean.upper);
        assert!(mean.lower >= min - 1e-12 && mean.upper <= max + 1e-12);
        let std_dev = stat.std_dev_interval.unwrap();
        assert!(std_dev.lower >= 0.0 && std_dev.lower <= std_dev.upper);
    }
}
