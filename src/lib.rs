//! # simopt - Simulation-Optimization Experiment Engine
//!
//! simopt runs optimization algorithms ("solvers") against stochastic
//! simulation models ("problems") over many independent macroreplications,
//! re-evaluates the recommended solutions with common random numbers, and
//! turns the results into comparable progress curves, solvability profiles,
//! and area statistics.
//!
//! ## Core Concepts
//!
//! - **StreamIndex**: a `(stream, substream, subsubstream)` address of one
//!   reproducible random sequence
//! - **Solution**: a decision vector with its attached streams and accumulated responses
//! - **Experiment**: one solver on one problem, run and post-replicated
//! - **MetaExperiment**: the cross product of several solvers and problems
//! - **DataFarmingExperiment**: experiments fanned out over a factor grid
//!
//! ## Usage
//!
//! ```rust,ignore
//! use simopt::{Experiment, ExperimentConfig, Factors, PostRepSettings};
//!
//! let mut experiment = Experiment::from_names(
//!     "RNDSRCH",
//!     "QUADRATIC-1",
//!     &Factors::new(),
//!     &Factors::new(),
//!     ExperimentConfig::default(),
//! )?;
//! experiment.run(10)?;
//! experiment.post_replicate(PostRepSettings::new(100, 100))?;
//! let curves = experiment.progress_curves(true)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

// Random streams and the objects they drive
pub mod error;
pub mod factors;
pub mod rng;
pub mod solution;

// Adapter boundaries
pub mod problem;
pub mod solver;

// Orchestration and statistics
pub mod bootstrap;
pub mod curve;
pub mod data_farming;
pub mod experiment;
pub mod meta;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use bootstrap::{BootstrapSettings, ConfidenceBand, Interval};
pub use curve::Curve;
pub use data_farming::{
    DataFarmingBase, DataFarmingExperiment, DataFarmingMetaExperiment, DesignPoint, DesignPointFailure,
    DesignPointSummary, FactorGrid, FactorTarget,
};
pub use error::{ExecutionError, SimoptError, SimoptResult, StorageError, ValidationError};
pub use experiment::result::{
    Estimate, ExperimentResult, MacrorepOutcome, MacrorepRecord, PostRepOutcome, PostReplication,
    Recommendation, ReferenceEstimates,
};
pub use experiment::{
    Experiment, ExperimentConfig, ExperimentState, PostRepSettings, ReferenceValues,
};
pub use factors::{FactorReader, FactorValue, Factors};
pub use meta::{
    AreaStatistic, MetaExperiment, PairFailure, PairStage, ProfileKind, SolvabilityReport,
    SolvabilityRequest,
};
pub use problem::{Problem, ProblemKind, Replication, Sense};
pub use rng::generator::SimRng;
pub use rng::{MacrorepStreams, StreamAllocator, StreamIndex, StreamLedger};
pub use solution::Solution;
pub use solver::{RecommendedSequence, Solver, SolverContext, SolverKind};
pub use storage::{ExperimentRecord, ExperimentStore, StoreKey};
