//! Hierarchical random-number streams.
//!
//! Every simulation call draws from a stream addressed by a
//! `(stream, substream, subsubstream)` triple. Addresses are computed by a pure
//! function of explicit inputs (family, macroreplication index, solution
//! ordinal, random-source ordinal), never from a global cursor, so results do
//! not depend on execution order or on how many workers run in parallel.
//!
//! # Stream layout (per family)
//!
//! ```text
//! stream 0          reference evaluations (initial + optimal solution, shared CRN)
//! stream 1          post-replication when CRN across macroreplications is on
//! stream 2 + 2r     macroreplication r, optimization run
//!                     substreams [0, 16)  solver-internal randomness
//!                     substreams [16, ..) solutions: ordinal * n_sources + source
//! stream 3 + 2r     macroreplication r, post-replication
//! stream 2^32 - 1   bootstrap resampling (substream b = bootstrap b)
//! ```
//!
//! The subsubstream level is advanced once per simulated replication.

pub mod generator;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, ValidationError};

/// Number of substreams reserved for solver-internal randomness in a run stream.
pub const SOLVER_SUBSTREAMS: u64 = 16;

const REFERENCE_STREAM: u64 = 0;
const SHARED_POSTREP_STREAM: u64 = 1;
const FIRST_MACROREP_STREAM: u64 = 2;
const BOOTSTRAP_STREAM: u64 = u32::MAX as u64;

/// Most macroreplications whose streams fit in one family below the bootstrap stream.
pub const MAX_MACROREPS: usize = (BOOTSTRAP_STREAM as usize - FIRST_MACROREP_STREAM as usize) / 2;

/// Address of one reproducible random sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamIndex {
    /// Top-level stream; the upper 32 bits are the family.
    pub stream: u64,
    /// Substream within the stream.
    pub substream: u64,
    /// Subsubstream; advanced once per replication.
    pub subsubstream: u64,
}

impl StreamIndex {
    /// Index from its three components.
    #[must_use]
    pub const fn new(stream: u64, substream: u64, subsubstream: u64) -> Self {
        Self {
            stream,
            substream,
            subsubstream,
        }
    }

    /// Same stream and substream, subsubstream reset to zero.
    #[must_use]
    pub const fn substream_start(self) -> Self {
        Self::new(self.stream, self.substream, 0)
    }
}

impl fmt::Display for StreamIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.stream, self.substream, self.subsubstream)
    }
}

/// Pure mapping from explicit `(base, offset)` pairs to stream indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAllocator {
    family: u32,
}

impl StreamAllocator {
    /// Allocator for the default family (0).
    #[must_use]
    pub const fn new() -> Self {
        Self { family: 0 }
    }

    /// Allocator whose streams are disjoint from every other family.
    #[must_use]
    pub const fn with_family(family: u32) -> Self {
        Self { family }
    }

    /// Family this allocator's streams live in.
    #[must_use]
    pub const fn family(&self) -> u32 {
        self.family
    }

    const fn stream(&self, local: u64) -> u64 {
        ((self.family as u64) << 32) | local
    }

    /// Returns the stream `offset` substreams past `base`.
    #[must_use]
    pub const fn next_stream(base: StreamIndex, offset: u64) -> StreamIndex {
        StreamIndex::new(base.stream, base.substream + offset, base.subsubstream)
    }

    /// Base of the streams attached to the initial and optimal reference solutions.
    #[must_use]
    pub const fn reference_base(&self) -> StreamIndex {
        StreamIndex::new(self.stream(REFERENCE_STREAM), 0, 0)
    }

    /// Base of the optimization run of macroreplication `macrorep`.
    #[must_use]
    pub const fn run_base(&self, macrorep: usize) -> StreamIndex {
        StreamIndex::new(self.stream(FIRST_MACROREP_STREAM + 2 * macrorep as u64), 0, 0)
    }

    /// Base of the post-replication streams of macroreplication `macrorep`.
    ///
    /// With `crn_across_macroreps` every macroreplication shares one stream.
    #[must_use]
    pub const fn postrep_base(&self, macrorep: usize, crn_across_macroreps: bool) -> StreamIndex {
        if crn_across_macroreps {
            StreamIndex::new(self.stream(SHARED_POSTREP_STREAM), 0, 0)
        } else {
            StreamIndex::new(self.stream(FIRST_MACROREP_STREAM + 2 * macrorep as u64 + 1), 0, 0)
        }
    }

    /// Streams for the `ordinal`-th solution built on `base`, one per random source.
    #[must_use]
    pub fn solution_streams(base: StreamIndex, ordinal: u64, n_sources: usize) -> Vec<StreamIndex> {
        let n = n_sources as u64;
        (0..n)
            .map(|source| Self::next_stream(base, ordinal * n + source))
            .collect()
    }

    /// Base of the streams used to resample results; bootstrap `b` draws from
    /// substream `b`.
    #[must_use]
    pub const fn bootstrap_base(&self) -> StreamIndex {
        StreamIndex::new(self.stream(BOOTSTRAP_STREAM), 0, 0)
    }

    /// Stream view of one macroreplication's optimization run.
    #[must_use]
    pub const fn macrorep(&self, macrorep: usize) -> MacrorepStreams {
        MacrorepStreams::new(self.run_base(macrorep))
    }
}

/// The streams available to one macroreplication's optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacrorepStreams {
    base: StreamIndex,
}

impl MacrorepStreams {
    const fn new(base: StreamIndex) -> Self {
        Self { base }
    }

    /// First stream of the macroreplication.
    #[must_use]
    pub const fn base(&self) -> StreamIndex {
        self.base
    }

    /// Stream for the solver's `k`-th internal random source.
    pub fn solver_stream(&self, k: u64) -> Result<StreamIndex, ValidationError> {
        if k >= SOLVER_SUBSTREAMS {
            return Err(ValidationError::invalid(
                "solver_stream",
                format!("solvers may use at most {SOLVER_SUBSTREAMS} internal streams (requested #{k})"),
            ));
        }
        Ok(StreamAllocator::next_stream(self.base, k))
    }

    /// Streams for the `ordinal`-th solution created during the run.
    #[must_use]
    pub fn solution_streams(&self, ordinal: u64, n_sources: usize) -> Vec<StreamIndex> {
        let base = StreamAllocator::next_stream(self.base, SOLVER_SUBSTREAMS);
        StreamAllocator::solution_streams(base, ordinal, n_sources)
    }
}

/// Record of the streams issued within one scope (a macroreplication run or
/// post-replication).
///
/// Re-issuing an index is only legal when the caller explicitly asks for
/// common random numbers; otherwise it is a `StreamCollision`.
#[derive(Debug, Clone, Default)]
pub struct StreamLedger {
    issued: Vec<StreamIndex>,
    seen: HashSet<StreamIndex>,
}

impl StreamLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `index` as issued.
    pub fn issue(&mut self, index: StreamIndex, allow_reuse: bool) -> Result<StreamIndex, ExecutionError> {
        if self.seen.insert(index) {
            self.issued.push(index);
        } else if !allow_reuse {
            return Err(ExecutionError::StreamCollision { index });
        }
        Ok(index)
    }

    /// Records every index in `indices`.
    pub fn issue_all(
        &mut self,
        indices: &[StreamIndex],
        allow_reuse: bool,
    ) -> Result<(), ExecutionError> {
        for index in indices {
            self.issue(*index, allow_reuse)?;
        }
        Ok(())
    }

    /// Distinct indices in first-issue order.
    #[must_use]
    pub fn issued(&self) -> &[StreamIndex] {
        &self.issued
    }

    /// Consumes the ledger, returning [`issued`](Self::issued).
    #[must_use]
    pub fn into_issued(self) -> Vec<StreamIndex> {
        self.issued
    }
}
