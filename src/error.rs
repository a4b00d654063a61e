//! Error types for simopt.
//!
//! All errors in simopt are strongly typed using thiserror.
//! Configuration problems surface as `ValidationError` at construction time,
//! orchestration problems as `ExecutionError`, and store problems as
//! `StorageError`.

use std::path::PathBuf;

use thiserror::Error;

use crate::rng::StreamIndex;

/// Validation errors raised while constructing experiments and adapters.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ValidationError {
    #[error("Unknown solver: '{name}'")]
    UnknownSolver {
        name: String,
    },

    #[error("Unknown problem: '{name}'")]
    UnknownProblem {
        name: String,
    },

    #[error("Unknown factor '{factor}' for {owner}")]
    UnknownFactor {
        owner: String,
        factor: String,
    },

    #[error("Factor '{factor}' for {owner} expects {expected}, got {actual}")]
    FactorTypeMismatch {
        owner: String,
        factor: String,
        expected: String,
        actual: String,
    },

    #[error("Factor '{factor}' for {owner} is out of domain: {reason}")]
    FactorOutOfDomain {
        owner: String,
        factor: String,
        reason: String,
    },

    #[error("Malformed design point {index}: {reason}")]
    MalformedDesignPoint {
        index: usize,
        reason: String,
    },

    #[error("Invalid argument '{field}': {reason}")]
    InvalidArgument {
        field: String,
        reason: String,
    },

    #[error("Decision vector has {actual} components, expected {expected}")]
    DimensionMismatch {
        expected: usize,
        actual: usize,
    },
}

impl ValidationError {
    /// Shorthand for an `InvalidArgument` error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Execution errors raised while running or analyzing experiments.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ExecutionError {
    #[error("Cannot {operation} while experiment is {state}")]
    InvalidState {
        operation: String,
        state: String,
    },

    #[error("Stream {index} was already issued in independent mode")]
    StreamCollision {
        index: StreamIndex,
    },

    #[error("Budget exhausted: requested {requested} replications, {remaining} remaining")]
    BudgetExhausted {
        requested: u64,
        remaining: u64,
    },

    #[error("{adapter} failed: {message}")]
    AdapterFailed {
        adapter: String,
        message: String,
    },

    #[error("Problem '{problem}' has identical initial and optimal estimates; cannot normalize")]
    DegenerateNormalization {
        problem: String,
    },

    #[error("Insufficient data: {reason}")]
    InsufficientData {
        reason: String,
    },
}

/// Errors from the persistent experiment store.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum StorageError {
    #[error("No stored experiment at {path}")]
    RecordNotFound {
        path: PathBuf,
    },

    #[error("Stored experiment at {path} is corrupt: {reason}")]
    Corrupt {
        path: PathBuf,
        reason: String,
    },

    #[error("Unsupported record schema version {found} (expected {expected})")]
    UnsupportedSchema {
        found: u32,
        expected: u32,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type for simopt.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum SimoptError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SimoptError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an adapter failure.
    #[must_use]
    pub fn adapter(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::AdapterFailed {
            adapter: adapter.into(),
            message: message.into(),
        })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error signals a logic defect or state-machine
    /// misuse. Such errors abort the whole operation instead of being recorded
    /// against one macroreplication.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Internal { .. } => true,
            Self::Validation(_) => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::InvalidState { .. } | ExecutionError::StreamCollision { .. }
            ),
            Self::Storage(_) => false,
        }
    }
}

/// Result type alias for simopt operations.
pub type SimoptResult<T> = Result<T, SimoptError>;
