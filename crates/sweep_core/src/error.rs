use thiserror::Error;

use crate::state::{JobHandle, Phase};

/// Problems detected while validating a sweep before anything is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("run_id cannot be empty")]
    EmptyRunId,

    #[error("iterate_over cannot be empty")]
    NoAxes,

    #[error("axis names must be non-empty strings")]
    BlankAxisName,

    #[error("axis '{name}' must be a non-empty list")]
    EmptyAxis { name: String },

    #[error("axis '{name}' exceeds MAX_AXIS_VALUES={limit}")]
    TooManyValues { name: String, limit: usize },

    #[error("parameter space is too large for one sweep (>{limit} combinations)")]
    SpaceTooLarge { limit: usize },

    #[error("zip mode needs equal axis lengths: '{axis}' has {found} values, expected {expected}")]
    MismatchedAxisLength {
        axis: String,
        expected: usize,
        found: usize,
    },

    #[error("batch_size must be a positive integer")]
    InvalidBatchSize,

    #[error("axes '{first}' and '{second}' both normalize to '{canonical}'")]
    DuplicateAxis {
        first: String,
        second: String,
        canonical: String,
    },

    #[error("no router rule accepts axis '{key}'")]
    UnroutableKey { key: String },

    #[error("rule group '{group}' can never match after catch-all group '{catch_all}'")]
    UnreachableRule { group: String, catch_all: String },

    #[error("invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },
}

/// A transform could not turn a raw axis value into job inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("axis '{axis}' has no resolved route")]
    Unrouted { axis: String },

    #[error("value for '{key}' must be {expected}")]
    InvalidValue { key: String, expected: &'static str },

    #[error("namespace '{namespace}' must hold an object to receive '{key}'")]
    NotAnObject { namespace: String, key: String },

    #[error("transform for '{key}' failed: {reason}")]
    Custom { key: String, reason: String },
}

/// Stage inputs of a two-stage job could not be prepared.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("job inputs have no '{namespace}' stage group")]
    MissingStage { namespace: String },

    #[error("stage '{namespace}' requires the '{port}' input")]
    MissingPort { namespace: String, port: String },

    #[error("'{namespace}.{port}' must be an object")]
    NotAnObject { namespace: String, port: String },

    #[error("'{key}' cannot be set in '{namespace}': {reason}")]
    ForbiddenParameter {
        namespace: String,
        key: String,
        reason: String,
    },

    #[error("Fermi energy unavailable: {0}")]
    FermiEnergy(String),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// The launch collaborator refused a combination's job inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("launch rejected: {reason}")]
pub struct LaunchRejected {
    pub reason: String,
}

impl LaunchRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("poller returned no terminal status for {} job(s)", missing.len())]
    Incomplete { missing: Vec<JobHandle> },

    #[error("poller failed: {0}")]
    Backend(String),
}

/// Raised by an analyze collaborator; always fatal for the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AnalyzeError {
    pub message: String,
}

impl AnalyzeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SweepError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("cannot {operation} while the sweep is {phase:?}")]
    InvalidTransition {
        phase: Phase,
        operation: &'static str,
    },

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error("analysis of job {handle} failed: {source}")]
    Analyze {
        handle: JobHandle,
        #[source]
        source: AnalyzeError,
    },

    #[error("job {handle} failed and the sweep aborts on job failure: {reason}")]
    JobFailed { handle: JobHandle, reason: String },

    #[error("persisted state does not match this sweep: {reason}")]
    StateMismatch { reason: String },
}
