//! Serializable sweep state.
//!
//! Everything the controller needs to continue after suspension lives here;
//! the host persists it verbatim between transitions.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::contract::{Axis, CombinationMode, SweepConfig, SWEEP_STATE_SCHEMA_VERSION};
use crate::enumerator::Combination;

/// Opaque reference to one dispatched job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalStatus {
    Success,
    Failure { reason: String },
    Cancelled { reason: String },
}

impl TerminalStatus {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure { .. } => "failure",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::Failure { reason } | Self::Cancelled { reason } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Dispatching,
    /// Suspension point: the batch is in flight and the host may stop here.
    AwaitingBatch,
    Analyzing,
    Done,
    Cancelled,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }
}

/// A combination whose inputs could not be built or were refused at launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRejection {
    pub combination: Combination,
    pub batch: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub handle: JobHandle,
    pub combination_index: usize,
    pub batch: usize,
    #[serde(flatten)]
    pub status: TerminalStatus,
    /// `false` when the job was abandoned or skipped after a fatal analysis.
    pub analyzed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepState {
    pub schema_version: String,
    pub run_id: String,
    /// Fingerprint of the configuration this state belongs to.
    pub fingerprint: String,
    pub axes: Vec<Axis>,
    pub mode: CombinationMode,
    pub batch_size: usize,
    pub phase: Phase,
    pub cursor: usize,
    /// Number of batches dispatched so far.
    pub batch: usize,
    pub realized_history: Vec<Combination>,
    pub in_flight: IndexMap<JobHandle, Combination>,
    #[serde(default)]
    pub batch_statuses: IndexMap<JobHandle, TerminalStatus>,
    #[serde(default)]
    pub outcomes: Vec<JobOutcome>,
    #[serde(default)]
    pub rejections: Vec<LaunchRejection>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl SweepState {
    pub fn new(config: &SweepConfig, fingerprint: impl Into<String>) -> Self {
        Self {
            schema_version: SWEEP_STATE_SCHEMA_VERSION.to_string(),
            run_id: config.run_id.clone(),
            fingerprint: fingerprint.into(),
            axes: config.axes.clone(),
            mode: config.mode,
            batch_size: config.batch_size,
            phase: Phase::Idle,
            cursor: 0,
            batch: 0,
            realized_history: Vec::new(),
            in_flight: IndexMap::new(),
            batch_statuses: IndexMap::new(),
            outcomes: Vec::new(),
            rejections: Vec::new(),
            cancel_requested: false,
            failure: None,
        }
    }

    pub fn summary(&self) -> SweepSummary {
        let succeeded = self
            .outcomes
            .iter()
            .filter(|outcome| outcome.status.is_success())
            .count();
        let cancelled = self
            .outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, TerminalStatus::Cancelled { .. }))
            .count();
        SweepSummary {
            run_id: self.run_id.clone(),
            phase: self.phase,
            cursor: self.cursor,
            batches: self.batch,
            realized: self.realized_history.len(),
            in_flight: self.in_flight.len(),
            succeeded,
            failed: self.outcomes.len() - succeeded - cancelled,
            cancelled,
            rejected: self.rejections.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub run_id: String,
    pub phase: Phase,
    pub cursor: usize,
    pub batches: usize,
    pub realized: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub rejected: usize,
}
