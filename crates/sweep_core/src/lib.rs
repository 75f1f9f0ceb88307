//! Deterministic parameter-sweep scheduling.
//!
//! This crate owns enumeration of the sweep space, key routing into job
//! inputs and the batch controller state machine. Launching, polling and
//! persistence are collaborators supplied by the host; see
//! `crates/sweep_runtime` for a local implementation.

pub mod contract;
pub mod controller;
pub mod enumerator;
pub mod error;
pub mod flavors;
pub mod inputs;
pub mod keys;
pub mod router;
pub mod state;
pub mod storage_keys;

pub use contract::{Axis, CombinationMode, SweepConfig, SweepRequest};
pub use controller::{
    BatchPoller, FailurePolicy, JobAnalyzer, JobLauncher, LaunchRequest, SweepCapabilities,
    SweepController, SweepPlan,
};
pub use enumerator::{AxisEnumerator, Combination, Step};
pub use error::{
    AnalyzeError, ConfigurationError, LaunchRejected, PollError, StageError, SweepError,
    TransformError,
};
pub use inputs::JobInputs;
pub use keys::{FdfKeyNormalizer, KeyNormalizer};
pub use router::{KeyRouter, Route, RouteTable, RouterRule};
pub use state::{JobHandle, Phase, SweepState, TerminalStatus};
