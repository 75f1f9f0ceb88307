//! Drives a controller through its transitions, persisting state between
//! every pair of them.
//!
//! Persisted state alone is enough to continue: `resume_sweep` rebuilds the
//! plan from the stored manifest and hands the state back to the controller,
//! which verifies it against the regenerated sequence.

use sweep_core::controller::{SweepCapabilities, SweepController};
use sweep_core::error::{ConfigurationError, SweepError};
use sweep_core::state::{Phase, SweepState, SweepSummary};
use sweep_core::storage_keys::manifest_object_key;
use thiserror::Error;
use tracing::{error, info};

use crate::adapters::state_store::{
    load_state, read_json, save_state, write_json, StateStore, StoreError,
};
use crate::handlers::manifest::SweepManifest;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Sweep(#[from] SweepError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("run '{run_id}' already has persisted state; resume it instead")]
    AlreadyStarted { run_id: String },

    #[error("no persisted {what} for run '{run_id}'")]
    NotFound { what: &'static str, run_id: String },
}

#[derive(Debug, Clone, Default)]
pub struct DriveOptions {
    pub state_prefix: String,
    /// Return at the next suspension point once this many batches have been
    /// dispatched by this call.
    pub max_batches: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    Finished(SweepSummary),
    /// Stopped while awaiting a batch; the persisted state can be resumed.
    Suspended(SweepSummary),
}

impl DriveOutcome {
    pub fn summary(&self) -> &SweepSummary {
        match self {
            Self::Finished(summary) | Self::Suspended(summary) => summary,
        }
    }
}

/// Registers a new run: fails if state already exists, otherwise stores the
/// manifest that `resume_sweep` will rebuild the plan from.
///
/// Returns the manifest as read back from the store. Starting the run from
/// it means the first process and every resume derive their plan from the
/// same bytes.
pub fn register_sweep(
    store: &dyn StateStore,
    prefix: &str,
    manifest: &SweepManifest,
) -> Result<SweepManifest, DriveError> {
    // Validate before anything is written.
    manifest.plan()?;
    let run_id = manifest.run_id();
    if load_state(store, prefix, run_id)?.is_some() {
        return Err(DriveError::AlreadyStarted {
            run_id: run_id.to_string(),
        });
    }
    write_json(store, &manifest_object_key(prefix, run_id), manifest)?;
    load_manifest(store, prefix, run_id)
}

pub fn load_manifest(
    store: &dyn StateStore,
    prefix: &str,
    run_id: &str,
) -> Result<SweepManifest, DriveError> {
    read_json(store, &manifest_object_key(prefix, run_id))?.ok_or_else(|| DriveError::NotFound {
        what: "manifest",
        run_id: run_id.to_string(),
    })
}

pub fn load_existing_state(
    store: &dyn StateStore,
    prefix: &str,
    run_id: &str,
) -> Result<SweepState, DriveError> {
    load_state(store, prefix, run_id)?.ok_or_else(|| DriveError::NotFound {
        what: "state",
        run_id: run_id.to_string(),
    })
}

/// Rebuilds a run's controller from its manifest and persisted state.
pub fn resume_sweep<'a>(
    store: &dyn StateStore,
    prefix: &str,
    manifest: &SweepManifest,
    capabilities: SweepCapabilities<'a>,
) -> Result<SweepController<'a>, DriveError> {
    let state = load_existing_state(store, prefix, manifest.run_id())?;
    let plan = manifest.plan()?;
    Ok(SweepController::resume(plan, state, capabilities)?)
}

pub fn drive_sweep(
    controller: &mut SweepController<'_>,
    store: &dyn StateStore,
    options: &DriveOptions,
) -> Result<DriveOutcome, DriveError> {
    let mut dispatched = 0usize;
    loop {
        save_state(store, &options.state_prefix, controller.state())?;

        let phase = controller.phase();
        if phase.is_terminal() {
            let summary = controller.summary();
            info!(
                run_id = %summary.run_id,
                phase = ?summary.phase,
                succeeded = summary.succeeded,
                failed = summary.failed,
                rejected = summary.rejected,
                "Sweep reached a terminal phase"
            );
            return Ok(DriveOutcome::Finished(summary));
        }
        if phase == Phase::AwaitingBatch
            && options
                .max_batches
                .is_some_and(|limit| dispatched >= limit)
        {
            let summary = controller.summary();
            info!(
                run_id = %summary.run_id,
                cursor = summary.cursor,
                in_flight = summary.in_flight,
                "Suspending sweep while jobs run"
            );
            return Ok(DriveOutcome::Suspended(summary));
        }

        if let Err(sweep_error) = controller.step() {
            error!(run_id = %controller.state().run_id, %sweep_error, "Sweep step failed");
            save_state(store, &options.state_prefix, controller.state())?;
            return Err(sweep_error.into());
        }
        if phase == Phase::Dispatching {
            dispatched += 1;
        }
    }
}
