#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Mutex;

use indexmap::IndexMap;
use serde_json::{json, Value};
use sweep_core::contract::{CombinationMode, SweepRequest};
use sweep_core::controller::{
    BatchPoller, JobAnalyzer, JobLauncher, LaunchRequest, SweepCapabilities, SweepPlan,
};
use sweep_core::enumerator::Combination;
use sweep_core::error::{AnalyzeError, LaunchRejected, PollError};
use sweep_core::flavors::siesta::siesta_router;
use sweep_core::inputs::JobInputs;
use sweep_core::state::{JobHandle, TerminalStatus};

pub fn handle_for(run_id: &str, index: usize) -> JobHandle {
    JobHandle::new(format!("{run_id}-{index:06}"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchedJob {
    pub handle: JobHandle,
    pub batch: usize,
    pub combination: Combination,
    pub inputs: JobInputs,
}

/// Launcher that accepts every combination except the listed indices.
#[derive(Default)]
pub struct ScriptedLauncher {
    reject: BTreeSet<usize>,
    launched: Mutex<Vec<LaunchedJob>>,
}

impl ScriptedLauncher {
    pub fn rejecting(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            reject: indices.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn launched(&self) -> Vec<LaunchedJob> {
        self.launched.lock().expect("poisoned mutex").clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        let mut sizes: IndexMap<usize, usize> = IndexMap::new();
        for job in self.launched() {
            *sizes.entry(job.batch).or_default() += 1;
        }
        sizes.into_values().collect()
    }
}

impl JobLauncher for ScriptedLauncher {
    fn launch(&self, request: LaunchRequest<'_>) -> Result<JobHandle, LaunchRejected> {
        let index = request.combination.index;
        if self.reject.contains(&index) {
            return Err(LaunchRejected::new(format!("combination {index} is malformed")));
        }
        let handle = handle_for(request.run_id, index);
        self.launched
            .lock()
            .expect("poisoned mutex")
            .push(LaunchedJob {
                handle: handle.clone(),
                batch: request.batch,
                combination: request.combination.clone(),
                inputs: request.inputs.clone(),
            });
        Ok(handle)
    }
}

/// Poller that reports success unless told otherwise.
#[derive(Default)]
pub struct ScriptedPoller {
    failing: BTreeSet<JobHandle>,
    withheld_once: Mutex<BTreeSet<JobHandle>>,
    polls: Mutex<Vec<Vec<JobHandle>>>,
}

impl ScriptedPoller {
    pub fn failing(handles: impl IntoIterator<Item = JobHandle>) -> Self {
        Self {
            failing: handles.into_iter().collect(),
            ..Self::default()
        }
    }

    /// The first poll that sees `handle` leaves it out of the result.
    pub fn withholding_once(handle: JobHandle) -> Self {
        Self {
            withheld_once: Mutex::new(BTreeSet::from([handle])),
            ..Self::default()
        }
    }

    pub fn polls(&self) -> Vec<Vec<JobHandle>> {
        self.polls.lock().expect("poisoned mutex").clone()
    }
}

impl BatchPoller for ScriptedPoller {
    fn poll_batch(
        &self,
        handles: &[JobHandle],
    ) -> Result<IndexMap<JobHandle, TerminalStatus>, PollError> {
        self.polls
            .lock()
            .expect("poisoned mutex")
            .push(handles.to_vec());
        let mut withheld = self.withheld_once.lock().expect("poisoned mutex");

        let mut statuses = IndexMap::new();
        for handle in handles {
            if withheld.remove(handle) {
                continue;
            }
            let status = if self.failing.contains(handle) {
                TerminalStatus::failure("scf did not converge")
            } else {
                TerminalStatus::Success
            };
            statuses.insert(handle.clone(), status);
        }
        Ok(statuses)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedJob {
    pub handle: JobHandle,
    pub index: usize,
    pub status: TerminalStatus,
}

#[derive(Default)]
pub struct RecordingAnalyzer {
    fail_on: Option<JobHandle>,
    stop_after: Option<usize>,
    analyzed: Mutex<Vec<AnalyzedJob>>,
}

impl RecordingAnalyzer {
    pub fn failing_on(handle: JobHandle) -> Self {
        Self {
            fail_on: Some(handle),
            ..Self::default()
        }
    }

    /// Asks the controller to stop once `count` jobs have been analyzed.
    pub fn stopping_after(count: usize) -> Self {
        Self {
            stop_after: Some(count),
            ..Self::default()
        }
    }

    pub fn analyzed(&self) -> Vec<AnalyzedJob> {
        self.analyzed.lock().expect("poisoned mutex").clone()
    }

    pub fn analyzed_indices(&self) -> Vec<usize> {
        self.analyzed().into_iter().map(|job| job.index).collect()
    }
}

impl JobAnalyzer for RecordingAnalyzer {
    fn analyze(
        &self,
        handle: &JobHandle,
        combination: &Combination,
        status: &TerminalStatus,
    ) -> Result<(), AnalyzeError> {
        self.analyzed
            .lock()
            .expect("poisoned mutex")
            .push(AnalyzedJob {
                handle: handle.clone(),
                index: combination.index,
                status: status.clone(),
            });
        if self.fail_on.as_ref() == Some(handle) {
            return Err(AnalyzeError::new("could not read output parameters"));
        }
        Ok(())
    }

    fn should_proceed(&self) -> bool {
        match self.stop_after {
            Some(limit) => self.analyzed.lock().expect("poisoned mutex").len() < limit,
            None => true,
        }
    }
}

#[derive(Default)]
pub struct Collaborators {
    pub launcher: ScriptedLauncher,
    pub poller: ScriptedPoller,
    pub analyzer: RecordingAnalyzer,
}

impl Collaborators {
    pub fn capabilities(&self) -> SweepCapabilities<'_> {
        SweepCapabilities {
            launcher: &self.launcher,
            poller: &self.poller,
            analyzer: &self.analyzer,
        }
    }
}

pub fn request(
    run_id: &str,
    axes: &[(&str, Vec<Value>)],
    mode: CombinationMode,
    batch_size: usize,
) -> SweepRequest {
    SweepRequest {
        run_id: run_id.to_string(),
        iterate_over: axes
            .iter()
            .map(|(name, values)| (name.to_string(), values.clone()))
            .collect(),
        iterate_mode: mode,
        batch_size,
    }
}

/// Three meshcutoff values on the SIESTA router.
pub fn meshcutoff_plan(run_id: &str, batch_size: usize) -> SweepPlan {
    let payload = request(
        run_id,
        &[("meshcutoff", vec![json!(100), json!(200), json!(300)])],
        CombinationMode::Zip,
        batch_size,
    );
    let router = siesta_router().expect("router should build");
    SweepPlan::new(payload, &router, base_inputs()).expect("plan should build")
}

pub fn base_inputs() -> JobInputs {
    let mut inputs = JobInputs::new();
    inputs.insert("code", json!("siesta@localhost"));
    inputs.insert("parameters", json!({"xc-functional": "GGA", "MeshCutoff": "50 Ry"}));
    inputs
}
