#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use indexmap::IndexMap;
use serde_json::json;
use sweep_core::controller::{BatchPoller, JobAnalyzer, JobLauncher, LaunchRequest};
use sweep_core::enumerator::Combination;
use sweep_core::error::{AnalyzeError, LaunchRejected, PollError};
use sweep_core::state::{JobHandle, TerminalStatus};
use sweep_runtime::handlers::manifest::SweepManifest;

/// Launcher and poller whose jobs finish the moment they are launched.
#[derive(Default)]
pub struct InstantJobs {
    failing: BTreeSet<usize>,
    fail_all: bool,
    launched: Mutex<HashMap<JobHandle, usize>>,
    launch_order: Mutex<Vec<usize>>,
}

impl InstantJobs {
    pub fn failing(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            failing: indices.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Every job fails, including ones launched by an earlier process.
    pub fn all_failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    pub fn launched_indices(&self) -> Vec<usize> {
        self.launch_order.lock().expect("launch order lock").clone()
    }
}

impl JobLauncher for InstantJobs {
    fn launch(&self, request: LaunchRequest<'_>) -> Result<JobHandle, LaunchRejected> {
        let index = request.combination.index;
        let handle = JobHandle::new(format!("{}-{index:06}", request.run_id));
        self.launched
            .lock()
            .expect("launched lock")
            .insert(handle.clone(), index);
        self.launch_order.lock().expect("launch order lock").push(index);
        Ok(handle)
    }
}

impl BatchPoller for InstantJobs {
    fn poll_batch(
        &self,
        handles: &[JobHandle],
    ) -> Result<IndexMap<JobHandle, TerminalStatus>, PollError> {
        let launched = self.launched.lock().expect("launched lock");
        Ok(handles
            .iter()
            .map(|handle| {
                let status = match launched.get(handle) {
                    _ if self.fail_all => TerminalStatus::failure("job failed"),
                    Some(index) if self.failing.contains(index) => {
                        TerminalStatus::failure(format!("job {index} failed"))
                    }
                    // Handles launched by an earlier process finished while it was away.
                    _ => TerminalStatus::Success,
                };
                (handle.clone(), status)
            })
            .collect())
    }
}

/// Analyzer that errors on one combination index.
pub struct BrokenAnalyzer {
    pub fail_on: usize,
}

impl JobAnalyzer for BrokenAnalyzer {
    fn analyze(
        &self,
        _handle: &JobHandle,
        combination: &Combination,
        _status: &TerminalStatus,
    ) -> Result<(), AnalyzeError> {
        if combination.index == self.fail_on {
            return Err(AnalyzeError::new("extractor crashed"));
        }
        Ok(())
    }
}

/// Plain-flavor product sweep over six combinations.
pub fn product_manifest(run_id: &str, batch_size: usize) -> SweepManifest {
    serde_json::from_value(json!({
        "run_id": run_id,
        "iterate_over": {
            "structure": ["bulk", "slab", "wire"],
            "code": ["siesta@local", "siesta@cluster"],
        },
        "iterate_mode": "product",
        "batch_size": batch_size,
        "flavor": "plain",
    }))
    .expect("manifest should parse")
}

/// Siesta-flavor sweep over mesh cutoffs.
pub fn meshcutoff_manifest(run_id: &str, batch_size: usize) -> SweepManifest {
    serde_json::from_value(json!({
        "run_id": run_id,
        "iterate_over": {"meshcutoff": [100, 200, 300]},
        "batch_size": batch_size,
        "base_inputs": {"parameters": {"xc.functional": "GGA"}},
    }))
    .expect("manifest should parse")
}
