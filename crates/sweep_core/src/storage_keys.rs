use crate::state::JobHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    SweepState,
    Manifest,
    JobRuns,
    JobOutcomes,
}

impl ObjectKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::SweepState => "sweep_state",
            Self::Manifest => "manifest",
            Self::JobRuns => "job_runs",
            Self::JobOutcomes => "job_outcomes",
        }
    }
}

pub fn run_prefix(base_prefix: &str, kind: ObjectKind, run_id: &str) -> String {
    let trimmed = base_prefix.trim_matches('/');
    let dataset = kind.as_str();
    if trimmed.is_empty() {
        format!("dataset={dataset}/run_id={run_id}")
    } else {
        format!("{trimmed}/dataset={dataset}/run_id={run_id}")
    }
}

pub fn state_object_key(base_prefix: &str, run_id: &str) -> String {
    format!(
        "{}/state.json",
        run_prefix(base_prefix, ObjectKind::SweepState, run_id)
    )
}

pub fn manifest_object_key(base_prefix: &str, run_id: &str) -> String {
    format!(
        "{}/manifest.json",
        run_prefix(base_prefix, ObjectKind::Manifest, run_id)
    )
}

/// Directory-like prefix owned by one job: its inputs, logs and status.
pub fn job_run_prefix(base_prefix: &str, run_id: &str, handle: &JobHandle) -> String {
    format!(
        "{}/handle={handle}",
        run_prefix(base_prefix, ObjectKind::JobRuns, run_id)
    )
}

pub fn job_inputs_object_key(base_prefix: &str, run_id: &str, handle: &JobHandle) -> String {
    format!("{}/inputs.json", job_run_prefix(base_prefix, run_id, handle))
}

pub fn job_status_object_key(base_prefix: &str, run_id: &str, handle: &JobHandle) -> String {
    format!("{}/status.json", job_run_prefix(base_prefix, run_id, handle))
}

pub fn job_outputs_object_key(base_prefix: &str, run_id: &str, handle: &JobHandle) -> String {
    format!("{}/outputs.json", job_run_prefix(base_prefix, run_id, handle))
}

pub fn outcome_object_key(
    base_prefix: &str,
    run_id: &str,
    status: &str,
    handle: &JobHandle,
) -> String {
    format!(
        "{}/status={status}/handle={handle}/outcome.json",
        run_prefix(base_prefix, ObjectKind::JobOutcomes, run_id)
    )
}
