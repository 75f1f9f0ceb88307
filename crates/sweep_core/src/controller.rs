//! Batch controller state machine.
//!
//! `Idle -> Dispatching -> AwaitingBatch -> Analyzing -> (Dispatching | Done)`,
//! with `Cancelled` and `Failed` as the other terminal phases. Each transition
//! is a separate method that leaves [`SweepState`] self-consistent, so the
//! host can persist it after any call and resume from it later. Only
//! `AwaitingBatch` waits on anything external.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::contract::{
    contract_fingerprint, normalize_request, SweepConfig, SweepRequest, SWEEP_STATE_SCHEMA_VERSION,
};
use crate::enumerator::{AxisEnumerator, Combination, Step};
use crate::error::{
    AnalyzeError, ConfigurationError, LaunchRejected, PollError, SweepError, TransformError,
};
use crate::inputs::{build_job_inputs, JobInputs};
use crate::router::{KeyRouter, Route, RouteTable};
use crate::state::{
    JobHandle, JobOutcome, LaunchRejection, Phase, SweepState, SweepSummary, TerminalStatus,
};

pub struct LaunchRequest<'a> {
    pub run_id: &'a str,
    pub batch: usize,
    pub combination: &'a Combination,
    pub inputs: &'a JobInputs,
}

/// Submits one job. Must not block on the job's completion.
pub trait JobLauncher {
    fn launch(&self, request: LaunchRequest<'_>) -> Result<JobHandle, LaunchRejected>;
}

/// Blocks until every handle reaches a terminal status.
pub trait BatchPoller {
    fn poll_batch(
        &self,
        handles: &[JobHandle],
    ) -> Result<IndexMap<JobHandle, TerminalStatus>, PollError>;
}

pub trait JobAnalyzer {
    /// Called once per finished job, in dispatch order. An error stops the
    /// sweep.
    fn analyze(
        &self,
        handle: &JobHandle,
        combination: &Combination,
        status: &TerminalStatus,
    ) -> Result<(), AnalyzeError>;

    /// Consulted after each analyzed batch; `false` ends the sweep early.
    fn should_proceed(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy)]
pub struct SweepCapabilities<'a> {
    pub launcher: &'a dyn JobLauncher,
    pub poller: &'a dyn BatchPoller,
    pub analyzer: &'a dyn JobAnalyzer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record failed jobs and keep scheduling.
    #[default]
    RecordAndContinue,
    /// Stop the sweep after the first failed job has been analyzed.
    AbortSweep,
}

/// A validated sweep: axes, resolved routes and base inputs.
///
/// Building a plan performs every configuration check, so a plan that exists
/// can never hit a `ConfigurationError` while running.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    config: SweepConfig,
    enumerator: AxisEnumerator,
    routes: RouteTable,
    base_inputs: JobInputs,
    fingerprint: String,
    failure_policy: FailurePolicy,
}

#[derive(Serialize)]
struct PlanFingerprint<'a> {
    config: &'a SweepConfig,
    routes: Vec<Value>,
    base_inputs: &'a JobInputs,
}

impl SweepPlan {
    pub fn new(
        request: SweepRequest,
        router: &KeyRouter,
        base_inputs: JobInputs,
    ) -> Result<Self, ConfigurationError> {
        let config = normalize_request(request)?;
        let enumerator = AxisEnumerator::new(config.axes.clone(), config.mode)?;
        let routes = router.route_table(config.axis_names())?;
        let fingerprint = contract_fingerprint(PlanFingerprint {
            config: &config,
            routes: routes.iter().map(|(_, route)| route_signature(route)).collect(),
            base_inputs: &base_inputs,
        });

        Ok(Self {
            config,
            enumerator,
            routes,
            base_inputs,
            fingerprint,
            failure_policy: FailurePolicy::default(),
        })
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn enumerator(&self) -> &AxisEnumerator {
        &self.enumerator
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn base_inputs(&self) -> &JobInputs {
        &self.base_inputs
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn job_inputs_for(&self, combination: &Combination) -> Result<JobInputs, TransformError> {
        build_job_inputs(&self.base_inputs, combination, &self.routes)
    }
}

fn route_signature(route: &Route) -> Value {
    json!({
        "axis": route.axis(),
        "namespace": route.namespace(),
        "key": route.key(),
        "group": route.group(),
        "transform": route.transform_name(),
        "defaults": route.defaults(),
        "nested": route.nested().map(route_signature),
    })
}

pub struct SweepController<'a> {
    plan: SweepPlan,
    state: SweepState,
    capabilities: SweepCapabilities<'a>,
}

impl<'a> SweepController<'a> {
    pub fn start(plan: SweepPlan, capabilities: SweepCapabilities<'a>) -> Self {
        let state = SweepState::new(&plan.config, plan.fingerprint.clone());
        Self {
            plan,
            state,
            capabilities,
        }
    }

    /// Continues a sweep from persisted state.
    ///
    /// The state must belong to the same configuration and its history must
    /// match the sequence regenerated from `(axes, mode)`.
    pub fn resume(
        plan: SweepPlan,
        state: SweepState,
        capabilities: SweepCapabilities<'a>,
    ) -> Result<Self, SweepError> {
        verify_resumable(&plan, &state)?;
        info!(
            run_id = %state.run_id,
            phase = ?state.phase,
            cursor = state.cursor,
            in_flight = state.in_flight.len(),
            "Resuming sweep"
        );
        Ok(Self {
            plan,
            state,
            capabilities,
        })
    }

    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    pub fn state(&self) -> &SweepState {
        &self.state
    }

    pub fn into_state(self) -> SweepState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn realized_history(&self) -> &[Combination] {
        &self.state.realized_history
    }

    pub fn summary(&self) -> SweepSummary {
        self.state.summary()
    }

    pub fn begin(&mut self) -> Result<(), SweepError> {
        self.expect_phase(Phase::Idle, "begin")?;
        info!(
            run_id = %self.state.run_id,
            total_combinations = self.plan.enumerator.len(),
            batch_size = self.state.batch_size,
            "Starting sweep"
        );
        self.state.phase = if self.state.cancel_requested {
            Phase::Cancelled
        } else {
            Phase::Dispatching
        };
        Ok(())
    }

    /// Realizes up to `batch_size` combinations and launches one job each.
    ///
    /// Returns the number of jobs actually launched. Rejected combinations
    /// are recorded and do not stop the batch.
    ///
    /// The state only reaches the host once this returns. A process that dies
    /// mid-dispatch resumes at the previous cursor and launches the batch
    /// again under the same handles, so launchers must treat a repeated
    /// handle as a fresh start of that job.
    pub fn dispatch_batch(&mut self) -> Result<usize, SweepError> {
        self.expect_phase(Phase::Dispatching, "dispatch a batch")?;
        if self.state.cancel_requested {
            self.state.phase = Phase::Cancelled;
            return Ok(0);
        }

        let target = self.state.batch_size;
        let batch = self.state.batch + 1;
        let mut pulled = 0usize;
        let mut launched = 0usize;

        while pulled < target {
            let Step::Next {
                combination,
                cursor,
            } = self.plan.enumerator.next(self.state.cursor)
            else {
                break;
            };
            pulled += 1;
            info!(
                run_id = %self.state.run_id,
                batch,
                index = combination.index,
                "Next values:\n\t{}",
                combination.describe()
            );
            self.state.cursor = cursor;
            self.state.realized_history.push(combination.clone());

            match self.launch(batch, &combination) {
                Ok(handle) => {
                    debug!(run_id = %self.state.run_id, %handle, "Job launched");
                    self.state.in_flight.insert(handle, combination);
                    launched += 1;
                }
                Err(reason) => {
                    warn!(
                        run_id = %self.state.run_id,
                        batch,
                        index = combination.index,
                        %reason,
                        "Combination rejected"
                    );
                    self.state.rejections.push(LaunchRejection {
                        combination,
                        batch,
                        reason,
                    });
                }
            }
        }

        if pulled > 0 {
            self.state.batch = batch;
            info!(
                run_id = %self.state.run_id,
                batch,
                cursor = self.state.cursor,
                "Launched batch of {launched}/{target} jobs"
            );
        }

        self.state.phase = if !self.state.in_flight.is_empty() {
            Phase::AwaitingBatch
        } else if self.plan.enumerator.is_exhausted_at(self.state.cursor) {
            Phase::Done
        } else {
            Phase::Dispatching
        };
        Ok(launched)
    }

    fn launch(&self, batch: usize, combination: &Combination) -> Result<JobHandle, String> {
        let inputs = self
            .plan
            .job_inputs_for(combination)
            .map_err(|error| error.to_string())?;
        let handle = self
            .capabilities
            .launcher
            .launch(LaunchRequest {
                run_id: &self.state.run_id,
                batch,
                combination,
                inputs: &inputs,
            })
            .map_err(|error| error.to_string())?;
        if self.state.in_flight.contains_key(&handle) {
            return Err(format!("launcher returned duplicate handle {handle}"));
        }
        Ok(handle)
    }

    /// Joins on the whole batch. Partial completion is an error and leaves
    /// the state untouched, so the call can simply be retried.
    pub fn await_batch(&mut self) -> Result<(), SweepError> {
        self.expect_phase(Phase::AwaitingBatch, "await a batch")?;
        let handles: Vec<JobHandle> = self.state.in_flight.keys().cloned().collect();
        let mut reported = self.capabilities.poller.poll_batch(&handles)?;

        let mut statuses = IndexMap::with_capacity(handles.len());
        let mut missing = Vec::new();
        for handle in handles {
            match reported.shift_remove(&handle) {
                Some(status) => {
                    statuses.insert(handle, status);
                }
                None => missing.push(handle),
            }
        }
        if !missing.is_empty() {
            return Err(PollError::Incomplete { missing }.into());
        }
        if !reported.is_empty() {
            debug!(
                run_id = %self.state.run_id,
                ignored = reported.len(),
                "Poller reported statuses for untracked handles"
            );
        }

        self.state.batch_statuses = statuses;
        self.state.phase = Phase::Analyzing;
        Ok(())
    }

    /// Hands every finished job to the analyzer in dispatch order.
    pub fn analyze_batch(&mut self) -> Result<(), SweepError> {
        self.expect_phase(Phase::Analyzing, "analyze a batch")?;
        let batch = self.state.batch;

        while let Some((handle, combination)) = self.state.in_flight.shift_remove_index(0) {
            let status = self
                .state
                .batch_statuses
                .shift_remove(&handle)
                .unwrap_or_else(|| TerminalStatus::failure("no terminal status recorded"));
            if let Some(reason) = status.reason() {
                warn!(
                    run_id = %self.state.run_id,
                    %handle,
                    status = status.label(),
                    reason,
                    "Job did not succeed"
                );
            }

            let analyzed =
                self.capabilities
                    .analyzer
                    .analyze(&handle, &combination, &status);
            let failed_reason = match &status {
                TerminalStatus::Failure { reason } => Some(reason.clone()),
                _ => None,
            };
            self.state.outcomes.push(JobOutcome {
                handle: handle.clone(),
                combination_index: combination.index,
                batch,
                status,
                analyzed: analyzed.is_ok(),
            });

            if let Err(source) = analyzed {
                let error = SweepError::Analyze { handle, source };
                self.fail(&error);
                return Err(error);
            }
            if self.plan.failure_policy == FailurePolicy::AbortSweep {
                if let Some(reason) = failed_reason {
                    let error = SweepError::JobFailed { handle, reason };
                    self.fail(&error);
                    return Err(error);
                }
            }
        }
        self.state.batch_statuses.clear();

        self.state.phase = if self.state.cancel_requested {
            Phase::Cancelled
        } else if !self.capabilities.analyzer.should_proceed() {
            info!(run_id = %self.state.run_id, batch, "Analyzer requested early stop");
            Phase::Done
        } else if self.plan.enumerator.is_exhausted_at(self.state.cursor) {
            Phase::Done
        } else {
            Phase::Dispatching
        };
        if self.state.phase == Phase::Done {
            info!(
                run_id = %self.state.run_id,
                realized = self.state.realized_history.len(),
                "Sweep finished"
            );
        }
        Ok(())
    }

    /// Stops further dispatch. Jobs already in flight are still awaited and
    /// analyzed unless [`Self::abandon_in_flight`] is called.
    pub fn cancel(&mut self) {
        if self.state.phase.is_terminal() {
            return;
        }
        self.state.cancel_requested = true;
        if matches!(self.state.phase, Phase::Idle | Phase::Dispatching) {
            self.state.phase = Phase::Cancelled;
        }
        info!(run_id = %self.state.run_id, phase = ?self.state.phase, "Sweep cancelled");
    }

    /// Cancels the sweep and records every unanalyzed in-flight job as
    /// cancelled. Returns the abandoned handles so the host can stop them.
    pub fn abandon_in_flight(&mut self, reason: &str) -> Vec<JobHandle> {
        if self.state.phase.is_terminal() && self.state.in_flight.is_empty() {
            return Vec::new();
        }
        self.state.cancel_requested = true;
        let abandoned = self.drain_unanalyzed(reason);
        if !self.state.phase.is_terminal() {
            self.state.phase = Phase::Cancelled;
        }
        warn!(
            run_id = %self.state.run_id,
            abandoned = abandoned.len(),
            reason,
            "Abandoned in-flight jobs"
        );
        abandoned
    }

    /// Runs whichever transition the current phase calls for.
    pub fn step(&mut self) -> Result<Phase, SweepError> {
        match self.state.phase {
            Phase::Idle => self.begin()?,
            Phase::Dispatching => {
                self.dispatch_batch()?;
            }
            Phase::AwaitingBatch => self.await_batch()?,
            Phase::Analyzing => self.analyze_batch()?,
            Phase::Done | Phase::Cancelled | Phase::Failed => {}
        }
        Ok(self.state.phase)
    }

    pub fn run_to_completion(&mut self) -> Result<SweepSummary, SweepError> {
        while !self.state.phase.is_terminal() {
            self.step()?;
        }
        Ok(self.summary())
    }

    fn drain_unanalyzed(&mut self, reason: &str) -> Vec<JobHandle> {
        let batch = self.state.batch;
        let mut drained = Vec::with_capacity(self.state.in_flight.len());
        for (handle, combination) in self.state.in_flight.drain(..) {
            let status = self
                .state
                .batch_statuses
                .shift_remove(&handle)
                .unwrap_or_else(|| TerminalStatus::Cancelled {
                    reason: reason.to_string(),
                });
            self.state.outcomes.push(JobOutcome {
                handle: handle.clone(),
                combination_index: combination.index,
                batch,
                status,
                analyzed: false,
            });
            drained.push(handle);
        }
        self.state.batch_statuses.clear();
        drained
    }

    fn fail(&mut self, error: &SweepError) {
        warn!(run_id = %self.state.run_id, %error, "Sweep failed");
        self.drain_unanalyzed("sweep stopped before analysis");
        self.state.failure = Some(error.to_string());
        self.state.phase = Phase::Failed;
    }

    fn expect_phase(&self, expected: Phase, operation: &'static str) -> Result<(), SweepError> {
        if self.state.phase == expected {
            Ok(())
        } else {
            Err(SweepError::InvalidTransition {
                phase: self.state.phase,
                operation,
            })
        }
    }
}

fn verify_resumable(plan: &SweepPlan, state: &SweepState) -> Result<(), SweepError> {
    let mismatch = |reason: String| Err(SweepError::StateMismatch { reason });

    if state.schema_version != SWEEP_STATE_SCHEMA_VERSION {
        return mismatch(format!(
            "schema version {} is not {SWEEP_STATE_SCHEMA_VERSION}",
            state.schema_version
        ));
    }
    if state.fingerprint != plan.fingerprint {
        return mismatch("configuration fingerprint differs".to_string());
    }
    if state.cursor != state.realized_history.len() {
        return mismatch(format!(
            "cursor {} does not match {} realized combinations",
            state.cursor,
            state.realized_history.len()
        ));
    }
    for (index, recorded) in state.realized_history.iter().enumerate() {
        if plan.enumerator.combination_at(index).as_ref() != Some(recorded) {
            return mismatch(format!(
                "realized combination {index} differs from the regenerated sequence"
            ));
        }
    }
    if let Some((handle, _)) = state
        .in_flight
        .iter()
        .find(|(_, combination)| combination.index >= state.cursor)
    {
        return mismatch(format!("in-flight job {handle} was never realized"));
    }
    if matches!(state.phase, Phase::Idle | Phase::Dispatching) && !state.in_flight.is_empty() {
        return mismatch(format!(
            "{} in-flight jobs recorded while {:?}",
            state.in_flight.len(),
            state.phase
        ));
    }
    Ok(())
}
