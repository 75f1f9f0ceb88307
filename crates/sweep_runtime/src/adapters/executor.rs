//! Runs each job as a local child process.
//!
//! Every job gets its own directory under the work dir holding `inputs.json`,
//! the captured `stdout.log`/`stderr.log` and, once the process exits,
//! `status.json`. The command sees the inputs path in `SWEEP_JOB_INPUTS` and
//! runs with the job directory as its working directory.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use indexmap::IndexMap;
use sweep_core::controller::{BatchPoller, JobLauncher, LaunchRequest};
use sweep_core::error::{LaunchRejected, PollError};
use sweep_core::flavors::Flavor;
use sweep_core::state::{JobHandle, TerminalStatus};
use sweep_core::storage_keys::{job_inputs_object_key, job_run_prefix, job_status_object_key};
use tokio::process::Command;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const JOB_INPUTS_ENV: &str = "SWEEP_JOB_INPUTS";
pub const JOB_DIR_ENV: &str = "SWEEP_JOB_DIR";
pub const JOB_HANDLE_ENV: &str = "SWEEP_JOB_HANDLE";

/// Status reported for a handle that has neither a live process nor a
/// recorded `status.json`, e.g. after the launching process died.
pub const LOST_JOB_REASON: &str = "job lost: no running process and no recorded status";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl JobCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh", vec!["-c".to_string(), script.into()])
    }
}

pub struct LocalCommandExecutor {
    run_id: String,
    command: JobCommand,
    work_dir: PathBuf,
    flavor: Flavor,
    runtime: Handle,
    running: Mutex<HashMap<JobHandle, JoinHandle<TerminalStatus>>>,
}

impl LocalCommandExecutor {
    pub fn new(
        run_id: impl Into<String>,
        command: JobCommand,
        work_dir: impl Into<PathBuf>,
        flavor: Flavor,
        runtime: Handle,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            command,
            work_dir: work_dir.into(),
            flavor,
            runtime,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn job_dir(&self, handle: &JobHandle) -> PathBuf {
        self.work_dir
            .join(job_run_prefix("", &self.run_id, handle))
    }

    pub fn inputs_path(&self, handle: &JobHandle) -> PathBuf {
        self.work_dir
            .join(job_inputs_object_key("", &self.run_id, handle))
    }

    pub fn status_path(&self, handle: &JobHandle) -> PathBuf {
        self.work_dir
            .join(job_status_object_key("", &self.run_id, handle))
    }

    fn handle_for(&self, index: usize) -> JobHandle {
        JobHandle::new(format!("{}-{index:06}", self.run_id))
    }

    fn prepare_job_dir(&self, handle: &JobHandle, body: &[u8]) -> Result<PathBuf, String> {
        let job_dir = self.job_dir(handle);
        fs::create_dir_all(&job_dir)
            .map_err(|error| format!("failed to create {}: {error}", job_dir.display()))?;

        let status_path = self.status_path(handle);
        match fs::remove_file(&status_path) {
            Ok(()) => debug!(handle = %handle, "Removed status left by an earlier attempt"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                return Err(format!(
                    "failed to clear stale {}: {error}",
                    status_path.display()
                ))
            }
        }

        let inputs_path = self.inputs_path(handle);
        fs::write(&inputs_path, body)
            .map_err(|error| format!("failed to write {}: {error}", inputs_path.display()))?;
        Ok(job_dir)
    }

    /// Waits for every job this process spawned to exit and record its
    /// status, without reporting them. A later process polls them from disk.
    pub fn settle(&self) -> Result<usize, PollError> {
        Self::ensure_can_block()?;
        let tasks: Vec<_> = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let settled = tasks.len();
        let wait_all = async {
            for (handle, task) in tasks {
                if let Err(error) = task.await {
                    warn!(handle = %handle, "Job task failed before recording status: {error}");
                }
            }
        };
        self.block_on(wait_all);
        Ok(settled)
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        if Handle::try_current().is_ok() {
            tokio::task::block_in_place(|| self.runtime.block_on(future))
        } else {
            self.runtime.block_on(future)
        }
    }

    fn ensure_can_block() -> Result<(), PollError> {
        let on_current_thread = Handle::try_current()
            .map(|current| current.runtime_flavor() == RuntimeFlavor::CurrentThread)
            .unwrap_or(false);
        if on_current_thread {
            return Err(PollError::Backend(
                "local executor must be polled from a multi-threaded runtime".to_string(),
            ));
        }
        Ok(())
    }

    /// Status of a job this process did not spawn, read back from disk.
    fn recorded_status(&self, handle: &JobHandle) -> TerminalStatus {
        let path = self.status_path(handle);
        match fs::read(&path) {
            Ok(body) => serde_json::from_slice(&body).unwrap_or_else(|error| {
                TerminalStatus::failure(format!("unreadable {}: {error}", path.display()))
            }),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                warn!(handle = %handle, "{LOST_JOB_REASON}");
                TerminalStatus::failure(LOST_JOB_REASON)
            }
            Err(error) => {
                TerminalStatus::failure(format!("failed to read {}: {error}", path.display()))
            }
        }
    }
}

impl JobLauncher for LocalCommandExecutor {
    fn launch(&self, request: LaunchRequest<'_>) -> Result<JobHandle, LaunchRejected> {
        if request.run_id != self.run_id {
            return Err(LaunchRejected::new(format!(
                "executor serves run '{}', not '{}'",
                self.run_id, request.run_id
            )));
        }
        self.flavor
            .validate_inputs(request.inputs)
            .map_err(|error| LaunchRejected::new(error.to_string()))?;

        let handle = self.handle_for(request.combination.index);
        let body = serde_json::to_vec_pretty(request.inputs)
            .map_err(|error| LaunchRejected::new(format!("failed to encode inputs: {error}")))?;
        let job_dir = self.prepare_job_dir(&handle, &body).map_err(LaunchRejected::new)?;

        let job = ChildJob {
            handle: handle.clone(),
            command: self.command.clone(),
            inputs_path: self.inputs_path(&handle),
            status_path: self.status_path(&handle),
            job_dir,
        };
        let task = self.runtime.spawn(job.run());
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.clone(), task);

        debug!(handle = %handle, batch = request.batch, "Spawned job");
        Ok(handle)
    }
}

impl BatchPoller for LocalCommandExecutor {
    fn poll_batch(
        &self,
        handles: &[JobHandle],
    ) -> Result<IndexMap<JobHandle, TerminalStatus>, PollError> {
        Self::ensure_can_block()?;

        let pending: Vec<_> = {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            handles
                .iter()
                .map(|handle| (handle.clone(), running.remove(handle)))
                .collect()
        };

        info!(jobs = pending.len(), "Waiting for batch to finish");
        let wait_all = async {
            let mut statuses = IndexMap::with_capacity(pending.len());
            for (handle, task) in pending {
                let status = match task {
                    Some(task) => task.await.unwrap_or_else(|error| {
                        TerminalStatus::failure(format!("job task failed: {error}"))
                    }),
                    None => self.recorded_status(&handle),
                };
                statuses.insert(handle, status);
            }
            statuses
        };

        Ok(self.block_on(wait_all))
    }
}

struct ChildJob {
    handle: JobHandle,
    command: JobCommand,
    job_dir: PathBuf,
    inputs_path: PathBuf,
    status_path: PathBuf,
}

impl ChildJob {
    async fn run(self) -> TerminalStatus {
        let status = self.execute().await;
        match serde_json::to_vec_pretty(&status) {
            Ok(body) => {
                if let Err(error) = tokio::fs::write(&self.status_path, body).await {
                    warn!(handle = %self.handle, "Failed to record job status: {error}");
                }
            }
            Err(error) => warn!(handle = %self.handle, "Failed to encode job status: {error}"),
        }
        status
    }

    async fn execute(&self) -> TerminalStatus {
        let (stdout, stderr) = match (
            log_file(&self.job_dir, "stdout.log"),
            log_file(&self.job_dir, "stderr.log"),
        ) {
            (Ok(stdout), Ok(stderr)) => (stdout, stderr),
            (Err(error), _) | (_, Err(error)) => return TerminalStatus::failure(error),
        };

        let exit = Command::new(&self.command.program)
            .args(&self.command.args)
            .current_dir(&self.job_dir)
            .env(JOB_INPUTS_ENV, &self.inputs_path)
            .env(JOB_DIR_ENV, &self.job_dir)
            .env(JOB_HANDLE_ENV, self.handle.as_str())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .await;

        match exit {
            Ok(exit) if exit.success() => TerminalStatus::Success,
            Ok(exit) => {
                warn!(handle = %self.handle, "Job {exit}");
                TerminalStatus::failure(format!("job {exit}"))
            }
            Err(error) => TerminalStatus::failure(format!(
                "failed to start '{}': {error}",
                self.command.program
            )),
        }
    }
}

fn log_file(job_dir: &Path, name: &str) -> Result<fs::File, String> {
    let path = job_dir.join(name);
    fs::File::create(&path).map_err(|error| format!("failed to create {}: {error}", path.display()))
}
