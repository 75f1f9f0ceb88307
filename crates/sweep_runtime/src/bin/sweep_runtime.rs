use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use sweep_core::controller::{
    BatchPoller, JobAnalyzer, JobLauncher, LaunchRequest, SweepCapabilities, SweepController,
};
use sweep_core::enumerator::Combination;
use sweep_core::error::{AnalyzeError, LaunchRejected, PollError};
use sweep_core::inputs::JobInputs;
use sweep_core::state::{JobHandle, TerminalStatus};
use sweep_runtime::adapters::executor::{JobCommand, LocalCommandExecutor};
use sweep_runtime::adapters::state_store::{save_state, FileStateStore};
use sweep_runtime::handlers::driver::{
    drive_sweep, load_existing_state, load_manifest, register_sweep, resume_sweep, DriveOptions,
    DriveOutcome,
};
use sweep_runtime::handlers::manifest::SweepManifest;
use sweep_runtime::handlers::recorder::OutcomeRecorder;
use sweep_runtime::handlers::stages::{prepare_stage, SocRunOutput, StageKind};
use sweep_runtime::telemetry::{init_tracing, level_for_verbosity};
use tokio::runtime::Handle;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sweep_runtime", about = "Run batch parameter sweeps as local jobs")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct StoreArgs {
    /// Directory holding manifests, sweep state and outcome records.
    #[arg(long, env = "SWEEP_STATE_DIR", default_value = ".sweep/state")]
    state_dir: PathBuf,

    /// Key prefix for every stored object.
    #[arg(long, env = "SWEEP_STATE_PREFIX", default_value = "")]
    prefix: String,
}

#[derive(Args)]
struct ExecArgs {
    /// Directory holding one subdirectory per job.
    #[arg(long, env = "SWEEP_WORK_DIR", default_value = ".sweep/jobs")]
    work_dir: PathBuf,

    /// Shell command run once per job, with SWEEP_JOB_INPUTS pointing at its inputs.
    #[arg(long, env = "SWEEP_JOB_COMMAND")]
    job_command: String,

    /// Pause after dispatching this many batches; `resume` continues the sweep.
    #[arg(long)]
    max_batches: Option<usize>,

    /// Stop scheduling new batches once this many jobs have failed.
    #[arg(long)]
    max_failures: Option<usize>,

    /// Hide the progress bar.
    #[arg(long)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Register a sweep manifest and start running it.
    Run {
        /// JSON manifest: run_id, iterate_over, iterate_mode, batch_size, flavor, base_inputs.
        #[arg(long)]
        manifest: PathBuf,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Continue a suspended or interrupted sweep from its persisted state.
    Resume {
        #[arg(long)]
        run_id: String,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Print the summary of a sweep's persisted state.
    Status {
        #[arg(long)]
        run_id: String,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Stop dispatching further batches of a sweep.
    Cancel {
        #[arg(long)]
        run_id: String,
        /// Also record in-flight jobs as cancelled instead of awaiting them.
        #[arg(long)]
        abandon: bool,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Print the inputs of one stage of a multi-run job.
    Prepare {
        #[arg(long, value_enum)]
        stage: StageKind,
        /// Job inputs as written by the executor.
        #[arg(long)]
        inputs: PathBuf,
        /// Outputs of the finished SOC run, required for the BdG stage.
        #[arg(long)]
        soc_output: Option<PathBuf>,
    },
}

/// Collaborators for commands that only edit persisted state.
struct StateOnly;

impl JobLauncher for StateOnly {
    fn launch(&self, _request: LaunchRequest<'_>) -> Result<JobHandle, LaunchRejected> {
        Err(LaunchRejected::new("no executor attached"))
    }
}

impl BatchPoller for StateOnly {
    fn poll_batch(
        &self,
        _handles: &[JobHandle],
    ) -> Result<IndexMap<JobHandle, TerminalStatus>, PollError> {
        Err(PollError::Backend("no executor attached".to_string()))
    }
}

impl JobAnalyzer for StateOnly {
    fn analyze(
        &self,
        _handle: &JobHandle,
        _combination: &Combination,
        _status: &TerminalStatus,
    ) -> Result<(), AnalyzeError> {
        Err(AnalyzeError::new("no analyzer attached"))
    }
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn Error>> {
    let body = fs::read(path).map_err(|error| format!("failed to read {}: {error}", path.display()))?;
    serde_json::from_slice(&body)
        .map_err(|error| format!("{} is not valid JSON: {error}", path.display()).into())
}

fn print_json(value: &impl serde::Serialize) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn execute(
    store: &FileStateStore,
    prefix: &str,
    manifest: &SweepManifest,
    exec: &ExecArgs,
    resume: bool,
) -> Result<(), Box<dyn Error>> {
    let run_id = manifest.run_id();
    let plan = manifest.plan()?;
    let total = plan.enumerator().len();

    let executor = LocalCommandExecutor::new(
        run_id,
        JobCommand::shell(exec.job_command.clone()),
        &exec.work_dir,
        manifest.flavor,
        Handle::current(),
    );
    let mut recorder = OutcomeRecorder::new(store, prefix, run_id)
        .with_work_dir(&exec.work_dir)
        .with_max_failures(exec.max_failures);
    if !exec.no_progress {
        recorder = recorder.with_progress(total);
    }
    let capabilities = SweepCapabilities {
        launcher: &executor,
        poller: &executor,
        analyzer: &recorder,
    };

    let mut controller = if resume {
        let controller = resume_sweep(store, prefix, manifest, capabilities)?;
        recorder.resume_from(&controller.state().outcomes);
        controller
    } else {
        SweepController::start(plan, capabilities)
    };
    info!(
        run_id,
        flavor = manifest.flavor.as_str(),
        total_combinations = total,
        "Driving sweep"
    );

    let options = DriveOptions {
        state_prefix: prefix.to_string(),
        max_batches: exec.max_batches,
    };
    let outcome = drive_sweep(&mut controller, store, &options);
    recorder.finish();

    let outcome = outcome?;
    if let DriveOutcome::Suspended(summary) = &outcome {
        let settled = executor.settle()?;
        info!(
            run_id = %summary.run_id,
            settled,
            "Suspended batch has finished running; resume to analyze it"
        );
    }
    print_json(outcome.summary())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_json, level_for_verbosity(cli.verbose));

    match cli.command {
        Command::Run {
            manifest,
            store,
            exec,
        } => {
            let manifest: SweepManifest = read_json_file(&manifest)?;
            let state_store = FileStateStore::new(&store.state_dir);
            let registered = register_sweep(&state_store, &store.prefix, &manifest)?;
            execute(&state_store, &store.prefix, &registered, &exec, false)
        }
        Command::Resume {
            run_id,
            store,
            exec,
        } => {
            let state_store = FileStateStore::new(&store.state_dir);
            let manifest = load_manifest(&state_store, &store.prefix, &run_id)?;
            execute(&state_store, &store.prefix, &manifest, &exec, true)
        }
        Command::Status { run_id, store } => {
            let state_store = FileStateStore::new(&store.state_dir);
            let state = load_existing_state(&state_store, &store.prefix, &run_id)?;
            if let Some(failure) = &state.failure {
                warn!(run_id = %run_id, failure = %failure, "Sweep failed");
            }
            print_json(&state.summary())
        }
        Command::Cancel {
            run_id,
            abandon,
            store,
        } => {
            let state_store = FileStateStore::new(&store.state_dir);
            let manifest = load_manifest(&state_store, &store.prefix, &run_id)?;
            let collaborators = StateOnly;
            let capabilities = SweepCapabilities {
                launcher: &collaborators,
                poller: &collaborators,
                analyzer: &collaborators,
            };
            let mut controller = resume_sweep(&state_store, &store.prefix, &manifest, capabilities)?;
            if abandon {
                for handle in controller.abandon_in_flight("cancelled by operator") {
                    info!(handle = %handle, "Abandoned job");
                }
            } else {
                controller.cancel();
            }
            save_state(&state_store, &store.prefix, controller.state())?;
            print_json(&controller.summary())
        }
        Command::Prepare {
            stage,
            inputs,
            soc_output,
        } => {
            let job: JobInputs = read_json_file(&inputs)?;
            let soc_output: Option<SocRunOutput> = soc_output
                .as_deref()
                .map(read_json_file)
                .transpose()?;
            let prepared = prepare_stage(stage, &job, soc_output.as_ref())?;
            print_json(&prepared)
        }
    }
}
