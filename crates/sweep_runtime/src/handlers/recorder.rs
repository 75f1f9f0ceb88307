use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use indexmap::IndexMap;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sweep_core::contract::OUTCOME_RECORD_SCHEMA_VERSION;
use sweep_core::controller::JobAnalyzer;
use sweep_core::enumerator::Combination;
use sweep_core::error::AnalyzeError;
use sweep_core::state::{JobHandle, JobOutcome, TerminalStatus};
use sweep_core::storage_keys::{job_outputs_object_key, outcome_object_key};
use tracing::{info, warn};

use crate::adapters::state_store::{write_json, StateStore};

/// Per-job result document, one object per analyzed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub schema_version: String,
    pub run_id: String,
    pub handle: JobHandle,
    pub combination_index: usize,
    pub values: IndexMap<String, Value>,
    #[serde(flatten)]
    pub status: TerminalStatus,
    /// `outputs.json` left in the job directory, if the job wrote one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    pub recorded_at: String,
}

#[derive(Debug, Default)]
struct Tally {
    analyzed: usize,
    failed: usize,
}

/// Writes an [`OutcomeRecord`] for every finished job and advances a
/// progress bar over the whole sweep.
pub struct OutcomeRecorder<'a> {
    store: &'a dyn StateStore,
    prefix: String,
    run_id: String,
    work_dir: Option<PathBuf>,
    progress: ProgressBar,
    /// Stop scheduling once this many jobs have failed.
    max_failures: Option<usize>,
    tally: Mutex<Tally>,
}

impl<'a> OutcomeRecorder<'a> {
    pub fn new(store: &'a dyn StateStore, prefix: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            run_id: run_id.into(),
            work_dir: None,
            progress: ProgressBar::hidden(),
            max_failures: None,
            tally: Mutex::new(Tally::default()),
        }
    }

    /// Where the executor keeps job directories; enables `outputs` capture.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn with_progress(mut self, total: usize) -> Self {
        let progress = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            progress.set_style(style.progress_chars("#>-"));
        }
        self.progress = progress;
        self
    }

    /// Accounts for jobs a previous process already analyzed, so the
    /// failure limit holds across a resume.
    pub fn resume_from(&self, outcomes: &[JobOutcome]) {
        let mut tally = self.tally.lock().unwrap_or_else(PoisonError::into_inner);
        *tally = Tally::default();
        for outcome in outcomes.iter().filter(|outcome| outcome.analyzed) {
            tally.analyzed += 1;
            if !outcome.status.is_success() {
                tally.failed += 1;
            }
        }
        self.progress.set_position(tally.analyzed as u64);
    }

    pub fn with_max_failures(mut self, max_failures: Option<usize>) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn analyzed(&self) -> usize {
        self.tally.lock().unwrap_or_else(PoisonError::into_inner).analyzed
    }

    pub fn finish(&self) {
        self.progress.finish_and_clear();
    }

    fn job_outputs(&self, handle: &JobHandle) -> Result<Option<Value>, AnalyzeError> {
        let Some(work_dir) = &self.work_dir else {
            return Ok(None);
        };
        let path = work_dir.join(job_outputs_object_key("", &self.run_id, handle));
        match fs::read(&path) {
            Ok(body) => serde_json::from_slice(&body).map(Some).map_err(|error| {
                AnalyzeError::new(format!("{} is not valid JSON: {error}", path.display()))
            }),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(AnalyzeError::new(format!(
                "failed to read {}: {error}",
                path.display()
            ))),
        }
    }
}

impl JobAnalyzer for OutcomeRecorder<'_> {
    fn analyze(
        &self,
        handle: &JobHandle,
        combination: &Combination,
        status: &TerminalStatus,
    ) -> Result<(), AnalyzeError> {
        let outputs = if status.is_success() {
            self.job_outputs(handle)?
        } else {
            None
        };
        let record = OutcomeRecord {
            schema_version: OUTCOME_RECORD_SCHEMA_VERSION.to_string(),
            run_id: self.run_id.clone(),
            handle: handle.clone(),
            combination_index: combination.index,
            values: combination.values.clone(),
            status: status.clone(),
            outputs,
            recorded_at: Utc::now().to_rfc3339(),
        };
        let key = outcome_object_key(&self.prefix, &self.run_id, status.label(), handle);
        write_json(self.store, &key, &record)
            .map_err(|error| AnalyzeError::new(format!("failed to record outcome: {error}")))?;

        let mut tally = self.tally.lock().unwrap_or_else(PoisonError::into_inner);
        tally.analyzed += 1;
        if !status.is_success() {
            tally.failed += 1;
        }
        self.progress.inc(1);
        info!(handle = %handle, key = %key, "Recorded outcome");
        Ok(())
    }

    fn should_proceed(&self) -> bool {
        let failed = self.tally.lock().unwrap_or_else(PoisonError::into_inner).failed;
        match self.max_failures {
            Some(limit) if failed >= limit => {
                warn!(failed, limit, "Failure limit reached; no further batches");
                false
            }
            _ => true,
        }
    }
}
