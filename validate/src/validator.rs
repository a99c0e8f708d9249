//! Per-task validation: load, snapshot, trial loop, aggregate, cleanup.
//!
//! Nothing in here returns an error. Every failure local to a task becomes
//! either a trial failure or a [`SkipReason`], so one broken task never stops
//! the batch.

use std::fmt;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::snapshot::SnapshotHandle;
use crate::task::{TaskRef, load_evaluation};
use crate::trial::{TrialOutcome, TrialRunner};

/// Consistency record for one task, as written to the report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub task_name: String,
    pub original_passed: bool,
    /// True iff every trial passed.
    pub validated: bool,
    pub attempts: u32,
    pub failures: u32,
    /// Same value as `validated`; kept for readers of older reports.
    pub consistent: bool,
    /// RFC 3339, taken when the last trial finished.
    pub timestamp: String,
    pub duration_secs: f64,
    /// SHA-256 over the snapshot manifest of `src/`.
    pub source_digest: String,
    pub trials: Vec<TrialOutcome>,
}

impl ValidationResult {
    pub fn from_trials(
        task_name: &str,
        original_passed: bool,
        source_digest: String,
        duration_secs: f64,
        trials: Vec<TrialOutcome>,
    ) -> Self {
        let failures = trials.iter().filter(|trial| !trial.passed()).count() as u32;
        let validated = failures == 0;
        Self {
            task_name: task_name.to_string(),
            original_passed,
            validated,
            attempts: trials.len() as u32,
            failures,
            consistent: validated,
            timestamp: Utc::now().to_rfc3339(),
            duration_secs,
            source_digest,
            trials,
        }
    }
}

/// Why a task produced no [`ValidationResult`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No readable `evaluation-result.json`.
    NoEvaluation,
    /// The earlier evaluation did not pass, so there is nothing to confirm.
    OriginallyFailed,
    /// `src/` could not be backed up.
    SnapshotError,
    /// `src/` could not be put back after a trial.
    RestoreError,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NoEvaluation => "no_evaluation",
            SkipReason::OriginallyFailed => "originally_failed",
            SkipReason::SnapshotError => "snapshot_error",
            SkipReason::RestoreError => "restore_error",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskVerdict {
    Validated(ValidationResult),
    Skipped {
        reason: SkipReason,
        detail: Option<String>,
    },
}

impl TaskVerdict {
    fn skipped(reason: SkipReason, detail: Option<String>) -> Self {
        TaskVerdict::Skipped { reason, detail }
    }
}

/// Validate one task end-to-end with `runs` sequential trials.
///
/// `src/` is restored after every trial whatever its outcome, and the
/// snapshot backup is always removed before this returns.
#[instrument(skip_all, fields(task = %task.name, runs = runs))]
pub fn validate_task<R: TrialRunner + ?Sized>(task: &TaskRef, runs: u32, runner: &R) -> TaskVerdict {
    let evaluation = match load_evaluation(task) {
        Ok(Some(evaluation)) => evaluation,
        Ok(None) => {
            debug!("no evaluation record");
            return TaskVerdict::skipped(SkipReason::NoEvaluation, None);
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "unreadable evaluation record");
            return TaskVerdict::skipped(SkipReason::NoEvaluation, Some(format!("{err:#}")));
        }
    };
    if !evaluation.passed {
        debug!("originally failed");
        return TaskVerdict::skipped(SkipReason::OriginallyFailed, None);
    }

    let started = Instant::now();
    let snapshot = match SnapshotHandle::snapshot(&task.dir) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "snapshot failed");
            return TaskVerdict::skipped(SkipReason::SnapshotError, Some(format!("{err:#}")));
        }
    };
    let source_digest = snapshot.digest();

    let trials = run_trials(task, runs, runner, &snapshot);

    if let Err(err) = snapshot.discard() {
        warn!(err = %format!("{err:#}"), "failed to discard snapshot");
    }

    let trials = match trials {
        Ok(trials) => trials,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "restore failed");
            return TaskVerdict::skipped(SkipReason::RestoreError, Some(format!("{err:#}")));
        }
    };

    let duration_secs = started.elapsed().as_millis() as f64 / 1000.0;
    let result = ValidationResult::from_trials(
        &task.name,
        evaluation.passed,
        source_digest,
        duration_secs,
        trials,
    );
    info!(
        validated = result.validated,
        failures = result.failures,
        attempts = result.attempts,
        "task validated"
    );
    TaskVerdict::Validated(result)
}

fn run_trials<R: TrialRunner + ?Sized>(
    task: &TaskRef,
    runs: u32,
    runner: &R,
    snapshot: &SnapshotHandle,
) -> Result<Vec<TrialOutcome>> {
    let mut trials = Vec::with_capacity(runs as usize);
    for attempt in 1..=runs {
        let outcome = runner.run(&task.name, &task.dir, attempt);
        debug!(attempt, status = ?outcome.status, "trial recorded");
        trials.push(outcome);
        snapshot
            .restore()
            .with_context(|| format!("restore after attempt {attempt}"))?;
    }
    Ok(trials)
}
