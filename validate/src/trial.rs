//! A single execution of a task's test command.
//!
//! Trials never fail with an error: a nonzero exit, a timeout, or a command
//! that cannot be started are all recorded as a [`TrialOutcome`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::HarnessConfig;
use crate::process::{CommandOutput, run_command_with_timeout};

/// Environment variable carrying the 1-based attempt number.
pub const ATTEMPT_ENV: &str = "VALIDATE_ATTEMPT";
/// `error_message` recorded when a trial is killed for running too long.
pub const TIMEOUT_MESSAGE: &str = "timeout";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// Exited with code 0.
    Passed,
    /// Exited with a nonzero code or was killed by a signal.
    Failed,
    /// Killed after exceeding the trial timeout.
    TimedOut,
    /// The command could not be run at all.
    Error,
}

/// Recorded result of one attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrialOutcome {
    pub attempt_index: u32,
    pub status: TrialStatus,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_secs: f64,
}

impl TrialOutcome {
    pub fn passed(&self) -> bool {
        self.status == TrialStatus::Passed
    }
}

pub trait TrialRunner {
    /// Run the test suite for the task at `task_dir`. `attempt` is 1-based.
    fn run(&self, task_name: &str, task_dir: &Path, attempt: u32) -> TrialOutcome;
}

/// Runs the configured test command as a child process.
#[derive(Debug, Clone)]
pub struct CommandTrialRunner {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub logs_dir: Option<PathBuf>,
}

impl CommandTrialRunner {
    pub fn from_config(cfg: &HarnessConfig) -> Self {
        Self {
            command: cfg.test_command.clone(),
            env: cfg.env.clone(),
            timeout: cfg.trial_timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
            logs_dir: cfg.logs_dir.clone(),
        }
    }

    fn build_command(&self, task_dir: &Path, attempt: u32) -> Result<Command> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("test command is empty");
        };
        let mut command = Command::new(program);
        command.args(args).current_dir(task_dir);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command.env(ATTEMPT_ENV, attempt.to_string());
        Ok(command)
    }

    fn write_log(&self, task_name: &str, attempt: u32, output: &CommandOutput) -> Result<()> {
        let Some(logs_dir) = &self.logs_dir else {
            return Ok(());
        };
        let path = attempt_log_path(logs_dir, task_name, attempt);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        fs::write(&path, output.render_log())
            .with_context(|| format!("write trial log {}", path.display()))?;
        Ok(())
    }
}

impl TrialRunner for CommandTrialRunner {
    #[instrument(skip_all, fields(task = task_name, attempt = attempt))]
    fn run(&self, task_name: &str, task_dir: &Path, attempt: u32) -> TrialOutcome {
        let started = Instant::now();
        let result = self.build_command(task_dir, attempt).and_then(|command| {
            run_command_with_timeout(command, self.timeout, self.output_limit_bytes)
        });
        let duration_secs = started.elapsed().as_millis() as f64 / 1000.0;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                return TrialOutcome {
                    attempt_index: attempt,
                    status: TrialStatus::Error,
                    exit_code: None,
                    error_message: Some(format!("{err:#}")),
                    duration_secs,
                };
            }
        };

        if let Err(err) = self.write_log(task_name, attempt, &output) {
            warn!(err = %format!("{err:#}"), "failed to write trial log");
        }

        let outcome = classify_output(attempt, &output, duration_secs);
        debug!(status = ?outcome.status, exit_code = ?outcome.exit_code, "trial finished");
        outcome
    }
}

/// Map a finished child process onto a trial outcome.
pub fn classify_output(attempt: u32, output: &CommandOutput, duration_secs: f64) -> TrialOutcome {
    let exit_code = output.status.code();
    let (status, error_message) = if output.timed_out {
        (TrialStatus::TimedOut, Some(TIMEOUT_MESSAGE.to_string()))
    } else if output.status.success() {
        (TrialStatus::Passed, None)
    } else {
        (TrialStatus::Failed, None)
    };
    TrialOutcome {
        attempt_index: attempt,
        status,
        exit_code: if output.timed_out { None } else { exit_code },
        error_message,
        duration_secs,
    }
}

pub fn attempt_log_path(logs_dir: &Path, task_name: &str, attempt: u32) -> PathBuf {
    logs_dir
        .join(task_name)
        .join(format!("attempt-{attempt}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn runner(script: &str, logs_dir: Option<PathBuf>) -> CommandTrialRunner {
        CommandTrialRunner {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: BTreeMap::from([("TASK_FLAVOR".to_string(), "ci".to_string())]),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
            logs_dir,
        }
    }

    #[test]
    fn attempt_log_path_is_stable() {
        let path = attempt_log_path(Path::new("/logs"), "task-001", 2);
        assert_eq!(path, PathBuf::from("/logs/task-001/attempt-2.log"));
    }

    #[test]
    fn missing_binary_is_an_error_outcome() {
        let temp = tempdir().expect("tempdir");
        let runner = CommandTrialRunner {
            command: vec!["/no/such/test-runner".to_string()],
            env: BTreeMap::new(),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 100,
            logs_dir: None,
        };
        let outcome = runner.run("task-001", temp.path(), 1);
        assert_eq!(outcome.status, TrialStatus::Error);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.error_message.is_some());
        assert!(!outcome.passed());
    }

    #[cfg(unix)]
    #[test]
    fn zero_exit_passes_and_nonzero_fails() {
        let temp = tempdir().expect("tempdir");
        let pass = runner("exit 0", None).run("task-001", temp.path(), 1);
        assert_eq!(pass.status, TrialStatus::Passed);
        assert_eq!(pass.exit_code, Some(0));
        assert!(pass.passed());

        let fail = runner("exit 3", None).run("task-001", temp.path(), 2);
        assert_eq!(fail.status, TrialStatus::Failed);
        assert_eq!(fail.exit_code, Some(3));
        assert_eq!(fail.attempt_index, 2);
        assert_eq!(fail.error_message, None);
    }

    #[cfg(unix)]
    #[test]
    fn runs_in_task_dir_with_attempt_env_and_writes_log() {
        let temp = tempdir().expect("tempdir");
        let task_dir = temp.path().join("task-001");
        fs::create_dir_all(&task_dir).expect("task dir");
        fs::write(task_dir.join("marker"), "").expect("marker");
        let logs = temp.path().join("logs");

        let outcome = runner(
            "test -f marker && echo \"attempt=$VALIDATE_ATTEMPT flavor=$TASK_FLAVOR\"",
            Some(logs.clone()),
        )
        .run("task-001", &task_dir, 3);
        assert!(outcome.passed());

        let log = fs::read_to_string(attempt_log_path(&logs, "task-001", 3)).expect("log");
        assert!(log.contains("attempt=3 flavor=ci"));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_is_recorded_with_marker() {
        let temp = tempdir().expect("tempdir");
        let mut slow = runner("exec sleep 30", None);
        slow.timeout = Duration::from_millis(200);

        let outcome = slow.run("task-001", temp.path(), 1);
        assert_eq!(outcome.status, TrialStatus::TimedOut);
        assert_eq!(outcome.error_message.as_deref(), Some(TIMEOUT_MESSAGE));
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.duration_secs < 30.0);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_bounds_trial_when_hang_is_in_a_subprocess() {
        let temp = tempdir().expect("tempdir");
        let mut slow = runner("sleep 8; exit 0", None);
        slow.timeout = Duration::from_millis(500);

        let outcome = slow.run("task-001", temp.path(), 1);
        assert_eq!(outcome.status, TrialStatus::TimedOut);
        assert!(outcome.duration_secs < 3.0, "took {}s", outcome.duration_secs);
    }

    #[test]
    fn outcome_serializes_camel_case() {
        let outcome = TrialOutcome {
            attempt_index: 1,
            status: TrialStatus::TimedOut,
            exit_code: None,
            error_message: Some(TIMEOUT_MESSAGE.to_string()),
            duration_secs: 1.5,
        };
        let json = serde_json::to_value(&outcome).expect("json");
        assert_eq!(json["attemptIndex"], 1);
        assert_eq!(json["status"], "timed_out");
        assert_eq!(json["errorMessage"], "timeout");
        assert!(json["exitCode"].is_null());
    }
}
