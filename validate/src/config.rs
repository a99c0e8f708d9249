//! Harness configuration loaded from `validate.toml`.
//!
//! Every field has a default, so the file is optional. Command-line flags are
//! layered on top with [`apply_overrides`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "validate.toml";
pub const DEFAULT_REPORT_FILE: &str = "validation-results.json";

/// Harness configuration (TOML).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Trials per task.
    pub runs: u32,

    /// Wall-clock budget for a single trial, in seconds.
    pub trial_timeout_secs: u64,

    /// Keep at most this many bytes of stdout (and of stderr) per trial.
    pub output_limit_bytes: usize,

    /// Directory holding the `task-*` directories.
    pub tasks_root: PathBuf,

    /// Where the JSON report is written.
    pub report_path: PathBuf,

    /// Per-attempt output logs go to `<logs_dir>/<task>/attempt-<n>.log`.
    pub logs_dir: Option<PathBuf>,

    /// Command that runs a task's test suite, executed inside the task dir.
    pub test_command: Vec<String>,

    /// Extra environment for the test command.
    pub env: BTreeMap<String, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            runs: 3,
            trial_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            tasks_root: PathBuf::from("."),
            report_path: PathBuf::from(DEFAULT_REPORT_FILE),
            logs_dir: None,
            test_command: vec!["npm".to_string(), "test".to_string()],
            env: BTreeMap::new(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.runs == 0 {
            return Err(anyhow!("runs must be > 0"));
        }
        if self.trial_timeout_secs == 0 {
            return Err(anyhow!("trial_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.test_command.is_empty() || self.test_command[0].trim().is_empty() {
            return Err(anyhow!("test_command must be a non-empty array"));
        }
        for key in self.env.keys() {
            if key.trim().is_empty() {
                return Err(anyhow!("env key must be non-empty"));
            }
        }
        Ok(())
    }

    pub fn trial_timeout(&self) -> Duration {
        Duration::from_secs(self.trial_timeout_secs)
    }

    /// Anchor relative paths at `base` (usually the working directory).
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        self.tasks_root = base.join(&self.tasks_root);
        self.report_path = base.join(&self.report_path);
        self.logs_dir = self.logs_dir.map(|dir| base.join(dir));
        self
    }
}

/// Values supplied on the command line. `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub runs: Option<u32>,
    pub trial_timeout_secs: Option<u64>,
    pub tasks_root: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config file missing, using defaults");
        return Ok(HarnessConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

/// Apply command-line overrides to a loaded config and validate the result.
pub fn apply_overrides(
    mut base: HarnessConfig,
    overrides: &ConfigOverrides,
) -> Result<HarnessConfig> {
    if let Some(runs) = overrides.runs {
        base.runs = runs;
    }
    if let Some(timeout) = overrides.trial_timeout_secs {
        base.trial_timeout_secs = timeout;
    }
    if let Some(tasks_root) = &overrides.tasks_root {
        base.tasks_root = tasks_root.clone();
    }
    if let Some(report_path) = &overrides.report_path {
        base.report_path = report_path.clone();
    }
    if let Some(logs_dir) = &overrides.logs_dir {
        base.logs_dir = Some(logs_dir.clone());
    }
    base.validate()?;
    Ok(base)
}
