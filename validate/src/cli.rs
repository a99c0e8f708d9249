//! `validate` command implementation.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::{ConfigOverrides, DEFAULT_CONFIG_FILE, apply_overrides, load_config};
use crate::exit_codes;
use crate::report::run_batch;
use crate::task::select_tasks;
use crate::trial::CommandTrialRunner;

/// Everything the command line can set.
#[derive(Debug, Clone, Default)]
pub struct ValidateArgs {
    /// Task names, `all`, or empty.
    pub tasks: Vec<String>,
    /// Config file; defaults to `validate.toml` in the working directory.
    pub config: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

/// Validate the selected tasks and return the process exit code.
pub fn run_validate(working_dir: &Path, args: &ValidateArgs) -> Result<i32> {
    let config_path = working_dir.join(
        args.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE)),
    );
    let cfg = load_config(&config_path).context("load config")?;
    let cfg = apply_overrides(cfg, &args.overrides)
        .with_context(|| format!("invalid config {}", config_path.display()))?
        .resolve_paths(working_dir);
    debug!(?cfg, "config resolved");

    let task_names = select_tasks(&cfg.tasks_root, &args.tasks).context("select tasks")?;
    info!(tasks = task_names.len(), runs = cfg.runs, "starting validation");
    println!(
        "validate: tasks={} runs={} command={}",
        task_names.len(),
        cfg.runs,
        cfg.test_command.join(" ")
    );

    let runner = CommandTrialRunner::from_config(&cfg);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let outcome = run_batch(
        &cfg.tasks_root,
        &task_names,
        cfg.runs,
        &runner,
        &cfg.report_path,
        &mut out,
    )?;

    if outcome.summary.inconsistent > 0 {
        Ok(exit_codes::INCONSISTENT)
    } else {
        Ok(exit_codes::OK)
    }
}
