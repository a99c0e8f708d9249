//! Task selection and evaluation records.
//!
//! A task is a directory named `task-*` under the tasks root. Its previous
//! evaluation outcome lives in `evaluation-result.json` inside that directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Directory-name prefix that marks a task.
pub const TASK_PREFIX: &str = "task-";
/// Token that selects every task.
pub const ALL_TOKEN: &str = "all";
/// Evaluation record written by the evaluation step.
pub const EVALUATION_FILE: &str = "evaluation-result.json";

/// Stored outcome of the earlier evaluation. Other fields are ignored.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct EvaluationResult {
    pub passed: bool,
}

/// A selected task and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub name: String,
    pub dir: PathBuf,
}

impl TaskRef {
    pub fn new(tasks_root: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            dir: tasks_root.join(name),
        }
    }

    pub fn evaluation_path(&self) -> PathBuf {
        self.dir.join(EVALUATION_FILE)
    }
}

/// Resolve command-line arguments into an ordered list of task names.
///
/// No arguments, or the single token `all`, selects every `task-*` directory
/// under `tasks_root`, sorted by name. Anything else is taken verbatim, in
/// order; names that do not exist surface later as skipped tasks.
pub fn select_tasks(tasks_root: &Path, args: &[String]) -> Result<Vec<String>> {
    if args.is_empty() || (args.len() == 1 && args[0] == ALL_TOKEN) {
        return discover_tasks(tasks_root);
    }
    Ok(args.to_vec())
}

/// List every `task-*` directory under `tasks_root`, sorted by name.
pub fn discover_tasks(tasks_root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(tasks_root)
        .with_context(|| format!("read tasks root {}", tasks_root.display()))?
    {
        let entry = entry.context("read task entry")?;
        if !entry.path().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with(TASK_PREFIX) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Read a task's evaluation record.
///
/// Returns `Ok(None)` when the record does not exist.
pub fn load_evaluation(task: &TaskRef) -> Result<Option<EvaluationResult>> {
    let path = task.evaluation_path();
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let evaluation: EvaluationResult =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(evaluation))
}
