//! Test-only fixtures: a scratch tasks root and a scripted trial runner.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::snapshot::{BACKUP_PREFIX, SOURCE_DIR};
use crate::task::{EVALUATION_FILE, TaskRef};
use crate::trial::{TIMEOUT_MESSAGE, TrialOutcome, TrialRunner, TrialStatus};

/// Temporary tasks root populated with `task-*` directories.
pub struct TestTasks {
    temp: TempDir,
}

impl TestTasks {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir().context("create tempdir")?,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Create a task with the given `src/` files.
    ///
    /// `passed = None` leaves out `evaluation-result.json`.
    pub fn add_task(
        &self,
        name: &str,
        passed: Option<bool>,
        files: &[(&str, &str)],
    ) -> Result<TaskRef> {
        let task = TaskRef::new(self.root(), name);
        let src = task.dir.join(SOURCE_DIR);
        fs::create_dir_all(&src).with_context(|| format!("create {}", src.display()))?;
        for (rel, contents) in files {
            let path = src.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        if let Some(passed) = passed {
            fs::write(
                task.dir.join(EVALUATION_FILE),
                format!("{{\n  \"passed\": {passed}\n}}\n"),
            )
            .context("write evaluation record")?;
        }
        Ok(task)
    }

    pub fn read_src(&self, name: &str, rel: &str) -> Result<String> {
        let path = self.root().join(name).join(SOURCE_DIR).join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Snapshot backup directories currently present in a task.
    pub fn backup_dirs(&self, name: &str) -> Result<Vec<PathBuf>> {
        backup_dirs_in(&self.root().join(name))
    }
}

fn backup_dirs_in(task_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(task_dir).with_context(|| format!("read {}", task_dir.display()))? {
        let entry = entry.context("read entry")?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(BACKUP_PREFIX) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

/// What a scripted trial reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedTrial {
    Exit(i32),
    Timeout,
    SpawnError,
}

/// State of `src/` seen at the start of a trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub task: String,
    pub attempt: u32,
    /// Sorted relative paths, `/`-separated.
    pub src_files: Vec<String>,
}

/// Trial runner that replays a fixed queue of outcomes.
///
/// Optionally damages `src/` (or the snapshot backup) during each trial so
/// tests can check what the next trial sees.
#[derive(Debug, Default)]
pub struct ScriptedTrialRunner {
    script: RefCell<VecDeque<ScriptedTrial>>,
    observations: RefCell<Vec<Observation>>,
    vandalize: bool,
    remove_backups: bool,
}

impl ScriptedTrialRunner {
    pub fn new(script: Vec<ScriptedTrial>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            ..Self::default()
        }
    }

    /// Delete every `src/` file and add `src/stray.txt` during each trial.
    pub fn vandalizing(mut self) -> Self {
        self.vandalize = true;
        self
    }

    /// Delete the snapshot backup during each trial so the restore fails.
    pub fn removing_backups(mut self) -> Self {
        self.remove_backups = true;
        self
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.observations.borrow().clone()
    }

    fn damage(&self, task_dir: &Path) -> Result<()> {
        let src = task_dir.join(SOURCE_DIR);
        if self.vandalize && src.exists() {
            fs::remove_dir_all(&src).with_context(|| format!("remove {}", src.display()))?;
            fs::create_dir_all(&src).with_context(|| format!("create {}", src.display()))?;
            fs::write(src.join("stray.txt"), "left behind").context("write stray file")?;
        }
        if self.remove_backups {
            for dir in backup_dirs_in(task_dir)? {
                fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
            }
        }
        Ok(())
    }
}

impl TrialRunner for ScriptedTrialRunner {
    fn run(&self, task_name: &str, task_dir: &Path, attempt: u32) -> TrialOutcome {
        self.observations.borrow_mut().push(Observation {
            task: task_name.to_string(),
            attempt,
            src_files: list_files(&task_dir.join(SOURCE_DIR)),
        });

        let damage = self.damage(task_dir);
        let step = self.script.borrow_mut().pop_front();
        let (status, exit_code, error_message) = match (damage, step) {
            (Err(err), _) => (TrialStatus::Error, None, Some(format!("{err:#}"))),
            (Ok(()), None) => (TrialStatus::Error, None, Some("script exhausted".to_string())),
            (Ok(()), Some(ScriptedTrial::Exit(0))) => (TrialStatus::Passed, Some(0), None),
            (Ok(()), Some(ScriptedTrial::Exit(code))) => (TrialStatus::Failed, Some(code), None),
            (Ok(()), Some(ScriptedTrial::Timeout)) => {
                (TrialStatus::TimedOut, None, Some(TIMEOUT_MESSAGE.to_string()))
            }
            (Ok(()), Some(ScriptedTrial::SpawnError)) => (
                TrialStatus::Error,
                None,
                Some("spawn command: not found".to_string()),
            ),
        };
        TrialOutcome {
            attempt_index: attempt,
            status,
            exit_code,
            error_message,
            duration_secs: 0.0,
        }
    }
}

/// Sorted, `/`-separated relative paths of every file under `root`.
pub fn list_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    collect_files(root, "", &mut files);
    files.sort();
    files
}

fn collect_files(dir: &Path, prefix: &str, files: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        if entry.path().is_dir() {
            collect_files(&entry.path(), &rel, files);
        } else {
            files.push(rel);
        }
    }
}
