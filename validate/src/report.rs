//! Batch orchestration, console progress, and the JSON report.
//!
//! The report is rewritten atomically after every validated task, so a crash
//! mid-batch keeps the results of the tasks that already finished. The last
//! write holds the complete list.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::task::TaskRef;
use crate::trial::TrialRunner;
use crate::validator::{SkipReason, TaskVerdict, ValidationResult, validate_task};

/// Tallies for a batch. Skipped tasks are excluded from the percentage.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub validated: usize,
    pub inconsistent: usize,
    pub skipped: usize,
    pub skipped_tasks: Vec<(String, SkipReason)>,
}

impl RunSummary {
    pub fn record(&mut self, task_name: &str, verdict: &TaskVerdict) {
        match verdict {
            TaskVerdict::Validated(result) if result.validated => self.validated += 1,
            TaskVerdict::Validated(_) => self.inconsistent += 1,
            TaskVerdict::Skipped { reason, .. } => {
                self.skipped += 1;
                self.skipped_tasks.push((task_name.to_string(), *reason));
            }
        }
    }

    pub fn consistency_percentage(&self) -> f64 {
        consistency_percentage(self.validated, self.inconsistent)
    }
}

/// `validated / (validated + inconsistent) * 100`, one decimal place; `0` for
/// an empty denominator.
pub fn consistency_percentage(validated: usize, inconsistent: usize) -> f64 {
    let denominator = validated + inconsistent;
    if denominator == 0 {
        return 0.0;
    }
    let ratio = validated as f64 / denominator as f64 * 100.0;
    (ratio * 10.0).round() / 10.0
}

/// Results and tallies of a finished batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<ValidationResult>,
    pub summary: RunSummary,
}

/// Validate `task_names` one after another and write the report.
///
/// Progress and the summary block go to `out`. Only report serialization,
/// report writes, and writes to `out` can fail the batch.
#[instrument(skip_all, fields(tasks = task_names.len(), runs = runs))]
pub fn run_batch<R: TrialRunner + ?Sized, W: Write>(
    tasks_root: &Path,
    task_names: &[String],
    runs: u32,
    runner: &R,
    report_path: &Path,
    out: &mut W,
) -> Result<BatchOutcome> {
    let mut results = Vec::new();
    let mut summary = RunSummary::default();

    for name in task_names {
        let task = TaskRef::new(tasks_root, name);
        writeln!(out, "validate: task={name} starting runs={runs}")?;
        let verdict = validate_task(&task, runs, runner);
        writeln!(out, "{}", result_line(name, &verdict))?;
        summary.record(name, &verdict);
        if let TaskVerdict::Validated(result) = verdict {
            results.push(result);
            write_report(report_path, &results)?;
        }
    }

    write_report(report_path, &results)?;
    write_summary(out, &summary, report_path)?;
    Ok(BatchOutcome { results, summary })
}

fn result_line(name: &str, verdict: &TaskVerdict) -> String {
    match verdict {
        TaskVerdict::Validated(result) => format!(
            "validate: task={} {} attempts={} failures={}",
            name,
            if result.validated {
                "validated"
            } else {
                "inconsistent"
            },
            result.attempts,
            result.failures
        ),
        TaskVerdict::Skipped {
            reason,
            detail: Some(detail),
        } => format!("validate: task={name} skipped reason={reason} detail={detail}"),
        TaskVerdict::Skipped {
            reason,
            detail: None,
        } => format!("validate: task={name} skipped reason={reason}"),
    }
}

fn write_summary<W: Write>(out: &mut W, summary: &RunSummary, report_path: &Path) -> Result<()> {
    writeln!(
        out,
        "summary: validated={} inconsistent={} skipped={}",
        summary.validated, summary.inconsistent, summary.skipped
    )?;
    for (name, reason) in &summary.skipped_tasks {
        writeln!(out, "summary: skipped {name} ({reason})")?;
    }
    writeln!(
        out,
        "summary: consistency={:.1}%",
        summary.consistency_percentage()
    )?;
    writeln!(out, "summary: report={}", report_path.display())?;
    Ok(())
}

/// Atomically write the report (temp file + rename).
pub fn write_report(path: &Path, results: &[ValidationResult]) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(results).context("serialize report")?;
    buf.push('\n');
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp report {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace report {}", path.display()))?;
    debug!(path = %path.display(), entries = results.len(), "report written");
    Ok(())
}
