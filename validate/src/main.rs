//! Re-run previously passing benchmark tasks to detect flaky passes.
//!
//! Each selected `task-*` directory whose `evaluation-result.json` records a
//! pass has its test command executed several times, with `src/` restored
//! between runs. Results go to `validation-results.json`.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use validate::cli::{ValidateArgs, run_validate};
use validate::config::ConfigOverrides;
use validate::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "validate",
    version,
    about = "Re-run passed tasks to confirm their results are not flaky"
)]
struct Cli {
    /// Task names to validate, or `all` (the default) for every `task-*` dir.
    tasks: Vec<String>,

    /// Trials per task.
    #[arg(long)]
    runs: Option<u32>,

    /// Per-trial timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Directory containing the task directories.
    #[arg(long)]
    tasks_root: Option<PathBuf>,

    /// Report output path.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write each attempt's output under this directory.
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// Config file (default: `validate.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn into_args(self) -> ValidateArgs {
        ValidateArgs {
            tasks: self.tasks,
            config: self.config,
            overrides: ConfigOverrides {
                runs: self.runs,
                trial_timeout_secs: self.timeout_secs,
                tasks_root: self.tasks_root,
                report_path: self.report,
                logs_dir: self.logs_dir,
            },
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let working_dir = std::env::current_dir()?;
    run_validate(&working_dir, &cli.into_args())
}
