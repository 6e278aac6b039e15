//! Trodes Timefix - device-to-wall-clock correction for continuous time files
//!
//! This tool fixes the correspondence between the Trodes device sample counter
//! (`trodestime`) and wall-clock time (`systime`) in extracted
//! `*.continuoustime.dat` files, rewriting each file in place.
//!
//! # Features
//!
//! - Per-chunk linear regression of jittered sysclock observations
//! - Wall-clock synthesis from the creation anchor for recordings without
//!   sysclock packets
//! - Batch mode: one OS process per file, bounded by `--jobs`
//! - Per-file success/failure reporting; one bad file never aborts the batch
//! - Optional JSON job report for pipeline provenance
//!
//! # Usage
//!
//! ```bash
//! # Fix a single file in place
//! trodes-timefix 20240315_rat1_01.continuoustime.dat
//!
//! # Fix a whole session, two conversions at a time
//! trodes-timefix *.continuoustime.dat --jobs 2
//!
//! # Synthesize a wall-clock column into a new file (source untouched)
//! trodes-timefix old_recording.continuoustime.dat --infer-to with_systime.continuoustime.dat
//!
//! # Keep a machine-readable record of the run
//! trodes-timefix *.continuoustime.dat --report timefix_report.json
//! ```
//!
//! # Output
//!
//! For each corrected file with sysclock observations, two columns are
//! appended: `time_chunk_label` (contiguous-counter chunk index) and
//! `adjusted_systime` (regressed wall-clock nanoseconds). Files without a
//! `systime` column gain one synthesized from `system_time_at_creation` and
//! `clockrate`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

use trodes_extract_toolbox::cli::Args;
use trodes_extract_toolbox::sync::{FixSummary, add_system_time_to_file, fix_timestamp_lag};

/// Outcome of one file's conversion
enum Outcome {
    Fixed(FixSummary),
    ChildExited { code: Option<i32>, success: bool },
    Failed(String),
}

struct JobResult {
    file: PathBuf,
    outcome: Outcome,
}

impl JobResult {
    fn succeeded(&self) -> bool {
        match &self.outcome {
            Outcome::Fixed(_) => true,
            Outcome::ChildExited { success, .. } => *success,
            Outcome::Failed(_) => false,
        }
    }
}

fn log_with_time(message: &str, start_time: Instant) {
    let elapsed = start_time.elapsed();
    let total_millis = elapsed.as_millis();
    let seconds = (total_millis / 1000) % 60;
    let minutes = (total_millis / 60000) % 60;
    let millis = total_millis % 1000;
    println!("[+{:02}:{:02}.{:03}] {}", minutes, seconds, millis, message);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    // Child mode: convert exactly one file, success signalled via exit status
    if args.child {
        let file = args
            .files
            .first()
            .context("child mode requires exactly one file")?;
        let summary = fix_timestamp_lag(file)?;
        println!(
            "STATUS FIXED {} ({} records, {} chunks)",
            summary.path.display(),
            summary.n_records,
            summary.n_chunks
        );
        return Ok(());
    }

    if !args.quiet {
        trodes_extract_toolbox::display_license_notice("trodes-timefix");
        println!("╔════════════════════════════════════════════════════════════════╗");
        println!("║              Trodes Timestamp Correction Tool                  ║");
        println!("╚════════════════════════════════════════════════════════════════╝");
        println!();
        println!("Files: {}", args.files.len());
        println!("Jobs: {}", args.jobs);
        println!();
    }

    let started_at = chrono::Utc::now().to_rfc3339();

    if let Some(dst) = &args.infer_to {
        anyhow::ensure!(
            args.files.len() == 1,
            "--infer-to takes exactly one input file, got {}",
            args.files.len()
        );
        let summary = add_system_time_to_file(&args.files[0], dst)?;
        println!(
            "Synthesized {} wall-clock samples into {}",
            summary.n_records,
            summary.path.display()
        );
        return Ok(());
    }

    let start_time = Instant::now();
    let results = if args.jobs <= 1 || args.files.len() == 1 {
        run_in_process(&args.files, start_time, args.quiet)
    } else {
        run_as_child_processes(&args, start_time)?
    };

    let succeeded = results.iter().filter(|r| r.succeeded()).count();
    let failed = results.len() - succeeded;

    if !args.quiet {
        println!();
        println!("Conversion complete: {} succeeded, {} failed", succeeded, failed);
        for result in results.iter().filter(|r| !r.succeeded()) {
            match &result.outcome {
                Outcome::Failed(reason) => {
                    println!("\tFAILED {}: {}", result.file.display(), reason)
                }
                Outcome::ChildExited { code, .. } => println!(
                    "\tFAILED {}: child exited with {:?}",
                    result.file.display(),
                    code
                ),
                Outcome::Fixed(_) => unreachable!(),
            }
        }
    }

    if let Some(report_path) = &args.report {
        write_report(report_path, &args, &started_at, &results)?;
        if !args.quiet {
            println!("Report written to {}", report_path.display());
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} files failed", failed, results.len());
    }
    Ok(())
}

/// Convert files one after another inside this process
fn run_in_process(files: &[PathBuf], start_time: Instant, quiet: bool) -> Vec<JobResult> {
    let mut results = Vec::with_capacity(files.len());
    for file in files {
        let outcome = match fix_timestamp_lag(file) {
            Ok(summary) => {
                if !quiet {
                    log_with_time(
                        &format!(
                            "Fixed {} ({} records, {} chunks, {:?})",
                            summary.path.display(),
                            summary.n_records,
                            summary.n_chunks,
                            summary.mode
                        ),
                        start_time,
                    );
                }
                Outcome::Fixed(summary)
            }
            Err(e) => {
                log_with_time(&format!("FAILED {}: {:#}", file.display(), e), start_time);
                Outcome::Failed(format!("{:#}", e))
            }
        };
        results.push(JobResult {
            file: file.clone(),
            outcome,
        });
    }
    results
}

/// Convert files in child processes, at most `jobs` running at once.
///
/// Each child is this same executable in `--child` mode; children share no
/// state, and one child's failure only marks its own file.
fn run_as_child_processes(args: &Args, start_time: Instant) -> Result<Vec<JobResult>> {
    let exe = std::env::current_exe().context("failed to locate own executable")?;
    let mut pending: VecDeque<&PathBuf> = args.files.iter().collect();
    let mut active: Vec<(PathBuf, Child)> = Vec::new();
    let mut results = Vec::with_capacity(args.files.len());

    while !pending.is_empty() || !active.is_empty() {
        while active.len() < args.jobs {
            let Some(file) = pending.pop_front() else {
                break;
            };
            let child = spawn_fix_child(&exe, file)?;
            if !args.quiet {
                log_with_time(&format!("Started job for {}", file.display()), start_time);
            }
            active.push((file.clone(), child));
        }

        let mut still_active = Vec::with_capacity(active.len());
        for (file, mut child) in active {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if !args.quiet {
                        log_with_time(
                            &format!("Job for {} exited: {}", file.display(), status),
                            start_time,
                        );
                    }
                    results.push(JobResult {
                        file,
                        outcome: Outcome::ChildExited {
                            code: status.code(),
                            success: status.success(),
                        },
                    });
                }
                Ok(None) => still_active.push((file, child)),
                Err(e) => {
                    results.push(JobResult {
                        file,
                        outcome: Outcome::Failed(format!("failed to poll child: {}", e)),
                    });
                }
            }
        }
        active = still_active;

        if !active.is_empty() {
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    Ok(results)
}

fn spawn_fix_child(exe: &Path, file: &Path) -> Result<Child> {
    Command::new(exe)
        .arg("--child")
        .arg("--quiet")
        .arg(file)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .context(format!("failed to spawn job for {}", file.display()))
}

fn write_report(
    report_path: &Path,
    args: &Args,
    started_at: &str,
    results: &[JobResult],
) -> Result<()> {
    let entries: Vec<serde_json::Value> = results
        .iter()
        .map(|result| match &result.outcome {
            Outcome::Fixed(summary) => json!({
                "file": result.file.display().to_string(),
                "ok": true,
                "summary": summary,
            }),
            Outcome::ChildExited { code, success } => json!({
                "file": result.file.display().to_string(),
                "ok": success,
                "exit_code": code,
            }),
            Outcome::Failed(reason) => json!({
                "file": result.file.display().to_string(),
                "ok": false,
                "error": reason,
            }),
        })
        .collect();

    let config: serde_json::Value =
        serde_json::from_str(&args.to_job_config_json(Some(started_at.to_string()))?)?;
    let report = json!({
        "config": config,
        "finished_at": chrono::Utc::now().to_rfc3339(),
        "results": entries,
    });

    std::fs::write(report_path, serde_json::to_string_pretty(&report)?)
        .context(format!("failed to write report {}", report_path.display()))?;
    Ok(())
}
