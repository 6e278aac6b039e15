use clap::Parser;
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser, Clone)]
#[command(name = "trodes-timefix")]
#[command(about = "Correct device-to-wall-clock correspondence in Trodes continuous time files")]
#[command(version)]
pub struct Args {
    #[arg(
        required = true,
        help = "Continuous time files (*.continuoustime.dat) to correct"
    )]
    pub files: Vec<PathBuf>,

    #[arg(
        long,
        short = 'j',
        default_value = "1",
        help = "Maximum number of files converted concurrently (one OS process per file when > 1)"
    )]
    pub jobs: usize,

    #[arg(
        long,
        help = "Synthesize a wall-clock column into this new file instead of rewriting in place (single input only)"
    )]
    pub infer_to: Option<PathBuf>,

    #[arg(long, help = "Write a JSON job report to this path")]
    pub report: Option<PathBuf>,

    #[arg(long, short = 'q', help = "Minimal output mode")]
    pub quiet: bool,

    #[arg(long, hide = true, help = "Internal: run as a single-file child job")]
    pub child: bool,
}

impl Args {
    /// Serialize the effective job configuration to JSON for the report
    pub fn to_job_config_json(&self, started_at: Option<String>) -> anyhow::Result<String> {
        let config_json = json!({
            "files": self.files.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
            "jobs": self.jobs,
            "infer_to": self.infer_to.as_ref().map(|p| p.display().to_string()),
            "report": self.report.as_ref().map(|p| p.display().to_string()),
            "quiet": self.quiet,
            "started_at": started_at,
            "timefix_version": env!("CARGO_PKG_VERSION")
        });

        Ok(serde_json::to_string_pretty(&config_json)?)
    }
}
