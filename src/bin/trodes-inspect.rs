//! Trodes Inspect - extracted data file inspection and metadata viewer
//!
//! This tool inspects any Trodes extracted binary file (`*.dat`) and displays
//! its settings header, declared field schema, record statistics, and — for
//! files carrying a device counter column — counter range and contiguous
//! chunk structure.
//!
//! # Usage
//!
//! ```bash
//! # Summary of any extracted file
//! trodes-inspect 20240315_rat1_01.continuoustime.dat
//!
//! # Full header dump
//! trodes-inspect 20240315_rat1_01.LFP_nt1ch1.dat --verbose
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use trodes_extract_toolbox::dat::{Column, DatFile};
use trodes_extract_toolbox::sync::label_time_chunks;

#[derive(Parser)]
#[command(name = "trodes-inspect")]
#[command(about = "Inspect Trodes extracted binary data files")]
#[command(version)]
struct Args {
    /// Path to the extracted data file
    file_path: PathBuf,

    /// Show the full settings header
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    trodes_extract_toolbox::display_license_notice("trodes-inspect");

    println!("╔════════════════════════════════════════════════════════════════╗");
    println!("║              Trodes Data File Inspector                        ║");
    println!("╚════════════════════════════════════════════════════════════════╝");
    println!();
    println!("File: {}", args.file_path.display());
    println!();

    let file = DatFile::read(&args.file_path)
        .with_context(|| format!("reading {}", args.file_path.display()))?;

    println!("Header: {} entries", file.header.len());
    if args.verbose {
        for (key, value) in file.header.iter() {
            println!("\t{}: {}", key, value);
        }
        println!();
    }

    if let Some(creation_ms) = file.header.get("system_time_at_creation") {
        match creation_ms
            .parse::<i64>()
            .ok()
            .and_then(chrono::DateTime::from_timestamp_millis)
        {
            Some(created) => println!("Created: {} ({} ms)", created.to_rfc3339(), creation_ms),
            None => println!("Created: unparseable ({:?})", creation_ms),
        }
    }
    if let Some(clockrate) = file.header.get("clockrate").or(file.header.get("clock rate")) {
        println!("Clock rate: {} Hz", clockrate);
    }

    let Some(schema) = file.schema()? else {
        println!("Payload: {} bytes (no fields descriptor)", file.payload.len());
        return Ok(());
    };

    println!("Schema: {}", schema);
    println!("Record size: {} bytes", schema.record_size());

    let records = file.records()?;
    println!("Records: {}", records.n_records());

    // Counter statistics for files whose leading column is a uint32 counter
    let counter = schema
        .fields()
        .first()
        .and_then(|f| records.column(&f.name))
        .and_then(Column::as_u32);
    if let Some(counter) = counter
        && let (Some(&first), Some(&last)) = (counter.first(), counter.last())
    {
        let chunk_labels = label_time_chunks(counter);
        let n_chunks = chunk_labels.last().map(|&l| l as u64 + 1).unwrap_or(0);
        println!();
        println!("Counter range: {} -> {}", first, last);
        println!("Contiguous chunks: {}", n_chunks);
        if args.verbose && n_chunks > 1 {
            let mut start = 0;
            while start < counter.len() {
                let label = chunk_labels[start];
                let mut end = start + 1;
                while end < chunk_labels.len() && chunk_labels[end] == label {
                    end += 1;
                }
                println!(
                    "\t- chunk {}: counters {} -> {} ({} records)",
                    label,
                    counter[start],
                    counter[end - 1],
                    end - start
                );
                start = end;
            }
        }
    }

    Ok(())
}
