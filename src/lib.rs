//! Trodes Extract Toolbox - reading, correcting and rewriting SpikeGadgets/Trodes
//! extracted binary data files
//!
//! This crate provides command-line tools and library functions for working with
//! the extracted binary files a Trodes recording session produces (LFP, spike
//! snippets, timestamps, position tracking, digital I/O, continuous time), and
//! for reconciling the device sample counter embedded in those files with
//! wall-clock time.
//!
//! # Overview
//!
//! A Trodes extraction run leaves a family of `.dat` files, each with an ASCII
//! settings header bounded by `<Start settings>` / `<End settings>` sentinel
//! lines followed by fixed-width little-endian binary records. The record
//! layout is self-described: the `fields` header entry lists the payload
//! schema as `<name type>` tokens, and datatype-specific header parameters
//! (channel counts, clock rates, scaling) determine the rest.
//!
//! The wall-clock (`systime`) column of a continuous time file is noisy:
//! sysclock packets arrive from the MCU with transport jitter. Because the
//! device counter itself ticks at a regular rate, the true correspondence can
//! be recovered by fitting wall-clock time against the counter, one fit per
//! contiguous counter chunk so genuine recording gaps stay sharp.
//!
//! # Command-Line Tools
//!
//! - `trodes-timefix` - correct continuous time files in place, with optional
//!   one-process-per-file batch mode
//! - `trodes-inspect` - display header, schema and record statistics for any
//!   extracted data file
//!
//! # Quick Start
//!
//! ```bash
//! # Correct a single recording's continuous time file
//! trodes-timefix 20240315_rat1_01.continuoustime.dat
//!
//! # Correct a whole session, two files at a time, with a JSON report
//! trodes-timefix *.continuoustime.dat --jobs 2 --report timefix_report.json
//!
//! # Look at what a file contains
//! trodes-inspect 20240315_rat1_01.LFP_nt1ch1.dat --verbose
//! ```
//!
//! # Library Usage
//!
//! The library modules can be used programmatically:
//!
//! - [`dat`] - sentinel-header parsing, field schemas, record sets, and the
//!   round-trip writer
//! - [`loaders`] - per-datatype file loaders (LFP, timestamps, spikes,
//!   position, DIO, continuous time)
//! - [`sync`] - clock reconciliation algorithms and the in-place fix
//! - [`cli`] - command-line argument definitions
//!
//! # License
//!
//! This project is licensed under the GNU General Public License v3.0.

pub mod cli;
pub mod dat;
pub mod loaders;
pub mod sync;

use chrono::Datelike;

/// Display GPL license notice for a program
pub fn display_license_notice(program_name: &str) {
    let version = env!("CARGO_PKG_VERSION");
    let current_year = chrono::Utc::now().year();
    let copyright_year = if current_year == 2026 {
        "2026".to_string()
    } else {
        format!("2026-{}", current_year)
    };

    println!(
        "{} {} Copyright (C) {} the trodes-extract-toolbox authors",
        program_name, version, copyright_year
    );
    println!("This program comes with ABSOLUTELY NO WARRANTY.");
    println!("For details see https://www.gnu.org/licenses/gpl-3.0.html#license-text.");
    println!("This is free software, and you are welcome to redistribute it under certain conditions.");
    println!();
}
