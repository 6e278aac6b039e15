//! Device-to-wall-clock reconciliation for continuous time files.
//!
//! Sysclock packets arrive from the MCU with transport jitter, so the raw
//! `systime` column wobbles around the true wall-clock time of each sample.
//! The device counter itself ticks regularly. Fitting wall-clock time as a
//! linear function of the counter, independently per contiguous counter
//! chunk, removes the jitter while preserving genuine discontinuities
//! (device pauses, dropped packets) that a single global fit would smear.
//!
//! Recordings that carry no `systime` column at all instead get one
//! synthesized by even-spaced extrapolation from the file's creation
//! anchor at the nominal clock rate. The two paths never mix: a synthetic
//! series is already exactly linear and is not refit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::dat::{Column, RecordSet, writer::write_dat_file};
use crate::loaders::ContinuousTimeLoader;

const NANOSECONDS_PER_SECOND: f64 = 1e9;
const NANOSECONDS_PER_MILLISECOND: i64 = 1_000_000;

/// Label each maximal run of contiguous device counters with an integer.
///
/// A step greater than one between consecutive counters starts a new chunk;
/// regression fits never cross these boundaries.
pub fn label_time_chunks(trodestime: &[u32]) -> Vec<u32> {
    let mut labels = Vec::with_capacity(trodestime.len());
    let mut label = 0u32;
    for (i, &t) in trodestime.iter().enumerate() {
        if i > 0 && t.saturating_sub(trodestime[i - 1]) > 1 {
            label += 1;
        }
        labels.push(label);
    }
    labels
}

/// Slope and intercept of an ordinary least-squares line fit
#[derive(Debug, Clone, Copy)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

/// Fit `y = intercept + slope * x`; `None` when `x` holds fewer than two
/// distinct values and the slope is undefined.
fn linear_fit(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    if x.len() < 2 {
        return None;
    }
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (&xi, &yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        sxx += dx * dx;
        sxy += dx * (yi - mean_y);
    }
    if sxx == 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    Some(LinearFit {
        slope,
        intercept: mean_y - slope * mean_x,
    })
}

/// Synthesize an evenly spaced wall-clock column (nanoseconds since epoch)
/// from the creation anchor and the nominal clock rate.
///
/// Spacing is interpolated per index rather than accumulated per sample, so
/// a non-integral nanoseconds-per-sample ratio never compounds into drift
/// over a long recording.
pub fn infer_systime(
    clockrate: u32,
    system_time_at_creation_ms: i64,
    n_records: usize,
) -> Result<Vec<i64>> {
    if clockrate == 0 {
        bail!("clockrate of 0 Hz cannot be extrapolated");
    }
    let ns_per_sample = NANOSECONDS_PER_SECOND / f64::from(clockrate);
    let creation_ns = system_time_at_creation_ms * NANOSECONDS_PER_MILLISECOND;
    Ok((0..n_records)
        .map(|i| creation_ns + (i as f64 * ns_per_sample).round() as i64)
        .collect())
}

/// Regress observed wall-clock nanoseconds onto the device counter, one fit
/// per chunk, and return the adjusted wall-clock column.
///
/// A chunk with fewer than two distinct counter values cannot be fit; its
/// records fall back to linear synthesis from the chunk's first observation
/// at the nominal rate. That is a warning, not a failure — downstream
/// consumers tolerate approximate timestamps better than missing data.
pub fn regress_timestamps(
    trodestime: &[u32],
    systime: &[i64],
    chunk_labels: &[u32],
    clockrate: u32,
) -> Vec<i64> {
    debug_assert_eq!(trodestime.len(), systime.len());
    debug_assert_eq!(trodestime.len(), chunk_labels.len());

    let mut adjusted = Vec::with_capacity(trodestime.len());
    let mut start = 0;
    while start < trodestime.len() {
        let label = chunk_labels[start];
        let mut end = start + 1;
        while end < chunk_labels.len() && chunk_labels[end] == label {
            end += 1;
        }

        let counters: Vec<f64> = trodestime[start..end]
            .iter()
            .map(|&t| f64::from(t))
            .collect();
        let seconds: Vec<f64> = systime[start..end]
            .iter()
            .map(|&s| s as f64 / NANOSECONDS_PER_SECOND)
            .collect();

        match linear_fit(&counters, &seconds) {
            Some(fit) => {
                adjusted.extend(counters.iter().map(|&c| {
                    ((fit.intercept + fit.slope * c) * NANOSECONDS_PER_SECOND).round() as i64
                }));
            }
            None => {
                tracing::warn!(
                    chunk = label,
                    records = end - start,
                    "chunk has fewer than two distinct counters; falling back to linear synthesis"
                );
                let anchor_counter = f64::from(trodestime[start]);
                let anchor_ns = systime[start];
                let ns_per_sample = NANOSECONDS_PER_SECOND / f64::from(clockrate);
                adjusted.extend(
                    counters
                        .iter()
                        .map(|&c| anchor_ns + ((c - anchor_counter) * ns_per_sample).round() as i64),
                );
            }
        }

        start = end;
    }

    adjusted
}

/// How a continuous time file was corrected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixMode {
    /// No wall-clock column existed; one was synthesized from the creation anchor
    Synthesized,
    /// Jittered wall-clock observations were regressed per chunk
    Regressed,
}

/// Outcome report for one corrected file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSummary {
    pub path: PathBuf,
    pub mode: FixMode,
    pub n_records: usize,
    pub n_chunks: usize,
}

/// Fix the correspondence between the device counter and wall-clock time in
/// a continuous time file, rewriting the file in place.
///
/// When the file already carries a `systime` column, each chunk's
/// observations are regressed and the result lands in new
/// `time_chunk_label` and `adjusted_systime` columns. When it does not, a
/// `systime` column is synthesized from `system_time_at_creation` and
/// `clockrate`; the synthetic series is exactly linear by construction, so
/// no regression pass runs over it.
pub fn fix_timestamp_lag(path: impl AsRef<Path>) -> Result<FixSummary> {
    let path = path.as_ref();
    let loader = ContinuousTimeLoader::read(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let trodestime = loader.trodestime();
    let n_records = loader.records.n_records();
    let chunk_labels = label_time_chunks(trodestime);
    let n_chunks = chunk_labels.last().map(|&l| l as usize + 1).unwrap_or(0);

    let (records, mode) = match loader.systime() {
        Some(systime) => {
            let adjusted = regress_timestamps(trodestime, systime, &chunk_labels, loader.clockrate);
            let records = loader
                .records
                .with_column("time_chunk_label", Column::Uint32(chunk_labels))?
                .with_column("adjusted_systime", Column::Int64(adjusted))?;
            (records, FixMode::Regressed)
        }
        None => {
            tracing::warn!(
                path = %path.display(),
                "no systime column; synthesizing wall-clock from creation anchor"
            );
            let creation_ms: i64 = loader
                .header
                .require("system_time_at_creation")?
                .parse()
                .context("header key 'system_time_at_creation' is not an integer")?;
            let systime = infer_systime(loader.clockrate, creation_ms, n_records)?;
            let records = loader
                .records
                .with_column("systime", Column::Int64(systime))?;
            (records, FixMode::Synthesized)
        }
    };

    write_dat_file(path, &loader.header, &records)
        .with_context(|| format!("rewriting {}", path.display()))?;

    Ok(FixSummary {
        path: path.to_path_buf(),
        mode,
        n_records,
        n_chunks,
    })
}

/// Synthesize a wall-clock column for an older recording and write the
/// result as a new `<trodestime uint32><systime int64>` file, leaving the
/// source untouched.
pub fn add_system_time_to_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<FixSummary> {
    let src = src.as_ref();
    let dst = dst.as_ref();
    let loader =
        ContinuousTimeLoader::read(src).with_context(|| format!("reading {}", src.display()))?;
    let trodestime = loader.trodestime().to_vec();
    let n_records = trodestime.len();

    let creation_ms: i64 = loader
        .header
        .require("system_time_at_creation")?
        .parse()
        .context("header key 'system_time_at_creation' is not an integer")?;
    let systime = infer_systime(loader.clockrate, creation_ms, n_records)?;

    let records = RecordSet::from_columns(vec![
        ("trodestime".to_string(), Column::Uint32(trodestime)),
        ("systime".to_string(), Column::Int64(systime)),
    ])?;

    write_dat_file(dst, &loader.header, &records)
        .with_context(|| format!("writing {}", dst.display()))?;

    Ok(FixSummary {
        path: dst.to_path_buf(),
        mode: FixMode::Synthesized,
        n_records,
        n_chunks: 1,
    })
}
