use anyhow::Result;
use tempfile::tempdir;

use trodes_extract_toolbox::dat::{Column, DatFile};
use trodes_extract_toolbox::sync::{
    FixMode, add_system_time_to_file, fix_timestamp_lag, infer_systime, label_time_chunks,
    regress_timestamps,
};

/// Assemble raw file bytes: sentinels, `key: value` lines, then payload
fn make_dat_bytes(header: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"<Start settings>\n");
    for (key, value) in header {
        bytes.extend_from_slice(format!("{}: {}\n", key, value).as_bytes());
    }
    bytes.extend_from_slice(b"<End settings>\n");
    bytes.extend_from_slice(payload);
    bytes
}

#[test]
fn test_chunk_labels_follow_gap_rule() {
    assert_eq!(
        label_time_chunks(&[5, 6, 7, 10, 11, 15]),
        vec![0, 0, 0, 1, 1, 2]
    );
    assert_eq!(label_time_chunks(&[1, 2, 3]), vec![0, 0, 0]);
    assert_eq!(label_time_chunks(&[]), Vec::<u32>::new());
}

#[test]
fn test_infer_systime_is_evenly_spaced() -> Result<()> {
    // 30 kHz is not an integral number of nanoseconds per sample; spacing
    // must interpolate rather than accumulate the truncated step
    let systime = infer_systime(30000, 1000, 3)?;
    assert_eq!(
        systime,
        vec![1_000_000_000, 1_000_033_333, 1_000_066_667]
    );

    let long = infer_systime(30000, 0, 30001)?;
    assert_eq!(*long.last().unwrap(), 1_000_000_000);
    assert!(long.windows(2).all(|w| w[1] > w[0]));
    Ok(())
}

#[test]
fn test_regression_smooths_jitter_within_envelope() {
    let trodestime = [0u32, 1, 2, 3];
    // 0.0, 1.0, 2.1, 2.9 milliseconds of observed wall-clock
    let systime = [0i64, 1_000_000, 2_100_000, 2_900_000];
    let labels = label_time_chunks(&trodestime);

    let adjusted = regress_timestamps(&trodestime, &systime, &labels, 30000);

    assert!(adjusted.windows(2).all(|w| w[1] >= w[0]));
    for (a, s) in adjusted.iter().zip(systime.iter()) {
        assert!((a - s).abs() <= 2_000_000, "deviation {} ns over 2 ms", a - s);
    }
}

#[test]
fn test_chunk_fits_are_isolated() {
    let trodestime = [0u32, 1, 2, 3, 100, 101, 102, 103];
    let base = [
        0i64,
        1_000_000,
        2_100_000,
        2_900_000,
        100_000_000,
        101_200_000,
        101_900_000,
        103_100_000,
    ];
    let labels = label_time_chunks(&trodestime);
    assert_eq!(labels, vec![0, 0, 0, 0, 1, 1, 1, 1]);

    let adjusted = regress_timestamps(&trodestime, &base, &labels, 30000);

    // Shifting the second chunk by five seconds must not move the first fit
    let mut shifted = base;
    for s in shifted[4..].iter_mut() {
        *s += 5_000_000_000;
    }
    let adjusted_shifted = regress_timestamps(&trodestime, &shifted, &labels, 30000);

    assert_eq!(adjusted[..4], adjusted_shifted[..4]);
    assert_ne!(adjusted[4..], adjusted_shifted[4..]);
}

#[test]
fn test_degenerate_chunk_falls_back_to_synthesis() {
    // Single-record chunk surrounded by gaps: no slope can be fit
    let trodestime = [0u32, 1, 2, 50, 90, 91, 92];
    let systime = [0i64, 1_000_000, 2_000_000, 700_000_000, 903_000_000, 904_000_000, 905_000_000];
    let labels = label_time_chunks(&trodestime);
    assert_eq!(labels, vec![0, 0, 0, 1, 2, 2, 2]);

    let adjusted = regress_timestamps(&trodestime, &systime, &labels, 30000);

    // The lone record keeps its observed wall-clock as the anchor
    assert_eq!(adjusted[3], 700_000_000);
    // Repeated counters degenerate the same way: anchored, evenly extended
    let flat = regress_timestamps(&[7, 7, 7], &[100, 250, 400], &[0, 0, 0], 30000);
    assert_eq!(flat, vec![100, 100, 100]);
}

#[test]
fn test_fix_rewrites_regressed_columns_in_place() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("session.continuoustime.dat");

    let mut payload = Vec::new();
    let trodestime = [100u32, 101, 102, 200, 201, 202];
    let systime = [
        1_000_000_000i64,
        1_000_033_000,
        1_000_067_300,
        1_003_334_000,
        1_003_366_500,
        1_003_400_200,
    ];
    for (&t, &s) in trodestime.iter().zip(systime.iter()) {
        payload.extend_from_slice(&t.to_le_bytes());
        payload.extend_from_slice(&s.to_le_bytes());
    }
    std::fs::write(
        &path,
        make_dat_bytes(
            &[
                ("clockrate", "30000"),
                ("fields", "<trodestime uint32><systime int64>"),
            ],
            &payload,
        ),
    )?;

    let summary = fix_timestamp_lag(&path)?;
    assert_eq!(summary.mode, FixMode::Regressed);
    assert_eq!(summary.n_records, 6);
    assert_eq!(summary.n_chunks, 2);

    let fixed = DatFile::read(&path)?;
    assert_eq!(
        fixed.header.get("fields"),
        Some("<trodestime uint32><systime int64><time_chunk_label uint32><adjusted_systime int64>")
    );
    let records = fixed.records()?;
    assert_eq!(
        records.column("time_chunk_label").and_then(Column::as_u32),
        Some(&[0u32, 0, 0, 1, 1, 1][..])
    );
    let adjusted = records
        .column("adjusted_systime")
        .and_then(Column::as_i64)
        .unwrap();
    assert!(adjusted.windows(2).all(|w| w[1] >= w[0]));
    // Original observations survive untouched next to the adjusted column
    assert_eq!(
        records.column("systime").and_then(Column::as_i64),
        Some(&systime[..])
    );
    Ok(())
}

#[test]
fn test_fix_synthesizes_when_systime_absent() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("old_session.continuoustime.dat");

    let mut payload = Vec::new();
    for t in [100u32, 101, 102] {
        payload.extend_from_slice(&t.to_le_bytes());
    }
    std::fs::write(
        &path,
        make_dat_bytes(
            &[
                ("clockrate", "30000"),
                ("system_time_at_creation", "1000"),
                ("fields", "<trodestime uint32>"),
            ],
            &payload,
        ),
    )?;

    let summary = fix_timestamp_lag(&path)?;
    assert_eq!(summary.mode, FixMode::Synthesized);

    let records = DatFile::read(&path)?.records()?;
    assert_eq!(
        records.column("systime").and_then(Column::as_i64),
        Some(&[1_000_000_000i64, 1_000_033_333, 1_000_066_667][..])
    );
    Ok(())
}

#[test]
fn test_failed_fix_leaves_file_untouched() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("not_trodes.dat");
    let original = b"something else entirely\n".to_vec();
    std::fs::write(&path, &original)?;

    assert!(fix_timestamp_lag(&path).is_err());
    assert_eq!(std::fs::read(&path)?, original);
    Ok(())
}

#[test]
fn test_add_system_time_writes_new_two_column_file() -> Result<()> {
    let dir = tempdir()?;
    let src = dir.path().join("old.continuoustime.dat");
    let dst = dir.path().join("with_systime.continuoustime.dat");

    let mut payload = Vec::new();
    for t in [0u32, 1, 2, 3] {
        payload.extend_from_slice(&t.to_le_bytes());
    }
    let original = make_dat_bytes(
        &[
            ("clockrate", "30000"),
            ("system_time_at_creation", "1000"),
            ("fields", "<trodestime uint32>"),
        ],
        &payload,
    );
    std::fs::write(&src, &original)?;

    let summary = add_system_time_to_file(&src, &dst)?;
    assert_eq!(summary.mode, FixMode::Synthesized);
    assert_eq!(summary.n_records, 4);

    // Source untouched, destination carries the regenerated two-column schema
    assert_eq!(std::fs::read(&src)?, original);
    let out = DatFile::read(&dst)?;
    assert_eq!(
        out.header.get("fields"),
        Some("<trodestime uint32><systime int64>")
    );
    let records = out.records()?;
    assert_eq!(
        records.column("trodestime").and_then(Column::as_u32),
        Some(&[0u32, 1, 2, 3][..])
    );
    assert!(
        records
            .column("systime")
            .and_then(Column::as_i64)
            .unwrap()
            .windows(2)
            .all(|w| w[1] > w[0])
    );
    Ok(())
}
