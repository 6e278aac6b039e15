use anyhow::Result;
use tempfile::tempdir;

use trodes_extract_toolbox::dat::{
    Column, DatFile, DatFormatError, FieldSchema, writer::write_dat_file,
};
use trodes_extract_toolbox::loaders::{
    DioLoader, LfpLoader, SAMPLES_PER_SPIKE, SpikeLoader, TimestampLoader,
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

fn continuous_time_payload(records: &[(u32, i64)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for &(trodestime, systime) in records {
        payload.extend_from_slice(&trodestime.to_le_bytes());
        payload.extend_from_slice(&systime.to_le_bytes());
    }
    payload
}

#[test]
fn test_roundtrip_is_byte_identical() -> Result<()> {
    let dir = tempdir()?;
    let src = dir.path().join("session.continuoustime.dat");
    let copy = dir.path().join("copy.continuoustime.dat");

    let original = make_dat_bytes(
        &[
            ("description", "Continuous time on trodes clock"),
            ("byte_order", "little endian"),
            ("clockrate", "30000"),
            ("system_time_at_creation", "1710500000000"),
            ("fields", "<trodestime uint32><systime int64>"),
        ],
        &continuous_time_payload(&[
            (100, 1_710_500_000_000_000_000),
            (101, 1_710_500_000_000_033_333),
            (102, 1_710_500_000_000_066_667),
        ]),
    );
    std::fs::write(&src, &original)?;

    let file = DatFile::read(&src)?;
    let records = file.records()?;
    assert_eq!(records.n_records(), 3);
    assert_eq!(
        records.column("trodestime").and_then(Column::as_u32),
        Some(&[100u32, 101, 102][..])
    );

    write_dat_file(&copy, &file.header, &records)?;
    let rewritten = std::fs::read(&copy)?;
    assert_eq!(rewritten, original);

    // And the copy still parses to the same values
    let reread = DatFile::read(&copy)?;
    assert_eq!(reread.header, file.header);
    assert_eq!(
        reread.records()?.column("systime").and_then(Column::as_i64),
        records.column("systime").and_then(Column::as_i64)
    );
    Ok(())
}

#[test]
fn test_missing_start_sentinel_fails() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("bogus.dat");
    std::fs::write(&path, b"not a settings header\nclockrate: 30000\n")?;

    let err = DatFile::read(&path).unwrap_err();
    assert!(matches!(err, DatFormatError::MissingStartMarker { .. }));
    Ok(())
}

#[test]
fn test_header_over_limit_fails() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("runaway.dat");

    let mut bytes = Vec::from(&b"<Start settings>\n"[..]);
    for i in 0..1200 {
        bytes.extend_from_slice(format!("key_{}: {}\n", i, i).as_bytes());
    }
    std::fs::write(&path, &bytes)?;

    let err = DatFile::read(&path).unwrap_err();
    assert!(matches!(err, DatFormatError::HeaderTooLong { .. }));
    Ok(())
}

#[test]
fn test_missing_end_sentinel_fails() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("truncated.dat");
    std::fs::write(&path, b"<Start settings>\nclockrate: 30000\n")?;

    let err = DatFile::read(&path).unwrap_err();
    assert!(matches!(err, DatFormatError::MissingEndMarker { .. }));
    Ok(())
}

#[test]
fn test_header_keys_normalized_and_required() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("mixed_case.dat");
    std::fs::write(
        &path,
        make_dat_bytes(&[("Clockrate", "30000"), ("Fields", "<time uint32>")], &[]),
    )?;

    let file = DatFile::read(&path)?;
    assert_eq!(file.header.get("clockrate"), Some("30000"));
    assert_eq!(file.header.get("Clockrate"), None);
    assert!(matches!(
        file.header.require("decimation"),
        Err(DatFormatError::MissingKey { .. })
    ));
    Ok(())
}

#[test]
fn test_payload_not_multiple_of_record_size_fails() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ragged.dat");
    // 12-byte records, 10 bytes of payload
    std::fs::write(
        &path,
        make_dat_bytes(
            &[("fields", "<trodestime uint32><systime int64>")],
            &[0u8; 10],
        ),
    )?;

    let err = DatFile::read(&path)?.records().unwrap_err();
    assert!(matches!(err, DatFormatError::RecordSizeMismatch { .. }));
    Ok(())
}

#[test]
fn test_field_schema_parse_and_regenerate() -> Result<()> {
    let descriptor = "<trodestime uint32><systime int64><adjusted_systime int64>";
    let schema = FieldSchema::parse(descriptor)?;
    assert_eq!(schema.field_count(), 3);
    assert_eq!(schema.record_size(), 4 + 8 + 8);
    assert_eq!(schema.to_string(), descriptor);

    assert!(matches!(
        FieldSchema::parse("<time uint32><state complex128>"),
        Err(DatFormatError::InvalidFieldType { .. })
    ));
    assert!(matches!(
        FieldSchema::parse("<time uint32"),
        Err(DatFormatError::InvalidFieldsDescriptor { .. })
    ));
    Ok(())
}

#[test]
fn test_spike_loader_derives_record_size_from_header() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("spikes_nt1.dat");

    let num_channels = 2usize;
    let record_size = 4 + num_channels * SAMPLES_PER_SPIKE * 2;
    let mut payload = Vec::new();
    for spike in 0..2u32 {
        payload.extend_from_slice(&(1000 + spike).to_le_bytes());
        for sample in 0..(num_channels * SAMPLES_PER_SPIKE) as i16 {
            payload.extend_from_slice(&(sample - 40).to_le_bytes());
        }
    }
    assert_eq!(payload.len(), 2 * record_size);

    std::fs::write(
        &path,
        make_dat_bytes(
            &[
                ("original_file", "session.rec"),
                ("ntrode_id", "1"),
                ("num_channels", "2"),
                ("clock rate", "30000"),
                ("voltage_scaling", "0.195"),
            ],
            &payload,
        ),
    )?;

    let spikes = SpikeLoader::read(&path)?;
    assert_eq!(spikes.record_size, record_size);
    assert_eq!(spikes.timestamps, vec![1000, 1001]);
    assert_eq!(spikes.waveforms.dim(), (2, 2, SAMPLES_PER_SPIKE));
    assert_eq!(spikes.waveforms[[0, 0, 0]], -40);
    assert_eq!(spikes.waveforms[[0, 1, 0]], SAMPLES_PER_SPIKE as i16 - 40);
    Ok(())
}

#[test]
fn test_spike_loader_rejects_misaligned_payload() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("spikes_bad.dat");

    // Header claims 2 channels (164-byte records); payload is not a multiple
    std::fs::write(
        &path,
        make_dat_bytes(
            &[("num_channels", "2"), ("clock rate", "30000")],
            &[0u8; 100],
        ),
    )?;

    let err = SpikeLoader::read(&path).unwrap_err();
    assert!(matches!(err, DatFormatError::RecordSizeMismatch { .. }));
    Ok(())
}

#[test]
fn test_lfp_and_timestamp_loaders_decode() -> Result<()> {
    let dir = tempdir()?;

    let lfp_path = dir.path().join("lfp_nt1ch1.dat");
    let mut lfp_payload = Vec::new();
    for v in [-100i16, 0, 250] {
        lfp_payload.extend_from_slice(&v.to_le_bytes());
    }
    std::fs::write(
        &lfp_path,
        make_dat_bytes(
            &[
                ("ntrode_id", "1"),
                ("ntrode_channel", "1"),
                ("clock rate", "30000"),
                ("voltage_scaling", "0.195"),
                ("decimation", "16"),
                ("fields", "<voltage int16>"),
            ],
            &lfp_payload,
        ),
    )?;
    let lfp = LfpLoader::read(&lfp_path)?;
    assert_eq!(lfp.voltages, vec![-100, 0, 250]);
    assert_eq!(lfp.clockrate, 30000);
    assert_eq!(lfp.decimation, Some(16));

    let ts_path = dir.path().join("timestamps.dat");
    let mut ts_payload = Vec::new();
    for t in [7u32, 8, 9, 20] {
        ts_payload.extend_from_slice(&t.to_le_bytes());
    }
    std::fs::write(
        &ts_path,
        make_dat_bytes(
            &[("byte_order", "little endian"), ("clock rate", "30000")],
            &ts_payload,
        ),
    )?;
    let ts = TimestampLoader::read(&ts_path)?;
    assert_eq!(ts.timestamps, vec![7, 8, 9, 20]);
    Ok(())
}

#[test]
fn test_dio_loader_decodes_states() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("dio_Din1.dat");

    let mut payload = Vec::new();
    for (t, s) in [(10u32, 0u8), (55, 1), (90, 0)] {
        payload.extend_from_slice(&t.to_le_bytes());
        payload.push(s);
    }
    std::fs::write(
        &path,
        make_dat_bytes(
            &[
                ("direction", "input"),
                ("id", "Din1"),
                ("clockrate", "30000"),
            ],
            &payload,
        ),
    )?;

    let dio = DioLoader::read(&path)?;
    assert_eq!(dio.timestamps, vec![10, 55, 90]);
    assert_eq!(dio.states, vec![false, true, false]);
    assert_eq!(dio.direction.as_deref(), Some("input"));
    Ok(())
}

#[test]
fn test_missing_required_key_is_fatal() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("no_clockrate.dat");
    std::fs::write(
        &path,
        make_dat_bytes(&[("byte_order", "little endian")], &[0u8; 4]),
    )?;

    let err = TimestampLoader::read(&path).unwrap_err();
    assert!(matches!(err, DatFormatError::MissingKey { key } if key == "clock rate"));
    Ok(())
}
