//! Datatype-specific loaders for Trodes extracted binary files.
//!
//! Each loader reads one file family (LFP, timestamps, spikes, position,
//! digital I/O, continuous time), pulls its header parameters, derives the
//! record layout those parameters imply, and decodes the payload. Layouts
//! are never assumed where the header can describe them: spike record size
//! comes from the declared channel count, position record width from the
//! `fields` descriptor.

use std::path::Path;

use ndarray::Array3;

use crate::dat::{
    Column, DatFile, DatFormatError, FieldSchema, FieldSpec, FieldType, Header, RecordSet, Result,
};

/// Samples Trodes stores per channel for one spike snippet
pub const SAMPLES_PER_SPIKE: usize = 40;

/// Require a header value and parse it as an integer
fn require_parsed<T: std::str::FromStr>(header: &Header, key: &str) -> Result<T> {
    let value = header.require(key)?;
    value.parse().map_err(|_| DatFormatError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parse an optional header value, treating a malformed one as an error
fn optional_parsed<T: std::str::FromStr>(header: &Header, key: &str) -> Result<Option<T>> {
    match header.get(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| DatFormatError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
        None => Ok(None),
    }
}

/// Compare the file's declared `fields` entry against the layout this
/// datatype implies. A disagreement is logged and decoding continues with
/// the implied layout (best effort), never silently reinterpreted.
fn check_declared_schema(file: &DatFile, expected: &FieldSchema) {
    let Some(descriptor) = file.header.get("fields") else {
        return;
    };
    match FieldSchema::parse(descriptor) {
        Ok(declared) => {
            if declared != *expected {
                tracing::warn!(
                    path = %file.path.display(),
                    declared = %declared,
                    expected = %expected,
                    "declared fields disagree with datatype layout; decoding with datatype layout"
                );
            }
        }
        Err(e) => {
            tracing::warn!(
                path = %file.path.display(),
                error = %e,
                "unparseable fields descriptor; decoding with datatype layout"
            );
        }
    }
}

/// One LFP channel file: a single int16 voltage sample per record.
#[derive(Debug, Clone)]
pub struct LfpLoader {
    pub header: Header,
    pub original_file: Option<String>,
    pub ntrode_id: Option<String>,
    pub ntrode_channel: Option<String>,
    pub clockrate: u32,
    pub voltage_scaling: Option<f64>,
    pub decimation: Option<u32>,
    pub first_timestamp: Option<u64>,
    pub reference: Option<String>,
    pub low_pass_filter: Option<String>,
    pub voltages: Vec<i16>,
}

impl LfpLoader {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let file = DatFile::read(path)?;
        let schema = FieldSchema::new(vec![FieldSpec {
            name: "voltage".to_string(),
            ty: FieldType::Int16,
        }]);
        check_declared_schema(&file, &schema);
        let records = RecordSet::decode(&schema, &file.payload)?;
        let voltages = match records.column("voltage") {
            Some(Column::Int16(v)) => v.clone(),
            _ => unreachable!("voltage column is declared int16"),
        };

        Ok(Self {
            original_file: file.header.get("original_file").map(String::from),
            ntrode_id: file.header.get("ntrode_id").map(String::from),
            ntrode_channel: file.header.get("ntrode_channel").map(String::from),
            clockrate: require_parsed(&file.header, "clock rate")?,
            voltage_scaling: optional_parsed(&file.header, "voltage_scaling")?,
            decimation: optional_parsed(&file.header, "decimation")?,
            first_timestamp: optional_parsed(&file.header, "first_timestamp")?,
            reference: file.header.get("reference").map(String::from),
            low_pass_filter: file.header.get("low_pass_filter").map(String::from),
            header: file.header,
            voltages,
        })
    }
}

/// A timestamps file: one uint32 device counter per record, the common time
/// axis the other streams align against.
#[derive(Debug, Clone)]
pub struct TimestampLoader {
    pub header: Header,
    pub byte_order: Option<String>,
    pub original_file: Option<String>,
    pub clockrate: u32,
    pub decimation: Option<u32>,
    pub time_offset: Option<i64>,
    pub timestamps: Vec<u32>,
}

impl TimestampLoader {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let file = DatFile::read(path)?;
        let schema = FieldSchema::new(vec![FieldSpec {
            name: "time".to_string(),
            ty: FieldType::Uint32,
        }]);
        check_declared_schema(&file, &schema);
        let records = RecordSet::decode(&schema, &file.payload)?;
        let timestamps = match records.column("time") {
            Some(Column::Uint32(v)) => v.clone(),
            _ => unreachable!("time column is declared uint32"),
        };

        Ok(Self {
            byte_order: file.header.get("byte_order").map(String::from),
            original_file: file.header.get("original_file").map(String::from),
            clockrate: require_parsed(&file.header, "clock rate")?,
            decimation: optional_parsed(&file.header, "decimation")?,
            time_offset: optional_parsed(&file.header, "time_offset")?,
            header: file.header,
            timestamps,
        })
    }
}

/// A spike snippet file: per record, one uint32 counter followed by
/// `num_channels x SAMPLES_PER_SPIKE` int16 waveform samples.
#[derive(Debug, Clone)]
pub struct SpikeLoader {
    pub header: Header,
    pub original_file: Option<String>,
    pub ntrode_id: Option<String>,
    pub num_channels: usize,
    pub clockrate: u32,
    pub voltage_scaling: Option<f64>,
    pub time_offset: Option<i64>,
    pub threshold: Option<String>,
    pub reference: Option<String>,
    /// Record width in bytes, derived from the declared channel count
    pub record_size: usize,
    pub timestamps: Vec<u32>,
    /// Waveforms indexed as (spike, channel, sample)
    pub waveforms: Array3<i16>,
}

impl SpikeLoader {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let file = DatFile::read(path)?;
        let num_channels: usize = require_parsed(&file.header, "num_channels")?;
        if num_channels == 0 {
            return Err(DatFormatError::InvalidValue {
                key: "num_channels".to_string(),
                value: "0".to_string(),
            });
        }

        // 4-byte counter plus 2 bytes per waveform sample. The header is the
        // only source of truth for this width; an inconsistent header shows
        // up as a payload that does not divide into whole records.
        let record_size = 4 + num_channels * SAMPLES_PER_SPIKE * 2;
        if file.payload.len() % record_size != 0 {
            return Err(DatFormatError::RecordSizeMismatch {
                payload_len: file.payload.len(),
                record_size,
            });
        }
        let n_spikes = file.payload.len() / record_size;

        let mut timestamps = Vec::with_capacity(n_spikes);
        let mut samples = Vec::with_capacity(n_spikes * num_channels * SAMPLES_PER_SPIKE);
        for record in file.payload.chunks_exact(record_size) {
            timestamps.push(u32::from_le_bytes(record[..4].try_into().unwrap()));
            for sample in record[4..].chunks_exact(2) {
                samples.push(i16::from_le_bytes(sample.try_into().unwrap()));
            }
        }
        let waveforms = Array3::from_shape_vec((n_spikes, num_channels, SAMPLES_PER_SPIKE), samples)
            .expect("sample count matches derived record layout");

        Ok(Self {
            original_file: file.header.get("original_file").map(String::from),
            ntrode_id: file.header.get("ntrode_id").map(String::from),
            num_channels,
            clockrate: require_parsed(&file.header, "clock rate")?,
            voltage_scaling: optional_parsed(&file.header, "voltage_scaling")?,
            time_offset: optional_parsed(&file.header, "time_offset")?,
            threshold: file.header.get("threshold").map(String::from),
            reference: file.header.get("reference").map(String::from),
            record_size,
            header: file.header,
            timestamps,
            waveforms,
        })
    }
}

/// A position tracking file: frame counter plus fixed-width integer
/// coordinate subfields, with layout taken from the `fields` descriptor so
/// field-list evolution (one diode, two diodes) needs no code change.
#[derive(Debug, Clone)]
pub struct PosLoader {
    pub header: Header,
    pub threshold: Option<String>,
    pub dark: Option<String>,
    pub clockrate: Option<u32>,
    /// Record width in bytes, derived from the fields descriptor
    pub record_size: usize,
    pub records: RecordSet,
}

impl PosLoader {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let file = DatFile::read(path)?;
        let descriptor = file.header.require("fields")?;
        let schema = FieldSchema::parse(descriptor)?;
        let records = RecordSet::decode(&schema, &file.payload)?;

        Ok(Self {
            threshold: file.header.get("threshold").map(String::from),
            dark: file.header.get("dark").map(String::from),
            clockrate: optional_parsed(&file.header, "clockrate")?,
            record_size: schema.record_size(),
            header: file.header,
            records,
        })
    }

    /// Frame/sample counters (the leading uint32 field)
    pub fn timestamps(&self) -> Option<&[u32]> {
        let first = self.records.schema().fields().first()?;
        self.records.column(&first.name)?.as_u32()
    }
}

/// A digital I/O event file: (uint32 counter, uint8 state) records decoded
/// to boolean transitions. Direction and channel id live in the header and
/// the filename label, not the payload.
#[derive(Debug, Clone)]
pub struct DioLoader {
    pub header: Header,
    pub original_file: Option<String>,
    pub direction: Option<String>,
    pub id: Option<String>,
    pub display_order: Option<u32>,
    pub clockrate: u32,
    pub timestamps: Vec<u32>,
    pub states: Vec<bool>,
}

impl DioLoader {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let file = DatFile::read(path)?;
        let schema = FieldSchema::new(vec![
            FieldSpec {
                name: "time".to_string(),
                ty: FieldType::Uint32,
            },
            FieldSpec {
                name: "state".to_string(),
                ty: FieldType::Uint8,
            },
        ]);
        check_declared_schema(&file, &schema);
        let records = RecordSet::decode(&schema, &file.payload)?;
        let timestamps = match records.column("time") {
            Some(Column::Uint32(v)) => v.clone(),
            _ => unreachable!("time column is declared uint32"),
        };
        let states = match records.column("state") {
            Some(Column::Uint8(v)) => v.iter().map(|&s| s != 0).collect(),
            _ => unreachable!("state column is declared uint8"),
        };

        Ok(Self {
            original_file: file.header.get("original_file").map(String::from),
            direction: file.header.get("direction").map(String::from),
            id: file.header.get("id").map(String::from),
            display_order: optional_parsed(&file.header, "display_order")?,
            clockrate: require_parsed(&file.header, "clockrate")?,
            header: file.header,
            timestamps,
            states,
        })
    }
}

/// A continuous-time file: `<trodestime uint32>` alone, or with a
/// `<systime int64>` wall-clock column when the recording carried sysclock
/// packets. This is the unit the reconciliation engine reads and rewrites.
#[derive(Debug, Clone)]
pub struct ContinuousTimeLoader {
    pub header: Header,
    pub clockrate: u32,
    /// Milliseconds since the Unix epoch at file creation, when recorded
    pub system_time_at_creation: Option<i64>,
    pub timestamp_at_creation: Option<u64>,
    pub records: RecordSet,
}

impl ContinuousTimeLoader {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let file = DatFile::read(path)?;
        let descriptor = file.header.require("fields")?;
        let schema = FieldSchema::parse(descriptor)?;
        let records = RecordSet::decode(&schema, &file.payload)?;
        if !records.has_column("trodestime") {
            return Err(DatFormatError::InvalidFieldsDescriptor {
                reason: format!("continuous time file declares no trodestime column: {}", schema),
            });
        }

        Ok(Self {
            clockrate: require_parsed(&file.header, "clockrate")?,
            system_time_at_creation: optional_parsed(&file.header, "system_time_at_creation")?,
            timestamp_at_creation: optional_parsed(&file.header, "timestamp_at_creation")?,
            header: file.header,
            records,
        })
    }

    pub fn trodestime(&self) -> &[u32] {
        self.records
            .column("trodestime")
            .and_then(Column::as_u32)
            .expect("presence checked at read time")
    }

    pub fn systime(&self) -> Option<&[i64]> {
        self.records.column("systime").and_then(Column::as_i64)
    }
}
