pub mod writer;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// First line of every Trodes extracted data file.
pub const START_SENTINEL: &str = "<Start settings>";
/// Line terminating the settings block; the binary payload begins on the next byte.
pub const END_SENTINEL: &str = "<End settings>";
/// Headers longer than this are treated as malformed rather than scanned forever.
pub const MAX_HEADER_LINES: usize = 1000;

/// Result type for dat format operations
pub type Result<T> = std::result::Result<T, DatFormatError>;

/// Errors raised while parsing or writing Trodes extracted data files.
///
/// All variants are fatal for the single file being processed; none are
/// silently repaired.
#[derive(Error, Debug)]
pub enum DatFormatError {
    #[error("file {path} does not start with '<Start settings>'")]
    MissingStartMarker { path: String },

    #[error("file {path} header over 1000 lines without '<End settings>'")]
    HeaderTooLong { path: String },

    #[error("file {path} ends before '<End settings>'")]
    MissingEndMarker { path: String },

    #[error("header line is not 'key: value': {line:?}")]
    InvalidHeaderLine { line: String },

    #[error("required header key '{key}' missing")]
    MissingKey { key: String },

    #[error("header key '{key}' has invalid value {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("invalid field type '{field_type}'")]
    InvalidFieldType { field_type: String },

    #[error("invalid fields descriptor: {reason}")]
    InvalidFieldsDescriptor { reason: String },

    #[error("record size mismatch: {payload_len} payload bytes is not a multiple of {record_size}-byte records")]
    RecordSizeMismatch {
        payload_len: usize,
        record_size: usize,
    },

    #[error("column '{name}' has {actual} values, expected {expected}")]
    ColumnLengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Fixed-width primitive types representable in a dat payload.
///
/// Type names follow the numpy-style spelling Trodes writes into the
/// `fields` header entry (e.g. `uint32`, `int64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
}

impl FieldType {
    /// Parse a type name from a fields descriptor token
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "uint8" => Ok(FieldType::Uint8),
            "int8" => Ok(FieldType::Int8),
            "uint16" => Ok(FieldType::Uint16),
            "int16" => Ok(FieldType::Int16),
            "uint32" => Ok(FieldType::Uint32),
            "int32" => Ok(FieldType::Int32),
            "uint64" => Ok(FieldType::Uint64),
            "int64" => Ok(FieldType::Int64),
            "float32" => Ok(FieldType::Float32),
            "float64" => Ok(FieldType::Float64),
            _ => Err(DatFormatError::InvalidFieldType {
                field_type: name.to_string(),
            }),
        }
    }

    /// Width of one value of this type in the binary payload
    pub fn size(&self) -> usize {
        match self {
            FieldType::Uint8 | FieldType::Int8 => 1,
            FieldType::Uint16 | FieldType::Int16 => 2,
            FieldType::Uint32 | FieldType::Int32 | FieldType::Float32 => 4,
            FieldType::Uint64 | FieldType::Int64 | FieldType::Float64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Uint8 => "uint8",
            FieldType::Int8 => "int8",
            FieldType::Uint16 => "uint16",
            FieldType::Int16 => "int16",
            FieldType::Uint32 => "uint32",
            FieldType::Int32 => "int32",
            FieldType::Uint64 => "uint64",
            FieldType::Int64 => "int64",
            FieldType::Float32 => "float32",
            FieldType::Float64 => "float64",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One named field of a record layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
}

/// Ordered record layout parsed from a `fields` header value such as
/// `<trodestime uint32><systime int64>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    fields: Vec<FieldSpec>,
}

impl FieldSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Parse a fields descriptor string into an ordered schema
    pub fn parse(descriptor: &str) -> Result<Self> {
        let trimmed = descriptor.trim();
        if trimmed.is_empty() {
            return Err(DatFormatError::InvalidFieldsDescriptor {
                reason: "descriptor is empty".to_string(),
            });
        }

        let mut fields = Vec::new();
        let mut rest = trimmed;
        while !rest.is_empty() {
            if !rest.starts_with('<') {
                return Err(DatFormatError::InvalidFieldsDescriptor {
                    reason: format!("expected '<' at {:?}", rest),
                });
            }
            let Some(end) = rest.find('>') else {
                return Err(DatFormatError::InvalidFieldsDescriptor {
                    reason: format!("unterminated token in {:?}", rest),
                });
            };

            let token = &rest[1..end];
            let mut parts = token.split_whitespace();
            let (Some(name), Some(ty), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(DatFormatError::InvalidFieldsDescriptor {
                    reason: format!("token {:?} is not '<name type>'", token),
                });
            };
            fields.push(FieldSpec {
                name: name.to_string(),
                ty: FieldType::parse(ty)?,
            });
            rest = rest[end + 1..].trim_start();
        }

        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Byte width of one full record
    pub fn record_size(&self) -> usize {
        self.fields.iter().map(|f| f.ty.size()).sum()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

impl fmt::Display for FieldSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.fields {
            write!(f, "<{} {}>", field.name, field.ty)?;
        }
        Ok(())
    }
}

/// One decoded payload column, typed to match its field declaration
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Uint8(Vec<u8>),
    Int8(Vec<i8>),
    Uint16(Vec<u16>),
    Int16(Vec<i16>),
    Uint32(Vec<u32>),
    Int32(Vec<i32>),
    Uint64(Vec<u64>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Uint8(v) => v.len(),
            Column::Int8(v) => v.len(),
            Column::Uint16(v) => v.len(),
            Column::Int16(v) => v.len(),
            Column::Uint32(v) => v.len(),
            Column::Int32(v) => v.len(),
            Column::Uint64(v) => v.len(),
            Column::Int64(v) => v.len(),
            Column::Float32(v) => v.len(),
            Column::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Column::Uint8(_) => FieldType::Uint8,
            Column::Int8(_) => FieldType::Int8,
            Column::Uint16(_) => FieldType::Uint16,
            Column::Int16(_) => FieldType::Int16,
            Column::Uint32(_) => FieldType::Uint32,
            Column::Int32(_) => FieldType::Int32,
            Column::Uint64(_) => FieldType::Uint64,
            Column::Int64(_) => FieldType::Int64,
            Column::Float32(_) => FieldType::Float32,
            Column::Float64(_) => FieldType::Float64,
        }
    }

    pub fn as_u32(&self) -> Option<&[u32]> {
        match self {
            Column::Uint32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            Column::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<&[i16]> {
        match self {
            Column::Int16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<&[u16]> {
        match self {
            Column::Uint16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match self {
            Column::Uint8(v) => Some(v),
            _ => None,
        }
    }
}

/// Columnar record set decoded from a dat payload.
///
/// Transformations add or replace whole columns and yield a new value;
/// individual records are never mutated in place.
#[derive(Debug, Clone)]
pub struct RecordSet {
    schema: FieldSchema,
    columns: Vec<Column>,
    n_records: usize,
}

impl RecordSet {
    /// Decode a little-endian fixed-width payload against a schema
    pub fn decode(schema: &FieldSchema, payload: &[u8]) -> Result<Self> {
        let record_size = schema.record_size();
        if record_size == 0 {
            return Err(DatFormatError::InvalidFieldsDescriptor {
                reason: "schema has no fields".to_string(),
            });
        }
        if payload.len() % record_size != 0 {
            return Err(DatFormatError::RecordSizeMismatch {
                payload_len: payload.len(),
                record_size,
            });
        }
        let n_records = payload.len() / record_size;

        macro_rules! decode_column {
            ($ty:ty, $variant:ident, $offset:expr, $width:expr) => {{
                let mut values = Vec::with_capacity(n_records);
                let mut at = $offset;
                for _ in 0..n_records {
                    let raw: [u8; $width] = payload[at..at + $width].try_into().unwrap();
                    values.push(<$ty>::from_le_bytes(raw));
                    at += record_size;
                }
                Column::$variant(values)
            }};
        }

        let mut columns = Vec::with_capacity(schema.field_count());
        let mut offset = 0;
        for field in schema.fields() {
            let column = match field.ty {
                FieldType::Uint8 => decode_column!(u8, Uint8, offset, 1),
                FieldType::Int8 => decode_column!(i8, Int8, offset, 1),
                FieldType::Uint16 => decode_column!(u16, Uint16, offset, 2),
                FieldType::Int16 => decode_column!(i16, Int16, offset, 2),
                FieldType::Uint32 => decode_column!(u32, Uint32, offset, 4),
                FieldType::Int32 => decode_column!(i32, Int32, offset, 4),
                FieldType::Uint64 => decode_column!(u64, Uint64, offset, 8),
                FieldType::Int64 => decode_column!(i64, Int64, offset, 8),
                FieldType::Float32 => decode_column!(f32, Float32, offset, 4),
                FieldType::Float64 => decode_column!(f64, Float64, offset, 8),
            };
            columns.push(column);
            offset += field.ty.size();
        }

        Ok(Self {
            schema: schema.clone(),
            columns,
            n_records,
        })
    }

    /// Build a record set directly from named columns
    pub fn from_columns(columns: Vec<(String, Column)>) -> Result<Self> {
        let n_records = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        for (name, column) in &columns {
            if column.len() != n_records {
                return Err(DatFormatError::ColumnLengthMismatch {
                    name: name.clone(),
                    expected: n_records,
                    actual: column.len(),
                });
            }
        }
        let fields = columns
            .iter()
            .map(|(name, column)| FieldSpec {
                name: name.clone(),
                ty: column.field_type(),
            })
            .collect();
        Ok(Self {
            schema: FieldSchema::new(fields),
            columns: columns.into_iter().map(|(_, c)| c).collect(),
            n_records,
        })
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    pub fn n_records(&self) -> usize {
        self.n_records
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.schema.position(name).is_some()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.schema.position(name).map(|i| &self.columns[i])
    }

    pub fn columns(&self) -> impl Iterator<Item = (&FieldSpec, &Column)> {
        self.schema.fields().iter().zip(self.columns.iter())
    }

    /// Return a new record set with `column` added, or replaced if a column
    /// of that name already exists
    pub fn with_column(&self, name: &str, column: Column) -> Result<Self> {
        if column.len() != self.n_records {
            return Err(DatFormatError::ColumnLengthMismatch {
                name: name.to_string(),
                expected: self.n_records,
                actual: column.len(),
            });
        }
        let mut next = self.clone();
        let spec = FieldSpec {
            name: name.to_string(),
            ty: column.field_type(),
        };
        match next.schema.position(name) {
            Some(i) => {
                next.schema.fields[i] = spec;
                next.columns[i] = column;
            }
            None => {
                next.schema.fields.push(spec);
                next.columns.push(column);
            }
        }
        Ok(next)
    }
}

/// Ordered header key/value mapping.
///
/// Keys are normalized to lowercase at parse time; lookups take the
/// canonical lowercase name. A missing required key is a hard error, never
/// substituted with a default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    entries: Vec<(String, String)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| DatFormatError::MissingKey {
            key: key.to_string(),
        })
    }

    /// Replace an entry in place, or append it if the key is new
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let key = key.to_lowercase();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A fully read extracted data file: parsed header plus raw payload bytes.
///
/// The source file is closed once `read` returns; decoding the payload is
/// deferred to the datatype loaders because record layout depends on header
/// parameters.
#[derive(Debug, Clone)]
pub struct DatFile {
    pub path: PathBuf,
    pub header: Header,
    pub payload: Vec<u8>,
}

impl DatFile {
    /// Read and parse a Trodes extracted data file
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| DatFormatError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let (header, payload_start) = parse_header(&bytes, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            header,
            payload: bytes[payload_start..].to_vec(),
        })
    }

    /// Parse the `fields` header entry, if the file declares one
    pub fn schema(&self) -> Result<Option<FieldSchema>> {
        match self.header.get("fields") {
            Some(descriptor) => FieldSchema::parse(descriptor).map(Some),
            None => Ok(None),
        }
    }

    /// Decode the payload against the declared `fields` schema
    pub fn records(&self) -> Result<RecordSet> {
        let descriptor = self.header.require("fields")?;
        let schema = FieldSchema::parse(descriptor)?;
        RecordSet::decode(&schema, &self.payload)
    }
}

/// Parse the sentinel-delimited header block; returns the header and the
/// byte offset where the binary payload starts.
fn parse_header(bytes: &[u8], path: &Path) -> Result<(Header, usize)> {
    let (first_line, mut offset) = next_line(bytes, 0);
    if first_line != Some(START_SENTINEL.as_bytes()) {
        return Err(DatFormatError::MissingStartMarker {
            path: path.display().to_string(),
        });
    }

    let mut header = Header::new();
    let mut line_count = 0;
    loop {
        let (line, next_offset) = next_line(bytes, offset);
        let Some(line) = line else {
            // Ran off the end of the file without the end sentinel
            return Err(DatFormatError::MissingEndMarker {
                path: path.display().to_string(),
            });
        };
        offset = next_offset;

        if line == END_SENTINEL.as_bytes() {
            break;
        }

        line_count += 1;
        if line_count > MAX_HEADER_LINES {
            return Err(DatFormatError::HeaderTooLong {
                path: path.display().to_string(),
            });
        }

        let line = std::str::from_utf8(line).map_err(|_| DatFormatError::InvalidHeaderLine {
            line: String::from_utf8_lossy(line).into_owned(),
        })?;
        let Some((key, value)) = line.split_once(':') else {
            return Err(DatFormatError::InvalidHeaderLine {
                line: line.to_string(),
            });
        };
        header.set(key.trim(), value.trim().to_string());
    }

    Ok((header, offset))
}

/// Return the next `\n`-terminated line starting at `offset`.
///
/// Returns `None` when no full line remains; headers never legitimately end
/// at EOF, since the payload begins only after the end-sentinel line.
fn next_line(bytes: &[u8], offset: usize) -> (Option<&[u8]>, usize) {
    if offset >= bytes.len() {
        return (None, offset);
    }
    match bytes[offset..].iter().position(|&b| b == b'\n') {
        Some(rel) => (Some(&bytes[offset..offset + rel]), offset + rel + 1),
        None => (None, offset),
    }
}
