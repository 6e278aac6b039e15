use std::io::{BufWriter, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use super::{Column, DatFormatError, END_SENTINEL, Header, RecordSet, Result, START_SENTINEL};

/// Write a header and record set to `path` in the Trodes extracted format.
///
/// The `fields` header entry is regenerated from the actual in-memory
/// columns before anything is written, so a schema-changing transform (such
/// as adding an adjusted time column) can never leave header and payload
/// disagreeing. The file is assembled in a named temp file next to the
/// destination and moved into place atomically; an interrupted write leaves
/// any existing file untouched.
pub fn write_dat_file(path: impl AsRef<Path>, header: &Header, records: &RecordSet) -> Result<()> {
    let path = path.as_ref();
    let io_err = |source: std::io::Error| DatFormatError::Io {
        path: path.display().to_string(),
        source,
    };

    let mut header = header.clone();
    header.set("fields", records.schema().to_string());

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let tmp = match dir {
        Some(dir) => NamedTempFile::new_in(dir),
        None => NamedTempFile::new(),
    }
    .map_err(io_err)?;

    {
        let mut out = BufWriter::new(tmp.as_file());
        write_contents(&mut out, &header, records).map_err(io_err)?;
        out.flush().map_err(io_err)?;
    }

    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn write_contents<W: Write>(out: &mut W, header: &Header, records: &RecordSet) -> std::io::Result<()> {
    writeln!(out, "{}", START_SENTINEL)?;
    for (key, value) in header.iter() {
        writeln!(out, "{}: {}", key, value)?;
    }
    writeln!(out, "{}", END_SENTINEL)?;
    out.write_all(&encode_payload(records))?;
    Ok(())
}

/// Serialize the record set into record-major little-endian bytes
fn encode_payload(records: &RecordSet) -> Vec<u8> {
    let mut payload = Vec::with_capacity(records.n_records() * records.schema().record_size());

    macro_rules! push_value {
        ($values:expr, $i:expr) => {
            payload.extend_from_slice(&$values[$i].to_le_bytes())
        };
    }

    for i in 0..records.n_records() {
        for (_, column) in records.columns() {
            match column {
                Column::Uint8(v) => push_value!(v, i),
                Column::Int8(v) => push_value!(v, i),
                Column::Uint16(v) => push_value!(v, i),
                Column::Int16(v) => push_value!(v, i),
                Column::Uint32(v) => push_value!(v, i),
                Column::Int32(v) => push_value!(v, i),
                Column::Uint64(v) => push_value!(v, i),
                Column::Int64(v) => push_value!(v, i),
                Column::Float32(v) => push_value!(v, i),
                Column::Float64(v) => push_value!(v, i),
            }
        }
    }

    payload
}
