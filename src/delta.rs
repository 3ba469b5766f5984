//! Changed-block journal and merge.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic "VSDELTA1" | u64 virtual size | u64 extent count
//! { u64 offset | u64 length | length bytes } * extent count
//! ```
//!
//! Extents are stored in checkpoint order and applied in that order, so a
//! later write to the same range wins.

use crate::{MigrationError, Result, log_debug, log_info};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const MAGIC: &[u8; 8] = b"VSDELTA1";

const COPY_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaHeader {
    pub virtual_size: u64,
    pub extent_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeStats {
    pub extents: u64,
    pub bytes_applied: u64,
    pub virtual_size: u64,
}

/// Streams a journal to any writer.
pub struct DeltaWriter<W: Write> {
    inner: W,
    declared: u64,
    written: u64,
    virtual_size: u64,
}

impl<W: Write> DeltaWriter<W> {
    pub fn new(mut inner: W, virtual_size: u64, extent_count: u64) -> Result<Self> {
        inner.write_all(MAGIC)?;
        inner.write_all(&virtual_size.to_le_bytes())?;
        inner.write_all(&extent_count.to_le_bytes())?;
        Ok(Self {
            inner,
            declared: extent_count,
            written: 0,
            virtual_size,
        })
    }

    pub fn push(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.written == self.declared {
            return Err(MigrationError::Conversion(format!(
                "journal declares {} extents, refusing another",
                self.declared
            )));
        }
        let end = offset.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > self.virtual_size) {
            return Err(extent_out_of_range(offset, data.len() as u64, self.virtual_size));
        }
        self.inner.write_all(&offset.to_le_bytes())?;
        self.inner.write_all(&(data.len() as u64).to_le_bytes())?;
        self.inner.write_all(data)?;
        self.written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        if self.written != self.declared {
            return Err(MigrationError::Conversion(format!(
                "journal declares {} extents but {} were written",
                self.declared, self.written
            )));
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

pub fn read_header<R: Read>(reader: &mut R) -> Result<DeltaHeader> {
    let mut magic = [0u8; 8];
    read_exact(reader, &mut magic, "header")?;
    if &magic != MAGIC {
        return Err(MigrationError::Conversion(
            "delta export is not a changed-block journal".to_string(),
        ));
    }
    Ok(DeltaHeader {
        virtual_size: read_u64(reader, "header")?,
        extent_count: read_u64(reader, "header")?,
    })
}

/// Copy the raw `base` to `out` and apply the journal at `delta` on top.
///
/// `out` is always rebuilt from `base`, so repeating a merge with the same
/// inputs produces the same bytes.
pub fn merge_delta(base: &Path, delta: &Path, out: &Path) -> Result<MergeStats> {
    if out == base || out == delta {
        return Err(MigrationError::State(format!(
            "merge output {} must differ from its inputs",
            out.display()
        )));
    }

    let mut journal = BufReader::new(File::open(delta)?);
    let header = read_header(&mut journal)?;

    let base_len = fs::metadata(base)?.len();
    if base_len > header.virtual_size {
        return Err(MigrationError::Conversion(format!(
            "base image is {} bytes but the journal describes a {} byte disk",
            base_len, header.virtual_size
        )));
    }

    fs::copy(base, out)?;
    let mut target = OpenOptions::new().write(true).open(out)?;
    if base_len < header.virtual_size {
        log_debug!(
            "Growing merged image from {} to {} bytes",
            base_len,
            header.virtual_size
        );
        target.set_len(header.virtual_size)?;
    }

    let mut stats = MergeStats {
        virtual_size: header.virtual_size,
        ..MergeStats::default()
    };
    let mut buffer = vec![0u8; COPY_CHUNK];
    let mut writer = BufWriter::new(&mut target);

    for index in 0..header.extent_count {
        let offset = read_u64(&mut journal, "extent header")?;
        let length = read_u64(&mut journal, "extent header")?;
        let end = offset
            .checked_add(length)
            .ok_or_else(|| extent_out_of_range(offset, length, header.virtual_size))?;
        if end > header.virtual_size {
            return Err(extent_out_of_range(offset, length, header.virtual_size));
        }

        writer.seek(SeekFrom::Start(offset))?;
        let mut remaining = length;
        while remaining > 0 {
            let chunk = remaining.min(COPY_CHUNK as u64) as usize;
            read_exact(&mut journal, &mut buffer[..chunk], "extent data")?;
            writer.write_all(&buffer[..chunk])?;
            remaining -= chunk as u64;
        }

        stats.extents = index + 1;
        stats.bytes_applied += length;
    }

    let mut trailing = [0u8; 1];
    if journal.read(&mut trailing)? != 0 {
        return Err(MigrationError::Conversion(
            "changed-block journal has trailing data".to_string(),
        ));
    }

    writer.flush()?;
    drop(writer);
    target.sync_all()?;

    log_info!(
        "Merged {} extents ({} bytes) into {}",
        stats.extents,
        stats.bytes_applied,
        out.display()
    );
    Ok(stats)
}

fn extent_out_of_range(offset: u64, length: u64, virtual_size: u64) -> MigrationError {
    MigrationError::Conversion(format!(
        "extent {}+{} lies outside the {} byte disk",
        offset, length, virtual_size
    ))
}

fn read_u64<R: Read>(reader: &mut R, what: &str) -> Result<u64> {
    let mut bytes = [0u8; 8];
    read_exact(reader, &mut bytes, what)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            MigrationError::Conversion(format!("changed-block journal truncated in {}", what))
        }
        _ => MigrationError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn journal(virtual_size: u64, extents: &[(u64, &[u8])]) -> Vec<u8> {
        let mut writer =
            DeltaWriter::new(Vec::new(), virtual_size, extents.len() as u64).unwrap();
        for (offset, data) in extents {
            writer.push(*offset, data).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn header_round_trips() {
        let bytes = journal(4096, &[(0, &b"abc"[..])]);
        let header = read_header(&mut bytes.as_slice()).unwrap();
        assert_eq!(header, DeltaHeader { virtual_size: 4096, extent_count: 1 });
    }

    #[test]
    fn later_extents_win() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.raw");
        let delta = dir.path().join("delta.vsdelta");
        let out = dir.path().join("merged.raw");

        fs::write(&base, vec![0u8; 16]).unwrap();
        fs::write(&delta, journal(16, &[(2, &b"AAAA"[..]), (4, &b"BB"[..])])).unwrap();

        let stats = merge_delta(&base, &delta, &out).unwrap();
        assert_eq!(stats.extents, 2);
        assert_eq!(stats.bytes_applied, 6);

        let merged = fs::read(&out).unwrap();
        assert_eq!(&merged[..8], &[0, 0, b'A', b'A', b'B', b'B', 0, 0]);
        // base untouched
        assert_eq!(fs::read(&base).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn grows_base_to_virtual_size() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.raw");
        let delta = dir.path().join("delta.vsdelta");
        let out = dir.path().join("merged.raw");

        fs::write(&base, vec![1u8; 8]).unwrap();
        fs::write(&delta, journal(12, &[(10, &b"zz"[..])])).unwrap();

        merge_delta(&base, &delta, &out).unwrap();
        assert_eq!(
            fs::read(&out).unwrap(),
            vec![1, 1, 1, 1, 1, 1, 1, 1, 0, 0, b'z', b'z']
        );
    }

    #[test]
    fn truncated_journal_is_a_conversion_error() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.raw");
        let delta = dir.path().join("delta.vsdelta");
        let out = dir.path().join("merged.raw");

        fs::write(&base, vec![0u8; 16]).unwrap();
        let mut bytes = journal(16, &[(0, &b"12345678"[..])]);
        bytes.truncate(bytes.len() - 3);
        fs::write(&delta, bytes).unwrap();

        let err = merge_delta(&base, &delta, &out).unwrap_err();
        assert!(matches!(err, MigrationError::Conversion(_)), "{err}");
    }

    #[test]
    fn writer_rejects_extent_past_disk_end() {
        let mut writer = DeltaWriter::new(Vec::new(), 8, 1).unwrap();
        assert!(writer.push(6, b"abc").is_err());
    }

    #[test]
    fn merge_refuses_in_place_output() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.raw");
        let delta = dir.path().join("delta.vsdelta");
        fs::write(&base, vec![0u8; 4]).unwrap();
        fs::write(&delta, journal(4, &[])).unwrap();
        assert!(merge_delta(&base, &delta, &base).is_err());
    }
}
