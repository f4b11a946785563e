//! Hits File Format
//!
//! The tracker persists one file per instrumented module and run. The
//! collector reads it back after the monitored process has exited.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "CVHT"
//! 4       2     format version (LE)
//! 6       2     run id length N (LE)
//! 8       N     run id (UTF-8)
//! 8+N     4     slot count S (LE)
//! 12+N    8*S   counters, one u64 LE per slot
//! ```

use crate::error::{TrackerError, TrackerResult};
use std::io::Write;
use std::path::Path;

/// Magic bytes at the start of every hits file
pub const HITS_MAGIC: [u8; 4] = *b"CVHT";

/// Current hits file format version
pub const HITS_VERSION: u16 = 1;

/// Decoded contents of a hits file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitsFile {
    /// Run identifier the counters belong to
    pub run_id: String,
    /// One counter per slot
    pub counts: Vec<u64>,
}

impl HitsFile {
    /// Create a hits file payload
    #[must_use]
    pub fn new(run_id: impl Into<String>, counts: Vec<u64>) -> Self {
        Self {
            run_id: run_id.into(),
            counts,
        }
    }

    /// Number of slots recorded
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.counts.len()
    }

    /// Encode to bytes
    pub fn to_bytes(&self) -> TrackerResult<Vec<u8>> {
        let id = self.run_id.as_bytes();
        let id_len = u16::try_from(id.len()).map_err(|_| TrackerError::InvalidRunId {
            message: format!("{} bytes exceeds {}", id.len(), u16::MAX),
        })?;
        let slots = u32::try_from(self.counts.len()).map_err(|_| TrackerError::InvalidRunId {
            message: format!("{} slots exceeds {}", self.counts.len(), u32::MAX),
        })?;

        let mut out = Vec::with_capacity(12 + id.len() + self.counts.len() * 8);
        out.extend_from_slice(&HITS_MAGIC);
        out.extend_from_slice(&HITS_VERSION.to_le_bytes());
        out.extend_from_slice(&id_len.to_le_bytes());
        out.extend_from_slice(id);
        out.extend_from_slice(&slots.to_le_bytes());
        for count in &self.counts {
            out.extend_from_slice(&count.to_le_bytes());
        }
        Ok(out)
    }

    /// Decode from bytes; `path` is used for error context only
    pub fn from_bytes(bytes: &[u8], path: &Path) -> TrackerResult<Self> {
        let mut reader = ByteReader { bytes, pos: 0, path };

        if reader.take(4, "magic")? != HITS_MAGIC {
            return Err(TrackerError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let version = reader.u16("version")?;
        if version != HITS_VERSION {
            return Err(TrackerError::UnsupportedVersion {
                path: path.to_path_buf(),
                version,
            });
        }
        let id_len = reader.u16("run id length")? as usize;
        let run_id = std::str::from_utf8(reader.take(id_len, "run id")?)
            .map_err(|e| TrackerError::InvalidRunId {
                message: e.to_string(),
            })?
            .to_string();
        let slots = reader.u32("slot count")? as usize;
        let raw = reader.take(slots * 8, "counters")?;
        let counts = raw
            .chunks_exact(8)
            .map(|b| u64::from_le_bytes(b.try_into().unwrap_or([0; 8])))
            .collect();

        Ok(Self { run_id, counts })
    }

    /// Read and decode a hits file
    pub fn read(path: &Path) -> TrackerResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, path)
    }

    /// Write the file atomically: a temporary file in the same directory is
    /// renamed over `path`, so readers see either the old or the new snapshot.
    pub fn write_atomic(&self, path: &Path) -> TrackerResult<()> {
        let bytes = self.to_bytes()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| TrackerError::Io(e.error))?;
        Ok(())
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, len: usize, what: &str) -> TrackerResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| TrackerError::truncated(self.path, format!("missing {what}")))?;
        let bytes: &'a [u8] = self.bytes;
        let slice = &bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self, what: &str) -> TrackerResult<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> TrackerResult<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
