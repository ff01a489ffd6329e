//! Operation Log Segments
//!
//! A segment is one file holding a contiguous run of log entries:
//!
//! ```text
//! header (32 bytes): magic "WOLFMETA" | version u32 | first id u64 | reserved
//! record:            id u64 | request type i32 | compressed u8 | len u32
//!                    | payload | crc32 u32 | RECORD_MAGIC u64
//! ```
//!
//! All integers are little-endian. The checksum covers everything from the
//! id up to the end of the payload.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};
use crate::id::LogId;
use crate::operation::OperationFrame;

/// Magic bytes at the start of each segment file
const SEGMENT_MAGIC: &[u8; 8] = b"WOLFMETA";

/// Segment file version
const SEGMENT_VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Trailer closing every record
const RECORD_MAGIC: u64 = 0x574F_4C46_4F50_4C47;

/// Bytes of a record besides its payload
const RECORD_OVERHEAD: usize = 8 + 4 + 1 + 4 + 4 + 8;

/// Segment file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Id of the first record this segment holds (or will hold)
    pub first_id: LogId,
}

impl SegmentHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(SEGMENT_MAGIC);
        bytes[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.first_id.as_u64().to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Oplog("Segment header too short".into()));
        }

        if &bytes[0..8] != SEGMENT_MAGIC {
            return Err(Error::Oplog("Invalid segment magic bytes".into()));
        }

        let version = u32::from_le_bytes(le_array(&bytes[8..12]));
        if version != SEGMENT_VERSION {
            return Err(Error::Oplog(format!(
                "Unsupported segment version: {}",
                version
            )));
        }

        Ok(Self {
            first_id: LogId::new(u64::from_le_bytes(le_array(&bytes[12..20]))),
        })
    }
}

/// Read only the header of a segment file
pub fn read_header(path: &Path) -> Result<SegmentHeader> {
    let mut file = File::open(path)?;
    let mut bytes = [0u8; HEADER_SIZE];
    file.read_exact(&mut bytes)?;
    SegmentHeader::from_bytes(&bytes)
}

/// A record read back from a segment
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub log_id: LogId,
    pub frame: OperationFrame,
}

/// Result of scanning a segment file
pub struct SegmentScan {
    pub header: SegmentHeader,
    pub records: Vec<SegmentRecord>,
    /// Offset just past the last valid record
    pub valid_len: u64,
    /// Whether bytes after `valid_len` failed to decode
    pub torn: bool,
}

/// Read and validate every record of a segment file.
///
/// Decoding stops at the first record that is incomplete, fails its
/// checksum or breaks the id sequence; the caller decides whether that
/// is a torn tail or corruption.
pub fn scan(path: &Path) -> Result<SegmentScan> {
    let data = std::fs::read(path)?;
    let header = SegmentHeader::from_bytes(&data)?;

    let mut records = Vec::new();
    let mut pos = HEADER_SIZE;
    let mut expected = header.first_id;

    while pos < data.len() {
        match decode_record(&data[pos..])? {
            Some((record, len)) if record.log_id == expected => {
                pos += len;
                expected = expected.next();
                records.push(record);
            }
            _ => break,
        }
    }

    Ok(SegmentScan {
        header,
        records,
        valid_len: pos as u64,
        torn: pos < data.len(),
    })
}

fn decode_record(buf: &[u8]) -> Result<Option<(SegmentRecord, usize)>> {
    if buf.len() < RECORD_OVERHEAD {
        return Ok(None);
    }

    let id = u64::from_le_bytes(le_array(&buf[0..8]));
    let request_type = i32::from_le_bytes(le_array(&buf[8..12]));
    let compressed = buf[12] != 0;
    let len = u32::from_le_bytes(le_array(&buf[13..17])) as usize;

    let body_end = 17 + len;
    let total = RECORD_OVERHEAD + len;
    if buf.len() < total {
        return Ok(None);
    }

    let stored_checksum = u32::from_le_bytes(le_array(&buf[body_end..body_end + 4]));
    let magic = u64::from_le_bytes(le_array(&buf[body_end + 4..body_end + 12]));
    if magic != RECORD_MAGIC || stored_checksum != crc32fast::hash(&buf[..body_end]) {
        return Ok(None);
    }

    let payload = &buf[17..body_end];
    let payload = if compressed {
        lz4_flex::decompress_size_prepended(payload).map_err(|e| Error::OplogCorrupted {
            log_id: LogId::new(id),
            reason: format!("Decompression failed: {}", e),
        })?
    } else {
        payload.to_vec()
    };

    Ok(Some((
        SegmentRecord {
            log_id: LogId::new(id),
            frame: OperationFrame {
                request_type,
                payload,
            },
        },
        total,
    )))
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// The segment currently receiving appends
pub struct Segment {
    file: File,
    header: SegmentHeader,
    entry_count: usize,
    compression: bool,
}

impl Segment {
    /// Create a new, empty segment file
    pub fn create(path: PathBuf, first_id: LogId, compression: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let header = SegmentHeader { first_id };
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;

        Ok(Self {
            file,
            header,
            entry_count: 0,
            compression,
        })
    }

    /// Reopen the last segment for appending, dropping a torn tail
    pub fn open(path: PathBuf, compression: bool) -> Result<(Self, Vec<SegmentRecord>)> {
        let scanned = scan(&path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        if scanned.torn {
            warn!(
                "Truncating torn tail of {} at offset {}",
                path.display(),
                scanned.valid_len
            );
            file.set_len(scanned.valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        let segment = Self {
            file,
            header: scanned.header,
            entry_count: scanned.records.len(),
            compression,
        };
        Ok((segment, scanned.records))
    }

    /// Append one record; durable only after [`sync`](Self::sync)
    pub fn append(&mut self, log_id: LogId, frame: &OperationFrame) -> Result<()> {
        let payload = if self.compression {
            lz4_flex::compress_prepend_size(&frame.payload)
        } else {
            frame.payload.clone()
        };

        let len = u32::try_from(payload.len())
            .map_err(|_| Error::Oplog(format!("Record {} too large", log_id)))?;

        let mut record = Vec::with_capacity(RECORD_OVERHEAD + payload.len());
        record.extend_from_slice(&log_id.as_u64().to_le_bytes());
        record.extend_from_slice(&frame.request_type.to_le_bytes());
        record.push(self.compression as u8);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&payload);
        let checksum = crc32fast::hash(&record);
        record.extend_from_slice(&checksum.to_le_bytes());
        record.extend_from_slice(&RECORD_MAGIC.to_le_bytes());

        self.file.write_all(&record)?;
        self.entry_count += 1;
        Ok(())
    }

    /// Flush appended records to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn first_id(&self) -> LogId {
        self.header.first_id
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

/// File name of the segment starting at `first_id`
pub fn segment_file_name(first_id: LogId) -> String {
    format!("oplog_{:020}.opl", first_id.as_u64())
}

/// List all segment files in a directory, oldest first
pub fn list_segments(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "opl")
            && path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.starts_with("oplog_"))
        {
            segments.push(path);
        }
    }

    // Zero-padded ids sort lexically
    segments.sort();
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn frame(n: u8) -> OperationFrame {
        OperationFrame {
            request_type: 2,
            payload: vec![n; 40],
        }
    }

    #[test]
    fn test_segment_append_and_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(LogId::new(5)));

        let mut segment = Segment::create(path.clone(), LogId::new(5), true).unwrap();
        for i in 0..3u64 {
            segment.append(LogId::new(5 + i), &frame(i as u8)).unwrap();
        }
        segment.sync().unwrap();

        let scanned = scan(&path).unwrap();
        assert!(!scanned.torn);
        assert_eq!(scanned.header.first_id, LogId::new(5));
        assert_eq!(scanned.records.len(), 3);
        assert_eq!(scanned.records[2].log_id, LogId::new(7));
        assert_eq!(scanned.records[2].frame, frame(2));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(LogId::FIRST));

        {
            let mut segment = Segment::create(path.clone(), LogId::FIRST, false).unwrap();
            segment.append(LogId::new(1), &frame(1)).unwrap();
            segment.append(LogId::new(2), &frame(2)).unwrap();
            segment.sync().unwrap();
        }

        // Simulate a crash in the middle of the second record
        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 5).unwrap();
        drop(file);

        let (segment, records) = Segment::open(path.clone(), false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(segment.entry_count(), 1);
        assert_eq!(segment.first_id(), LogId::FIRST);
        assert!(!scan(&path).unwrap().torn);
    }

    #[test]
    fn test_bad_header_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oplog_00000000000000000001.opl");
        std::fs::write(&path, b"not a segment file at all, clearly").unwrap();
        assert!(matches!(scan(&path), Err(Error::Oplog(_))));
    }

    #[test]
    fn test_list_segments_sorted() {
        let dir = tempdir().unwrap();
        for id in [17u64, 1, 9] {
            Segment::create(
                dir.path().join(segment_file_name(LogId::new(id))),
                LogId::new(id),
                false,
            )
            .unwrap();
        }
        std::fs::write(dir.path().join("state.db"), b"").unwrap();

        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 3);
        assert!(segments[0].ends_with(segment_file_name(LogId::new(1))));
        assert!(segments[2].ends_with(segment_file_name(LogId::new(17))));
    }
}
