//! On-disk journal record format.
//!
//! One file per committed transaction, little-endian throughout:
//!
//! | field                      | size     |
//! |----------------------------|----------|
//! | magic                      | 4 B      |
//! | version                    | 4 B      |
//! | flags (reserved)           | 4 B      |
//! | transaction id             | 4 B      |
//! | operation count N          | 4 B      |
//! | N × { offset 8 B, len 4 B }| 12 B each|
//! | payloads, descriptor order | variable |
//! | checksum                   | 4 B      |
//!
//! A record is well-formed iff magic and version match, the descriptors
//! are consistent with the file length, and the trailing CRC32 over
//! everything before it matches. Readers classify failures as *corrupt*
//! (structural mismatch) or *truncated* (file shorter than the
//! descriptors imply); the distinction matters to recovery reporting.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use crate::checksum::Checksum;
use crate::error::{Error, Result};

/// First four bytes of every journal record.
pub const RECORD_MAGIC: [u8; 4] = *b"JRNL";

/// Current format version.
pub const RECORD_VERSION: u32 = 1;

const HEADER_LEN: u64 = 20;
const DESC_LEN: u64 = 12;
const TRAILER_LEN: u64 = 4;

/// A single journaled write: `data` destined for `offset` in the data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// An in-memory journal record, ready to serialize or just deserialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub id: u32,
    pub flags: u32,
    pub writes: Vec<WriteOp>,
}

/// Why a record failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenKind {
    /// Structural mismatch: bad magic, bad version, inconsistent
    /// descriptors, trailing bytes, or a checksum failure.
    Corrupt,
    /// The file ends before the descriptors say it should.
    Truncated,
}

/// A record that failed validation, with the reason kept for reporting.
#[derive(Debug)]
pub struct BrokenRecord {
    pub kind: BrokenKind,
    pub reason: String,
}

/// Outcome of reading one journal record from disk.
#[derive(Debug)]
pub enum RecordOutcome {
    Valid(JournalRecord),
    Broken(BrokenRecord),
}

impl JournalRecord {
    pub fn new(id: u32, writes: Vec<WriteOp>) -> Self {
        Self {
            id,
            flags: 0,
            writes,
        }
    }

    /// Total payload bytes carried by this record.
    pub fn payload_bytes(&self) -> u64 {
        self.writes.iter().map(|w| w.data.len() as u64).sum()
    }

    /// Serialize to the on-disk layout, checksum included.
    pub fn serialize(&self) -> Vec<u8> {
        let payload_len: usize = self.writes.iter().map(|w| w.data.len()).sum();
        let total = HEADER_LEN as usize
            + self.writes.len() * DESC_LEN as usize
            + payload_len
            + TRAILER_LEN as usize;

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&RECORD_MAGIC);
        buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&(self.writes.len() as u32).to_le_bytes());
        for w in &self.writes {
            buf.extend_from_slice(&w.offset.to_le_bytes());
            buf.extend_from_slice(&(w.data.len() as u32).to_le_bytes());
        }
        for w in &self.writes {
            buf.extend_from_slice(&w.data);
        }
        let sum = crate::checksum::checksum_of(&buf);
        buf.extend_from_slice(&sum.to_le_bytes());
        buf
    }
}

fn corrupt(reason: impl Into<String>) -> RecordOutcome {
    RecordOutcome::Broken(BrokenRecord {
        kind: BrokenKind::Corrupt,
        reason: reason.into(),
    })
}

fn truncated(expected: u64, actual: u64) -> RecordOutcome {
    RecordOutcome::Broken(BrokenRecord {
        kind: BrokenKind::Truncated,
        reason: format!("file is {actual} bytes, descriptors imply {expected}"),
    })
}

/// Read `buf.len()` bytes, folding them into the running checksum.
///
/// Returns `Ok(false)` when the file ends first.
fn read_summed<R: Read>(reader: &mut R, sum: &mut Checksum, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => {
            sum.update(buf);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Parse and validate one journal record file.
///
/// Payloads are streamed through the checksum rather than loaded twice.
/// Underlying I/O failures (permission, transient errors) propagate as
/// [`Error`]; validation failures come back as [`RecordOutcome::Broken`].
pub fn read_record(path: &Path) -> Result<RecordOutcome> {
    let file = File::open(path)
        .map_err(|e| Error::io(format!("open journal record {}", path.display()), e))?;
    let file_len = file
        .metadata()
        .map_err(|e| Error::io(format!("stat journal record {}", path.display()), e))?
        .len();
    let mut reader = BufReader::new(file);
    let mut sum = Checksum::new();
    let io_ctx = |e| Error::io(format!("read journal record {}", path.display()), e);

    let mut header = [0u8; HEADER_LEN as usize];
    if !read_summed(&mut reader, &mut sum, &mut header).map_err(io_ctx)? {
        return Ok(truncated(HEADER_LEN + TRAILER_LEN, file_len));
    }
    if header[0..4] != RECORD_MAGIC {
        return Ok(corrupt("bad magic"));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != RECORD_VERSION {
        return Ok(corrupt(format!("unsupported version {version}")));
    }
    let flags = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let id = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
    let op_count = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
    if op_count == 0 {
        return Ok(corrupt("record holds no operations"));
    }

    // Bound the descriptor table against the file length before allocating.
    let desc_end = HEADER_LEN + u64::from(op_count) * DESC_LEN;
    if desc_end + TRAILER_LEN > file_len {
        return Ok(truncated(desc_end + TRAILER_LEN, file_len));
    }

    let mut descriptors = Vec::with_capacity(op_count as usize);
    let mut payload_total: u64 = 0;
    for _ in 0..op_count {
        let mut desc = [0u8; DESC_LEN as usize];
        if !read_summed(&mut reader, &mut sum, &mut desc).map_err(io_ctx)? {
            return Ok(truncated(desc_end + TRAILER_LEN, file_len));
        }
        let offset = u64::from_le_bytes([
            desc[0], desc[1], desc[2], desc[3], desc[4], desc[5], desc[6], desc[7],
        ]);
        let len = u32::from_le_bytes([desc[8], desc[9], desc[10], desc[11]]);
        if len == 0 {
            return Ok(corrupt("zero-length operation"));
        }
        match offset.checked_add(u64::from(len)) {
            Some(end) if end <= i64::MAX as u64 => {}
            _ => return Ok(corrupt(format!("operation range overflows at offset {offset}"))),
        }
        payload_total += u64::from(len);
        descriptors.push((offset, len));
    }

    let expected_len = desc_end + payload_total + TRAILER_LEN;
    if file_len < expected_len {
        return Ok(truncated(expected_len, file_len));
    }
    if file_len > expected_len {
        return Ok(corrupt(format!(
            "{} trailing bytes after record end",
            file_len - expected_len
        )));
    }

    let mut writes = Vec::with_capacity(descriptors.len());
    for (offset, len) in descriptors {
        let mut data = vec![0u8; len as usize];
        if !read_summed(&mut reader, &mut sum, &mut data).map_err(io_ctx)? {
            return Ok(truncated(expected_len, file_len));
        }
        writes.push(WriteOp { offset, data });
    }

    let mut trailer = [0u8; TRAILER_LEN as usize];
    if let Err(e) = reader.read_exact(&mut trailer) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(truncated(expected_len, file_len));
        }
        return Err(io_ctx(e));
    }
    let stored = u32::from_le_bytes(trailer);
    let computed = sum.finalize();
    if stored != computed {
        return Ok(corrupt(format!(
            "checksum mismatch: computed {computed:08x}, stored {stored:08x}"
        )));
    }

    Ok(RecordOutcome::Valid(JournalRecord { id, flags, writes }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample_record() -> JournalRecord {
        JournalRecord::new(
            7,
            vec![
                WriteOp {
                    offset: 0,
                    data: b"hello".to_vec(),
                },
                WriteOp {
                    offset: 4096,
                    data: b"world!".to_vec(),
                },
            ],
        )
    }

    fn write_bytes(dir: &TempDir, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("000000007");
        fs::write(&path, bytes).unwrap();
        path
    }

    fn read_valid(path: &Path) -> JournalRecord {
        match read_record(path).unwrap() {
            RecordOutcome::Valid(r) => r,
            RecordOutcome::Broken(b) => panic!("expected valid record, got {b:?}"),
        }
    }

    fn read_broken(path: &Path) -> BrokenRecord {
        match read_record(path).unwrap() {
            RecordOutcome::Broken(b) => b,
            RecordOutcome::Valid(_) => panic!("expected broken record"),
        }
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let dir = TempDir::new().unwrap();
        let record = sample_record();
        let path = write_bytes(&dir, &record.serialize());

        assert_eq!(read_valid(&path), record);
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let record = sample_record();
        assert_eq!(record.serialize(), record.serialize());
    }

    #[test]
    fn test_payload_bytes_sums_operations() {
        assert_eq!(sample_record().payload_bytes(), 11);
    }

    #[test]
    fn test_bit_flip_anywhere_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let serialized = sample_record().serialize();

        // Flip a payload bit, a descriptor bit, and an id bit in turn.
        for pos in [serialized.len() - 6, 24, 13] {
            let mut copy = serialized.clone();
            copy[pos] ^= 0x01;
            let path = write_bytes(&dir, &copy);
            let broken = read_broken(&path);
            assert_eq!(broken.kind, BrokenKind::Corrupt, "flip at {pos}: {broken:?}");
        }
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let mut bytes = sample_record().serialize();
        bytes[0] = b'X';
        let broken = read_broken(&write_bytes(&dir, &bytes));
        assert_eq!(broken.kind, BrokenKind::Corrupt);
        assert!(broken.reason.contains("magic"));
    }

    #[test]
    fn test_unknown_version_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let mut bytes = sample_record().serialize();
        bytes[4] = 99;
        let broken = read_broken(&write_bytes(&dir, &bytes));
        assert_eq!(broken.kind, BrokenKind::Corrupt);
        assert!(broken.reason.contains("version"));
    }

    #[test]
    fn test_short_file_is_truncated() {
        let dir = TempDir::new().unwrap();
        let bytes = sample_record().serialize();

        // Cut inside the payload and inside the header.
        for keep in [bytes.len() - 8, 10] {
            let path = write_bytes(&dir, &bytes[..keep]);
            let broken = read_broken(&path);
            assert_eq!(broken.kind, BrokenKind::Truncated, "kept {keep} bytes");
        }
    }

    #[test]
    fn test_trailing_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let mut bytes = sample_record().serialize();
        bytes.extend_from_slice(b"junk");
        let broken = read_broken(&write_bytes(&dir, &bytes));
        assert_eq!(broken.kind, BrokenKind::Corrupt);
    }

    #[test]
    fn test_empty_file_is_truncated() {
        let dir = TempDir::new().unwrap();
        let broken = read_broken(&write_bytes(&dir, &[]));
        assert_eq!(broken.kind, BrokenKind::Truncated);
    }

    #[test]
    fn test_zero_op_record_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let record = JournalRecord::new(1, Vec::new());
        let broken = read_broken(&write_bytes(&dir, &record.serialize()));
        assert_eq!(broken.kind, BrokenKind::Corrupt);
    }

    #[test]
    fn test_missing_file_is_an_error_not_a_classification() {
        let dir = TempDir::new().unwrap();
        let err = read_record(&dir.path().join("000000099")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
