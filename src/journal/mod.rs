//! The on-disk journal directory.
//!
//! A journaled data file `f` keeps its journal in the sibling directory
//! `f.jio/`. Inside live one record file per committed-but-unapplied
//! transaction (named by zero-padded identifier, so lexicographic order is
//! commit order), the persisted `next-id` counter, and the empty `lock`
//! file that only exists to carry kernel byte-range locks.
//!
//! Durability protocol: a record file is fsynced, then the directory is
//! fsynced. Only after the directory fsync returns is the transaction
//! durable. Removal mirrors this: unlink, then directory fsync.

pub mod record;

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use self::record::JournalRecord;
use crate::error::{Error, Result};
use crate::platform;

/// Suffix appended to the data file name to form the journal directory.
pub const DIR_SUFFIX: &str = ".jio";

/// Name of the persisted identifier counter inside the journal directory.
pub const NEXT_ID_FILE: &str = "next-id";

/// Name of the lockfile inside the journal directory.
pub const LOCK_FILE: &str = "lock";

/// Width of zero-padded record file names.
const RECORD_NAME_WIDTH: usize = 9;

/// Journal directory path for a given data file.
pub fn dir_path(datafile: &Path) -> PathBuf {
    let mut name = OsString::from(datafile.as_os_str());
    name.push(DIR_SUFFIX);
    PathBuf::from(name)
}

/// An open journal directory: its path plus a directory handle for fsync.
#[derive(Debug)]
pub struct JournalDir {
    path: PathBuf,
    dir: File,
}

impl JournalDir {
    /// Open the journal directory beside `datafile`, creating it if needed.
    ///
    /// Creation fsyncs the parent directory so the new entry is durable.
    pub fn create_or_open(datafile: &Path) -> Result<Self> {
        let path = dir_path(datafile);
        if path.exists() && !path.is_dir() {
            return Err(Error::Exists(format!(
                "{} exists and is not a directory",
                path.display()
            )));
        }
        match fs::create_dir(&path) {
            Ok(()) => {
                let parent = match datafile.parent() {
                    Some(p) if !p.as_os_str().is_empty() => p,
                    _ => Path::new("."),
                };
                let parent_dir = platform::open_dir(parent)
                    .map_err(|e| Error::io(format!("open directory {}", parent.display()), e))?;
                platform::fsync(&parent_dir)
                    .map_err(|e| Error::io(format!("fsync directory {}", parent.display()), e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(Error::io(
                    format!("create journal directory {}", path.display()),
                    e,
                ))
            }
        }
        Self::open_at(path)
    }

    /// Open an existing journal directory, or report that none is present.
    pub fn open_existing(datafile: &Path) -> Result<Self> {
        let path = dir_path(datafile);
        if !path.exists() {
            return Err(Error::NoJournal);
        }
        if !path.is_dir() {
            return Err(Error::Exists(format!(
                "{} exists and is not a directory",
                path.display()
            )));
        }
        Self::open_at(path)
    }

    fn open_at(path: PathBuf) -> Result<Self> {
        let dir = platform::open_dir(&path)
            .map_err(|e| Error::io(format!("open journal directory {}", path.display()), e))?;
        Ok(Self { path, dir })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the record file for `id`.
    pub fn record_path(&self, id: u32) -> PathBuf {
        self.path.join(format!("{id:09}"))
    }

    /// Open the lockfile, creating it empty on first use.
    pub fn open_lockfile(&self) -> Result<File> {
        let path = self.path.join(LOCK_FILE);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::io(format!("open lockfile {}", path.display()), e))
    }

    /// Create a fresh record file for `id` in exclusive mode.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Exists`] if a record with this identifier is
    /// already present.
    pub fn allocate(&self, id: u32) -> Result<File> {
        let path = self.record_path(id);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    Error::Exists(format!("journal record {} already exists", path.display()))
                } else {
                    Error::io(format!("create journal record {}", path.display()), e)
                }
            })
    }

    /// Serialize `record` into `file`, then fsync the file and the
    /// directory. When this returns, the record is durable.
    pub fn write_record(&self, file: &mut File, rec: &JournalRecord) -> Result<()> {
        use std::io::Write;
        let bytes = rec.serialize();
        file.write_all(&bytes)
            .map_err(|e| Error::io(format!("write journal record {}", rec.id), e))?;
        platform::fsync(file).map_err(|e| Error::io(format!("fsync journal record {}", rec.id), e))?;
        self.fsync_dir()
    }

    /// Fsync the journal directory itself.
    pub fn fsync_dir(&self) -> Result<()> {
        platform::fsync(&self.dir)
            .map_err(|e| Error::io(format!("fsync journal directory {}", self.path.display()), e))
    }

    /// Unlink the record for `id` without syncing the directory.
    ///
    /// Batch removal paths unlink several records and fsync the directory
    /// once at the end.
    pub fn unlink(&self, id: u32) -> Result<()> {
        let path = self.record_path(id);
        fs::remove_file(&path)
            .map_err(|e| Error::io(format!("remove journal record {}", path.display()), e))
    }

    /// Unlink the record for `id` and make the removal durable.
    pub fn remove(&self, id: u32) -> Result<()> {
        self.unlink(id)?;
        self.fsync_dir()
    }

    /// Enumerate record identifiers in ascending (= commit) order.
    pub fn scan(&self) -> Result<Vec<u32>> {
        let entries = fs::read_dir(&self.path)
            .map_err(|e| Error::io(format!("read journal directory {}", self.path.display()), e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                Error::io(format!("read journal directory {}", self.path.display()), e)
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() == RECORD_NAME_WIDTH && name.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(id) = name.parse::<u32>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Read the persisted identifier counter.
    ///
    /// A missing or unparsable counter reads as `None`; recovery rebuilds
    /// it from the record files it scans.
    pub fn load_next_id(&self) -> Result<Option<u32>> {
        match fs::read_to_string(self.path.join(NEXT_ID_FILE)) {
            Ok(contents) => Ok(contents.trim().parse::<u32>().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io("read next-id file", e)),
        }
    }

    /// Persist the identifier counter via write-to-temp, fsync, rename,
    /// directory fsync.
    pub fn store_next_id(&self, id: u32) -> Result<()> {
        use std::io::Write;
        let tmp = self.path.join("next-id.tmp");
        let target = self.path.join(NEXT_ID_FILE);
        let mut file =
            File::create(&tmp).map_err(|e| Error::io("create next-id temp file", e))?;
        file.write_all(format!("{id}\n").as_bytes())
            .map_err(|e| Error::io("write next-id temp file", e))?;
        platform::fsync(&file).map_err(|e| Error::io("fsync next-id temp file", e))?;
        platform::atomic_replace(&self.dir, &tmp, &target)
            .map_err(|e| Error::io("replace next-id file", e))
    }
}

#[cfg(test)]
mod tests {
    use super::record::{JournalRecord, RecordOutcome, WriteOp};
    use super::*;
    use tempfile::TempDir;

    fn datafile(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("data");
        fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_dir_path_appends_suffix() {
        assert_eq!(
            dir_path(Path::new("/var/db/events")),
            PathBuf::from("/var/db/events.jio")
        );
    }

    #[test]
    fn test_create_or_open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let data = datafile(&dir);

        let first = JournalDir::create_or_open(&data).unwrap();
        assert!(first.path().is_dir());
        JournalDir::create_or_open(&data).unwrap();
    }

    #[test]
    fn test_open_existing_without_directory_reports_no_journal() {
        let dir = TempDir::new().unwrap();
        let data = datafile(&dir);
        assert!(matches!(
            JournalDir::open_existing(&data),
            Err(Error::NoJournal)
        ));
    }

    #[test]
    fn test_journal_path_collision_with_regular_file() {
        let dir = TempDir::new().unwrap();
        let data = datafile(&dir);
        fs::write(dir_path(&data), b"not a directory").unwrap();

        assert!(matches!(
            JournalDir::create_or_open(&data),
            Err(Error::Exists(_))
        ));
        assert!(matches!(
            JournalDir::open_existing(&data),
            Err(Error::Exists(_))
        ));
    }

    #[test]
    fn test_allocate_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let journal = JournalDir::create_or_open(&datafile(&dir)).unwrap();

        let _file = journal.allocate(1).unwrap();
        assert!(matches!(journal.allocate(1), Err(Error::Exists(_))));
    }

    #[test]
    fn test_write_record_roundtrips_through_scan() {
        let dir = TempDir::new().unwrap();
        let journal = JournalDir::create_or_open(&datafile(&dir)).unwrap();

        let rec = JournalRecord::new(
            3,
            vec![WriteOp {
                offset: 128,
                data: b"abc".to_vec(),
            }],
        );
        let mut file = journal.allocate(3).unwrap();
        journal.write_record(&mut file, &rec).unwrap();

        assert_eq!(journal.scan().unwrap(), vec![3]);
        match record::read_record(&journal.record_path(3)).unwrap() {
            RecordOutcome::Valid(read) => assert_eq!(read, rec),
            RecordOutcome::Broken(b) => panic!("unexpected broken record: {b:?}"),
        }
    }

    #[test]
    fn test_scan_orders_by_identifier_and_skips_metadata() {
        let dir = TempDir::new().unwrap();
        let journal = JournalDir::create_or_open(&datafile(&dir)).unwrap();

        for id in [5u32, 2, 9] {
            let rec = JournalRecord::new(
                id,
                vec![WriteOp {
                    offset: 0,
                    data: vec![0u8],
                }],
            );
            let mut file = journal.allocate(id).unwrap();
            journal.write_record(&mut file, &rec).unwrap();
        }
        journal.store_next_id(10).unwrap();
        journal.open_lockfile().unwrap();

        assert_eq!(journal.scan().unwrap(), vec![2, 5, 9]);
    }

    #[test]
    fn test_remove_unlinks_record() {
        let dir = TempDir::new().unwrap();
        let journal = JournalDir::create_or_open(&datafile(&dir)).unwrap();

        let rec = JournalRecord::new(
            1,
            vec![WriteOp {
                offset: 0,
                data: vec![1u8],
            }],
        );
        let mut file = journal.allocate(1).unwrap();
        journal.write_record(&mut file, &rec).unwrap();
        journal.remove(1).unwrap();

        assert!(journal.scan().unwrap().is_empty());
    }

    #[test]
    fn test_next_id_roundtrip() {
        let dir = TempDir::new().unwrap();
        let journal = JournalDir::create_or_open(&datafile(&dir)).unwrap();

        assert_eq!(journal.load_next_id().unwrap(), None);
        journal.store_next_id(42).unwrap();
        assert_eq!(journal.load_next_id().unwrap(), Some(42));
        journal.store_next_id(43).unwrap();
        assert_eq!(journal.load_next_id().unwrap(), Some(43));
    }

    #[test]
    fn test_malformed_next_id_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let journal = JournalDir::create_or_open(&datafile(&dir)).unwrap();
        fs::write(journal.path().join(NEXT_ID_FILE), b"not a number").unwrap();
        assert_eq!(journal.load_next_id().unwrap(), None);
    }
}
