//! Journal recovery.
//!
//! Scans the journal directory in identifier order and rolls forward every
//! well-formed record: apply its writes, fsync the data file, unlink the
//! record, fsync the directory. Broken records are counted and, on
//! request, removed. Replay is idempotent: a record whose writes are
//! already present produces byte-identical results, so recovery is safe to
//! re-run after a crash during recovery itself.
//!
//! Replay order matters where records overlap: later identifiers commit
//! later and must win, the same ordering the lock manager enforces at
//! runtime.

use std::fs::{self, File};
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::journal::record::{self, RecordOutcome};
use crate::journal::JournalDir;
use crate::platform;

/// Behavior switches for [`fsck`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FsckOptions {
    /// Remove broken records after counting them.
    pub cleanup: bool,
}

/// What a recovery pass found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FsckReport {
    /// Journal records seen.
    pub total: u64,
    /// Well-formed records replayed and removed.
    pub applied: u64,
    /// Records that failed validation.
    pub broken: u64,
    /// Applied records whose writes were already present byte-for-byte.
    pub reapplied: u64,
    /// Broken records removed because cleanup was requested.
    pub cleaned: u64,
}

/// Check and roll forward the journal of `datafile`.
///
/// Takes a whole-file kernel lock on the journal lockfile for the
/// duration, so concurrent openers of the same file wait.
///
/// # Errors
///
/// [`Error::NoJournal`] when no journal directory exists beside the data
/// file; [`Error::NotFound`] when the data file itself is missing;
/// otherwise the classified I/O failure.
pub fn fsck(datafile: &Path, options: &FsckOptions) -> Result<FsckReport> {
    let data = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(datafile)
        .map_err(|e| Error::io(format!("open data file {}", datafile.display()), e))?;
    let journal = JournalDir::open_existing(datafile)?;

    let lockfile = journal.open_lockfile()?;
    platform::lock_range(&lockfile, 0, 0).map_err(|e| Error::io("lock journal lockfile", e))?;
    let report = run_replay(&data, &journal, options.cleanup);
    let _ = platform::unlock_range(&lockfile, 0, 0);
    report
}

/// Replay pass shared by [`fsck`] and handle open.
///
/// The caller is responsible for exclusive access to the journal.
pub(crate) fn run_replay(data: &File, journal: &JournalDir, cleanup: bool) -> Result<FsckReport> {
    let mut report = FsckReport::default();
    let mut max_seen: u32 = 0;

    for id in journal.scan()? {
        report.total += 1;
        max_seen = max_seen.max(id);
        match record::read_record(&journal.record_path(id))? {
            RecordOutcome::Broken(broken) => {
                warn!(id, kind = ?broken.kind, reason = %broken.reason, "broken journal record");
                report.broken += 1;
                if cleanup {
                    journal.remove(id)?;
                    report.cleaned += 1;
                }
            }
            RecordOutcome::Valid(rec) => {
                let mut identical = true;
                for w in &rec.writes {
                    let mut current = vec![0u8; w.data.len()];
                    let n = platform::read_full(data, &mut current, w.offset)
                        .map_err(|e| Error::io("read data file", e))?;
                    if n < w.data.len() || current != w.data {
                        identical = false;
                        break;
                    }
                }
                for w in &rec.writes {
                    platform::write_full(data, &w.data, w.offset)
                        .map_err(|e| Error::io("write data file", e))?;
                }
                platform::fsync(data).map_err(|e| Error::io("fsync data file", e))?;
                journal.remove(id)?;
                report.applied += 1;
                if identical {
                    report.reapplied += 1;
                }
                debug!(id, ops = rec.writes.len(), "replayed journal record");
            }
        }
    }

    // Identifiers stay monotonic across restarts: never hand out an id at
    // or below anything seen on disk.
    let persisted = journal.load_next_id()?.unwrap_or(1);
    let next = persisted.max(max_seen.saturating_add(1)).max(1);
    journal.store_next_id(next)?;

    Ok(report)
}
