//! The journaled file handle.
//!
//! A handle binds a data file to its journal directory, lock manager, and
//! optional autosync worker. Opening runs implicit recovery; closing is a
//! cooperative teardown that refuses while transactions, lingered work, or
//! the autosync worker are still outstanding. Dropping a handle without
//! closing it just closes descriptors, which is indistinguishable from a
//! crash and therefore always safe: anything unfinished is replayed by the
//! next open or fsck.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::autosync::{self, Autosync, LingerQueue};
use crate::error::{Error, Result};
use crate::journal::JournalDir;
use crate::lock::LockManager;
use crate::platform;
use crate::recovery;
use crate::trans::Transaction;

/// Where a registered transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransState {
    /// Journal record staged or staging; data writes not yet complete.
    Committing,
    /// Data written under linger; fsync and record removal still pending.
    Applied,
}

/// State shared between the handle, its transactions, and the autosync
/// worker. Transactions and the worker hold `Weak` references; the handle
/// is the only strong owner.
pub(crate) struct Shared {
    pub(crate) path: PathBuf,
    pub(crate) data: File,
    pub(crate) writable: bool,
    pub(crate) linger_mode: bool,
    pub(crate) journal: JournalDir,
    pub(crate) locks: LockManager,
    next_id: AtomicU32,
    pub(crate) builders: AtomicUsize,
    registry: Mutex<BTreeMap<u32, TransState>>,
    pub(crate) linger: Mutex<LingerQueue>,
    pub(crate) linger_cond: Condvar,
    pub(crate) autosync_error: Mutex<Option<Error>>,
}

impl Shared {
    pub(crate) fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn registry_set(&self, id: u32, state: TransState) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, state);
    }

    pub(crate) fn registry_remove(&self, id: u32) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Transactions registered between identifier assignment and release.
    pub(crate) fn registry_len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Options controlling how a journaled file is opened.
///
/// Mirrors `std::fs::OpenOptions`, plus [`linger`](OpenOptions::linger)
/// to defer data-file fsync and journal removal to the autosync worker.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    create: bool,
    create_new: bool,
    truncate: bool,
    mode: u32,
    linger: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            create: false,
            create_new: false,
            truncate: false,
            mode: 0o666,
            linger: false,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    /// Permission bits for files created by this open.
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode;
        self
    }

    /// Defer data-file fsync and journal removal at commit; see
    /// [`JournaledFile::autosync_start`] and [`JournaledFile::sync`].
    pub fn linger(&mut self, linger: bool) -> &mut Self {
        self.linger = linger;
        self
    }

    /// Open `path` as a journaled file.
    ///
    /// Creates the journal directory beside the data file when missing
    /// and replays any committed-but-unapplied transactions before
    /// returning. A read-only handle skips replay and cannot commit.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<JournaledFile> {
        let path = path.as_ref();
        if !self.read && !self.write {
            return Err(Error::invalid("handle must be readable or writable"));
        }
        if self.truncate && !self.write {
            return Err(Error::invalid("truncate requires write access"));
        }

        // Truncation is applied after recovery, not by the open itself:
        // pending journal records must be replayed before the tail is cut,
        // or a later replay would resurrect the truncated bytes.
        let data = {
            use std::os::unix::fs::OpenOptionsExt;
            fs::OpenOptions::new()
                .read(self.read)
                .write(self.write)
                .create(self.create)
                .create_new(self.create_new)
                .mode(self.mode)
                .open(path)
                .map_err(|e| Error::io(format!("open {}", path.display()), e))?
        };

        let journal = JournalDir::create_or_open(path)?;
        let lockfile = journal.open_lockfile()?;
        let locks = LockManager::new(lockfile);

        let next_id = if self.write {
            // Implicit recovery, exclusive against every other opener.
            let guard = locks.lock_ranges(&[(0, u64::MAX)])?;
            recovery::run_replay(&data, &journal, false)?;
            if self.truncate {
                data.set_len(0)
                    .map_err(|e| Error::io("truncate data file", e))?;
                platform::fsync(&data).map_err(|e| Error::io("fsync data file", e))?;
            }
            drop(guard);
            journal.load_next_id()?.unwrap_or(1)
        } else {
            let persisted = journal.load_next_id()?.unwrap_or(1);
            let max_seen = journal.scan()?.last().copied().unwrap_or(0);
            persisted.max(max_seen.saturating_add(1))
        };

        Ok(JournaledFile {
            shared: Arc::new(Shared {
                path: path.to_path_buf(),
                data,
                writable: self.write,
                linger_mode: self.linger,
                journal,
                locks,
                next_id: AtomicU32::new(next_id),
                builders: AtomicUsize::new(0),
                registry: Mutex::new(BTreeMap::new()),
                linger: Mutex::new(LingerQueue::default()),
                linger_cond: Condvar::new(),
                autosync_error: Mutex::new(None),
            }),
            autosync: Mutex::new(None),
        })
    }
}

/// A regular file with crash-consistent, atomic multi-range writes.
pub struct JournaledFile {
    shared: Arc<Shared>,
    autosync: Mutex<Option<Autosync>>,
}

impl JournaledFile {
    /// Open with default options: read-write, no create, no linger.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        OpenOptions::new().open(path)
    }

    /// Options builder, mirroring `std::fs::OpenOptions`.
    pub fn options() -> OpenOptions {
        OpenOptions::new()
    }

    /// Path this handle was opened with.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Start a transaction against this file.
    pub fn new_trans(&self) -> Transaction {
        Transaction::new(&self.shared)
    }

    /// Positional read under the range lock for `[offset, offset + len)`.
    ///
    /// Returns the number of bytes read; shorter than the buffer when the
    /// read crosses end-of-file.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        platform::check_span(offset, buf.len())?;
        let _guard = self
            .shared
            .locks
            .lock_ranges(&[(offset, offset + buf.len() as u64)])?;
        platform::read_full(&self.shared.data, buf, offset)
            .map_err(|e| Error::io("read from data file", e))
    }

    /// Positional write, journaled as a single-operation transaction, so
    /// it is atomic and crash-consistent like any other commit.
    pub fn pwrite(&self, data: &[u8], offset: u64) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut trans = self.new_trans();
        trans.add_write(data, offset)?;
        trans.commit()?;
        Ok(data.len())
    }

    /// Truncate the data file to `length` bytes.
    ///
    /// Serialized against every transaction touching any byte at or past
    /// the new length. Lingered transactions are drained first so the cut
    /// cannot be undone by a later journal replay.
    pub fn truncate(&self, length: u64) -> Result<()> {
        if length > i64::MAX as u64 {
            return Err(Error::invalid("length exceeds maximum file offset"));
        }
        // Take the tail lock before draining: a commit landing in the
        // linger queue between the drain and the cut would be replayed
        // past the new length after a crash, resurrecting the truncated
        // bytes. The drain itself takes no range locks, so holding the
        // guard across it cannot deadlock.
        let _guard = self.shared.locks.lock_ranges(&[(length, u64::MAX)])?;
        self.sync()?;
        self.shared
            .data
            .set_len(length)
            .map_err(|e| Error::io("truncate data file", e))?;
        platform::fsync(&self.shared.data).map_err(|e| Error::io("fsync data file", e))
    }

    /// Synchronously drain lingered transactions: one data-file fsync,
    /// then unlink their journal records, then one directory fsync.
    pub fn sync(&self) -> Result<()> {
        let ids = {
            let mut queue = self
                .shared
                .linger
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.bytes = 0;
            std::mem::take(&mut queue.pending)
        };
        if ids.is_empty() {
            return Ok(());
        }
        autosync::flush(&self.shared, &ids)
    }

    /// Start the autosync worker: flush lingered transactions at most
    /// every `interval_secs`, or sooner once pending payload bytes exceed
    /// `max_bytes`.
    pub fn autosync_start(&self, interval_secs: u64, max_bytes: u64) -> Result<()> {
        if interval_secs == 0 {
            return Err(Error::invalid("autosync interval must be nonzero"));
        }
        let mut slot = self.autosync.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(Error::busy("autosync is already running"));
        }
        *slot = Some(autosync::start(
            &self.shared,
            Duration::from_secs(interval_secs),
            max_bytes,
        )?);
        Ok(())
    }

    /// Stop the autosync worker after a final synchronous drain.
    ///
    /// # Errors
    ///
    /// Returns the worker's pending asynchronous error, if any.
    pub fn autosync_stop(&self) -> Result<()> {
        let worker = self
            .autosync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::invalid("autosync is not running"))?;
        worker.stop(&self.shared)?;
        match self.take_autosync_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Take the autosync worker's pending asynchronous error, if any.
    pub fn take_autosync_error(&self) -> Option<Error> {
        self.shared
            .autosync_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Close the handle.
    ///
    /// Refuses while the autosync worker runs, an asynchronous error is
    /// pending, transactions are outstanding, or lingered work has not
    /// been drained. On success the data file is fsynced and the
    /// identifier counter persisted.
    ///
    /// On error the handle is consumed anyway; descriptors close as on
    /// drop and any remaining journal records are replayed by the next
    /// open or fsck.
    pub fn close(self) -> Result<()> {
        if self
            .autosync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Err(Error::busy("autosync is active; stop it before close"));
        }
        if self
            .shared
            .autosync_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Err(Error::busy(
                "autosync error pending; take_autosync_error() first",
            ));
        }
        if self.shared.builders.load(Ordering::SeqCst) != 0 {
            return Err(Error::invalid("transactions still outstanding"));
        }
        {
            let queue = self
                .shared
                .linger
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !queue.pending.is_empty() {
                return Err(Error::busy("lingered transactions pending; sync() first"));
            }
        }
        if self.shared.registry_len() != 0 {
            return Err(Error::busy("transactions still releasing"));
        }
        if self.shared.writable {
            platform::fsync(&self.shared.data).map_err(|e| Error::io("fsync data file", e))?;
            self.shared
                .journal
                .store_next_id(self.shared.next_id.load(Ordering::SeqCst))?;
        }
        Ok(())
    }
}
