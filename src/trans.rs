//! The transaction engine.
//!
//! A transaction is built in memory, then moved through commit in a fixed
//! order:
//!
//! 1. lock every interval the transaction touches (sorted, coalesced)
//! 2. resolve read operations against the pre-transaction file state
//! 3. assign the identifier
//! 4. write and fsync the journal record, fsync the journal directory;
//!    the transaction is durable from here on
//! 5. apply the writes to the data file in the order they were added
//! 6. fsync the data file and remove the record, or hand both off to the
//!    linger queue
//! 7. release the locks
//!
//! Before step 4 any failure aborts with no durable trace. After step 4
//! there is no abort: a failure is reported to the caller, but the record
//! stays on disk and the next recovery pass rolls it forward.

use std::sync::{PoisonError, Weak};

use tracing::warn;

use crate::error::{Error, Result};
use crate::file::{Shared, TransState};
use crate::journal::record::{JournalRecord, WriteOp};
use crate::platform;

/// A single operation recorded in a transaction.
#[derive(Debug)]
enum Op {
    Write(WriteOp),
    Read { offset: u64, len: usize },
}

impl Op {
    fn span(&self) -> (u64, u64) {
        match self {
            Op::Write(w) => (w.offset, w.offset + w.data.len() as u64),
            Op::Read { offset, len } => (*offset, offset + *len as u64),
        }
    }
}

/// Handle to the result of a read operation, redeemed after commit.
#[derive(Debug, Clone, Copy)]
pub struct ReadSlot(usize);

/// An uncommitted transaction: an ordered list of operations.
///
/// Operations are recorded without any I/O; everything happens at
/// [`commit`](Transaction::commit). Dropping an uncommitted transaction
/// has no side effects.
#[derive(Debug)]
pub struct Transaction {
    shared: Weak<Shared>,
    ops: Vec<Op>,
    read_count: usize,
}

/// A committed transaction: its identifier and the bytes its read
/// operations observed.
#[derive(Debug)]
pub struct Committed {
    id: u32,
    reads: Vec<Vec<u8>>,
}

impl Committed {
    /// Identifier assigned at commit time.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Bytes observed by a read operation. Shorter than requested when
    /// the read crossed end-of-file.
    pub fn read(&self, slot: ReadSlot) -> &[u8] {
        &self.reads[slot.0]
    }
}

impl Transaction {
    pub(crate) fn new(shared: &std::sync::Arc<Shared>) -> Self {
        shared
            .builders
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Self {
            shared: std::sync::Arc::downgrade(shared),
            ops: Vec::new(),
            read_count: 0,
        }
    }

    /// Record a write of `data` at `offset`. No I/O happens here.
    pub fn add_write(&mut self, data: impl Into<Vec<u8>>, offset: u64) -> Result<()> {
        let data = data.into();
        if data.is_empty() {
            return Err(Error::invalid("write operation with empty payload"));
        }
        if data.len() as u64 > u64::from(u32::MAX) {
            return Err(Error::invalid("write operation exceeds 4 GiB"));
        }
        platform::check_span(offset, data.len())?;
        self.ops.push(Op::Write(WriteOp { offset, data }));
        Ok(())
    }

    /// Record a read of `len` bytes at `offset`. The bytes observed are
    /// available from [`Committed::read`] once the transaction commits,
    /// and reflect the file state before any of this transaction's writes.
    pub fn add_read(&mut self, len: usize, offset: u64) -> Result<ReadSlot> {
        if len == 0 {
            return Err(Error::invalid("read operation of zero length"));
        }
        platform::check_span(offset, len)?;
        self.ops.push(Op::Read { offset, len });
        let slot = ReadSlot(self.read_count);
        self.read_count += 1;
        Ok(slot)
    }

    /// Number of operations recorded so far.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Commit the transaction.
    ///
    /// On success the writes are applied to the data file; in linger mode
    /// their durability is deferred to the autosync worker or an explicit
    /// sync. On failure before the journal record is durable, the data
    /// file is untouched.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] on an empty transaction or a
    /// closed handle, otherwise with the classified I/O failure. An error
    /// after the record became durable leaves the record in place for
    /// recovery to replay.
    pub fn commit(mut self) -> Result<Committed> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| Error::invalid("handle is closed"))?;
        if self.ops.is_empty() {
            return Err(Error::invalid("transaction has no operations"));
        }

        let ranges: Vec<(u64, u64)> = self.ops.iter().map(Op::span).collect();
        let _guard = shared.locks.lock_ranges(&ranges)?;

        // Reads observe the state prior to this transaction's writes.
        let mut reads = Vec::with_capacity(self.read_count);
        for op in &self.ops {
            if let Op::Read { offset, len } = *op {
                let mut buf = vec![0u8; len];
                let n = platform::read_full(&shared.data, &mut buf, offset)
                    .map_err(|e| Error::io("read from data file", e))?;
                buf.truncate(n);
                reads.push(buf);
            }
        }

        let writes: Vec<WriteOp> = std::mem::take(&mut self.ops)
            .into_iter()
            .filter_map(|op| match op {
                Op::Write(w) => Some(w),
                Op::Read { .. } => None,
            })
            .collect();

        let id = shared.allocate_id();
        if writes.is_empty() {
            // Nothing to journal; the reads alone are the transaction.
            return Ok(Committed { id, reads });
        }
        let record = JournalRecord::new(id, writes);
        shared.registry_set(id, TransState::Committing);

        if let Err(e) = stage(&shared, &record) {
            shared.registry_remove(id);
            return Err(e);
        }

        // Durable from here on. Failures below are reported but leave the
        // record on disk; recovery replays it.
        for w in &record.writes {
            if let Err(e) = platform::write_full(&shared.data, &w.data, w.offset) {
                shared.registry_remove(id);
                warn!(id, "data write failed after durable commit; record kept for recovery");
                return Err(Error::io("write to data file", e));
            }
        }

        if shared.linger_mode {
            shared.registry_set(id, TransState::Applied);
            let mut queue = shared.linger.lock().unwrap_or_else(PoisonError::into_inner);
            queue.pending.push(id);
            queue.bytes += record.payload_bytes();
            drop(queue);
            shared.linger_cond.notify_all();
            return Ok(Committed { id, reads });
        }

        if let Err(e) = platform::fsync(&shared.data) {
            shared.registry_remove(id);
            warn!(id, "data fsync failed after durable commit; record kept for recovery");
            return Err(Error::io("fsync data file", e));
        }
        if let Err(e) = shared.journal.remove(id) {
            shared.registry_remove(id);
            return Err(e);
        }
        shared.registry_remove(id);
        Ok(Committed { id, reads })
    }
}

/// Create the record file and make it durable.
fn stage(shared: &Shared, record: &JournalRecord) -> Result<()> {
    let mut file = shared.journal.allocate(record.id)?;
    if let Err(e) = shared.journal.write_record(&mut file, record) {
        let _ = shared.journal.unlink(record.id);
        return Err(e);
    }
    Ok(())
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .builders
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
    }
}
