//! Background application of lingered transactions.
//!
//! In linger mode, commit defers the data-file fsync and journal removal.
//! Finished transactions accumulate on a handle-local queue; the autosync
//! worker drains it on two conditions:
//!
//! - periodic: at most once per configured interval
//! - threshold: as soon as accumulated payload bytes exceed the limit
//!
//! One drain is one data-file fsync, then every accumulated record is
//! unlinked, then one directory fsync. The data fsync must complete before
//! the first unlink, otherwise a crash could drop both the journal record
//! and the data it guarded.

use std::io;
use std::sync::{Arc, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::file::Shared;
use crate::platform;

/// Pending lingered transactions, protected by the handle's mutex.
#[derive(Debug, Default)]
pub(crate) struct LingerQueue {
    pub(crate) pending: Vec<u32>,
    pub(crate) bytes: u64,
    pub(crate) shutdown: bool,
}

/// A running autosync worker.
pub(crate) struct Autosync {
    thread: thread::JoinHandle<()>,
}

/// Spawn the worker thread for `shared`.
pub(crate) fn start(shared: &Arc<Shared>, interval: Duration, max_bytes: u64) -> Result<Autosync> {
    let weak = Arc::downgrade(shared);
    let thread = thread::Builder::new()
        .name("jio-autosync".into())
        .spawn(move || worker(weak, interval, max_bytes))
        .map_err(|e| Error::io("spawn autosync worker", e))?;
    Ok(Autosync { thread })
}

impl Autosync {
    /// Request shutdown and wait for the worker's final drain.
    pub(crate) fn stop(self, shared: &Shared) -> Result<()> {
        {
            let mut queue = shared.linger.lock().unwrap_or_else(PoisonError::into_inner);
            queue.shutdown = true;
        }
        shared.linger_cond.notify_all();
        self.thread.join().map_err(|_| {
            Error::io(
                "join autosync worker",
                io::Error::new(io::ErrorKind::Other, "worker panicked"),
            )
        })?;
        let mut queue = shared.linger.lock().unwrap_or_else(PoisonError::into_inner);
        queue.shutdown = false;
        Ok(())
    }
}

fn worker(shared: Weak<Shared>, interval: Duration, max_bytes: u64) {
    loop {
        let Some(shared) = shared.upgrade() else { return };
        let (ids, stopping) = next_batch(&shared, interval, max_bytes);
        if !ids.is_empty() {
            match flush(&shared, &ids) {
                Ok(()) => debug!(count = ids.len(), "autosync applied lingered transactions"),
                Err(e) => {
                    warn!(error = %e, "autosync flush failed");
                    *shared
                        .autosync_error
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(e);
                }
            }
        }
        if stopping {
            return;
        }
    }
}

/// Wait for the next wake condition and take the accumulated batch.
fn next_batch(shared: &Shared, interval: Duration, max_bytes: u64) -> (Vec<u32>, bool) {
    let mut queue = shared.linger.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if queue.shutdown {
            break;
        }
        if !queue.pending.is_empty() && queue.bytes >= max_bytes {
            break;
        }
        let (guard, timeout) = shared
            .linger_cond
            .wait_timeout(queue, interval)
            .unwrap_or_else(PoisonError::into_inner);
        queue = guard;
        if timeout.timed_out() {
            break;
        }
    }
    let ids = std::mem::take(&mut queue.pending);
    queue.bytes = 0;
    (ids, queue.shutdown)
}

/// Apply one batch: data fsync, then unlinks, then one directory fsync.
///
/// Also used by the handle's synchronous drain. The journal records stay
/// on disk if any step fails; recovery replays them. Registry entries are
/// released only once the whole batch is durable, so close keeps refusing
/// after a failed drain.
pub(crate) fn flush(shared: &Shared, ids: &[u32]) -> Result<()> {
    platform::fsync(&shared.data).map_err(|e| Error::io("fsync data file", e))?;
    for id in ids {
        shared.journal.unlink(*id)?;
    }
    shared.journal.fsync_dir()?;
    for id in ids {
        shared.registry_remove(*id);
    }
    Ok(())
}

impl std::fmt::Debug for Autosync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autosync")
            .field("thread", &self.thread.thread().name())
            .finish()
    }
}
