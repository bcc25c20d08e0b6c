//! Range locks over the data file.
//!
//! Two layers share one interval model, half-open `[start, end)`:
//!
//! - a process-local ordered interval set with a condvar waiter queue,
//!   which serializes transactions within this process, and
//! - kernel byte-range locks on the journal lockfile, which extend the
//!   same exclusion to every process that opens the journaled file.
//!
//! A caller must present the complete interval set it will touch in one
//! call. The manager sorts and coalesces the set and acquires in ascending
//! start order, so two transactions can never hold pieces of each other's
//! ranges while waiting.

use std::collections::BTreeMap;
use std::fs::File;
use std::sync::{Condvar, Mutex, PoisonError};

use tracing::warn;

use crate::error::{Error, Result};
use crate::platform;

/// Process-local range locks layered over kernel locks on the lockfile.
pub(crate) struct LockManager {
    lockfile: File,
    held: Mutex<BTreeMap<u64, u64>>,
    released: Condvar,
}

/// Scoped ownership of a set of locked intervals.
///
/// Dropping the guard releases the kernel locks in descending order and
/// wakes local waiters.
pub(crate) struct RangeGuard<'a> {
    manager: &'a LockManager,
    ranges: Vec<(u64, u64)>,
}

impl LockManager {
    pub(crate) fn new(lockfile: File) -> Self {
        Self {
            lockfile,
            held: Mutex::new(BTreeMap::new()),
            released: Condvar::new(),
        }
    }

    /// Block until every interval in `ranges` is free, then take them all.
    ///
    /// Overlapping and adjacent intervals are coalesced first; acquisition
    /// is all-or-nothing against other holders in this process, then
    /// interval by interval in ascending order against the kernel.
    pub(crate) fn lock_ranges(&self, ranges: &[(u64, u64)]) -> Result<RangeGuard<'_>> {
        for &(start, end) in ranges {
            if start >= end {
                return Err(Error::invalid(format!(
                    "empty lock interval [{start}, {end})"
                )));
            }
        }
        let merged = coalesce(ranges.to_vec());

        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if merged.iter().all(|r| !overlaps(&held, *r)) {
                for &(start, end) in &merged {
                    held.insert(start, end);
                }
                break;
            }
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(held);

        for (i, &(start, end)) in merged.iter().enumerate() {
            if let Err(e) = platform::lock_range(&self.lockfile, start, kernel_len(start, end)) {
                // Back out: kernel locks taken so far, then the local claim.
                for &(s, e2) in merged[..i].iter().rev() {
                    let _ = platform::unlock_range(&self.lockfile, s, kernel_len(s, e2));
                }
                self.release_local(&merged);
                return Err(Error::io("lock byte range on lockfile", e));
            }
        }

        Ok(RangeGuard {
            manager: self,
            ranges: merged,
        })
    }

    fn release_local(&self, ranges: &[(u64, u64)]) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        for &(start, _) in ranges {
            held.remove(&start);
        }
        drop(held);
        self.released.notify_all();
    }

    fn release(&self, ranges: &[(u64, u64)]) {
        for &(start, end) in ranges.iter().rev() {
            if let Err(e) = platform::unlock_range(&self.lockfile, start, kernel_len(start, end)) {
                warn!(start, end, error = %e, "failed to release kernel byte-range lock");
            }
        }
        self.release_local(ranges);
    }
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.ranges);
    }
}

fn kernel_len(start: u64, end: u64) -> u64 {
    // An unbounded interval maps to the kernel's "to end of file" form.
    if end == u64::MAX {
        0
    } else {
        end - start
    }
}

fn coalesce(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Held intervals are pairwise disjoint, so the only candidate for an
/// overlap with `[start, end)` is the held interval with the greatest
/// start below `end`.
fn overlaps(held: &BTreeMap<u64, u64>, (start, end): (u64, u64)) -> bool {
    match held.range(..end).next_back() {
        Some((_, &held_end)) => held_end > start,
        None => false,
    }
}
