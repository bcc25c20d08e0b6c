//! POSIX file primitives.
//!
//! Positional read/write loops that retry short transfers, file and
//! directory fsync, atomic rename, and blocking byte-range advisory locks.
//! Every blocking syscall here restarts on `EINTR`; callers never see it.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Validate that `[offset, offset + len)` is a representable file range.
///
/// Kernel byte-range locks and positional I/O take signed 64-bit offsets.
pub(crate) fn check_span(offset: u64, len: usize) -> crate::Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| crate::Error::InvalidArgument(format!("range at offset {offset} overflows")))?;
    if end > i64::MAX as u64 {
        return Err(crate::Error::InvalidArgument(format!(
            "range end {end} exceeds maximum file offset"
        )));
    }
    Ok(())
}

/// Read into `buf` starting at `offset`, retrying short reads.
///
/// Returns the number of bytes read. A return smaller than `buf.len()`
/// means end-of-file was reached.
pub fn read_full(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Write all of `buf` at `offset`, retrying short writes.
pub fn write_full(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match file.write_at(&buf[done..], offset + done as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned zero bytes",
                ))
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Flush file data and metadata to stable storage.
pub fn fsync(file: &File) -> io::Result<()> {
    loop {
        match file.sync_all() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Open a directory so it can be fsynced.
pub fn open_dir(path: &Path) -> io::Result<File> {
    File::open(path)
}

/// Rename `from` to `to` within the directory `dir`, then fsync the
/// directory so the rename is durable.
pub fn atomic_replace(dir: &File, from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)?;
    fsync(dir)
}

fn range_op(file: &File, kind: libc::c_short, start: u64, len: u64) -> io::Result<()> {
    // l_len of zero means "to the end of the file, however far it grows".
    let lock = libc::flock {
        l_type: kind,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: start as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    };
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &lock) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

/// Take a blocking exclusive kernel lock over `[start, start + len)`.
///
/// A `len` of zero locks from `start` to the end of the file. Kernel
/// byte-range locks are per process: exclusion between threads of one
/// process is the lock manager's job, not the kernel's.
pub fn lock_range(file: &File, start: u64, len: u64) -> io::Result<()> {
    range_op(file, libc::F_WRLCK as libc::c_short, start, len)
}

/// Release a kernel lock previously taken with [`lock_range`].
pub fn unlock_range(file: &File, start: u64, len: u64) -> io::Result<()> {
    range_op(file, libc::F_UNLCK as libc::c_short, start, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn scratch_file(dir: &TempDir, name: &str) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join(name))
            .unwrap()
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = scratch_file(&dir, "data");

        write_full(&file, b"positional", 100).unwrap();

        let mut buf = vec![0u8; 10];
        let n = read_full(&file, &mut buf, 100).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf, b"positional");
    }

    #[test]
    fn test_read_past_eof_returns_partial_count() {
        let dir = TempDir::new().unwrap();
        let file = scratch_file(&dir, "data");
        write_full(&file, b"abc", 0).unwrap();

        let mut buf = vec![0u8; 8];
        let n = read_full(&file, &mut buf, 0).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn test_read_at_eof_returns_zero() {
        let dir = TempDir::new().unwrap();
        let file = scratch_file(&dir, "data");

        let mut buf = vec![0u8; 4];
        assert_eq!(read_full(&file, &mut buf, 0).unwrap(), 0);
    }

    #[test]
    fn test_write_extends_file_with_zeros() {
        let dir = TempDir::new().unwrap();
        let file = scratch_file(&dir, "data");
        write_full(&file, b"x", 1000).unwrap();

        let mut buf = vec![0xFFu8; 4];
        let n = read_full(&file, &mut buf, 500).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, vec![0u8; 4]);
    }

    #[test]
    fn test_lock_and_unlock_range() {
        let dir = TempDir::new().unwrap();
        let file = scratch_file(&dir, "lock");

        lock_range(&file, 0, 128).unwrap();
        unlock_range(&file, 0, 128).unwrap();

        // Whole-file form with len 0.
        lock_range(&file, 0, 0).unwrap();
        unlock_range(&file, 0, 0).unwrap();
    }

    #[test]
    fn test_atomic_replace_swaps_contents() {
        let dir = TempDir::new().unwrap();
        let dir_handle = open_dir(dir.path()).unwrap();
        let from = dir.path().join("counter.tmp");
        let to = dir.path().join("counter");

        fs::write(&from, b"42\n").unwrap();
        fs::write(&to, b"1\n").unwrap();
        atomic_replace(&dir_handle, &from, &to).unwrap();

        assert_eq!(fs::read(&to).unwrap(), b"42\n");
        assert!(!from.exists());
    }
}
