//! Concurrent commits through one handle.
//!
//! Disjoint transactions may interleave freely; overlapping transactions
//! must serialize so that the result equals one of the two serial orders,
//! never a byte-level blend.

use std::sync::Arc;
use std::thread;

use jio::JournaledFile;
use tempfile::TempDir;

fn open_shared(dir: &TempDir) -> Arc<JournaledFile> {
    Arc::new(
        JournaledFile::options()
            .create(true)
            .open(dir.path().join("data"))
            .unwrap(),
    )
}

#[test]
fn test_disjoint_commits_both_land() {
    let dir = TempDir::new().unwrap();
    let file = open_shared(&dir);

    let a = Arc::clone(&file);
    let b = Arc::clone(&file);
    let ta = thread::spawn(move || {
        let mut trans = a.new_trans();
        trans.add_write(b"XXXX".to_vec(), 0).unwrap();
        trans.commit().unwrap();
    });
    let tb = thread::spawn(move || {
        let mut trans = b.new_trans();
        trans.add_write(b"YYYY".to_vec(), 1024).unwrap();
        trans.commit().unwrap();
    });
    ta.join().unwrap();
    tb.join().unwrap();

    let mut buf = vec![0u8; 4];
    file.pread(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"XXXX");
    file.pread(&mut buf, 1024).unwrap();
    assert_eq!(&buf, b"YYYY");
}

#[test]
fn test_overlapping_commits_serialize() {
    let dir = TempDir::new().unwrap();
    let file = open_shared(&dir);
    file.truncate(64).unwrap();

    let a = Arc::clone(&file);
    let b = Arc::clone(&file);
    let ta = thread::spawn(move || {
        let mut trans = a.new_trans();
        trans.add_write(b"AAAA".to_vec(), 10).unwrap();
        trans.commit().unwrap();
    });
    let tb = thread::spawn(move || {
        let mut trans = b.new_trans();
        trans.add_write(b"BBBB".to_vec(), 12).unwrap();
        trans.commit().unwrap();
    });
    ta.join().unwrap();
    tb.join().unwrap();

    let mut buf = vec![0u8; 6];
    file.pread(&mut buf, 10).unwrap();
    assert!(
        &buf == b"AABBBB" || &buf == b"AAAABB",
        "blended overlapping writes: {:?}",
        buf
    );
}

#[test]
fn test_many_disjoint_writers() {
    let dir = TempDir::new().unwrap();
    let file = open_shared(&dir);

    let mut handles = Vec::new();
    for i in 0..8u64 {
        let file = Arc::clone(&file);
        handles.push(thread::spawn(move || {
            for j in 0..4u64 {
                let offset = i * 1024 + j * 64;
                let mut trans = file.new_trans();
                trans.add_write(vec![i as u8 + 1; 16], offset).unwrap();
                trans.commit().unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for i in 0..8u64 {
        for j in 0..4u64 {
            let mut buf = vec![0u8; 16];
            file.pread(&mut buf, i * 1024 + j * 64).unwrap();
            assert_eq!(buf, vec![i as u8 + 1; 16]);
        }
    }
}

#[test]
fn test_pread_does_not_observe_half_applied_transaction() {
    // A reader that honors the lock manager can only observe the data
    // file before or after a whole transaction, so a two-range commit
    // must never show one range updated and the other stale.
    let dir = TempDir::new().unwrap();
    let file = open_shared(&dir);
    file.truncate(2048).unwrap();

    let writer = Arc::clone(&file);
    let tw = thread::spawn(move || {
        for round in 1..=16u8 {
            let mut trans = writer.new_trans();
            trans.add_write(vec![round; 8], 0).unwrap();
            trans.add_write(vec![round; 8], 1024).unwrap();
            trans.commit().unwrap();
        }
    });

    let reader = Arc::clone(&file);
    let tr = thread::spawn(move || {
        for _ in 0..64 {
            let mut trans = reader.new_trans();
            let first = trans.add_read(8, 0).unwrap();
            let second = trans.add_read(8, 1024).unwrap();
            let committed = trans.commit().unwrap();
            assert_eq!(
                committed.read(first),
                committed.read(second),
                "observed a torn transaction"
            );
        }
    });

    tw.join().unwrap();
    tr.join().unwrap();
}
