//! CRC32 checksums for journal records.
//!
//! The on-disk format depends on this value, so the implementation must be
//! stable across releases. CRC32 (IEEE polynomial) is computed incrementally:
//! feeding `a` then `b` yields the same value as feeding `a ‖ b` in one call.

use crc32fast::Hasher;

/// Incremental 32-bit checksum over an arbitrary byte sequence.
#[derive(Default)]
pub struct Checksum {
    hasher: Hasher,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold more bytes into the running checksum.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Consume the state and produce the final 32-bit value.
    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

/// One-shot checksum over a complete byte slice.
pub fn checksum_of(data: &[u8]) -> u32 {
    let mut sum = Checksum::new();
    sum.update(data);
    sum.finalize()
}
