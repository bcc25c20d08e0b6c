//! jio - crash-consistent, atomic multi-range writes for regular files.
//!
//! A caller writes through [`JournaledFile`]; every transaction either
//! appears fully applied on the data file after a crash or leaves it
//! unchanged, never a torn mixture. Committed-but-unapplied transactions
//! are replayed in commit order by the implicit recovery at open or by
//! [`fsck`].
//!
//! ```no_run
//! use jio::JournaledFile;
//!
//! # fn main() -> jio::Result<()> {
//! let file = JournaledFile::options().create(true).open("events.db")?;
//! let mut trans = file.new_trans();
//! trans.add_write(b"header".to_vec(), 0)?;
//! trans.add_write(b"body".to_vec(), 4096)?;
//! trans.commit()?;
//! file.close()?;
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod error;
pub mod file;
pub mod journal;
pub mod recovery;
pub mod trans;

mod autosync;
mod lock;
mod platform;

pub use error::{Error, Result};
pub use file::{JournaledFile, OpenOptions};
pub use recovery::{fsck, FsckOptions, FsckReport};
pub use trans::{Committed, ReadSlot, Transaction};
