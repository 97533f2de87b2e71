//! TFS: a tiny flash file store for boot monitors.
//!
//! Files live in a linear chain of records on NOR flash. Replacing a file
//! and compacting a device (defrag) are both safe against power loss at any
//! point; the next [`Tfs::mount`] finishes what was interrupted.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod chain;
pub mod config;
pub mod crc;
pub mod defrag;
pub mod device;
pub mod error;
pub mod flash;
pub mod header;
pub mod platform;
pub mod ramflash;

mod add;
mod file;
mod tfs;

#[cfg(test)]
mod defrag_test;

pub use add::{AddOutcome, DataSource};
pub use config::TfsConfig;
pub use defrag::{DefragOutcome, DefragState, DefragStatus, Resume};
pub use device::{DeviceFlags, DeviceTable, TfsDevice};
pub use error::{DefragStep, TfsError, TfsResult};
pub use file::{Fd, OpenMode, Whence};
pub use flash::{FlashDevice, FlashError, Sector};
pub use header::{FileFlags, FileHeader};
pub use platform::{Headless, Platform};
pub use ramflash::RamFlash;
pub use tfs::{FileEntry, LockedTfs, MemUsage, MountReport, Tfs};
