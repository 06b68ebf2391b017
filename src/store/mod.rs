//! Sinks for the bytes of incoming messages.
//!
//! A store never fails loudly: write errors set a sticky flag that is only visible through
//! [`ContentStore::has_error`], so one broken message cannot stall the shared read path.

pub mod discard;
pub mod file;
pub mod memory;

use std::fmt;
use std::path::{Path, PathBuf};

pub use discard::DiscardStore;
pub use file::FileStore;
pub use memory::MemoryStore;

pub trait ContentStore: Send + fmt::Debug {
    /// Write `bytes` at absolute `offset`, or at the current position when `offset` is `None`.
    ///
    /// Always returns `bytes.len()`; failures only set the error flag.
    fn store(&mut self, offset: Option<u64>, bytes: &[u8]) -> usize;

    /// Release the underlying resource. Called once per message; later calls are no-ops.
    fn receiving_finished(&mut self, aborted: bool);

    fn bytes_received(&self) -> u64;

    fn has_error(&self) -> bool;

    fn was_aborted(&self) -> bool;

    /// The stored bytes, for stores that keep them in memory.
    fn contents(&self) -> Option<&[u8]> {
        None
    }

    /// The backing file, for stores that write to disk.
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Hand the backing file over to the caller so it outlives the store.
    fn persist(&mut self) -> Option<PathBuf> {
        None
    }

    /// Drop whatever the store still holds on to (deletes backing files).
    fn release(&mut self) {}
}

/// Default store policy: small known-size messages in memory, everything else on disk.
pub fn default_store(expected_total: Option<u64>, memory_limit: usize) -> Box<dyn ContentStore> {
    match expected_total {
        Some(total) if total <= memory_limit as u64 => {
            Box::new(MemoryStore::with_capacity(total as usize))
        }
        _ => Box::new(FileStore::temporary()),
    }
}
