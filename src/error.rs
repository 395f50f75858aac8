//! # Storage Error Kinds
//!
//! Most fallible operations in this crate return `eyre::Result` with message
//! context, which is the right shape for precondition violations and one-off
//! failures. The encrypted storage layer is different: callers need to
//! distinguish a handful of outcomes programmatically (an authentication
//! failure is fatal to the operation, address-space exhaustion may be retried
//! after unmapping, a structurally invalid file must not be opened at all).
//!
//! Those kinds are modeled as a typed [`StorageError`] enum. It is always
//! carried inside an `eyre::Report`, so call sites that only want context can
//! keep using `wrap_err`, and call sites that need the kind can downcast:
//!
//! ```ignore
//! match mapping.read_barrier(0, 4096) {
//!     Err(e) if e.downcast_ref::<StorageError>()
//!         .is_some_and(|k| matches!(k, StorageError::DecryptionFailed)) => { ... }
//!     other => other?,
//! }
//! ```

use std::io;

/// Caller-distinguishable failures of the encrypted storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The HMAC of a data block matched neither the current nor the previous
    /// generation, and the block is not all-zero. The file is corrupted or
    /// the key is wrong.
    #[error("page failed HMAC verification; wrong key or corrupted file")]
    DecryptionFailed,

    /// An anonymous mapping could not be allocated (EAGAIN/EMFILE/ENOMEM).
    #[error("address space exhausted while mapping {size} bytes")]
    AddressSpaceExhausted { size: usize },

    /// The file exists and is non-empty but is too small or misshapen to
    /// contain even one encrypted page.
    #[error("invalid encrypted file: {reason}")]
    InvalidFile { reason: String },

    /// Any other file-system failure.
    #[error("storage i/o error")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Classifies an `io::Error` from a mapping attempt: memory-pressure
    /// errno values become [`StorageError::AddressSpaceExhausted`], the rest
    /// stay [`StorageError::Io`].
    pub(crate) fn from_map_error(err: io::Error, size: usize) -> Self {
        match err.raw_os_error() {
            Some(code) if is_mmap_memory_error(code) => {
                StorageError::AddressSpaceExhausted { size }
            }
            _ => StorageError::Io(err),
        }
    }
}

fn is_mmap_memory_error(code: i32) -> bool {
    code == libc::EAGAIN || code == libc::EMFILE || code == libc::ENOMEM
}
