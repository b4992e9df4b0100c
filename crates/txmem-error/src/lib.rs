#![forbid(unsafe_code)]
//! Error types for txmem.
//!
//! Defines `TmError` and a `Result<T>` alias used throughout the workspace.
//! Every transactional failure surfaces as a return value; the engine never
//! panics across its public interface.

use thiserror::Error;

/// Unified error type for all txmem operations.
///
/// Failures split into two classes. *Transient* failures are the normal
/// cost of optimistic progress under contention: the transaction has been
/// rolled back and the caller should retry it from the beginning (see
/// [`TmError::is_transient`]). The remaining variants are permanent:
/// resource exhaustion or a misuse of the interface that retrying cannot
/// fix.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TmError {
    #[error("allocation failed")]
    OutOfMemory,

    #[error("lock contention at {addr:#x}")]
    Contention { addr: usize },

    #[error("address {addr:#x} is not backed by any live segment")]
    Unmapped { addr: usize },

    #[error("segment at {addr:#x} is scheduled for deallocation")]
    Retired { addr: usize },

    #[error("{value:#x} violates the region alignment {alignment}")]
    Misaligned { value: usize, alignment: usize },

    #[error("write attempted in a read-only transaction")]
    ReadOnly,

    #[error("the root segment cannot be freed")]
    RootFree,

    #[error("transaction already committed or aborted")]
    Inactive,
}

impl TmError {
    /// Whether the failed transaction should simply be retried.
    ///
    /// `Contention` is the ordinary price of non-blocking lock acquisition,
    /// and `Retired` means the target is scheduled for free by a
    /// transaction that has not finished yet; both resolve once the other
    /// transaction does. `Unmapped` is permanent: an address that never
    /// existed will never start resolving, and one deleted by a committed
    /// free will never come back, so retrying on it could only loop.
    /// Everything else is resource exhaustion or a caller bug.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Contention { .. } | Self::Retired { .. })
    }
}

/// Result alias using `TmError`.
pub type Result<T> = std::result::Result<T, TmError>;
