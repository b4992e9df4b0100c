#![forbid(unsafe_code)]
//! Software transactional memory over a segmented shared region.
//!
//! A [`Region`] is a collection of aligned byte segments rooted in one
//! never-freeable segment. Threads open a [`Transaction`] against the
//! region and read, write, allocate, and free aligned byte ranges; each
//! transaction either commits all of its updates atomically or aborts and
//! leaves no observable effect.
//!
//! # Protocol
//!
//! Concurrency control is eager and pessimistic. Every segment carries one
//! reader–writer lock protecting its bytes and its tombstone flag; reads
//! take the shared side, writes and frees the exclusive side, and a
//! transaction keeps every acquired lock until it finishes. Acquisition is
//! always non-blocking: failure converts to an abort instead of a wait, so
//! the engine is deadlock-free at the cost of retries under contention.
//! Writes capture byte pre-images into an undo log; abort replays the log
//! newest-first through the still-held locks. Allocation and free take
//! effect eagerly on the region's segment collection and are finalized or
//! unwound at commit/abort.
//!
//! Aborts surface as [`TmError`] values whose [`TmError::is_transient`]
//! predicate tells retryable contention apart from caller mistakes;
//! [`Region::atomically`] packages the retry loop.
//!
//! A shared hold is never promoted to exclusive, so a transaction that
//! intends to modify a range it also reads must take the exclusive side
//! first — write an intent cell of the segment, then read through the held
//! lock:
//!
//! ```
//! use txmem::{Addr, Mode, Region};
//!
//! let region = Region::new(1024, 8)?;
//! let start = region.start();
//! let counter = Addr(start.0 + 8);
//!
//! region.atomically(Mode::ReadWrite, |tx| {
//!     tx.write(&[0_u8; 8], start)?; // intent: acquire the exclusive side
//!     let mut buf = [0_u8; 8];
//!     tx.read(counter, &mut buf)?;
//!     let value = u64::from_le_bytes(buf) + 1;
//!     tx.write(&value.to_le_bytes(), counter)
//! })?;
//!
//! let mut out = [0_u8; 8];
//! region.atomically(Mode::ReadOnly, |tx| tx.read(counter, &mut out))?;
//! assert_eq!(u64::from_le_bytes(out), 1);
//! # Ok::<(), txmem::TmError>(())
//! ```

mod region;
mod segment;
mod transaction;

pub use region::Region;
pub use transaction::{Mode, Transaction};
pub use txmem_error::{Result, TmError};
pub use txmem_types::{Addr, TxId};
