//! Transactions: per-thread bookkeeping and the operation layer.
//!
//! A transaction accumulates owned segment-lock guards (shared for reads,
//! exclusive for writes and frees, plus the locks of segments it allocated),
//! an undo log of pre-images, and queued-free markers. Commit publishes by
//! releasing locks and finalizing frees; abort replays the undo log through
//! the still-held exclusive guards and unwinds allocation and free side
//! effects.
//!
//! # Protocol invariants
//!
//! - A segment appears at most once across the shared, exclusive, and
//!   pending-alloc hold sets of one transaction.
//! - Every lock acquisition is non-blocking; failure converts to abort, so
//!   the engine cannot deadlock.
//! - Before any acquisition the transaction searches its own holds: a
//!   revisited segment reuses the held guard (self-deadlock avoidance). A
//!   shared hold on a write path aborts rather than promoting; a free only
//!   needs *some* hold, so it proceeds on a shared one.
//! - Undo pre-images are exact: captured immediately before each write,
//!   sized to the write, replayed newest-first on abort.
//! - The tombstone is claimed with an atomic swap by a transaction holding
//!   the segment's lock in either mode, and a committed free deletes the
//!   segment with the flag still set, so a racing locate that acquires the
//!   lock late still observes it and aborts.

use crate::region::Region;
use crate::segment::{ExclusiveGuard, Segment, SegmentCell, SharedGuard};
use std::fmt;
use std::mem;
use tracing::{debug, trace, warn};
use txmem_error::{Result, TmError};
use txmem_types::{is_positive_multiple, Addr, TxId};

/// Access mode fixed at `begin`.
///
/// A read-only transaction may only read; it cannot abort at commit because
/// conflicting reads abort eagerly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

/// Pre-image of one write, replayed on abort.
struct UndoRecord {
    base: Addr,
    offset: usize,
    prev: Vec<u8>,
}

/// A shared hold acquired by a read. `queued_free` is set when the
/// transaction later frees the segment through this hold: a free needs a
/// hold of either strength, not specifically the exclusive one.
struct ReadHold {
    segment: Segment,
    guard: SharedGuard,
    queued_free: bool,
}

/// An exclusive hold acquired by a write or a free. `queued_free` marks the
/// segment for physical deletion at commit (and tombstone rollback at
/// abort).
struct WriteHold {
    segment: Segment,
    guard: ExclusiveGuard,
    queued_free: bool,
}

/// The lock of a segment allocated by this transaction, held from creation
/// to commit/abort so no other transaction can observe the segment early.
/// Kept apart from [`WriteHold`] because commit keeps these segments but
/// destroys queued frees; `queued_free` covers alloc-then-free in one
/// transaction.
struct AllocHold {
    segment: Segment,
    guard: ExclusiveGuard,
    queued_free: bool,
}

/// A transaction bound to one region.
///
/// Operations return `Err` on abort; the rollback has already run by the
/// time the error is observable and every later operation answers
/// [`TmError::Inactive`]. Dropping a live transaction aborts it.
pub struct Transaction<'r> {
    region: &'r Region,
    id: TxId,
    mode: Mode,
    live: bool,
    reads: Vec<ReadHold>,
    writes: Vec<WriteHold>,
    allocs: Vec<AllocHold>,
    undo: Vec<UndoRecord>,
}

impl<'r> Transaction<'r> {
    pub(crate) fn new(region: &'r Region, id: TxId, mode: Mode) -> Self {
        Self {
            region,
            id,
            mode,
            live: true,
            reads: Vec::new(),
            writes: Vec::new(),
            allocs: Vec::new(),
            undo: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TxId {
        self.id
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// False once the transaction has committed or aborted.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Read `dst.len()` bytes starting at `src` into `dst`.
    ///
    /// `src` and `dst.len()` must satisfy the region alignment contract.
    /// An `Err` means the transaction aborted and rolled back.
    pub fn read(&mut self, src: Addr, dst: &mut [u8]) -> Result<()> {
        self.ensure_live()?;
        self.check_range_contract(src, dst.len())?;

        // A segment this transaction already holds is reused in place:
        // issuing a second acquisition against our own lock would self-abort.
        if let Some(index) = self.writes.iter().position(|h| h.segment.contains(src)) {
            let hold = &self.writes[index];
            let outcome = copy_from_cell(&hold.segment, &hold.guard, src, dst);
            return outcome.map_err(|err| self.abort(err));
        }
        if let Some(index) = self.allocs.iter().position(|h| h.segment.contains(src)) {
            let hold = &self.allocs[index];
            let outcome = copy_from_cell(&hold.segment, &hold.guard, src, dst);
            return outcome.map_err(|err| self.abort(err));
        }
        if let Some(index) = self.reads.iter().position(|h| h.segment.contains(src)) {
            let hold = &self.reads[index];
            let outcome = copy_from_cell(&hold.segment, &hold.guard, src, dst);
            return outcome.map_err(|err| self.abort(err));
        }

        let Some(segment) = self.region.locate(src) else {
            return Err(self.abort(TmError::Unmapped { addr: src.0 }));
        };
        let Some(guard) = segment.try_lock_shared() else {
            trace!(
                target: "txmem::tx",
                tx = %self.id,
                base = %segment.base(),
                "segment_lock_contended"
            );
            return Err(self.abort(TmError::Contention {
                addr: segment.base().0,
            }));
        };
        let outcome = copy_from_cell(&segment, &guard, src, dst);
        self.reads.push(ReadHold {
            segment,
            guard,
            queued_free: false,
        });
        outcome.map_err(|err| self.abort(err))
    }

    /// Write the bytes of `src` at `dst`.
    ///
    /// `dst` and `src.len()` must satisfy the region alignment contract.
    /// An `Err` means the transaction aborted and rolled back.
    pub fn write(&mut self, src: &[u8], dst: Addr) -> Result<()> {
        self.ensure_live()?;
        if self.mode == Mode::ReadOnly {
            return Err(self.abort(TmError::ReadOnly));
        }
        self.check_range_contract(dst, src.len())?;

        // A shared hold on the target would need a promotion, which
        // non-blocking locks cannot grant.
        if self.reads.iter().any(|h| h.segment.contains(dst)) {
            return Err(self.abort(TmError::Contention { addr: dst.0 }));
        }

        if let Some(index) = self.writes.iter().position(|h| h.segment.contains(dst)) {
            let segment = self.writes[index].segment.clone();
            let outcome = write_via_hold(
                &mut self.undo,
                &segment,
                &mut self.writes[index].guard,
                src,
                dst,
            );
            return outcome.map_err(|err| self.abort(err));
        }
        if let Some(index) = self.allocs.iter().position(|h| h.segment.contains(dst)) {
            let segment = self.allocs[index].segment.clone();
            let outcome = write_via_hold(
                &mut self.undo,
                &segment,
                &mut self.allocs[index].guard,
                src,
                dst,
            );
            return outcome.map_err(|err| self.abort(err));
        }

        let Some(segment) = self.region.locate(dst) else {
            return Err(self.abort(TmError::Unmapped { addr: dst.0 }));
        };
        let Some(mut guard) = segment.try_lock_exclusive() else {
            trace!(
                target: "txmem::tx",
                tx = %self.id,
                base = %segment.base(),
                "segment_lock_contended"
            );
            return Err(self.abort(TmError::Contention {
                addr: segment.base().0,
            }));
        };
        let outcome = write_via_hold(&mut self.undo, &segment, &mut guard, src, dst);
        self.writes.push(WriteHold {
            segment,
            guard,
            queued_free: false,
        });
        outcome.map_err(|err| self.abort(err))
    }

    /// Allocate a zeroed segment of `size` bytes and return its base.
    ///
    /// Allocation refusal returns `OutOfMemory` *without* aborting: the
    /// transaction stays live and may continue or commit. Every other
    /// failure aborts as usual. The segment stays invisible to other
    /// transactions until commit because its exclusive lock is held from
    /// birth.
    pub fn alloc(&mut self, size: usize) -> Result<Addr> {
        self.ensure_live()?;
        if self.mode == Mode::ReadOnly {
            return Err(self.abort(TmError::ReadOnly));
        }
        let alignment = self.region.alignment();
        if !is_positive_multiple(size, alignment) {
            return Err(self.abort(TmError::Misaligned {
                value: size,
                alignment,
            }));
        }

        let segment = match Segment::alloc_zeroed(size, alignment, false) {
            Ok(segment) => segment,
            Err(err) => {
                warn!(target: "txmem::tx", tx = %self.id, size, "alloc_refused");
                return Err(err);
            }
        };
        let guard = segment.lock_exclusive();
        self.region.insert(segment.clone());
        let base = segment.base();
        trace!(target: "txmem::tx", tx = %self.id, base = %base, size, "segment_allocated");
        self.allocs.push(AllocHold {
            segment,
            guard,
            queued_free: false,
        });
        Ok(base)
    }

    /// Schedule the segment whose base is `target` for deallocation at
    /// commit.
    ///
    /// The bytes stay in place until commit; abort re-publishes the segment
    /// by clearing its tombstone. A lock this transaction already holds —
    /// in either mode — is enough: the tombstone is claimed atomically, not
    /// written through the guard. Repeating a free the transaction already
    /// queued is a no-op. An `Err` means the transaction aborted.
    pub fn free(&mut self, target: Addr) -> Result<()> {
        self.ensure_live()?;
        if self.mode == Mode::ReadOnly {
            return Err(self.abort(TmError::ReadOnly));
        }

        // Already held: mark in place, no second acquisition. A free the
        // transaction already queued through this hold is idempotent. A
        // claim that observes the flag set without our own queued_free
        // mark is a fellow shared holder's free and aborts; rollback only
        // clears flags this transaction claimed itself.
        if let Some(index) = self.writes.iter().position(|h| h.segment.base() == target) {
            if self.writes[index].queued_free {
                return Ok(());
            }
            if self.writes[index].segment.claim_tombstone() {
                return Err(self.abort(TmError::Retired { addr: target.0 }));
            }
            self.writes[index].queued_free = true;
            trace!(target: "txmem::tx", tx = %self.id, base = %target, "segment_tombstoned");
            return Ok(());
        }
        if let Some(index) = self.allocs.iter().position(|h| h.segment.base() == target) {
            if self.allocs[index].queued_free {
                return Ok(());
            }
            if self.allocs[index].segment.claim_tombstone() {
                return Err(self.abort(TmError::Retired { addr: target.0 }));
            }
            self.allocs[index].queued_free = true;
            trace!(target: "txmem::tx", tx = %self.id, base = %target, "segment_tombstoned");
            return Ok(());
        }
        if let Some(index) = self.reads.iter().position(|h| h.segment.base() == target) {
            if self.reads[index].queued_free {
                return Ok(());
            }
            if self.reads[index].segment.claim_tombstone() {
                return Err(self.abort(TmError::Retired { addr: target.0 }));
            }
            self.reads[index].queued_free = true;
            trace!(target: "txmem::tx", tx = %self.id, base = %target, "segment_tombstoned");
            return Ok(());
        }

        let Some(segment) = self.region.locate_base(target) else {
            return Err(self.abort(TmError::Unmapped { addr: target.0 }));
        };
        if segment.is_root() {
            return Err(self.abort(TmError::RootFree));
        }
        let Some(guard) = segment.try_lock_exclusive() else {
            trace!(
                target: "txmem::tx",
                tx = %self.id,
                base = %segment.base(),
                "segment_lock_contended"
            );
            return Err(self.abort(TmError::Contention { addr: target.0 }));
        };
        // A set flag here means the segment was deleted by a committed free
        // before we acquired the lock; the claim is not ours to clear.
        let stale = segment.claim_tombstone();
        self.writes.push(WriteHold {
            segment,
            guard,
            queued_free: !stale,
        });
        if stale {
            return Err(self.abort(TmError::Retired { addr: target.0 }));
        }
        trace!(target: "txmem::tx", tx = %self.id, base = %target, "segment_tombstoned");
        Ok(())
    }

    /// Commit: publish every write, finalize every free, keep every
    /// allocation, release all locks.
    ///
    /// Always succeeds in this design — eager locking leaves no validation
    /// to fail at commit. A read-only transaction merely releases its
    /// shared holds. Returns `Inactive` if the transaction already
    /// aborted.
    pub fn commit(mut self) -> Result<()> {
        if !self.live {
            return Err(TmError::Inactive);
        }
        let (nreads, nwrites, nallocs) = (self.reads.len(), self.writes.len(), self.allocs.len());
        let mut freed = 0_usize;

        // Physical deletion first: withdraw each queued free from the
        // region, then let the guard drop release its lock. The tombstone
        // stays set so a reader that located the segment before withdrawal
        // aborts once it gets the lock. A read-only transaction carries
        // only plain shared holds, so for it this whole pass is release.
        for hold in self.writes.drain(..) {
            if hold.queued_free {
                freed += 1;
                self.region.remove(hold.segment.base());
            }
            drop(hold);
        }
        for hold in self.allocs.drain(..) {
            if hold.queued_free {
                freed += 1;
                self.region.remove(hold.segment.base());
            }
            drop(hold);
        }
        for hold in self.reads.drain(..) {
            if hold.queued_free {
                freed += 1;
                self.region.remove(hold.segment.base());
            }
            drop(hold);
        }
        self.undo.clear();
        self.live = false;
        debug!(
            target: "txmem::tx",
            tx = %self.id,
            reads = nreads,
            writes = nwrites,
            allocs = nallocs,
            freed,
            "tx_commit"
        );
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.live {
            Ok(())
        } else {
            Err(TmError::Inactive)
        }
    }

    /// Alignment contract shared by read and write: the address and the
    /// size are both governed by the region alignment.
    fn check_range_contract(&mut self, addr: Addr, len: usize) -> Result<()> {
        let alignment = self.region.alignment();
        if !addr.is_aligned_to(alignment) {
            return Err(self.abort(TmError::Misaligned {
                value: addr.0,
                alignment,
            }));
        }
        if !is_positive_multiple(len, alignment) {
            return Err(self.abort(TmError::Misaligned {
                value: len,
                alignment,
            }));
        }
        Ok(())
    }

    /// Roll back and return the cause for the caller to propagate.
    fn abort(&mut self, cause: TmError) -> TmError {
        debug!(target: "txmem::tx", tx = %self.id, cause = %cause, "tx_abort");
        self.rollback();
        cause
    }

    /// Unwind every speculative effect and release every hold.
    ///
    /// Runs at most once: the live flag drops and every entry point checks
    /// it first.
    fn rollback(&mut self) {
        // Newest-first replay: overlapping writes are undone in reverse
        // order so the earliest pre-image lands last.
        let undo = mem::take(&mut self.undo);
        for record in undo.into_iter().rev() {
            if let Some(cell) = self.exclusive_cell_mut(record.base) {
                cell.bytes_mut()[record.offset..record.offset + record.prev.len()]
                    .copy_from_slice(&record.prev);
            }
        }
        // Re-publish queued frees.
        for hold in &self.writes {
            if hold.queued_free {
                hold.segment.clear_tombstone();
            }
        }
        for hold in &self.reads {
            if hold.queued_free {
                hold.segment.clear_tombstone();
            }
        }
        // Allocations never became visible contents-wise; withdraw and
        // destroy them.
        for hold in self.allocs.drain(..) {
            self.region.remove(hold.segment.base());
            drop(hold);
        }
        // Exclusive releases before shared releases.
        self.writes.clear();
        self.reads.clear();
        self.live = false;
    }

    /// The cell of a segment this transaction holds exclusively, whether
    /// via a write/free hold or an allocation.
    fn exclusive_cell_mut(&mut self, base: Addr) -> Option<&mut SegmentCell> {
        if let Some(hold) = self.writes.iter_mut().find(|h| h.segment.base() == base) {
            return Some(&mut *hold.guard);
        }
        self.allocs
            .iter_mut()
            .find(|h| h.segment.base() == base)
            .map(|hold| &mut *hold.guard)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.live {
            debug!(target: "txmem::tx", tx = %self.id, "tx_dropped_live");
            self.rollback();
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("live", &self.live)
            .field("reads", &self.reads.len())
            .field("writes", &self.writes.len())
            .field("allocs", &self.allocs.len())
            .field("undo", &self.undo.len())
            .finish()
    }
}

/// Offset of `[addr, addr + len)` inside the segment, or `Unmapped` if the
/// range escapes it.
fn range_in(segment: &Segment, addr: Addr, len: usize) -> Result<usize> {
    let offset = addr
        .offset_from(segment.base())
        .ok_or(TmError::Unmapped { addr: addr.0 })?;
    let end = offset
        .checked_add(len)
        .ok_or(TmError::Unmapped { addr: addr.0 })?;
    if end > segment.len() {
        return Err(TmError::Unmapped { addr: addr.0 });
    }
    Ok(offset)
}

/// Copy out of a held segment, honoring the tombstone: a segment scheduled
/// for free — by anyone, this transaction included — must not serve reads.
fn copy_from_cell(segment: &Segment, cell: &SegmentCell, src: Addr, dst: &mut [u8]) -> Result<()> {
    if segment.is_tombstoned() {
        return Err(TmError::Retired {
            addr: segment.base().0,
        });
    }
    let offset = range_in(segment, src, dst.len())?;
    dst.copy_from_slice(&cell.bytes()[offset..offset + dst.len()]);
    Ok(())
}

/// Write through a held exclusive guard: capture the pre-image (fallibly —
/// an unlogged write would make rollback unsound, so refusal aborts),
/// record it, then mutate in place.
fn write_via_hold(
    undo: &mut Vec<UndoRecord>,
    segment: &Segment,
    guard: &mut ExclusiveGuard,
    src: &[u8],
    dst: Addr,
) -> Result<()> {
    if segment.is_tombstoned() {
        return Err(TmError::Retired {
            addr: segment.base().0,
        });
    }
    let offset = range_in(segment, dst, src.len())?;
    let mut prev = Vec::new();
    prev.try_reserve_exact(src.len())
        .map_err(|_| TmError::OutOfMemory)?;
    prev.extend_from_slice(&guard.bytes()[offset..offset + src.len()]);
    undo.push(UndoRecord {
        base: segment.base(),
        offset,
        prev,
    });
    guard.bytes_mut()[offset..offset + src.len()].copy_from_slice(src);
    Ok(())
}
