//! Segments: aligned byte buffers, the unit of concurrency control.
//!
//! A segment couples a fixed-size, address-stable, aligned buffer with one
//! reader–writer lock and a tombstone flag. The lock protects the buffer
//! contents; the tombstone is an atomic claimed with a swap, because a
//! transaction that only holds the shared side may still schedule the
//! segment for deallocation and cannot write through a read guard. Base
//! address, length, and root-ness are immutable and readable without the
//! lock.
//!
//! Lock acquisition is always non-blocking; guards are *owned*
//! (`ArcRwLock*Guard`) so a transaction can hold them across calls for its
//! entire lifetime. Releasing the guard and dropping the last `Segment`
//! handle frees the buffer, in that order.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use txmem_error::{Result, TmError};
use txmem_types::{align_up, Addr};

/// Shared-mode guard held by a reading transaction.
pub(crate) type SharedGuard = ArcRwLockReadGuard<RawRwLock, SegmentCell>;

/// Exclusive-mode guard held by a writing or freeing transaction.
pub(crate) type ExclusiveGuard = ArcRwLockWriteGuard<RawRwLock, SegmentCell>;

/// A fixed-size zeroed buffer whose first byte is aligned to the region
/// alignment.
///
/// Alignment is achieved by over-allocating `len + align` bytes and slicing
/// at the first aligned offset. The allocation is fallible
/// (`Vec::try_reserve_exact`), so exhaustion surfaces as `OutOfMemory`
/// instead of terminating the process. The backing storage never grows or
/// shrinks, so the aligned base address is stable for the buffer's lifetime.
struct AlignedBytes {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBytes {
    fn zeroed(len: usize, align: usize) -> Result<Self> {
        debug_assert!(align.is_power_of_two());
        let cap = len.checked_add(align).ok_or(TmError::OutOfMemory)?;
        let mut raw = Vec::new();
        raw.try_reserve_exact(cap).map_err(|_| TmError::OutOfMemory)?;
        raw.resize(cap, 0);
        let start = raw.as_ptr() as usize;
        let aligned = align_up(start, align).ok_or(TmError::OutOfMemory)?;
        Ok(Self {
            raw,
            offset: aligned - start,
            len,
        })
    }

    fn base(&self) -> Addr {
        Addr(self.raw.as_ptr() as usize + self.offset)
    }

    fn as_slice(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }
}

impl fmt::Debug for AlignedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBytes")
            .field("base", &self.base())
            .field("len", &self.len)
            .finish()
    }
}

/// The lock-protected state of a segment: the buffer contents.
#[derive(Debug)]
pub(crate) struct SegmentCell {
    bytes: AlignedBytes,
}

impl SegmentCell {
    pub(crate) fn bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes.as_mut_slice()
    }
}

/// Cheap-clone handle to one segment.
///
/// Identity is the base address: bases are unique among live segments
/// because each is the stable address of a distinct live allocation.
#[derive(Debug, Clone)]
pub(crate) struct Segment {
    base: Addr,
    len: usize,
    root: bool,
    tombstone: Arc<AtomicBool>,
    cell: Arc<RwLock<SegmentCell>>,
}

impl Segment {
    /// Allocate a zero-initialized segment of `len` bytes aligned to `align`.
    pub(crate) fn alloc_zeroed(len: usize, align: usize, root: bool) -> Result<Self> {
        let bytes = AlignedBytes::zeroed(len, align)?;
        let base = bytes.base();
        Ok(Self {
            base,
            len,
            root,
            tombstone: Arc::new(AtomicBool::new(false)),
            cell: Arc::new(RwLock::new(SegmentCell { bytes })),
        })
    }

    pub(crate) fn base(&self) -> Addr {
        self.base
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_root(&self) -> bool {
        self.root
    }

    /// Whether `addr` falls inside `[base, base + len)`.
    pub(crate) fn contains(&self, addr: Addr) -> bool {
        addr.offset_from(self.base)
            .is_some_and(|offset| offset < self.len)
    }

    /// Whether the segment is scheduled for deallocation by some
    /// uncommitted transaction — or already physically deleted: a committed
    /// free leaves the flag set forever.
    pub(crate) fn is_tombstoned(&self) -> bool {
        self.tombstone.load(Ordering::Acquire)
    }

    /// Claim the tombstone, returning the previous value. A `true` return
    /// means someone else owns the free (or the segment is already dead)
    /// and the caller must not clear the flag on rollback.
    pub(crate) fn claim_tombstone(&self) -> bool {
        self.tombstone.swap(true, Ordering::AcqRel)
    }

    /// Re-publish the segment after an aborted free.
    pub(crate) fn clear_tombstone(&self) {
        self.tombstone.store(false, Ordering::Release);
    }

    /// Non-blocking shared acquisition; `None` means contention.
    pub(crate) fn try_lock_shared(&self) -> Option<SharedGuard> {
        self.cell.try_read_arc()
    }

    /// Non-blocking exclusive acquisition; `None` means contention.
    pub(crate) fn try_lock_exclusive(&self) -> Option<ExclusiveGuard> {
        self.cell.try_write_arc()
    }

    /// Exclusive acquisition for a segment no other party can reference yet
    /// (just built, not yet published): cannot contend.
    pub(crate) fn lock_exclusive(&self) -> ExclusiveGuard {
        self.cell.write_arc()
    }
}
