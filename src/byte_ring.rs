//! Lock-free multi-producer multi-consumer byte ring.
//!
//! # Design
//!
//! A fixed-capacity circular byte buffer coordinated by four atomic position
//! markers and two signed byte budgets. Producers append opaque byte blocks,
//! consumers remove blocks in FIFO order, and any number of threads may do
//! either concurrently.
//!
//! Each side (read, write) owns a marker pair:
//!
//! - `reserve` — the commit pointer. A reservation claims `[reserve,
//!   reserve + len)` by compare-exchanging `reserve` forward. The CAS is the
//!   linearization point: exactly one contender wins any given block.
//! - `retire` — the watermark. After transferring bytes, an operation waits
//!   until `retire` equals its own reservation origin, then advances it.
//!   This retires reservations strictly in the order they were granted.
//!
//! The markers divide the ring into four non-overlapping arcs, in cyclic
//! order (`rd` = read side, `wr` = write side):
//!
//! ```text
//!        rd.retire    rd.reserve        wr.retire    wr.reserve
//!            |            |                 |            |
//!   ----|++++++++++++|=============|%%%%%%%%%%%%|----
//!        in-flight     committed    in-flight    free
//!        reads         data         writes
//! ```
//!
//! Marker comparisons alone cannot tell a full ring from an empty one and are
//! prone to ABA once positions wrap, so availability is tracked separately in
//! two signed counters: `used` (committed, not yet reserved for read) and
//! `free` (writable). An operation *reserves* by decrementing its budget
//! before attempting the CAS; a lost CAS gives the reservation back. When
//! several operations race for a remainder too small for all of them, a
//! budget may transiently go negative — the losers restore it, and the
//! counters converge to `used + free == capacity` at quiescence. The
//! decrement-first order keeps the accounting conservative: the opposite side
//! never observes more budget than actually exists.
//!
//! Every operation runs three phases:
//!
//! 1. **Reserve** — sample `reserve` and the budget, back off (or fail, for
//!    the `try_` forms) while the budget is short, then decrement the budget
//!    and CAS `reserve` forward. Lost CAS: restore the budget, retry.
//! 2. **Transfer** — `memcpy` into or out of the claimed block, split in two
//!    when the block wraps past the physical end. No atomics; the block is
//!    exclusively owned between reserve and release.
//! 3. **Release** — wait until `retire` equals the reservation origin, store
//!    the reservation end, credit the opposite budget.
//!
//! The phase-3 wait is why this is lock-free but not wait-free: a later
//! reservation cannot retire before an earlier one finishes its transfer.
//!
//! # Ordering rationale
//!
//! ```text
//! writer: fill block, then Release-store wr.retire and Release-credit used
//! reader: Acquire-load used sees the credit  →  sees the block's bytes
//! ```
//!
//! The budget credit in phase 3 is a Release RMW and every phase-1 budget
//! load is Acquire, so a reader that observes credited bytes observes the
//! writes that produced them (and symmetrically for writers reusing drained
//! space). Budget RMWs continue each other's release sequences, which keeps
//! the edge intact across interleaved credits from many threads. The
//! un-reserve on a lost CAS orders nothing and stays Relaxed.
//!
//! # Threading
//!
//! All operations take `&self` and are safe to call from any number of
//! threads. The three wait points (short budget, lost CAS, watermark order)
//! busy-spin with a CPU relaxation hint; nothing ever blocks in the kernel.
//!
//! # Safety
//!
//! `unsafe` is confined to the phase-2 copies and relies on the exclusivity
//! granted by the reserve CAS; invariants are documented per helper.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use std::ptr;

use crossbeam_utils::CachePadded;

use crate::storage::{RawStorage, StorageError};

/// Minimum alignment of the backing allocation.
///
/// Keeps the buffer base cache-line aligned so the typed layer only has to
/// raise alignment for records aligned beyond a cache line.
pub(crate) const CACHE_LINE: usize = 64;

/// CPU relaxation for the protocol's spin points. Under loom this must yield
/// so the model scheduler can run the thread being waited on.
#[inline]
fn spin() {
    #[cfg(loom)]
    loom::thread::yield_now();
    #[cfg(not(loom))]
    std::hint::spin_loop();
}

/// Marker pair for one side of the ring.
///
/// Both fields are byte offsets in `[0, capacity)`. `reserve` is the commit
/// pointer (CAS target of phase 1), `retire` the watermark (advanced in
/// reservation order by phase 3).
struct Side {
    reserve: AtomicUsize,
    retire: AtomicUsize,
}

impl Side {
    fn new() -> Self {
        Self {
            reserve: AtomicUsize::new(0),
            retire: AtomicUsize::new(0),
        }
    }
}

/// Bounded lock-free MPMC byte queue.
///
/// Blocking operations ([`write`](Self::write), [`read`](Self::read)) spin
/// until the requested space or data is available; the `try_` forms fail
/// fast instead. FIFO order is defined by reservation order: the order in
/// which writers win their reservations is the order readers drain their
/// bytes.
///
/// # Invariants
/// - The four marker arcs never overlap; all marker arithmetic wraps through
///   [`wrap`](Self::wrap).
/// - `used + free == capacity` whenever no operation is in flight; either
///   budget may dip negative while reservations race.
/// - Bytes drained at position `p` are the bytes a writer committed at `p`.
pub struct ByteRing {
    storage: RawStorage,
    /// Committed-readable byte budget. Readers reserve from it, writers
    /// credit it.
    used: CachePadded<AtomicIsize>,
    /// Writable byte budget. Writers reserve from it, readers credit it.
    free: CachePadded<AtomicIsize>,
    rd: CachePadded<Side>,
    wr: CachePadded<Side>,
}

// SAFETY: all shared-state mutation goes through the atomics; buffer bytes
// are only touched inside a reservation, which grants exclusive ownership of
// the block until release. Sending the ring moves the allocation wholesale.
unsafe impl Send for ByteRing {}
unsafe impl Sync for ByteRing {}

impl ByteRing {
    /// Ring with no storage (`capacity() == 0`).
    ///
    /// Queries work; `try_` operations always fail; blocking operations on a
    /// zero-capacity ring panic (a non-empty block can never fit).
    pub fn new() -> Self {
        Self::from_storage(RawStorage::empty())
    }

    /// Ring over `capacity` freshly allocated bytes.
    ///
    /// # Errors
    /// Returns [`StorageError`] when the allocation cannot be made.
    pub fn with_capacity(capacity: usize) -> Result<Self, StorageError> {
        Self::with_capacity_aligned(capacity, CACHE_LINE)
    }

    /// As [`with_capacity`](Self::with_capacity), with the base alignment
    /// raised to `align`. Used by the typed layer to honor record alignment.
    pub(crate) fn with_capacity_aligned(
        capacity: usize,
        align: usize,
    ) -> Result<Self, StorageError> {
        let storage = RawStorage::with_capacity(capacity, align.max(CACHE_LINE))?;
        Ok(Self::from_storage(storage))
    }

    fn from_storage(storage: RawStorage) -> Self {
        let free = storage.size() as isize;
        Self {
            storage,
            used: CachePadded::new(AtomicIsize::new(0)),
            free: CachePadded::new(AtomicIsize::new(free)),
            rd: CachePadded::new(Side::new()),
            wr: CachePadded::new(Side::new()),
        }
    }

    /// Fixed byte capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.size()
    }

    /// Best-effort count of committed, unreserved bytes, clamped to zero.
    ///
    /// Exact once all concurrent operations have quiesced; under concurrency
    /// it is a snapshot that may lag or run ahead by in-flight reservations.
    #[inline]
    pub fn size(&self) -> usize {
        self.used.load(Ordering::Acquire).max(0) as usize
    }

    /// True when [`size`](Self::size) observes no readable bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Appends `data` to the ring, spinning until it fits.
    ///
    /// Returns once the bytes are committed and observable by readers. An
    /// empty slice returns immediately.
    ///
    /// # Panics
    /// Panics if `data.len() > capacity()`; such a block could never fit.
    pub fn write(&self, data: &[u8]) {
        assert!(
            data.len() <= self.capacity(),
            "write larger than ring capacity"
        );
        if data.is_empty() {
            return;
        }

        let block = self.reserve(&self.wr, &self.free, data.len());
        // SAFETY: the reservation grants exclusive ownership of the block
        // until the release below.
        unsafe { self.fill_block(block, data) };
        self.release(&self.wr, &self.used, block, data.len());
    }

    /// Appends `data` if enough free space is observed; `false` otherwise.
    ///
    /// A `false` return proves only that this thread's budget sample was
    /// short — concurrent releases may already have made the space available
    /// again. The ring is left untouched on failure.
    pub fn try_write(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }

        let Some(block) = self.try_reserve(&self.wr, &self.free, data.len()) else {
            return false;
        };
        // SAFETY: as in `write`.
        unsafe { self.fill_block(block, data) };
        self.release(&self.wr, &self.used, block, data.len());
        true
    }

    /// Fills `out` with the oldest committed bytes, spinning until enough
    /// data is available.
    ///
    /// An empty slice returns immediately.
    ///
    /// # Panics
    /// Panics if `out.len() > capacity()`.
    pub fn read(&self, out: &mut [u8]) {
        assert!(
            out.len() <= self.capacity(),
            "read larger than ring capacity"
        );
        if out.is_empty() {
            return;
        }

        let block = self.reserve(&self.rd, &self.used, out.len());
        // SAFETY: the reservation grants exclusive ownership of the block
        // until the release below.
        unsafe { self.drain_block(block, out) };
        self.release(&self.rd, &self.free, block, out.len());
    }

    /// Fills `out` if enough committed data is observed; `false` otherwise.
    ///
    /// Failure is a sample, not a proof — see [`try_write`](Self::try_write).
    /// `out` is left untouched on failure.
    pub fn try_read(&self, out: &mut [u8]) -> bool {
        if out.is_empty() {
            return true;
        }

        let Some(block) = self.try_reserve(&self.rd, &self.used, out.len()) else {
            return false;
        };
        // SAFETY: as in `read`.
        unsafe { self.drain_block(block, out) };
        self.release(&self.rd, &self.free, block, out.len());
        true
    }

    // ========================================================================
    // Reserve / release protocol
    // ========================================================================

    /// Wraps a position from `[0, 2 * capacity)` back into `[0, capacity)`.
    ///
    /// The single place modular arithmetic happens; everything else works on
    /// already-wrapped offsets.
    #[inline]
    pub(crate) fn wrap(&self, pos: usize) -> usize {
        let cap = self.capacity();
        debug_assert!(pos < 2 * cap.max(1));
        if pos < cap {
            pos
        } else {
            pos - cap
        }
    }

    /// Phase 1, blocking: claims an exclusive `len`-byte block, spinning
    /// while `budget` is short. Returns the block's starting offset.
    fn reserve(&self, side: &Side, budget: &AtomicIsize, len: usize) -> usize {
        debug_assert!(len > 0 && len <= self.capacity());

        loop {
            let old = side.reserve.load(Ordering::Acquire);
            while budget.load(Ordering::Acquire) < len as isize {
                spin();
            }

            let new = self.wrap(old + len);
            budget.fetch_sub(len as isize, Ordering::AcqRel);
            match side
                .reserve
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return old,
                Err(_) => {
                    // Another reservation won this block; give the budget
                    // back and retry against the new commit pointer.
                    budget.fetch_add(len as isize, Ordering::Relaxed);
                }
            }
        }
    }

    /// Phase 1, non-blocking: as [`reserve`](Self::reserve) but fails when a
    /// budget sample is short. A lost CAS is an ownership conflict, not a
    /// capacity failure, so it re-samples and retries.
    fn try_reserve(&self, side: &Side, budget: &AtomicIsize, len: usize) -> Option<usize> {
        debug_assert!(len > 0);

        loop {
            let old = side.reserve.load(Ordering::Acquire);
            if budget.load(Ordering::Acquire) < len as isize {
                return None;
            }

            let new = self.wrap(old + len);
            budget.fetch_sub(len as isize, Ordering::AcqRel);
            match side
                .reserve
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(old),
                Err(_) => {
                    budget.fetch_add(len as isize, Ordering::Relaxed);
                }
            }
        }
    }

    /// Phase 3: retires the block `[old, old + len)` and credits the
    /// opposite budget.
    ///
    /// Waits until every earlier reservation on this side has retired, so
    /// the watermark only ever advances in reservation order and never
    /// publishes a block whose left neighbor is still transferring.
    fn release(&self, side: &Side, credit: &AtomicIsize, old: usize, len: usize) {
        let new = self.wrap(old + len);

        while side.retire.load(Ordering::Acquire) != old {
            spin();
        }
        side.retire.store(new, Ordering::Release);
        credit.fetch_add(len as isize, Ordering::Release);
    }

    // ========================================================================
    // Block transfer
    // ========================================================================

    /// Phase 2 for writes: copies `data` into the reserved block, split in
    /// two when the block wraps past the physical end.
    ///
    /// # Safety
    /// `block` must be a write-side reservation for exactly `data.len()`
    /// bytes that has not been released yet.
    unsafe fn fill_block(&self, block: usize, data: &[u8]) {
        let base = self.storage.base();
        let first = data.len().min(self.capacity() - block);

        ptr::copy_nonoverlapping(data.as_ptr(), base.add(block), first);
        if first < data.len() {
            ptr::copy_nonoverlapping(data.as_ptr().add(first), base, data.len() - first);
        }
    }

    /// Phase 2 for reads: copies the reserved block into `out`, split in two
    /// when the block wraps past the physical end.
    ///
    /// # Safety
    /// `block` must be a read-side reservation for exactly `out.len()` bytes
    /// that has not been released yet.
    unsafe fn drain_block(&self, block: usize, out: &mut [u8]) {
        let base = self.storage.base();
        let first = out.len().min(self.capacity() - block);

        ptr::copy_nonoverlapping(base.add(block), out.as_mut_ptr(), first);
        if first < out.len() {
            ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), out.len() - first);
        }
    }

    // ========================================================================
    // Typed-layer access
    // ========================================================================

    /// Base of the backing buffer for in-place record access.
    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.storage.base()
    }

    /// Current read commit pointer. Only meaningful without concurrent
    /// operations (the typed destructor's single-threaded walk).
    pub(crate) fn read_pos(&self) -> usize {
        self.rd.reserve.load(Ordering::Acquire)
    }

    pub(crate) fn reserve_write_block(&self, len: usize) -> usize {
        self.reserve(&self.wr, &self.free, len)
    }

    pub(crate) fn try_reserve_write_block(&self, len: usize) -> Option<usize> {
        self.try_reserve(&self.wr, &self.free, len)
    }

    pub(crate) fn release_write_block(&self, block: usize, len: usize) {
        self.release(&self.wr, &self.used, block, len);
    }

    pub(crate) fn reserve_read_block(&self, len: usize) -> usize {
        self.reserve(&self.rd, &self.used, len)
    }

    pub(crate) fn try_reserve_read_block(&self, len: usize) -> Option<usize> {
        self.try_reserve(&self.rd, &self.used, len)
    }

    pub(crate) fn release_read_block(&self, block: usize, len: usize) {
        self.release(&self.rd, &self.free, block, len);
    }
}

impl Default for ByteRing {
    fn default() -> Self {
        Self::new()
    }
}



#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    /// Two racing writers: the reservation CAS must hand out disjoint blocks
    /// and both bytes must survive (over-reservation resolves correctly).
    #[test]
    fn racing_writers_get_disjoint_blocks() {
        loom::model(|| {
            let ring = Arc::new(ByteRing::with_capacity(2).expect("ring allocation"));

            let a = Arc::clone(&ring);
            let b = Arc::clone(&ring);
            let t1 = thread::spawn(move || a.write(&[1]));
            let t2 = thread::spawn(move || b.write(&[2]));
            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(ring.size(), 2);
            let mut out = [0u8; 2];
            assert!(ring.try_read(&mut out));
            out.sort_unstable();
            assert_eq!(out, [1, 2]);

            // Budgets must have converged back to the quiescent state.
            assert_eq!(ring.size(), 0);
            assert!(ring.try_write(&[0, 0]));
        });
    }

    /// A committed write is fully visible to the reader that drains it.
    #[test]
    fn writer_reader_handoff_preserves_bytes() {
        loom::model(|| {
            let ring = Arc::new(ByteRing::with_capacity(2).expect("ring allocation"));

            let w = Arc::clone(&ring);
            let writer = thread::spawn(move || {
                w.write(&[7]);
                w.write(&[8]);
            });

            let r = Arc::clone(&ring);
            let reader = thread::spawn(move || {
                let mut out = [0u8; 1];
                r.read(&mut out);
                assert_eq!(out[0], 7);
                r.read(&mut out);
                assert_eq!(out[0], 8);
            });

            writer.join().unwrap();
            reader.join().unwrap();
            assert_eq!(ring.size(), 0);
        });
    }

    /// A failing `try_read` racing a writer never corrupts the budgets.
    #[test]
    fn try_read_race_leaves_budgets_consistent() {
        loom::model(|| {
            let ring = Arc::new(ByteRing::with_capacity(1).expect("ring allocation"));

            let w = Arc::clone(&ring);
            let writer = thread::spawn(move || w.write(&[9]));

            let r = Arc::clone(&ring);
            let reader = thread::spawn(move || {
                let mut out = [0u8; 1];
                loop {
                    if r.try_read(&mut out) {
                        return out[0];
                    }
                    thread::yield_now();
                }
            });

            writer.join().unwrap();
            assert_eq!(reader.join().unwrap(), 9);

            assert_eq!(ring.size(), 0);
            assert!(ring.try_write(&[0]));
        });
    }
}
