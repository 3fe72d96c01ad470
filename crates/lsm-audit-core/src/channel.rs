//! Bounded multi-producer ring channel
//!
//! Userspace counterpart of the kernel `RingBuf` maps. Storage is a fixed
//! slab of equally sized slots allocated once. Each slot carries an atomic
//! claim flag; producers admit themselves against a count of free slots,
//! claim one by CAS starting from a monotonically advancing cursor, fill it
//! in place, and either commit it (it becomes visible to the consumer in
//! commit order) or discard it (its flag clears and the capacity is free
//! again). A full channel refuses the reservation instead of waiting.
//!
//! Nothing on the producer side loops without bound, and returning a slot is
//! a pair of atomic stores that cannot fail.

use crate::metrics::ChannelStats;
use crate::schema::{EventKind, Record};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

const WORD: usize = mem::size_of::<u64>();

pub struct RingChannel {
    kind: EventKind,
    stride: usize,
    slots: usize,
    /// `slots * stride` bytes, kept as words for 8-byte alignment
    slab: Box<[UnsafeCell<u64>]>,
    /// Committed length of each slot
    lengths: Box<[AtomicUsize]>,
    /// Set from reservation until the slot is released
    busy: Box<[AtomicBool]>,
    /// Free slots not yet promised to a reservation
    available: AtomicIsize,
    /// Where the next reservation starts looking for a free slot
    claim: AtomicUsize,
    committed: CommitRing,
    stats: Arc<ChannelStats>,
}

// SAFETY: a slot's bytes are only touched through the `Slot` or
// `CommittedRecord` holding its index, and each index is owned by at most one
// of those at any time. Ownership moves between threads through the claim
// flags and the commit ring, whose release/acquire updates publish the slot
// contents.
unsafe impl Sync for RingChannel {}

impl RingChannel {
    /// Create a channel holding `capacity_bytes / stride` records of `kind`,
    /// where the stride is the record size rounded up to 8 bytes.
    pub fn new(kind: EventKind, capacity_bytes: usize, stats: Arc<ChannelStats>) -> Self {
        let stride = kind.record_size().next_multiple_of(WORD);
        let slots = capacity_bytes / stride;

        let slab = (0..slots * stride / WORD)
            .map(|_| UnsafeCell::new(0u64))
            .collect();
        let lengths = (0..slots).map(|_| AtomicUsize::new(0)).collect();
        let busy = (0..slots).map(|_| AtomicBool::new(false)).collect();

        Self {
            kind,
            stride,
            slots,
            slab,
            lengths,
            busy,
            available: AtomicIsize::new(slots as isize),
            claim: AtomicUsize::new(0),
            committed: CommitRing::with_capacity(slots),
            stats,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Bytes per slot
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.slots
    }

    /// Slots currently available to producers
    pub fn free_slots(&self) -> usize {
        self.available.load(Ordering::Acquire).max(0) as usize
    }

    /// Committed records not yet taken by the consumer
    pub fn pending(&self) -> usize {
        self.committed.len()
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Claim exclusive use of one slot for a record of `size` bytes.
    ///
    /// Never blocks. Returns `None` and counts a drop when the channel is
    /// full or `size` exceeds the slot stride. The returned slot is zeroed.
    pub fn reserve(&self, size: usize) -> Option<Slot<'_>> {
        if size > self.stride || !self.admit() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let Some(index) = self.claim_slot() else {
            self.available.fetch_add(1, Ordering::Release);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        // SAFETY: the claim flag for `index` was clear and is now ours, so no
        // other slot or record refers to it and the region lies inside the
        // slab.
        unsafe { ptr::write_bytes(self.slot_ptr(index), 0, self.stride) };
        self.stats.reserved.fetch_add(1, Ordering::Relaxed);

        Some(Slot {
            channel: self,
            index,
            len: size,
            finished: false,
        })
    }

    /// Take the oldest committed record, if any.
    ///
    /// The slot returns to the free pool when the record is dropped.
    pub fn next(&self) -> Option<CommittedRecord<'_>> {
        let index = self.committed.pop()?;
        let len = self.lengths[index].load(Ordering::Relaxed);
        self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        Some(CommittedRecord {
            channel: self,
            index,
            len,
        })
    }

    /// Take one unit of free capacity, or report that there is none.
    fn admit(&self) -> bool {
        if self.available.load(Ordering::Acquire) <= 0 {
            return false;
        }
        if self.available.fetch_sub(1, Ordering::AcqRel) > 0 {
            return true;
        }
        self.available.fetch_add(1, Ordering::Release);
        false
    }

    /// One lap over the claim flags from the cursor.
    ///
    /// An admitted reservation only comes back empty if every free slot was
    /// claimed ahead of it during the lap.
    fn claim_slot(&self) -> Option<usize> {
        let start = self.claim.fetch_add(1, Ordering::Relaxed);
        (0..self.slots)
            .map(|step| start.wrapping_add(step) % self.slots)
            .find(|&index| {
                self.busy[index]
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            })
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.slots);
        // SAFETY: index < slots keeps the offset inside the slab allocation.
        let cell = unsafe { self.slab.as_ptr().add(index * (self.stride / WORD)) };
        UnsafeCell::raw_get(cell).cast::<u8>()
    }

    fn publish(&self, index: usize, len: usize) {
        self.lengths[index].store(len, Ordering::Relaxed);
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        self.committed.push(index);
    }

    fn release(&self, index: usize) {
        self.busy[index].store(false, Ordering::Release);
        self.available.fetch_add(1, Ordering::Release);
    }
}

impl fmt::Debug for RingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingChannel")
            .field("kind", &self.kind)
            .field("stride", &self.stride)
            .field("slots", &self.slots)
            .field("free", &self.free_slots())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Exclusive, uncommitted reservation.
///
/// Dropping a slot without committing it discards it.
pub struct Slot<'a> {
    channel: &'a RingChannel,
    index: usize,
    len: usize,
    finished: bool,
}

impl Slot<'_> {
    /// View the slot as a record, filled in place.
    ///
    /// Returns `None` if the record does not fit the reservation.
    pub fn record_mut<T: Record>(&mut self) -> Option<&mut T> {
        if mem::size_of::<T>() > self.len {
            return None;
        }
        // SAFETY: the slab is 8-byte aligned and the stride is a multiple of
        // 8, which covers `Record`'s alignment bound. The bytes were zeroed at
        // reservation and `Record` accepts any bit pattern.
        unsafe { Some(&mut *self.channel.slot_ptr(self.index).cast::<T>()) }
    }

    /// Make the record visible to the consumer.
    pub fn commit(mut self) {
        self.finished = true;
        self.channel.publish(self.index, self.len);
    }

    /// Return the slot without producing a record.
    pub fn discard(mut self) {
        self.finished = true;
        self.abandon();
    }

    fn abandon(&self) {
        self.channel.release(self.index);
        self.channel
            .stats
            .discarded
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abandon();
        }
    }
}

/// Committed record taken by the consumer. Derefs to the record bytes.
pub struct CommittedRecord<'a> {
    channel: &'a RingChannel,
    index: usize,
    len: usize,
}

impl CommittedRecord<'_> {
    pub fn kind(&self) -> EventKind {
        self.channel.kind
    }
}

impl Deref for CommittedRecord<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the record owns its slot until dropped and the committing
        // producer no longer has access to it.
        unsafe { slice::from_raw_parts(self.channel.slot_ptr(self.index), self.len) }
    }
}

impl Drop for CommittedRecord<'_> {
    fn drop(&mut self) {
        self.channel.release(self.index);
    }
}

// =============================================================================
// Commit ring
// =============================================================================

/// Committed slot indices in commit order.
///
/// A commit takes a ticket from a monotonically advancing cursor and writes
/// its slot index into cell `ticket % len`. That cell is always vacant: every
/// ticket the consumer has not yet taken pins a distinct slot, so fewer than
/// `len` tickets can be ahead of it.
struct CommitRing {
    cells: Box<[CommitCell]>,
    tail: AtomicUsize,
    head: AtomicUsize,
}

struct CommitCell {
    /// `ticket + 1` once the cell holds that ticket's index
    stamp: AtomicUsize,
    index: AtomicUsize,
}

impl CommitRing {
    fn with_capacity(capacity: usize) -> Self {
        let cells = (0..capacity)
            .map(|_| CommitCell {
                stamp: AtomicUsize::new(0),
                index: AtomicUsize::new(0),
            })
            .collect();
        Self {
            cells,
            tail: AtomicUsize::new(0),
            head: AtomicUsize::new(0),
        }
    }

    fn push(&self, index: usize) {
        let ticket = self.tail.fetch_add(1, Ordering::Relaxed);
        let cell = &self.cells[ticket % self.cells.len()];
        cell.index.store(index, Ordering::Relaxed);
        cell.stamp.store(ticket.wrapping_add(1), Ordering::Release);
    }

    /// Index behind the oldest ticket, or `None` until that ticket is written.
    fn pop(&self) -> Option<usize> {
        if self.cells.is_empty() {
            return None;
        }
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let cell = &self.cells[head % self.cells.len()];
            if cell.stamp.load(Ordering::Acquire) != head.wrapping_add(1) {
                return None;
            }
            let index = cell.index.load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(current) => head = current,
            }
        }
    }

    fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(self.cells.len())
    }
}
