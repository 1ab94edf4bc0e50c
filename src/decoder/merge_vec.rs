//! Dual-buffer vectors with atomic recombination support.
//!
//! [`DeviceVector`] is a fixed-capacity vector with an atomic size counter,
//! shared between the kernel grid and the host. [`TokenMergeVector`] extends
//! it for the two-pass atomic token recombination: pass one appends candidate
//! TokenStates while racing minimum-cost winners into per-state pack cells;
//! pass two ([`TokenMergeVector::store_by_pack_index`]) re-reads each entry's
//! pack cell and rewrites the entry from the winner's scratch token, so the
//! active token handle always matches the authoritative atomic cell.
//!
//! Entry reads must be separated from concurrent appends by a grid barrier or
//! stream ordering; the counter alone does not publish entry contents.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::constants::decoding::INIT_PACK_IDX;
use crate::decoder::arena::TokenArena;
use crate::decoder::lookup::unpack_idx;
use crate::decoder::types::{Token, TokenState};

/// Fixed-capacity vector with atomic append, usable from many threads at once.
pub(crate) struct DeviceVector<T: Copy> {
    ptr: NonNull<T>,
    capacity: u32,
    count: AtomicU32,
}

// Safety: appends reserve disjoint slots through the atomic counter; reads are
// separated from writes by the callers' barriers per the module contract.
unsafe impl<T: Copy + Send> Send for DeviceVector<T> {}
unsafe impl<T: Copy + Send> Sync for DeviceVector<T> {}

impl<T: Copy> DeviceVector<T> {
    pub fn new(capacity: u32, fill: T) -> Self {
        let boxed: Box<[T]> = vec![fill; capacity as usize].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(boxed) as *mut T).expect("vector allocation");
        Self {
            ptr,
            capacity,
            count: AtomicU32::new(0),
        }
    }

    /// Append `value`, returning its assigned index.
    pub fn push_back(&self, value: T) -> u32 {
        let idx = self.count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(idx < self.capacity, "device vector overflow");
        unsafe { *self.ptr.as_ptr().add(idx as usize) = value };
        idx
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.count.store(0, Ordering::Release);
    }

    /// Read entry `idx`.
    #[inline]
    pub fn get(&self, idx: u32) -> T {
        debug_assert!(idx < self.size());
        unsafe { *self.ptr.as_ptr().add(idx as usize) }
    }

    /// Overwrite entry `idx`.
    #[inline]
    pub fn set(&self, idx: u32, value: T) {
        debug_assert!(idx < self.capacity);
        unsafe { *self.ptr.as_ptr().add(idx as usize) = value };
    }

    /// Copy the first `len` entries out.
    pub fn snapshot(&self, len: u32) -> Vec<T> {
        debug_assert!(len <= self.size());
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), len as usize).to_vec() }
    }
}

impl<T: Copy> Drop for DeviceVector<T> {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.capacity as usize,
            )));
        }
    }
}

/// Per-arc token scratch: pass one of the recombination writes winning tokens
/// here, keyed by the arc that produced them; pass two copies them out.
pub(crate) struct TokenScratch {
    ptr: NonNull<Token>,
    capacity: u32,
    updated: Box<[AtomicU32]>,
}

// Safety: each arc index is expanded by exactly one thread between barriers,
// so a scratch slot has one writer per pass.
unsafe impl Send for TokenScratch {}
unsafe impl Sync for TokenScratch {}

impl TokenScratch {
    pub fn new(num_arcs: u32) -> Self {
        let zero = Token {
            cost: 0.0,
            frame: 0,
            extra_cost: 0.0,
            state: 0,
        };
        let boxed: Box<[Token]> = vec![zero; num_arcs as usize].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(boxed) as *mut Token).expect("scratch allocation");
        let updated = (0..num_arcs)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            ptr,
            capacity: num_arcs,
            updated,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Record the winning token for arc `idx` and flag it updated.
    #[inline]
    pub fn write(&self, idx: u32, token: Token) {
        debug_assert!(idx < self.capacity);
        unsafe { *self.ptr.as_ptr().add(idx as usize) = token };
        self.updated[idx as usize].store(1, Ordering::Release);
    }

    #[inline]
    pub fn read(&self, idx: u32) -> Token {
        debug_assert!(idx < self.capacity);
        unsafe { *self.ptr.as_ptr().add(idx as usize) }
    }

    #[inline]
    pub fn is_updated(&self, idx: u32) -> bool {
        self.updated[idx as usize].load(Ordering::Acquire) != 0
    }

    /// Clear the updated flags in `range`; workers split the full range.
    pub fn clear_updated(&self, range: std::ops::Range<u32>) {
        for idx in range {
            self.updated[idx as usize].store(0, Ordering::Relaxed);
        }
    }
}

impl Drop for TokenScratch {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.capacity as usize,
            )));
        }
    }
}

/// TokenState vector with the pack-cell bookkeeping for the merge pass.
pub(crate) struct TokenMergeVector {
    data: DeviceVector<TokenState>,
    /// The atomic cell backing each entry, recorded at push time.
    packs: Box<[AtomicPtr<AtomicU64>]>,
    /// Whether the merge pass overwrote each entry.
    updated: Box<[AtomicU32]>,
}

// Safety: pack pointers reference lookup cells that outlive the vector
// (both are owned by the decoder core); flag/pointer slots go through
// atomics.
unsafe impl Send for TokenMergeVector {}
unsafe impl Sync for TokenMergeVector {}

impl TokenMergeVector {
    pub fn new(capacity: u32) -> Self {
        let fill = TokenState {
            token_idx: 0,
            state: 0,
            cost: 0.0,
        };
        let packs = (0..capacity)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let updated = (0..capacity)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            data: DeviceVector::new(capacity, fill),
            packs,
            updated,
        }
    }

    /// Append an entry with the pack cell that will decide its winner.
    pub fn push_back(&self, value: TokenState, pack_cell: *const AtomicU64) -> u32 {
        let idx = self.data.push_back(value);
        self.packs[idx as usize].store(pack_cell as *mut AtomicU64, Ordering::Release);
        idx
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.data.size()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    #[inline]
    pub fn get(&self, idx: u32) -> TokenState {
        self.data.get(idx)
    }

    #[inline]
    pub fn set(&self, idx: u32, value: TokenState) {
        self.data.set(idx, value);
    }

    pub fn snapshot(&self) -> Vec<TokenState> {
        self.data.snapshot(self.size())
    }

    /// Whether entry `idx` was overwritten by the most recent merge pass.
    #[allow(dead_code)]
    pub fn is_updated(&self, idx: u32) -> bool {
        self.updated[idx as usize].load(Ordering::Acquire) != 0
    }

    /// Pass two of the recombination: for every entry in `range`, re-read its
    /// pack cell, and when the winning arc's scratch token is flagged updated,
    /// materialize it into the arena slot `frame_start + entry_index` and
    /// rewrite the entry to match. Entries whose cell is owned by the initial
    /// token keep their handle.
    pub fn store_by_pack_index(
        &self,
        range: std::ops::Range<u32>,
        scratch: &TokenScratch,
        arena: &TokenArena,
        frame_start: u32,
    ) {
        for idx in range {
            let cell = self.packs[idx as usize].load(Ordering::Acquire);
            debug_assert!(!cell.is_null());
            // Safety: the cell points into the lookup table owned by the same
            // decoder core; see the struct-level contract.
            let pack = unsafe { (*cell).load(Ordering::Acquire) };
            let winner = unpack_idx(pack);
            if winner != INIT_PACK_IDX && scratch.is_updated(winner) {
                let token = scratch.read(winner);
                let global = frame_start + idx;
                // Safety: entry idx owns arena slot frame_start + idx.
                unsafe { arena.write(global, token) };
                let mut entry = self.data.get(idx);
                entry.token_idx = global;
                entry.cost = token.cost;
                self.data.set(idx, entry);
                self.updated[idx as usize].store(1, Ordering::Release);
            } else {
                self.updated[idx as usize].store(0, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::lookup::TokenLookup;

    #[test]
    fn test_device_vector_push_and_clear() {
        let vec = DeviceVector::new(8, 0u32);
        assert_eq!(vec.push_back(10), 0);
        assert_eq!(vec.push_back(20), 1);
        assert_eq!(vec.size(), 2);
        assert_eq!(vec.get(1), 20);
        vec.clear();
        assert_eq!(vec.size(), 0);
    }

    #[test]
    fn test_concurrent_push_assigns_unique_slots() {
        let vec = DeviceVector::new(1024, 0usize);
        std::thread::scope(|s| {
            for t in 0..4 {
                let vec = &vec;
                s.spawn(move || {
                    for i in 0..256 {
                        vec.push_back(t * 1000 + i);
                    }
                });
            }
        });
        assert_eq!(vec.size(), 1024);
        let mut seen = vec.snapshot(1024);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 1024);
    }

    #[test]
    fn test_store_by_pack_index_rewrites_winner() {
        let lookup = TokenLookup::new(1);
        let arena = TokenArena::new(8);
        let scratch = TokenScratch::new(4);
        let vec = TokenMergeVector::new(4);

        let elem = lookup.elem(0);
        // Arc 2 proposes cost 3.0 and wins; arc 1 proposed 5.0 and lost.
        assert!(elem.try_install(5.0, 1));
        scratch.write(
            1,
            Token {
                cost: 5.0,
                frame: 0,
                extra_cost: 0.0,
                state: 0,
            },
        );
        assert!(elem.try_install(3.0, 2));
        scratch.write(
            2,
            Token {
                cost: 3.0,
                frame: 0,
                extra_cost: 0.0,
                state: 0,
            },
        );

        let entry_idx = vec.push_back(
            TokenState {
                token_idx: 0,
                state: 0,
                cost: 5.0,
            },
            elem.pack_ptr(),
        );

        vec.store_by_pack_index(0..vec.size(), &scratch, &arena, 4);
        assert!(vec.is_updated(entry_idx));
        let entry = vec.get(entry_idx);
        assert_eq!(entry.token_idx, 4);
        assert_eq!(entry.cost, 3.0);
        assert_eq!(unsafe { arena.read(4) }.cost, 3.0);
    }

    #[test]
    fn test_store_skips_initial_token_entries() {
        let lookup = TokenLookup::new(1);
        let arena = TokenArena::new(4);
        let scratch = TokenScratch::new(2);
        let vec = TokenMergeVector::new(2);

        let elem = lookup.elem(0);
        elem.force_install(0.0, INIT_PACK_IDX);
        let entry_idx = vec.push_back(
            TokenState {
                token_idx: 0,
                state: 0,
                cost: 0.0,
            },
            elem.pack_ptr(),
        );

        vec.store_by_pack_index(0..vec.size(), &scratch, &arena, 0);
        assert!(!vec.is_updated(entry_idx));
        assert_eq!(vec.get(entry_idx).token_idx, 0);
    }
}
