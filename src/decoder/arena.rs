//! Token arena.
//!
//! A single contiguous pool of [`Token`]s in unified memory, bump-allocated a
//! frame at a time. The front pointer advances once per frame by the number of
//! tokens admitted; each frame's tokens are contiguous, so a `(frame, index)`
//! pair plus the recorded per-frame start resolves a token in O(1).
//!
//! Operations are wait-free. Advancing past the capacity is undefined behavior
//! by contract; callers size the arena via `max_tokens`.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::constants::memory::TOKEN_PREFETCH;
use crate::decoder::types::Token;

pub(crate) struct TokenArena {
    ptr: NonNull<Token>,
    capacity: u32,
    front: AtomicU32,
}

// Safety: slot ownership is coordinated by the kernel. During a frame each
// slot at or past the front is written by exactly one thread (the store pass
// entry that owns it), and slots below the front are only read. The front
// itself is atomic.
unsafe impl Send for TokenArena {}
unsafe impl Sync for TokenArena {}

impl TokenArena {
    pub fn new(capacity: u32) -> Self {
        let zero = Token {
            cost: 0.0,
            frame: 0,
            extra_cost: 0.0,
            state: 0,
        };
        let boxed: Box<[Token]> = vec![zero; capacity as usize].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(boxed) as *mut Token).expect("arena allocation");
        Self {
            ptr,
            capacity,
            front: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Current front: the index the next frame's tokens will start at.
    #[inline]
    pub fn front(&self) -> u32 {
        self.front.load(Ordering::Acquire)
    }

    /// Advance the front past `count` freshly written tokens; returns the old
    /// front. Exceeding the capacity is the caller's contract violation.
    pub fn advance_front(&self, count: u32) -> u32 {
        let old = self.front.fetch_add(count, Ordering::AcqRel);
        debug_assert!(
            old as u64 + count as u64 <= self.capacity as u64,
            "token arena overflow: front {} + {} > capacity {}",
            old,
            count,
            self.capacity
        );
        old
    }

    /// Read the token at `idx`.
    ///
    /// # Safety
    /// `idx` must be in bounds and the slot must not be concurrently written.
    #[inline]
    pub unsafe fn read(&self, idx: u32) -> Token {
        debug_assert!(idx < self.capacity);
        *self.ptr.as_ptr().add(idx as usize)
    }

    /// Write the token at `idx`.
    ///
    /// # Safety
    /// `idx` must be in bounds and the slot must be owned by the caller for
    /// the duration of the write (one writer per slot per frame).
    #[inline]
    pub unsafe fn write(&self, idx: u32, token: Token) {
        debug_assert!(idx < self.capacity);
        *self.ptr.as_ptr().add(idx as usize) = token;
    }

    /// Copy the allocated prefix `[0, front)` out of the arena.
    pub fn snapshot(&self) -> Vec<Token> {
        let front = self.front() as usize;
        // Safety: everything below the front was fully written by earlier
        // frames and is no longer mutated.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), front).to_vec() }
    }

    /// Hint that the next allocations will be touched by the kernel.
    /// A no-op on unified memory without prefetch.
    pub fn prefetch_next_to_device(&self, _count: u32) {}

    /// Same hint with the default prefetch window.
    pub fn prefetch_next_to_device_default(&self) {
        self.prefetch_next_to_device(TOKEN_PREFETCH);
    }

    /// Hint that the allocated prefix will be read from the host.
    /// A no-op on unified memory without prefetch.
    pub fn prefetch_allocated_to_host(&self) {}

    /// Rewind the front to zero without zeroing memory.
    pub fn reset(&self) {
        self.front.store(0, Ordering::Release);
    }
}

impl Drop for TokenArena {
    fn drop(&mut self) {
        // Safety: ptr/capacity came from Box::into_raw of this layout.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.capacity as usize,
            )));
        }
    }
}
