//! Token lookup table: the serialization point for recombination.
//!
//! One [`TokenLookupElem`] per WFST state. A proposed incoming token packs its
//! cost (order-preserving bits, high half) and a scratch index (low half) into
//! a single 64-bit cell, so one compare-and-swap implements "keep the cheaper
//! incoming token" and any thread can tell whether its proposal won without
//! reading neighbor data. The cell is reset to the worst-cost sentinel between
//! frames.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::constants::decoding::WORST_TOKEN_PACK;

/// Map an `f32` cost to bits whose unsigned order matches the float order.
#[inline]
pub(crate) fn cost_to_ordered(cost: f32) -> u32 {
    let bits = cost.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

/// Inverse of [`cost_to_ordered`].
#[inline]
pub(crate) fn ordered_to_cost(ordered: u32) -> f32 {
    let bits = if ordered & 0x8000_0000 != 0 {
        ordered & 0x7FFF_FFFF
    } else {
        !ordered
    };
    f32::from_bits(bits)
}

/// Pack `(cost, index)` with cost bits in the high half, monotone under
/// unsigned comparison.
#[inline]
pub(crate) fn pack_cost_idx(cost: f32, idx: u32) -> u64 {
    ((cost_to_ordered(cost) as u64) << 32) | idx as u64
}

/// Cost half of a packed cell.
#[inline]
pub(crate) fn unpack_cost(pack: u64) -> f32 {
    ordered_to_cost((pack >> 32) as u32)
}

/// Index half of a packed cell.
#[inline]
pub(crate) fn unpack_idx(pack: u64) -> u32 {
    pack as u32
}

const INACTIVE: u32 = 0;
const ACTIVE: u32 = 1;
const NO_TOKENSTATE: i32 = -1;

/// Per-state recombination cell.
pub(crate) struct TokenLookupElem {
    /// Packed `(cost, scratch index)` of the current best incoming token.
    token_pack: AtomicU64,
    /// Whether the state has been activated this frame.
    active: AtomicU32,
    /// Index of the state's TokenState in the current frame vector.
    /// Written once, when the state first becomes active.
    tokenstate_idx: AtomicI32,
}

impl TokenLookupElem {
    fn new() -> Self {
        Self {
            token_pack: AtomicU64::new(WORST_TOKEN_PACK),
            active: AtomicU32::new(INACTIVE),
            tokenstate_idx: AtomicI32::new(NO_TOKENSTATE),
        }
    }

    /// Seed the cell for a new frame.
    pub fn reset(&self) {
        self.token_pack.store(WORST_TOKEN_PACK, Ordering::Relaxed);
        self.active.store(INACTIVE, Ordering::Relaxed);
        self.tokenstate_idx.store(NO_TOKENSTATE, Ordering::Relaxed);
    }

    /// Race to install `(cost, idx)`. Returns true if this proposal won.
    /// A proposal only wins on strict cost improvement: equal costs keep the
    /// incumbent.
    pub fn try_install(&self, cost: f32, idx: u32) -> bool {
        let proposal = pack_cost_idx(cost, idx);
        let mut current = self.token_pack.load(Ordering::Acquire);
        loop {
            if proposal >> 32 >= current >> 32 {
                return false;
            }
            match self.token_pack.compare_exchange_weak(
                current,
                proposal,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Install unconditionally; used for the initial token only.
    pub fn force_install(&self, cost: f32, idx: u32) {
        self.token_pack
            .store(pack_cost_idx(cost, idx), Ordering::Release);
    }

    /// Current packed cell value.
    #[inline]
    pub fn load_pack(&self) -> u64 {
        self.token_pack.load(Ordering::Acquire)
    }

    /// Current best cost into this state, or +inf when untouched.
    #[inline]
    pub fn best_cost(&self) -> f32 {
        let pack = self.load_pack();
        if pack == WORST_TOKEN_PACK {
            f32::INFINITY
        } else {
            unpack_cost(pack)
        }
    }

    /// Pointer to the packed cell, recorded by the merge vector so the store
    /// pass can re-read the authoritative winner.
    pub fn pack_ptr(&self) -> *const AtomicU64 {
        &self.token_pack as *const AtomicU64
    }

    /// Atomically flip the state to active. Returns true for the one caller
    /// that performed the flip and therefore owns TokenState allocation.
    pub fn try_activate(&self) -> bool {
        self.active
            .compare_exchange(INACTIVE, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publish the TokenState slot index after activation.
    pub fn set_tokenstate_idx(&self, idx: u32) {
        self.tokenstate_idx.store(idx as i32, Ordering::Release);
    }

    /// TokenState slot of this state, spinning through the short window
    /// between a competitor's activation and its index publication.
    pub fn tokenstate_idx(&self) -> u32 {
        loop {
            let idx = self.tokenstate_idx.load(Ordering::Acquire);
            if idx != NO_TOKENSTATE {
                return idx as u32;
            }
            std::hint::spin_loop();
        }
    }
}

/// One lookup element per WFST state.
pub(crate) struct TokenLookup {
    elems: Box<[TokenLookupElem]>,
}

impl TokenLookup {
    pub fn new(num_states: u32) -> Self {
        let elems = (0..num_states)
            .map(|_| TokenLookupElem::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { elems }
    }

    #[inline]
    pub fn elem(&self, state: u32) -> &TokenLookupElem {
        &self.elems[state as usize]
    }

    /// Reset every state; used when starting a fresh utterance.
    pub fn reset_all(&self) {
        for elem in self.elems.iter() {
            elem.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_cost_preserves_order() {
        let costs = [-10.0f32, -0.5, 0.0, 0.25, 1.0, 100.0, f32::INFINITY];
        for pair in costs.windows(2) {
            assert!(cost_to_ordered(pair[0]) < cost_to_ordered(pair[1]));
        }
        for &c in &costs[..costs.len() - 1] {
            assert_eq!(ordered_to_cost(cost_to_ordered(c)), c);
        }
    }

    #[test]
    fn test_pack_orders_by_cost_first() {
        assert!(pack_cost_idx(1.0, 500) < pack_cost_idx(2.0, 0));
        assert_eq!(unpack_idx(pack_cost_idx(1.0, 42)), 42);
        assert_eq!(unpack_cost(pack_cost_idx(3.5, 42)), 3.5);
    }

    #[test]
    fn test_install_keeps_cheaper() {
        let elem = TokenLookupElem::new();
        assert!(elem.try_install(5.0, 1));
        assert!(!elem.try_install(6.0, 2));
        assert!(elem.try_install(4.0, 3));
        // Equal cost keeps the incumbent.
        assert!(!elem.try_install(4.0, 4));
        assert_eq!(unpack_idx(elem.load_pack()), 3);
        assert_eq!(elem.best_cost(), 4.0);
    }

    #[test]
    fn test_activation_is_exclusive() {
        let elem = TokenLookupElem::new();
        assert!(elem.try_activate());
        assert!(!elem.try_activate());
        elem.set_tokenstate_idx(11);
        assert_eq!(elem.tokenstate_idx(), 11);
    }

    #[test]
    fn test_reset_restores_sentinel() {
        let elem = TokenLookupElem::new();
        elem.try_install(1.0, 0);
        elem.try_activate();
        elem.reset();
        assert_eq!(elem.load_pack(), WORST_TOKEN_PACK);
        assert!(elem.best_cost().is_infinite());
        assert!(elem.try_activate());
    }

    #[test]
    fn test_concurrent_installs_keep_minimum() {
        use std::sync::Arc;
        let elem = Arc::new(TokenLookupElem::new());
        std::thread::scope(|s| {
            for t in 0..8 {
                let elem = &elem;
                s.spawn(move || {
                    for i in 0..100 {
                        let cost = ((t * 100 + i) % 57) as f32;
                        elem.try_install(cost, t as u32);
                    }
                });
            }
        });
        assert_eq!(elem.best_cost(), 0.0);
    }
}
