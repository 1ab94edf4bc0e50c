//! Core decoding data types.
//!
//! Layouts are part of the host/device contract: `Token` and `TokenState` are
//! 16 bytes, `LatLink` 32 bytes, so frames copy with aligned bulk moves.
//! Tokens are addressed by packed `(frame, index)` pairs rather than pointers,
//! which keeps references valid across arena relocation and lets the host
//! resolve them with the per-frame start indices alone.

/// A hypothesis node: the best way found so far to be in a WFST state at a
/// given frame.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token {
    /// Accumulated path cost up to this token; higher is worse.
    pub cost: f32,
    /// Frame at which the token was created.
    pub frame: i32,
    /// Slack over the best path through this token; written by the lattice
    /// pruner, 0 until then.
    pub extra_cost: f32,
    /// WFST state this token sits on.
    pub state: u32,
}

/// A per-frame record marking a WFST state active.
///
/// The cost duplicates the token's cost so the host can walk lattice data
/// without dereferencing into the token arena.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct TokenState {
    /// Index of the backing token in the global token arena.
    pub token_idx: u32,
    /// WFST state.
    pub state: u32,
    /// Copy of the token's accumulated cost.
    pub cost: f32,
}

/// A lattice arc connecting two tokens.
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy)]
pub struct LatLink {
    /// Packed `(frame, index)` of the destination token.
    pub next_tok: u64,
    /// Packed `(frame, index)` of the source token.
    pub prev_tok: u64,
    /// Input label on the link.
    pub ilabel: i32,
    /// Output label on the link.
    pub olabel: i32,
    /// Graph cost of traversing the link (contains LM, transitions).
    pub graph_cost: f32,
    /// Acoustic cost (pre-scaled) of traversing the link.
    pub acoustic_cost: f32,
}

impl LatLink {
    /// Build a link from endpoint coordinates.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prev_frame: u32,
        prev_idx: u32,
        next_frame: u32,
        next_idx: u32,
        ilabel: i32,
        olabel: i32,
        graph_cost: f32,
        acoustic_cost: f32,
    ) -> Self {
        Self {
            next_tok: pack_tok_ref(next_frame, next_idx),
            prev_tok: pack_tok_ref(prev_frame, prev_idx),
            ilabel,
            olabel,
            graph_cost,
            acoustic_cost,
        }
    }
}

/// Pack a `(frame, index-in-frame)` token reference into 64 bits.
#[inline]
pub fn pack_tok_ref(frame: u32, idx: u32) -> u64 {
    ((frame as u64) << 32) | idx as u64
}

/// Unpack a token reference into `(frame, index-in-frame)`.
#[inline]
pub fn unpack_tok_ref(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

const _: () = {
    assert!(std::mem::size_of::<Token>() == 16);
    assert!(std::mem::size_of::<TokenState>() == 16);
    assert!(std::mem::size_of::<LatLink>() == 32);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tok_ref_roundtrip() {
        for (frame, idx) in [(0, 0), (1, 7), (2999, 199_999), (u32::MAX, u32::MAX)] {
            assert_eq!(unpack_tok_ref(pack_tok_ref(frame, idx)), (frame, idx));
        }
    }

    #[test]
    fn test_lat_link_endpoints() {
        let link = LatLink::new(4, 10, 5, 3, 9, 2, 1.5, 0.25);
        assert_eq!(unpack_tok_ref(link.prev_tok), (4, 10));
        assert_eq!(unpack_tok_ref(link.next_tok), (5, 3));
        assert_eq!(link.ilabel, 9);
        assert_eq!(link.olabel, 2);
    }
}
