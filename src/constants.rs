//! Crate-wide constants.
//!
//! Values that are part of the data-model and hashing contracts live here so the
//! decoder, pruner and LM store agree on them without passing them around.

/// Language-model constants.
pub mod lm {
    /// Maximum n-gram order the store supports, plus one word of headroom so an
    /// on-demand query can prepend a new word without reallocating.
    pub const MAX_NGRAM: usize = 6;

    /// Hash-table over-allocation exponent: per-order slot counts are the next
    /// power of two above `count * 2^HASH_REDUNDANT`.
    pub const HASH_REDUNDANT: f64 = 0.5;

    /// Log-probability returned when a query misses even the unigram row.
    /// The on-demand transducer view treats this as "no arc".
    pub const ABSENT_LOGPROB: f32 = f32::MIN;

    /// Default seed for the per-(position, word) hash coefficients.
    pub const DEFAULT_HASH_SEED: u64 = 0;
}

/// Decoding constants.
pub mod decoding {
    /// Worst possible packed (cost, index) value; lookup cells are seeded with
    /// this sentinel so any real proposal wins the first compare-and-swap.
    pub const WORST_TOKEN_PACK: u64 = u64::MAX;

    /// Pack index reserved for the initial token, which has no originating arc.
    pub const INIT_PACK_IDX: u32 = u32::MAX;

    /// Number of arc jobs a worker claims per atomic increment during expansion.
    pub const EXPAND_CHUNK: u32 = 64;
}

/// Memory and transfer tuning.
pub mod memory {
    /// Tokens prefetched beyond the arena front when hinting the device side.
    pub const TOKEN_PREFETCH: u32 = 4096;
}
