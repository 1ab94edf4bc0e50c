//! Hashed n-gram language-model store.
//!
//! A fixed-capacity multi-level hash table. Unigrams are addressed directly by
//! word id; each higher order owns a power-of-two slot range sized from the
//! declared counts. An n-gram's signature is the XOR of per-(position, word)
//! 64-bit coefficients sampled once at build from a seeded RNG, so two builds
//! from the same input produce byte-identical tables. Collisions chain through
//! arena indices.
//!
//! Word-id arrays are newest-first throughout: rescoring prepends the next
//! word in O(1), and truncating the array keeps the newest suffix.

use std::io::BufRead;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::constants::lm::{ABSENT_LOGPROB, HASH_REDUNDANT, MAX_NGRAM};
use crate::error::{Error, Result};
use crate::lm::arpa::{parse_arpa, ArpaOptions, ArpaSink};

const NO_CHAIN: i32 = -1;

/// One stored n-gram.
#[derive(Debug, Clone, Copy)]
struct LmState {
    /// Log-probability of the n-gram (scaled).
    logprob: f32,
    /// Back-off weight consulted when a longer query misses (scaled).
    backoff: f32,
    /// Full 64-bit hash signature, kept for collision disambiguation.
    signature: u64,
    /// Word ids, newest first.
    words: [i32; MAX_NGRAM],
    /// N-gram order; 0 marks an empty slot.
    order: u8,
    /// Next state in this hash slot's collision chain.
    chain_next: i32,
    /// Longest suffix whose state exists; equivalent LM histories collapse
    /// onto it, so the decoder's recombination sees fewer distinct states.
    reco_state_id: i32,
}

impl LmState {
    fn empty() -> Self {
        Self {
            logprob: 0.0,
            backoff: 0.0,
            signature: 0,
            words: [0; MAX_NGRAM],
            order: 0,
            chain_next: NO_CHAIN,
            reco_state_id: NO_CHAIN,
        }
    }

    #[inline]
    fn exists(&self) -> bool {
        self.order != 0
    }
}

/// In-memory hashed back-off n-gram model.
pub struct NgramLm {
    bos: i32,
    eos: i32,
    unk: i32,
    order: usize,
    symbol_size: usize,
    /// Hash coefficients, `coeffs[position][word]`.
    coeffs: Vec<Vec<u64>>,
    /// Slot count per order >= 2, index `order - 2`.
    slot_sizes: Vec<u64>,
    /// Accumulated slot offset per order >= 2 into `map`.
    slot_offsets: Vec<u64>,
    /// Hash slot -> head of collision chain in `states`, or -1.
    map: Vec<i32>,
    /// Unigram block `[0, symbol_size)`, then chained higher orders.
    states: Vec<LmState>,
    max_collision: u32,
}

impl NgramLm {
    /// Build from ARPA text.
    pub fn from_reader<R: BufRead>(
        reader: R,
        symbol_size: usize,
        options: ArpaOptions,
    ) -> Result<Self> {
        let strict = options.strict;
        let mut builder = NgramLmBuilder::new(symbol_size, options);
        parse_arpa(reader, strict, &mut builder)?;
        builder.finish()
    }

    /// Build from an ARPA file on disk.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        symbol_size: usize,
        options: ArpaOptions,
    ) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file), symbol_size, options)
    }

    pub fn bos_symbol(&self) -> i32 {
        self.bos
    }

    pub fn eos_symbol(&self) -> i32 {
        self.eos
    }

    pub fn unk_symbol(&self) -> i32 {
        self.unk
    }

    /// Highest n-gram order the model carries.
    pub fn ngram_order(&self) -> usize {
        self.order
    }

    /// Longest collision chain encountered while building.
    pub fn max_collision_chain(&self) -> u32 {
        self.max_collision
    }

    /// Clamp out-of-vocabulary ids onto the unk symbol.
    #[inline]
    fn map_word(&self, word: i32) -> i32 {
        if (0..self.symbol_size as i32).contains(&word) {
            word
        } else if (0..self.symbol_size as i32).contains(&self.unk) {
            self.unk
        } else {
            0
        }
    }

    /// Signature and map slot of an n-gram (newest-first ids, order >= 2).
    fn hashed_slot(&self, words: &[i32]) -> (u64, usize) {
        let order = words.len();
        debug_assert!(order >= 2 && order <= self.order);
        let mut signature = self.coeffs[0][words[0] as usize];
        for (pos, &word) in words.iter().enumerate().skip(1) {
            signature ^= self.coeffs[pos][word as usize];
        }
        let size = self.slot_sizes[order - 2];
        let offset = self.slot_offsets[order - 2];
        let slot = (signature & (size - 1)) + offset;
        (signature, slot as usize)
    }

    /// Index of the state storing exactly this n-gram, if present. Word ids
    /// are newest first.
    pub fn state_index(&self, words: &[i32], order: usize) -> Option<u32> {
        debug_assert!(order >= 1 && order <= words.len());
        if order == 1 {
            let word = self.map_word(words[0]) as usize;
            return self.states[word].exists().then_some(word as u32);
        }
        if order > self.order {
            return None;
        }
        let (signature, slot) = self.hashed_slot(&words[..order]);
        let mut cursor = self.map[slot];
        while cursor != NO_CHAIN {
            let state = &self.states[cursor as usize];
            // Slot ranges are disjoint per order, so the signature alone
            // disambiguates within a chain.
            if state.signature == signature {
                return Some(cursor as u32);
            }
            cursor = state.chain_next;
        }
        None
    }

    /// Word ids (newest first) and order stored at `state_id`.
    pub fn word_ids_by_state(&self, state_id: u32) -> (&[i32], usize) {
        let state = &self.states[state_id as usize];
        let order = state.order as usize;
        (&state.words[..order], order)
    }

    /// Recombination state of `state_id`.
    pub fn reco_state_id(&self, state_id: u32) -> u32 {
        self.states[state_id as usize].reco_state_id as u32
    }

    /// Back-off log-probability of the n-gram at `state_id`.
    pub fn backoff_of(&self, state_id: u32) -> f32 {
        self.states[state_id as usize].backoff
    }

    /// Log-probability of the newest-first n-gram `words[..order]`, with
    /// back-off recursion on misses. `state_id` receives the recombination
    /// state of the entry that finally answered the query.
    ///
    /// Queries longer than the model order are clamped to the newest
    /// `ngram_order()` words. Returns [`ABSENT_LOGPROB`] only when even the
    /// unigram row has no entry.
    pub fn get_ngram_logprob(&self, words: &[i32], order: usize, state_id: &mut u32) -> f32 {
        let clamped = order.min(self.order).min(words.len());
        debug_assert!(clamped >= 1);
        let mut mapped = [0i32; MAX_NGRAM];
        for (dst, &src) in mapped.iter_mut().zip(words.iter()).take(clamped) {
            *dst = self.map_word(src);
        }
        self.logprob_inner(&mapped[..clamped], state_id)
    }

    fn logprob_inner(&self, words: &[i32], state_id: &mut u32) -> f32 {
        let order = words.len();
        if let Some(idx) = self.state_index(words, order) {
            *state_id = self.states[idx as usize].reco_state_id as u32;
            return self.states[idx as usize].logprob;
        }
        if order == 1 {
            return ABSENT_LOGPROB;
        }
        // Missing back-off states contribute 0 but do not stop the recursion.
        let backoff = self
            .state_index(&words[1..], order - 1)
            .map(|idx| self.states[idx as usize].backoff)
            .unwrap_or(0.0);
        let shorter = self.logprob_inner(&words[..order - 1], state_id);
        if shorter == ABSENT_LOGPROB {
            ABSENT_LOGPROB
        } else {
            backoff + shorter
        }
    }
}

/// Incremental construction of [`NgramLm`], fed by the ARPA reader or
/// directly by synthetic model generators.
pub struct NgramLmBuilder {
    lm: NgramLm,
    options: ArpaOptions,
    declared: Vec<usize>,
    read_counts: Vec<usize>,
}

impl ArpaSink for NgramLmBuilder {
    fn header(&mut self, counts: &[usize]) -> Result<()> {
        NgramLmBuilder::header(self, counts)
    }

    fn ngram(&mut self, words: &[i32], logprob: f32, backoff: f32) -> Result<()> {
        NgramLmBuilder::ngram(self, words, logprob, backoff)
    }
}

impl NgramLmBuilder {
    pub fn new(symbol_size: usize, options: ArpaOptions) -> Self {
        let lm = NgramLm {
            bos: options.bos_symbol,
            eos: options.eos_symbol,
            unk: options.unk_symbol,
            order: 0,
            symbol_size,
            coeffs: Vec::new(),
            slot_sizes: Vec::new(),
            slot_offsets: Vec::new(),
            map: Vec::new(),
            states: Vec::new(),
            max_collision: 0,
        };
        Self {
            lm,
            options,
            declared: Vec::new(),
            read_counts: Vec::new(),
        }
    }

    /// Allocate hash slots and the state arena from the declared counts.
    pub fn header(&mut self, counts: &[usize]) -> Result<()> {
        if counts.is_empty() || counts.len() >= MAX_NGRAM {
            return Err(Error::Configuration(format!(
                "n-gram order {} unsupported (max {})",
                counts.len(),
                MAX_NGRAM - 1
            )));
        }
        if self.lm.symbol_size == 0 {
            return Err(Error::Configuration(
                "LM vocabulary size must be positive".to_string(),
            ));
        }
        let lm = &mut self.lm;
        lm.order = counts.len();
        self.declared = counts.to_vec();
        self.read_counts = vec![0; counts.len()];

        // Deterministic coefficients: one 64-bit value per (position, word).
        let mut rng = StdRng::seed_from_u64(self.options.seed);
        lm.coeffs = (0..lm.order)
            .map(|_| (0..lm.symbol_size).map(|_| rng.gen::<u64>()).collect())
            .collect();

        // Power-of-two slot ranges for orders >= 2.
        let mut offset = 0u64;
        for (i, &count) in counts.iter().enumerate().skip(1) {
            let bits = ((count.max(1) as f64).log2() + HASH_REDUNDANT).ceil() as u32;
            let size = 1u64 << bits;
            debug!(
                order = i + 1,
                declared = count,
                slots = size,
                "sized n-gram hash level"
            );
            lm.slot_sizes.push(size);
            lm.slot_offsets.push(offset);
            offset += size;
        }
        lm.map = vec![NO_CHAIN; offset as usize];

        let chained: usize = counts.iter().skip(1).sum();
        lm.states = Vec::with_capacity(lm.symbol_size + chained);
        lm.states.resize(lm.symbol_size, LmState::empty());
        Ok(())
    }

    /// Insert one n-gram, word ids oldest-first as ARPA writes them.
    pub fn ngram(&mut self, words: &[i32], logprob: f32, backoff: f32) -> Result<()> {
        let order = words.len();
        if order == 0 || order > self.lm.order {
            return Err(Error::Configuration(format!(
                "n-gram of order {} outside the declared model order {}",
                order, self.lm.order
            )));
        }
        if words
            .iter()
            .any(|&w| !(0..self.lm.symbol_size as i32).contains(&w))
        {
            return Err(Error::Configuration(format!(
                "word id outside the vocabulary of {} symbols: {:?}",
                self.lm.symbol_size, words
            )));
        }
        self.read_counts[order - 1] += 1;

        let mut state = LmState::empty();
        state.logprob = logprob * self.options.scale;
        state.backoff = backoff * self.options.scale;
        state.order = order as u8;
        for (i, &w) in words.iter().rev().enumerate() {
            state.words[i] = w; // newest first
        }

        let lm = &mut self.lm;
        if order == 1 {
            let word = words[0] as usize;
            lm.states[word] = state;
            return Ok(());
        }

        let (signature, slot) = lm.hashed_slot(&state.words[..order]);
        state.signature = signature;
        let idx = lm.states.len() as i32;
        lm.states.push(state);

        // External chaining on collision.
        let mut cursor = lm.map[slot];
        if cursor == NO_CHAIN {
            lm.map[slot] = idx;
        } else {
            let mut depth = 1u32;
            while lm.states[cursor as usize].chain_next != NO_CHAIN {
                cursor = lm.states[cursor as usize].chain_next;
                depth += 1;
            }
            lm.states[cursor as usize].chain_next = idx;
            lm.max_collision = lm.max_collision.max(depth);
        }
        Ok(())
    }

    /// Verify counts, resolve recombination states and seal the model.
    pub fn finish(mut self) -> Result<NgramLm> {
        for (i, (&declared, &read)) in self.declared.iter().zip(self.read_counts.iter()).enumerate()
        {
            if declared != read {
                if self.options.strict {
                    return Err(Error::Inconsistent {
                        order: i + 1,
                        declared,
                        read,
                    });
                }
                tracing::warn!(
                    order = i + 1,
                    declared,
                    read,
                    "n-gram count mismatch against the header"
                );
            }
        }
        self.resolve_reco_states();
        info!(
            order = self.lm.order,
            states = self.lm.states.len(),
            max_collision = self.lm.max_collision,
            "n-gram store built"
        );
        Ok(self.lm)
    }

    /// For every stored state, find the longest suffix (newest words) whose
    /// state exists. States below the maximum order are valid histories and
    /// recombine onto themselves; maximum-order states cannot be histories
    /// and collapse onto their suffix, terminating at the unigram row.
    fn resolve_reco_states(&mut self) {
        let lm = &mut self.lm;
        for idx in 0..lm.states.len() {
            if !lm.states[idx].exists() {
                continue;
            }
            let order = lm.states[idx].order as usize;
            if order < lm.order || lm.order == 1 {
                lm.states[idx].reco_state_id = idx as i32;
                continue;
            }
            let words = lm.states[idx].words;
            let mut reco = words[0]; // unigram row fallback
            for suffix in (1..order).rev() {
                if let Some(found) = lm.state_index(&words[..suffix], suffix) {
                    reco = found as i32;
                    break;
                }
            }
            lm.states[idx].reco_state_id = reco;
        }
    }
}
