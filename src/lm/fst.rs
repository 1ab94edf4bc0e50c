//! Deterministic on-demand transducer view over the n-gram store.
//!
//! Exposes `(start, final, get_arc)` so a graph composition can rescore
//! hypotheses lazily: each arc query prepends the requested label to the
//! state's stored history (newest first) and looks the extended n-gram up,
//! returning the negated log-probability as the arc weight and the entry's
//! recombination state as the destination.

use crate::constants::lm::{ABSENT_LOGPROB, MAX_NGRAM};
use crate::lm::store::NgramLm;

/// An on-demand LM arc.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmArc {
    pub ilabel: i32,
    /// Always equal to `ilabel`; the view is an acceptor.
    pub olabel: i32,
    /// Negated log-probability.
    pub weight: f32,
    pub nextstate: u32,
}

/// Deterministic on-demand view of an [`NgramLm`].
pub struct NgramLmFst<'a> {
    lm: &'a NgramLm,
    start_state: u32,
}

impl<'a> NgramLmFst<'a> {
    /// Precomputes the start state by querying the `[bos]` history.
    pub fn new(lm: &'a NgramLm) -> Self {
        let mut start_state = 0u32;
        lm.get_ngram_logprob(&[lm.bos_symbol()], 1, &mut start_state);
        Self { lm, start_state }
    }

    /// State reached after consuming beginning-of-sentence.
    pub fn start(&self) -> u32 {
        self.start_state
    }

    /// Cost of emitting end-of-sentence from `state`; infinite when the
    /// model has no answer at all.
    pub fn final_weight(&self, state: u32) -> f32 {
        match self.query(state, self.lm.eos_symbol()) {
            Some((logprob, _)) => -logprob,
            None => f32::INFINITY,
        }
    }

    /// Arc out of `state` consuming `ilabel`, or `None` when the LM signals
    /// an absent entry.
    pub fn get_arc(&self, state: u32, ilabel: i32) -> Option<LmArc> {
        let (logprob, nextstate) = self.query(state, ilabel)?;
        Some(LmArc {
            ilabel,
            olabel: ilabel,
            weight: -logprob,
            nextstate,
        })
    }

    fn query(&self, state: u32, label: i32) -> Option<(f32, u32)> {
        let (history, order) = self.lm.word_ids_by_state(state);
        debug_assert!(order + 1 <= MAX_NGRAM);
        let mut words = [0i32; MAX_NGRAM];
        words[0] = label;
        words[1..=order].copy_from_slice(history);

        let mut nextstate = 0u32;
        let logprob = self
            .lm
            .get_ngram_logprob(&words[..=order], order + 1, &mut nextstate);
        (logprob != ABSENT_LOGPROB).then_some((logprob, nextstate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::arpa::ArpaOptions;

    // <s>=1, </s>=2, A=5, B=6.
    const ARPA: &str = "\
\\data\\
ngram 1=4
ngram 2=2

\\1-grams:
-0.5 1 -0.4
-1.5 2
-1.0 5 -0.5
-2.0 6

\\2-grams:
-0.2 1 5
-0.3 5 6

\\end\\
";

    fn lm() -> NgramLm {
        NgramLm::from_reader(ARPA.as_bytes(), 16, ArpaOptions::default()).unwrap()
    }

    #[test]
    fn test_start_is_bos_history() {
        let lm = lm();
        let fst = NgramLmFst::new(&lm);
        let (words, order) = lm.word_ids_by_state(fst.start());
        assert_eq!(order, 1);
        assert_eq!(words, &[1]);
    }

    #[test]
    fn test_arc_weight_is_negated_logprob() {
        let lm = lm();
        let fst = NgramLmFst::new(&lm);
        // From <s>, consuming A hits the bigram "<s> A".
        let arc = fst.get_arc(fst.start(), 5).expect("bigram exists");
        assert!((arc.weight - 0.2).abs() < 1e-6);
        assert_eq!(arc.olabel, 5);

        // The destination history then scores "A B" directly.
        let arc = fst.get_arc(arc.nextstate, 6).expect("bigram exists");
        assert!((arc.weight - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_backoff_arc_from_unseen_extension() {
        let lm = lm();
        let fst = NgramLmFst::new(&lm);
        // "<s> B" is not stored: backoff(<s>) + logprob(B) = -0.4 + -2.0.
        let arc = fst.get_arc(fst.start(), 6).expect("backoff still scores");
        assert!((arc.weight - 2.4).abs() < 1e-6);
    }

    #[test]
    fn test_final_weight_uses_eos() {
        let lm = lm();
        let fst = NgramLmFst::new(&lm);
        let a_state = lm.state_index(&[5], 1).unwrap();
        // From history "A": no bigram "A </s>", so backoff(A) + logprob(</s>).
        let weight = fst.final_weight(a_state);
        assert!((weight - (0.5 + 1.5)).abs() < 1e-6);
    }

    #[test]
    fn test_absent_entry_yields_no_arc() {
        let lm = lm();
        let fst = NgramLmFst::new(&lm);
        // Word 9 has no unigram and unk (3) has none either.
        assert!(fst.get_arc(fst.start(), 9).is_none());
    }

    #[test]
    fn test_nextstate_matches_reco_roundtrip() {
        let lm = lm();
        let fst = NgramLmFst::new(&lm);
        let arc = fst.get_arc(fst.start(), 5).unwrap();
        let entry = lm.state_index(&[5, 1], 2).unwrap();
        assert_eq!(arc.nextstate, lm.reco_state_id(entry));
    }
}
