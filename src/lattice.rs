//! Raw lattice output.
//!
//! [`RawLattice`] carries the five handles the decoder hands to its sink:
//! the frame-ordered token buffer, per-frame token start indices, the
//! frame-ordered pruned arc buffer, per-frame arc counts, and the final
//! frame's TokenState vector. Consumers reconstruct the lattice as a DAG over
//! `(frame, index)` nodes; [`RawLattice::best_path`] walks the cheapest
//! complete path for convenience and tests.

use crate::decoder::types::{unpack_tok_ref, LatLink, Token, TokenState};

/// The cheapest complete path through a lattice.
#[derive(Debug, Clone)]
pub struct BestPath {
    /// Output labels along the path, zeros (epsilons) removed.
    pub words: Vec<i32>,
    /// Input labels along the path, zeros removed.
    pub ilabels: Vec<i32>,
    /// Total path cost, including the final weight when a final state was
    /// reached.
    pub cost: f32,
}

/// Pruned lattice handed over by [`crate::decoder::LatticeDecoder::finalize`].
#[derive(Debug, Clone)]
pub struct RawLattice {
    /// All tokens, frame-ordered; `extra_cost` populated by the pruner.
    pub toks_buf: Vec<Token>,
    /// Start index of each frame's tokens in `toks_buf`; one extra entry
    /// holds the total.
    pub toks_fr_sidx: Vec<u32>,
    /// Surviving arcs, frame-ordered after pruning.
    pub arcs_buf: Vec<LatLink>,
    /// Number of surviving arcs per frame.
    pub arcs_fr_size: Vec<u32>,
    /// TokenState vector of the final frame.
    pub final_toks: Vec<TokenState>,
    /// Whether any final-frame token sat on a state with finite final weight.
    pub reached_final: bool,
    /// `(frame, index)` of the best complete token, final weight included
    /// when one was reachable.
    pub best_token: (u32, u32),
    /// Cost of the best complete path (with final weight when reached).
    pub best_cost: f32,
    /// Caller requested lattice determinization downstream.
    pub determinize: bool,
}

impl RawLattice {
    /// Number of decoded frames, counting frame 0.
    pub fn num_frames(&self) -> usize {
        self.arcs_fr_size.len()
    }

    /// Resolve a `(frame, index)` token reference.
    pub fn token(&self, frame: u32, idx: u32) -> &Token {
        &self.toks_buf[(self.toks_fr_sidx[frame as usize] + idx) as usize]
    }

    /// The pruned arcs whose destination token lives at `frame`.
    pub fn arcs_at(&self, frame: u32) -> &[LatLink] {
        let start: u32 = self.arcs_fr_size[..frame as usize].iter().sum();
        let len = self.arcs_fr_size[frame as usize];
        &self.arcs_buf[start as usize..(start + len) as usize]
    }

    /// Total surviving arcs.
    pub fn num_arcs(&self) -> usize {
        self.arcs_buf.len()
    }

    /// Backtrack the cheapest complete path from the best final token.
    ///
    /// Returns `None` only when the lattice is empty. When no final state was
    /// reached the path ends at the cheapest last-frame token instead.
    pub fn best_path(&self) -> Option<BestPath> {
        if self.toks_buf.is_empty() {
            return None;
        }
        let (mut frame, mut idx) = self.best_token;
        let mut words = Vec::new();
        let mut ilabels = Vec::new();

        // Bounded by the token count: each step moves to a strictly earlier
        // position in (frame, creation order).
        let mut steps = self.toks_buf.len() + 1;
        while steps > 0 {
            steps -= 1;
            let here = self.token(frame, idx);
            let residual = |l: &LatLink| {
                let (pf, pi) = unpack_tok_ref(l.prev_tok);
                let prev = self.token(pf, pi);
                (prev.cost + l.graph_cost + l.acoustic_cost - here.cost).abs()
            };
            let incoming = self
                .arcs_at(frame)
                .iter()
                .copied()
                .filter(|link| unpack_tok_ref(link.next_tok) == (frame, idx))
                .min_by(|a, b| residual(a).total_cmp(&residual(b)));
            let Some(link) = incoming else {
                break; // the initial token
            };
            if link.olabel != 0 {
                words.push(link.olabel);
            }
            if link.ilabel != 0 {
                ilabels.push(link.ilabel);
            }
            let (pf, pi) = unpack_tok_ref(link.prev_tok);
            frame = pf;
            idx = pi;
        }

        words.reverse();
        ilabels.reverse();
        Some(BestPath {
            words,
            ilabels,
            cost: self.best_cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two frames, one token each, one emitting arc between them.
    fn tiny_lattice() -> RawLattice {
        let toks = vec![
            Token {
                cost: 0.0,
                frame: 0,
                extra_cost: 0.0,
                state: 0,
            },
            Token {
                cost: 1.5,
                frame: 1,
                extra_cost: 0.0,
                state: 0,
            },
        ];
        let arcs = vec![LatLink::new(0, 0, 1, 0, 3, 7, 1.5, 0.0)];
        RawLattice {
            toks_buf: toks,
            toks_fr_sidx: vec![0, 1, 2],
            arcs_buf: arcs,
            arcs_fr_size: vec![0, 1],
            final_toks: Vec::new(),
            reached_final: true,
            best_token: (1, 0),
            best_cost: 1.5,
            determinize: false,
        }
    }

    #[test]
    fn test_token_resolution() {
        let lat = tiny_lattice();
        assert_eq!(lat.num_frames(), 2);
        assert_eq!(lat.token(1, 0).cost, 1.5);
        assert_eq!(lat.arcs_at(0).len(), 0);
        assert_eq!(lat.arcs_at(1).len(), 1);
    }

    #[test]
    fn test_best_path_backtracks_labels() {
        let lat = tiny_lattice();
        let path = lat.best_path().expect("nonempty lattice");
        assert_eq!(path.words, vec![7]);
        assert_eq!(path.ilabels, vec![3]);
        assert_eq!(path.cost, 1.5);
    }
}
