//! Flattened WFST recognition graph.
//!
//! The decoder consumes the graph as flat arrays in a CSR-like layout, the form
//! a graph loader hands over after construction, determinization and
//! composition (all external to this crate). Arcs are stored with every
//! emitting arc of the graph first, followed by every non-emitting
//! (`ilabel == 0`) arc; `e_offsets` and `ne_offsets` are per-state ranges into
//! that shared arc array. States are numbered densely from 0.

use crate::error::{Error, Result};

/// A single arc before flattening, used by [`DecodeGraph::from_arcs`].
#[derive(Debug, Clone, Copy)]
pub struct GraphArc {
    /// Input label; 0 marks a non-emitting (epsilon) arc, positive values
    /// index the acoustic log-likelihood vector.
    pub ilabel: i32,
    /// Output label (word id), 0 for none.
    pub olabel: i32,
    /// Graph cost of traversing the arc (language model, transitions).
    pub weight: f32,
    /// Destination state.
    pub nextstate: u32,
}

/// A WFST flattened into the arrays the decoding kernel reads.
#[derive(Debug, Clone)]
pub struct DecodeGraph {
    num_states: u32,
    start: u32,
    /// Per-state start of emitting arcs; length `num_states + 1`.
    e_offsets: Vec<u32>,
    /// Per-state start of non-emitting arcs; length `num_states + 1`.
    /// Indexes the same arc arrays, after all emitting arcs.
    ne_offsets: Vec<u32>,
    arc_ilabels: Vec<i32>,
    arc_olabels: Vec<i32>,
    arc_weights: Vec<f32>,
    arc_nextstates: Vec<u32>,
    /// Final cost per state; `f32::INFINITY` for non-final states.
    final_costs: Vec<f32>,
    num_pdfs: usize,
}

impl DecodeGraph {
    /// Assemble a graph from pre-flattened arrays.
    ///
    /// The arrays must satisfy the layout contract: monotone offsets, emitting
    /// arcs in `[0, e_count)`, non-emitting arcs in `[e_count, arc_count)`,
    /// destination states in range.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        start: u32,
        e_offsets: Vec<u32>,
        ne_offsets: Vec<u32>,
        arc_ilabels: Vec<i32>,
        arc_olabels: Vec<i32>,
        arc_weights: Vec<f32>,
        arc_nextstates: Vec<u32>,
        final_costs: Vec<f32>,
    ) -> Result<Self> {
        if e_offsets.len() != ne_offsets.len() || e_offsets.is_empty() {
            return Err(Error::Configuration(
                "offset arrays must both have num_states + 1 entries".to_string(),
            ));
        }
        let num_states = (e_offsets.len() - 1) as u32;
        if final_costs.len() != num_states as usize {
            return Err(Error::Configuration(
                "final cost array must have one entry per state".to_string(),
            ));
        }
        if start >= num_states {
            return Err(Error::Configuration(format!(
                "start state {} out of range for {} states",
                start, num_states
            )));
        }
        let arc_count = arc_ilabels.len();
        if arc_olabels.len() != arc_count
            || arc_weights.len() != arc_count
            || arc_nextstates.len() != arc_count
        {
            return Err(Error::Configuration(
                "arc arrays must all have the same length".to_string(),
            ));
        }
        for offsets in [&e_offsets, &ne_offsets] {
            for w in offsets.windows(2) {
                if w[0] > w[1] {
                    return Err(Error::Configuration(
                        "offset arrays must be monotone".to_string(),
                    ));
                }
            }
            if *offsets.last().unwrap_or(&0) as usize > arc_count {
                return Err(Error::Configuration(
                    "offsets exceed the arc array length".to_string(),
                ));
            }
        }
        if arc_nextstates.iter().any(|&s| s >= num_states) {
            return Err(Error::Configuration(
                "arc destination state out of range".to_string(),
            ));
        }

        let num_pdfs = arc_ilabels
            .iter()
            .copied()
            .max()
            .map(|m| (m.max(0) as usize) + 1)
            .unwrap_or(1);

        Ok(Self {
            num_states,
            start,
            e_offsets,
            ne_offsets,
            arc_ilabels,
            arc_olabels,
            arc_weights,
            arc_nextstates,
            final_costs,
            num_pdfs,
        })
    }

    /// Flatten an arc list into decoding form.
    ///
    /// `arcs` pairs each arc with its source state. Emitting and non-emitting
    /// arcs may be interleaved; this sorts them into the layout the kernel
    /// expects. Mainly used by graph loaders and tests.
    pub fn from_arcs(
        num_states: u32,
        start: u32,
        arcs: &[(u32, GraphArc)],
        final_costs: Vec<f32>,
    ) -> Result<Self> {
        if arcs.iter().any(|&(s, _)| s >= num_states) {
            return Err(Error::Configuration(
                "arc source state out of range".to_string(),
            ));
        }

        let n = num_states as usize;
        let mut e_offsets = vec![0u32; n + 1];
        let mut ne_offsets = vec![0u32; n + 1];
        let mut arc_ilabels = Vec::with_capacity(arcs.len());
        let mut arc_olabels = Vec::with_capacity(arcs.len());
        let mut arc_weights = Vec::with_capacity(arcs.len());
        let mut arc_nextstates = Vec::with_capacity(arcs.len());

        for emitting in [true, false] {
            let offsets = if emitting {
                &mut e_offsets
            } else {
                &mut ne_offsets
            };
            for state in 0..num_states {
                offsets[state as usize] = arc_ilabels.len() as u32;
                for &(src, arc) in arcs {
                    if src == state && (arc.ilabel != 0) == emitting {
                        arc_ilabels.push(arc.ilabel);
                        arc_olabels.push(arc.olabel);
                        arc_weights.push(arc.weight);
                        arc_nextstates.push(arc.nextstate);
                    }
                }
            }
            offsets[n] = arc_ilabels.len() as u32;
        }

        Self::from_parts(
            start,
            e_offsets,
            ne_offsets,
            arc_ilabels,
            arc_olabels,
            arc_weights,
            arc_nextstates,
            final_costs,
        )
    }

    /// Total number of states.
    pub fn num_states(&self) -> u32 {
        self.num_states
    }

    /// Total number of arcs, emitting and non-emitting.
    pub fn num_arcs(&self) -> usize {
        self.arc_ilabels.len()
    }

    /// The start state.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// One past the largest emitting input label; sizes the per-frame
    /// log-likelihood vectors.
    pub fn num_pdfs(&self) -> usize {
        self.num_pdfs
    }

    /// Range of emitting arc indices out of `state`.
    #[inline]
    pub fn emitting_arcs(&self, state: u32) -> std::ops::Range<u32> {
        self.e_offsets[state as usize]..self.e_offsets[state as usize + 1]
    }

    /// Range of non-emitting arc indices out of `state`.
    #[inline]
    pub fn nonemitting_arcs(&self, state: u32) -> std::ops::Range<u32> {
        self.ne_offsets[state as usize]..self.ne_offsets[state as usize + 1]
    }

    /// Number of emitting arcs out of `state`.
    #[inline]
    pub fn emitting_degree(&self, state: u32) -> u32 {
        self.e_offsets[state as usize + 1] - self.e_offsets[state as usize]
    }

    #[inline]
    pub fn arc_ilabel(&self, arc: u32) -> i32 {
        self.arc_ilabels[arc as usize]
    }

    #[inline]
    pub fn arc_olabel(&self, arc: u32) -> i32 {
        self.arc_olabels[arc as usize]
    }

    #[inline]
    pub fn arc_weight(&self, arc: u32) -> f32 {
        self.arc_weights[arc as usize]
    }

    #[inline]
    pub fn arc_nextstate(&self, arc: u32) -> u32 {
        self.arc_nextstates[arc as usize]
    }

    /// Final cost of `state`; infinite when the state is not final.
    #[inline]
    pub fn final_cost(&self, state: u32) -> f32 {
        self.final_costs[state as usize]
    }

    /// Whether `state` has a finite final weight.
    #[inline]
    pub fn is_final(&self, state: u32) -> bool {
        self.final_costs[state as usize].is_finite()
    }
}
