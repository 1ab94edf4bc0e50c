//! Token-passing kernel.
//!
//! [`DecoderCore`] holds every structure the grid touches: the token arena,
//! the per-state lookup table, the dual TokenState vectors, the shared
//! lattice-arc buffer (aliased with the pruner's before-pruning backing), the
//! per-arc token scratch and the double-buffered likelihood vectors.
//!
//! `process_tokens` runs one frame as a grid of cooperating worker threads
//! separated by barriers: emitting expansion over a degree-scanned arc job
//! list (dynamic distribution through an atomic index, independent of
//! per-state fan-out skew), a non-emitting closure iterated until a shared
//! `modified` flag stays clear, then the pack-indexed store pass that makes
//! every TokenState agree with its atomic recombination cell.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::DecoderConfig;
use crate::constants::decoding::{EXPAND_CHUNK, INIT_PACK_IDX};
use crate::decoder::arena::TokenArena;
use crate::decoder::lookup::{cost_to_ordered, ordered_to_cost, TokenLookup};
use crate::decoder::merge_vec::{DeviceVector, TokenMergeVector, TokenScratch};
use crate::decoder::pruner::LatticePruner;
use crate::decoder::types::{LatLink, Token, TokenState};
use crate::graph::DecodeGraph;

/// TokenState entries a worker claims per atomic increment in the
/// non-emitting closure.
const NE_CHUNK: u32 = 16;

/// One frame's worth of acoustic log-likelihoods in unified memory.
///
/// The likelihood stream writes it, the compute stream reads it; the driver's
/// event discipline keeps the two apart.
pub(crate) struct LikelihoodBuffer {
    ptr: NonNull<f32>,
    len: usize,
}

// Safety: single writer (likelihood stream) and readers (grid) are separated
// by event ordering; see the driver's per-frame sequence.
unsafe impl Send for LikelihoodBuffer {}
unsafe impl Sync for LikelihoodBuffer {}

impl LikelihoodBuffer {
    fn new(len: usize) -> Self {
        let boxed: Box<[f32]> = vec![0.0; len].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(boxed) as *mut f32).expect("likelihood allocation");
        Self { ptr, len }
    }

    /// Copy a host frame in. Caller guarantees no concurrent reader.
    pub fn upload(&self, frame: &[f32]) {
        assert!(frame.len() >= self.len, "likelihood frame too narrow");
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr(), self.ptr.as_ptr(), self.len);
        }
    }

    #[inline]
    fn get(&self, pdf: usize) -> f32 {
        debug_assert!(pdf < self.len);
        unsafe { *self.ptr.as_ptr().add(pdf) }
    }
}

impl Drop for LikelihoodBuffer {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

/// All state shared between the host driver and the grid.
pub(crate) struct DecoderCore {
    graph: Arc<DecodeGraph>,
    beam: f32,
    grid_threads: usize,

    pub arena: TokenArena,
    lookup: TokenLookup,
    /// Dual TokenState vectors; frame `f` lives in `toks[f % 2]`.
    toks: [TokenMergeVector; 2],
    /// Before-pruning lattice-arc buffer, shared with the pruner.
    pub arcs: DeviceVector<LatLink>,
    scratch: TokenScratch,
    /// Double-buffered likelihoods; acoustic frame `a` lives in `ll[a % 2]`.
    pub ll: [LikelihoodBuffer; 2],

    /// Frame cutoff as order-preserving cost bits.
    cutoff: AtomicU32,
    /// Set by any successful non-emitting install; cleared per closure pass.
    modified: AtomicBool,
    /// Dynamic work indices for emitting / non-emitting distribution.
    pe_idx: AtomicU32,
    ne_idx: AtomicU32,
    ne_snapshot: AtomicU32,
    /// Cost (ordered bits) at which each entry last ran its non-emitting
    /// expansion; an entry re-expands only after a strict improvement, so
    /// closure passes neither redo work nor emit duplicate lattice arcs.
    ne_expanded: Box<[AtomicU32]>,
    /// Prefix sums of emitting degrees over the previous frame's entries.
    degree_scan: Mutex<Vec<u32>>,

    pub pruner: LatticePruner,
}

impl DecoderCore {
    pub fn new(graph: Arc<DecodeGraph>, config: &DecoderConfig) -> Self {
        let num_pdfs = graph.num_pdfs();
        let num_arcs = graph.num_arcs() as u32;
        Self {
            beam: config.beam,
            grid_threads: config.grid_threads(),
            arena: TokenArena::new(config.max_tokens),
            lookup: TokenLookup::new(graph.num_states()),
            toks: [
                TokenMergeVector::new(config.max_tokens_per_frame),
                TokenMergeVector::new(config.max_tokens_per_frame),
            ],
            arcs: DeviceVector::new(config.max_arcs, LatLink::new(0, 0, 0, 0, 0, 0, 0.0, 0.0)),
            scratch: TokenScratch::new(num_arcs),
            ll: [
                LikelihoodBuffer::new(num_pdfs),
                LikelihoodBuffer::new(num_pdfs),
            ],
            cutoff: AtomicU32::new(cost_to_ordered(f32::INFINITY)),
            modified: AtomicBool::new(false),
            pe_idx: AtomicU32::new(0),
            ne_idx: AtomicU32::new(0),
            ne_snapshot: AtomicU32::new(0),
            ne_expanded: (0..config.max_tokens_per_frame)
                .map(|_| AtomicU32::new(u32::MAX))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            degree_scan: Mutex::new(Vec::new()),
            pruner: LatticePruner::new(
                config.max_tokens,
                config.prune_interval,
                config.lattice_beam,
                config.lat_threads(),
            ),
            graph,
        }
    }

    pub fn graph(&self) -> &DecodeGraph {
        &self.graph
    }

    /// TokenState vector of `frame`.
    pub fn frame_toks(&self, frame: u32) -> &TokenMergeVector {
        &self.toks[frame as usize % 2]
    }

    /// Number of tokens admitted at `frame`.
    pub fn active_count(&self, frame: u32) -> u32 {
        self.frame_toks(frame).size()
    }

    #[inline]
    fn load_cutoff(&self) -> f32 {
        ordered_to_cost(self.cutoff.load(Ordering::Acquire))
    }

    #[inline]
    fn store_cutoff(&self, cutoff: f32) {
        self.cutoff
            .store(cost_to_ordered(cutoff), Ordering::Release);
    }

    #[inline]
    fn tighten_cutoff(&self, cutoff: f32) {
        self.cutoff
            .fetch_min(cost_to_ordered(cutoff), Ordering::AcqRel);
    }

    /// Start a fresh utterance: rewind arenas and buffers and seed the
    /// initial token on the start state. Follow with
    /// [`DecoderCore::process_nonemitting`] to close frame 0.
    pub fn init_decoding(&self) {
        self.lookup.reset_all();
        self.arena.reset();
        self.toks[0].clear();
        self.toks[1].clear();
        self.arcs.clear();
        self.pruner.reset();

        let start = self.graph.start();
        let elem = self.lookup.elem(start);
        elem.force_install(0.0, INIT_PACK_IDX);
        let activated = elem.try_activate();
        debug_assert!(activated);
        // The initial token has no originating arc; materialize it directly.
        unsafe {
            self.arena.write(
                0,
                Token {
                    cost: 0.0,
                    frame: 0,
                    extra_cost: 0.0,
                    state: start,
                },
            );
        }
        let idx = self.toks[0].push_back(
            TokenState {
                token_idx: 0,
                state: start,
                cost: 0.0,
            },
            elem.pack_ptr(),
        );
        elem.set_tokenstate_idx(idx);
        self.store_cutoff(self.beam);
    }

    /// Epsilon closure of the initial token; only called at frame 0.
    pub fn process_nonemitting(&self) {
        self.degree_scan.lock().clear();
        self.run_grid(0, &self.toks[1], &self.toks[0], 0, &self.ll[0], 0);
        self.arena.advance_front(self.toks[0].size());
        self.arena.prefetch_next_to_device_default();
    }

    /// Expand one acoustic frame: tokens of `frame - 1` through emitting arcs
    /// (consuming acoustic frame `frame - 1`), then the epsilon closure.
    pub fn process_tokens(&self, frame: u32) {
        debug_assert!(frame >= 1);
        let prev = self.frame_toks(frame + 1); // (frame - 1) % 2
        let cur = self.frame_toks(frame);
        cur.clear();

        // Retire the previous frame's lookup entries.
        let prev_count = prev.size();
        for i in 0..prev_count {
            self.lookup.elem(prev.get(i).state).reset();
        }

        // Cutoff estimation over the active set.
        let mut best = f32::INFINITY;
        for i in 0..prev_count {
            best = best.min(prev.get(i).cost);
        }
        self.store_cutoff(best + self.beam);

        // Degree scan: flatten (token, emitting arc) pairs into one job range.
        let total_jobs = {
            let mut scan = self.degree_scan.lock();
            scan.clear();
            scan.push(0);
            let mut acc = 0u32;
            for i in 0..prev_count {
                acc += self.graph.emitting_degree(prev.get(i).state);
                scan.push(acc);
            }
            acc
        };

        let frame_start = self.arena.front();
        let ll = &self.ll[(frame as usize + 1) % 2]; // acoustic frame - 1
        self.run_grid(frame, prev, cur, total_jobs, ll, frame_start);

        let admitted = cur.size();
        self.arena.advance_front(admitted);
        self.arena.prefetch_next_to_device_default();
        debug_assert!(admitted <= self.arena.capacity());
        debug!(
            frame,
            active = admitted,
            cutoff = self.load_cutoff(),
            "frame expanded"
        );
    }

    /// Record `frame`'s token range and arc watermark with the pruner.
    pub fn collect_frame(&self, frame: u32) {
        let count = self.active_count(frame);
        let start = self.arena.front() - count;
        self.pruner
            .collect_frame(frame, start, count, self.arcs.size());
        self.arena.prefetch_allocated_to_host();
    }

    /// Periodic backward pruning over the window ending `prune_interval`
    /// frames ago.
    pub fn prune_active_tokens(&self, frame: u32) {
        self.pruner.prune_window(frame, &self.arena, &self.arcs);
    }

    fn run_grid(
        &self,
        frame: u32,
        prev: &TokenMergeVector,
        cur: &TokenMergeVector,
        total_jobs: u32,
        ll: &LikelihoodBuffer,
        frame_start: u32,
    ) {
        self.pe_idx.store(0, Ordering::Release);
        self.modified.store(false, Ordering::Release);
        let scan_guard = self.degree_scan.lock();
        let scan: &[u32] = &scan_guard;
        let barrier = Barrier::new(self.grid_threads);

        std::thread::scope(|scope| {
            for tid in 0..self.grid_threads {
                let barrier = &barrier;
                scope.spawn(move || {
                    self.grid_worker(tid, frame, prev, cur, scan, total_jobs, ll, frame_start, barrier);
                });
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn grid_worker(
        &self,
        tid: usize,
        frame: u32,
        prev: &TokenMergeVector,
        cur: &TokenMergeVector,
        scan: &[u32],
        total_jobs: u32,
        ll: &LikelihoodBuffer,
        frame_start: u32,
        barrier: &Barrier,
    ) {
        // Phase 0: clear the scratch and expansion markers, split statically.
        let num_arcs = self.scratch.capacity();
        let per = num_arcs.div_ceil(self.grid_threads as u32).max(1);
        let clear_start = (tid as u32 * per).min(num_arcs);
        let clear_end = (clear_start + per).min(num_arcs);
        self.scratch.clear_updated(clear_start..clear_end);
        let n_markers = self.ne_expanded.len() as u32;
        let per = n_markers.div_ceil(self.grid_threads as u32).max(1);
        let marker_start = (tid as u32 * per).min(n_markers);
        let marker_end = (marker_start + per).min(n_markers);
        for i in marker_start..marker_end {
            self.ne_expanded[i as usize].store(u32::MAX, Ordering::Relaxed);
        }
        barrier.wait();

        // Phase 1: emitting expansion over the flattened arc jobs.
        loop {
            let j0 = self.pe_idx.fetch_add(EXPAND_CHUNK, Ordering::AcqRel);
            if j0 >= total_jobs {
                break;
            }
            for job in j0..(j0 + EXPAND_CHUNK).min(total_jobs) {
                let entry = scan.partition_point(|&s| s <= job) - 1;
                let ts = prev.get(entry as u32);
                let arc = self.graph.emitting_arcs(ts.state).start + (job - scan[entry]);
                self.expand_arc(frame, true, entry as u32, ts.cost, arc, ll, cur);
            }
        }
        barrier.wait();

        // Phase 2: non-emitting closure to fixpoint.
        loop {
            barrier.wait();
            if tid == 0 {
                self.modified.store(false, Ordering::Release);
                self.ne_idx.store(0, Ordering::Release);
                self.ne_snapshot.store(cur.size(), Ordering::Release);
            }
            barrier.wait();
            let snapshot = self.ne_snapshot.load(Ordering::Acquire);
            loop {
                let i0 = self.ne_idx.fetch_add(NE_CHUNK, Ordering::AcqRel);
                if i0 >= snapshot {
                    break;
                }
                for i in i0..(i0 + NE_CHUNK).min(snapshot) {
                    let ts = cur.get(i);
                    // The pack cell holds the current best cost into the
                    // state, which may be fresher than the entry copy.
                    let src_cost = self.lookup.elem(ts.state).best_cost();
                    // Re-expand only on strict improvement since the entry's
                    // last expansion.
                    let bits = cost_to_ordered(src_cost);
                    let last = self.ne_expanded[i as usize].fetch_min(bits, Ordering::AcqRel);
                    if last <= bits {
                        continue;
                    }
                    let range = self.graph.nonemitting_arcs(ts.state);
                    for arc in range {
                        self.expand_arc(frame, false, i, src_cost, arc, ll, cur);
                    }
                }
            }
            barrier.wait();
            if !self.modified.load(Ordering::Acquire) {
                break;
            }
        }

        // Phase 3: pack-indexed store; align entries with their atomic
        // winners and materialize tokens into the arena.
        let count = cur.size();
        let per = count.div_ceil(self.grid_threads as u32).max(1);
        let store_start = (tid as u32 * per).min(count);
        let store_end = (store_start + per).min(count);
        cur.store_by_pack_index(store_start..store_end, &self.scratch, &self.arena, frame_start);
        barrier.wait();
    }

    /// Expand a single arc out of an active token; the shared-state side of
    /// stages 2, 3 and 5 of the frame pipeline.
    #[allow(clippy::too_many_arguments)]
    fn expand_arc(
        &self,
        frame: u32,
        emitting: bool,
        src_entry: u32,
        src_cost: f32,
        arc: u32,
        ll: &LikelihoodBuffer,
        cur: &TokenMergeVector,
    ) {
        let graph = &self.graph;
        let dest = graph.arc_nextstate(arc);
        let acoustic_cost = if emitting {
            -ll.get(graph.arc_ilabel(arc) as usize)
        } else {
            0.0
        };
        let new_cost = src_cost + graph.arc_weight(arc) + acoustic_cost;
        if !(new_cost < self.load_cutoff()) {
            return;
        }
        self.tighten_cutoff(new_cost + self.beam);

        let elem = self.lookup.elem(dest);
        if elem.try_install(new_cost, arc) {
            self.scratch.write(
                arc,
                Token {
                    cost: new_cost,
                    frame: frame as i32,
                    extra_cost: 0.0,
                    state: dest,
                },
            );
            if elem.try_activate() {
                let idx = cur.push_back(
                    TokenState {
                        token_idx: 0,
                        state: dest,
                        cost: new_cost,
                    },
                    elem.pack_ptr(),
                );
                elem.set_tokenstate_idx(idx);
            }
            if !emitting {
                self.modified.store(true, Ordering::Release);
            }
        }

        // Every admitted candidate becomes a lattice arc; losers carry their
        // slack into the pruner's extra-cost pass.
        let dest_idx = elem.tokenstate_idx();
        let prev_frame = if emitting { frame - 1 } else { frame };
        self.arcs.push_back(LatLink::new(
            prev_frame,
            src_entry,
            frame,
            dest_idx,
            graph.arc_ilabel(arc),
            graph.arc_olabel(arc),
            graph.arc_weight(arc),
            acoustic_cost,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphArc;

    fn core_with(graph: DecodeGraph, beam: f32) -> DecoderCore {
        let config = DecoderConfig {
            beam,
            lattice_beam: 10.0,
            max_tokens_per_frame: 64,
            max_lat_arc_per_frame: 64,
            max_tokens: 1024,
            max_arcs: 1024,
            prune_interval: 100,
            ..DecoderConfig::default()
        };
        DecoderCore::new(Arc::new(graph), &config)
    }

    fn upload_zeros(core: &DecoderCore, buffer: usize) {
        let zeros = vec![0.0f32; core.graph().num_pdfs()];
        core.ll[buffer].upload(&zeros);
    }

    #[test]
    fn test_init_runs_epsilon_closure() {
        // start -> eps -> state 1
        let graph = DecodeGraph::from_arcs(
            2,
            0,
            &[(
                0,
                GraphArc {
                    ilabel: 0,
                    olabel: 0,
                    weight: 0.5,
                    nextstate: 1,
                },
            )],
            vec![f32::INFINITY, 0.0],
        )
        .unwrap();
        let core = core_with(graph, 16.0);
        core.init_decoding();
        core.process_nonemitting();

        assert_eq!(core.active_count(0), 2);
        let entry = core.frame_toks(0).get(1);
        assert_eq!(entry.state, 1);
        assert!((entry.cost - 0.5).abs() < 1e-6);
        // One lattice arc for the epsilon expansion.
        assert_eq!(core.arcs.size(), 1);
        assert_eq!(core.arena.front(), 2);
    }

    #[test]
    fn test_recombination_keeps_single_tokenstate() {
        // Two emitting arcs from state 0 into state 1 with weights 1.0, 2.0.
        let graph = DecodeGraph::from_arcs(
            2,
            0,
            &[
                (
                    0,
                    GraphArc {
                        ilabel: 1,
                        olabel: 1,
                        weight: 1.0,
                        nextstate: 1,
                    },
                ),
                (
                    0,
                    GraphArc {
                        ilabel: 2,
                        olabel: 2,
                        weight: 2.0,
                        nextstate: 1,
                    },
                ),
            ],
            vec![f32::INFINITY, 0.0],
        )
        .unwrap();
        let core = core_with(graph, 16.0);
        core.init_decoding();
        core.process_nonemitting();
        upload_zeros(&core, 0);
        core.process_tokens(1);

        // Exactly one TokenState for state 1, at the cheaper cost.
        assert_eq!(core.active_count(1), 1);
        let entry = core.frame_toks(1).get(0);
        assert_eq!(entry.state, 1);
        assert!((entry.cost - 1.0).abs() < 1e-6);
        let token = unsafe { core.arena.read(entry.token_idx) };
        assert!((token.cost - 1.0).abs() < 1e-6);
        assert_eq!(token.state, 1);

        // Both candidates were admitted into the lattice buffer.
        assert_eq!(core.arcs.size(), 2);
    }

    #[test]
    fn test_beam_blocks_expensive_branch() {
        // Parallel self-loops: weight 0 and weight 100.
        let arcs = [
            (
                0,
                GraphArc {
                    ilabel: 1,
                    olabel: 0,
                    weight: 0.0,
                    nextstate: 0,
                },
            ),
            (
                0,
                GraphArc {
                    ilabel: 2,
                    olabel: 0,
                    weight: 100.0,
                    nextstate: 1,
                },
            ),
        ];
        let graph = DecodeGraph::from_arcs(2, 0, &arcs, vec![0.0, 0.0]).unwrap();

        let core = core_with(graph.clone(), 5.0);
        core.init_decoding();
        core.process_nonemitting();
        upload_zeros(&core, 0);
        core.process_tokens(1);
        // The 100-cost branch is never admitted under beam 5.
        assert_eq!(core.active_count(1), 1);
        assert_eq!(core.frame_toks(1).get(0).state, 0);

        let wide = core_with(graph, 200.0);
        wide.init_decoding();
        wide.process_nonemitting();
        upload_zeros(&wide, 0);
        wide.process_tokens(1);
        assert_eq!(wide.active_count(1), 2);
    }

    #[test]
    fn test_active_costs_within_cutoff() {
        // Branching graph with several weights; all active tokens must sit
        // within best + beam after each frame.
        let beam = 3.0;
        let graph = DecodeGraph::from_arcs(
            3,
            0,
            &[
                (
                    0,
                    GraphArc {
                        ilabel: 1,
                        olabel: 0,
                        weight: 0.0,
                        nextstate: 0,
                    },
                ),
                (
                    0,
                    GraphArc {
                        ilabel: 2,
                        olabel: 0,
                        weight: 2.0,
                        nextstate: 1,
                    },
                ),
                (
                    0,
                    GraphArc {
                        ilabel: 3,
                        olabel: 0,
                        weight: 2.5,
                        nextstate: 2,
                    },
                ),
                (
                    1,
                    GraphArc {
                        ilabel: 1,
                        olabel: 0,
                        weight: 1.0,
                        nextstate: 0,
                    },
                ),
                (
                    2,
                    GraphArc {
                        ilabel: 2,
                        olabel: 0,
                        weight: 0.5,
                        nextstate: 2,
                    },
                ),
            ],
            vec![0.0, 0.0, 0.0],
        )
        .unwrap();
        let core = core_with(graph, beam);
        core.init_decoding();
        core.process_nonemitting();
        for frame in 1..=6u32 {
            upload_zeros(&core, (frame as usize + 1) % 2);
            core.process_tokens(frame);
            let toks = core.frame_toks(frame);
            let count = toks.size();
            assert!(count > 0);
            let best = (0..count)
                .map(|i| toks.get(i).cost)
                .fold(f32::INFINITY, f32::min);
            for i in 0..count {
                assert!(toks.get(i).cost <= best + beam + 1e-5);
            }
            // Recombination is complete: states are unique within the frame.
            let mut states: Vec<u32> = (0..count).map(|i| toks.get(i).state).collect();
            states.sort_unstable();
            states.dedup();
            assert_eq!(states.len(), count as usize);
        }
    }
}
