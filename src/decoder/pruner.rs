//! Lattice pruner.
//!
//! Works back-to-front over a sliding window of frames. Every frame, the
//! kernel hands over the frame's token count and the arc buffer watermark
//! ([`LatticePruner::collect_frame`]); every `prune_interval` frames the
//! backward pass ([`LatticePruner::prune_window`]) computes per-token extra
//! cost (slack over the best path), drops arcs outside the lattice beam, and
//! moves settled frames into the host-side after-pruning buffers.
//!
//! Arcs are grouped under the frame of their destination token, so an
//! emitting arc `f-1 -> f` and a non-emitting arc `f -> f` both live in frame
//! `f`'s slice of the shared before-pruning arc buffer.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::decoder::arena::TokenArena;
use crate::decoder::merge_vec::DeviceVector;
use crate::decoder::types::{unpack_tok_ref, LatLink};

/// Arc ranges below this size are relaxed on the calling thread.
const PARALLEL_ARC_THRESHOLD: usize = 4096;

pub(crate) struct LatticePruner {
    prune_interval: u32,
    lattice_beam: f32,
    lat_threads: usize,
    /// Per-token slack over the best path, as nonnegative f32 bits so the
    /// relaxation can use atomic min. Indexed by global arena token index.
    extra: Box<[AtomicU32]>,
    /// Start index per frame into the token arena; entry `f` is frame `f`'s
    /// first token, entry `f+1` one past its last.
    toks_sidx: Mutex<Vec<u32>>,
    /// Start index per frame into the before-pruning arc buffer.
    arcs_sidx: Mutex<Vec<u32>>,
    /// Surviving arcs per settled frame, in stable bpr order.
    apr: Mutex<Vec<Vec<LatLink>>>,
    /// Frames below this index are settled: pruned, written out, immutable.
    settled: AtomicU32,
}

impl LatticePruner {
    pub fn new(max_tokens: u32, prune_interval: u32, lattice_beam: f32, lat_threads: usize) -> Self {
        let extra = (0..max_tokens)
            .map(|_| AtomicU32::new(f32::INFINITY.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            prune_interval,
            lattice_beam,
            lat_threads,
            extra,
            toks_sidx: Mutex::new(vec![0]),
            arcs_sidx: Mutex::new(vec![0]),
            apr: Mutex::new(Vec::new()),
            settled: AtomicU32::new(0),
        }
    }

    pub fn reset(&self) {
        *self.toks_sidx.lock() = vec![0];
        *self.arcs_sidx.lock() = vec![0];
        self.apr.lock().clear();
        self.settled.store(0, Ordering::Release);
    }

    /// Record frame `frame`'s token range and arc watermark. Called once per
    /// frame, in frame order, after the kernel's compute completes.
    pub fn collect_frame(&self, frame: u32, tok_start: u32, tok_count: u32, arc_end: u32) {
        let mut toks = self.toks_sidx.lock();
        debug_assert_eq!(toks.len(), frame as usize + 1);
        debug_assert_eq!(*toks.last().unwrap(), tok_start);
        toks.push(tok_start + tok_count);

        let mut arcs = self.arcs_sidx.lock();
        debug_assert_eq!(arcs.len(), frame as usize + 1);
        arcs.push(arc_end);
    }

    /// Periodic backward pruning, triggered with `frame` the newest collected
    /// frame. Relaxes extra costs over the open window and settles every frame
    /// at least `prune_interval` behind.
    pub fn prune_window(&self, frame: u32, arena: &TokenArena, arcs: &DeviceVector<LatLink>) {
        if frame < self.prune_interval {
            return;
        }
        let settle_hi = frame - self.prune_interval;
        let boundary = {
            let toks = self.toks_sidx.lock();
            let count = toks[frame as usize + 1] - toks[frame as usize];
            vec![0.0f32; count as usize]
        };
        self.relax_and_settle(frame, &boundary, Some(settle_hi), arena, arcs);
    }

    /// Final pruning at end of decode. `boundary_extra` carries the last
    /// frame's per-token slack (relative to the best final token); every
    /// remaining frame is settled.
    pub fn prune_final(
        &self,
        last_frame: u32,
        boundary_extra: &[f32],
        arena: &TokenArena,
        arcs: &DeviceVector<LatLink>,
    ) {
        self.relax_and_settle(last_frame, boundary_extra, Some(last_frame), arena, arcs);
    }

    fn relax_and_settle(
        &self,
        hi: u32,
        boundary_extra: &[f32],
        settle_hi: Option<u32>,
        arena: &TokenArena,
        arcs: &DeviceVector<LatLink>,
    ) {
        let toks_sidx: Vec<u32> = self.toks_sidx.lock().clone();
        let arcs_sidx: Vec<u32> = self.arcs_sidx.lock().clone();
        if toks_sidx.len() < hi as usize + 2 {
            // Frame `hi` was never collected; nothing to prune.
            return;
        }
        let lo = self.settled.load(Ordering::Acquire);
        if lo > hi {
            return;
        }

        // Seed the window: +inf everywhere, boundary values at the top frame.
        for g in toks_sidx[lo as usize]..toks_sidx[hi as usize + 1] {
            self.extra[g as usize].store(f32::INFINITY.to_bits(), Ordering::Relaxed);
        }
        let top = toks_sidx[hi as usize]..toks_sidx[hi as usize + 1];
        debug_assert_eq!(top.len(), boundary_extra.len());
        for (g, &e) in top.zip(boundary_extra.iter()) {
            self.extra[g as usize].store(e.max(0.0).to_bits(), Ordering::Relaxed);
        }

        // Backward relaxation to fixpoint. Extra costs only decrease, so the
        // pass terminates.
        loop {
            let changed = std::sync::atomic::AtomicBool::new(false);
            for w in (lo..=hi).rev() {
                let range = arcs_sidx[w as usize]..arcs_sidx[w as usize + 1];
                self.for_each_arc(range, arcs, |link| {
                    if self.relax_arc(&link, lo, &toks_sidx, arena).is_some() {
                        changed.store(true, Ordering::Relaxed);
                    }
                });
            }
            if !changed.load(Ordering::Relaxed) {
                break;
            }
        }

        // Settle finished frames: filter arcs against the lattice beam, write
        // converged extra costs back into the tokens, hand survivors to the
        // host buffers.
        let Some(settle_hi) = settle_hi else { return };
        if settle_hi < lo {
            return;
        }
        let mut apr = self.apr.lock();
        let mut kept_total = 0usize;
        let mut dropped_total = 0usize;
        for w in lo..=settle_hi {
            debug_assert_eq!(apr.len(), w as usize);
            let mut kept = Vec::new();
            for a in arcs_sidx[w as usize]..arcs_sidx[w as usize + 1] {
                let link = arcs.get(a);
                if self.link_extra(&link, &toks_sidx, arena) <= self.lattice_beam {
                    kept.push(link);
                } else {
                    dropped_total += 1;
                }
            }
            kept_total += kept.len();
            apr.push(kept);

            for g in toks_sidx[w as usize]..toks_sidx[w as usize + 1] {
                // Safety: frames being settled are no longer written by the
                // kernel; the lattice stream is the only mutator here.
                let mut token = unsafe { arena.read(g) };
                token.extra_cost = f32::from_bits(self.extra[g as usize].load(Ordering::Relaxed));
                unsafe { arena.write(g, token) };
            }
        }
        self.settled.store(settle_hi + 1, Ordering::Release);
        debug!(
            frames = ?(lo..=settle_hi),
            kept = kept_total,
            dropped = dropped_total,
            "settled lattice window"
        );
    }

    /// Slack of the best complete path through `link`, given converged
    /// destination extras.
    fn link_extra(&self, link: &LatLink, toks_sidx: &[u32], arena: &TokenArena) -> f32 {
        let (next_frame, next_idx) = unpack_tok_ref(link.next_tok);
        let (prev_frame, prev_idx) = unpack_tok_ref(link.prev_tok);
        let next_global = toks_sidx[next_frame as usize] + next_idx;
        let prev_global = toks_sidx[prev_frame as usize] + prev_idx;
        let next_extra = f32::from_bits(self.extra[next_global as usize].load(Ordering::Acquire));
        if !next_extra.is_finite() {
            return f32::INFINITY;
        }
        // Safety: tokens of collected frames are fully written.
        let next = unsafe { arena.read(next_global) };
        let prev = unsafe { arena.read(prev_global) };
        let slack = prev.cost + link.graph_cost + link.acoustic_cost - next.cost;
        (next_extra + slack).max(0.0)
    }

    /// One relaxation step; returns `Some(())` when the source token's extra
    /// cost decreased.
    fn relax_arc(
        &self,
        link: &LatLink,
        lo: u32,
        toks_sidx: &[u32],
        arena: &TokenArena,
    ) -> Option<()> {
        let (prev_frame, prev_idx) = unpack_tok_ref(link.prev_tok);
        if prev_frame < lo {
            // Source already settled in an earlier window.
            return None;
        }
        let link_extra = self.link_extra(link, toks_sidx, arena);
        if !link_extra.is_finite() {
            return None;
        }
        let prev_global = toks_sidx[prev_frame as usize] + prev_idx;
        let new_bits = link_extra.to_bits();
        let old_bits = self.extra[prev_global as usize].fetch_min(new_bits, Ordering::AcqRel);
        (new_bits < old_bits).then_some(())
    }

    /// Run `f` over the arc range, splitting across the lattice worker
    /// threads when the range is large enough to pay for it.
    fn for_each_arc<F>(&self, range: std::ops::Range<u32>, arcs: &DeviceVector<LatLink>, f: F)
    where
        F: Fn(LatLink) + Sync,
    {
        let len = range.len();
        if self.lat_threads <= 1 || len < PARALLEL_ARC_THRESHOLD {
            for a in range {
                f(arcs.get(a));
            }
            return;
        }
        let chunk = len.div_ceil(self.lat_threads) as u32;
        std::thread::scope(|scope| {
            for t in 0..self.lat_threads as u32 {
                let start = range.start + t * chunk;
                let end = (start + chunk).min(range.end);
                let f = &f;
                scope.spawn(move || {
                    for a in start..end {
                        f(arcs.get(a));
                    }
                });
            }
        });
    }

    /// Per-frame token start indices recorded so far (one past the last frame
    /// at the end).
    pub fn toks_frame_starts(&self) -> Vec<u32> {
        self.toks_sidx.lock().clone()
    }

    /// Drain the settled per-frame arcs into `(arcs_buf, arcs_fr_size)` form.
    pub fn take_host_arcs(&self) -> (Vec<LatLink>, Vec<u32>) {
        let mut apr = self.apr.lock();
        let mut sizes = Vec::with_capacity(apr.len());
        let mut flat = Vec::new();
        for frame_arcs in apr.drain(..) {
            sizes.push(frame_arcs.len() as u32);
            flat.extend(frame_arcs);
        }
        (flat, sizes)
    }
}
