//! Decoder driver.
//!
//! [`LatticeDecoder`] owns the shared core and orchestrates it over three
//! streams: `compute` (token passing), `lattice` (collection and pruning) and
//! `likelihood` (acoustic uploads, double-buffered one frame ahead). Two
//! events order them: the likelihood event gates each frame's compute, the
//! compute event gates that frame's lattice work. Those two event waits are
//! the only suspension points the decode loop goes through.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::DecoderConfig;
use crate::decoder::kernel::DecoderCore;
use crate::device::{Event, Stream};
use crate::error::{Error, Result};
use crate::graph::DecodeGraph;
use crate::lattice::RawLattice;
use crate::likelihood::AcousticScorer;

/// Parallel token-passing lattice decoder over a flattened WFST.
pub struct LatticeDecoder {
    config: DecoderConfig,
    core: Arc<DecoderCore>,
    stream_comp: Stream,
    stream_lat: Stream,
    stream_ll: Stream,
    /// Recorded after each frame's token passing.
    event_pt: Event,
    /// Recorded after each acoustic frame upload.
    event_ll: Event,
    num_frames_decoded: u32,
    dead: bool,
}

impl LatticeDecoder {
    /// Build a decoder over `graph`. Allocates every arena up front from the
    /// configured capacities.
    pub fn new(graph: Arc<DecodeGraph>, config: DecoderConfig) -> Result<Self> {
        config.validate()?;
        info!(
            states = graph.num_states(),
            arcs = graph.num_arcs(),
            beam = config.beam,
            lattice_beam = config.lattice_beam,
            "building lattice decoder"
        );
        let core = Arc::new(DecoderCore::new(graph, &config));
        Ok(Self {
            config,
            core,
            stream_comp: Stream::new("compute"),
            stream_lat: Stream::new("lattice"),
            stream_ll: Stream::new("likelihood"),
            event_pt: Event::new(),
            event_ll: Event::new(),
            num_frames_decoded: 0,
            dead: false,
        })
    }

    /// Frames decoded so far in the current utterance (excluding frame 0).
    pub fn num_frames_decoded(&self) -> u32 {
        self.num_frames_decoded
    }

    /// Whether any token of the last decoded frame sits on a state with a
    /// finite final weight. False after a dead decode.
    pub fn reached_final(&self) -> bool {
        if self.dead {
            return false;
        }
        let toks = self.core.frame_toks(self.num_frames_decoded);
        let graph = self.core.graph();
        (0..toks.size()).any(|i| graph.is_final(toks.get(i).state))
    }

    /// Decode every frame the scorer offers.
    ///
    /// Restarts the decoder state, so one instance can decode consecutive
    /// utterances. Fails with [`Error::DecodingDead`] when the beam kills
    /// every hypothesis; the lattice up to the preceding frame remains
    /// available through [`LatticeDecoder::finalize`].
    pub async fn decode(&mut self, scorer: &dyn AcousticScorer) -> Result<()> {
        let num_frames = scorer.num_frames() as u32;
        if num_frames > 0 && scorer.log_likelihoods(0).len() < self.core.graph().num_pdfs() {
            return Err(Error::Configuration(format!(
                "scorer provides {} likelihoods per frame, graph needs {}",
                scorer.log_likelihoods(0).len(),
                self.core.graph().num_pdfs()
            )));
        }

        // Quiesce any previous utterance before rewinding shared state.
        self.stream_comp.drain().await;
        self.stream_lat.drain().await;
        self.stream_ll.drain().await;
        self.num_frames_decoded = 0;
        self.dead = false;

        // Frame 0: initial token plus its epsilon closure, then collection.
        {
            let core = self.core.clone();
            self.stream_comp.enqueue(move || core.init_decoding());
            let core = self.core.clone();
            self.stream_comp.enqueue(move || core.process_nonemitting());
            self.stream_comp.record(&self.event_pt);
            self.stream_lat.wait_event(&self.event_pt);
            let core = self.core.clone();
            self.stream_lat.enqueue(move || core.collect_frame(0));
        }

        if num_frames > 0 {
            self.upload_frame(scorer, 0);
        }

        for frame in 1..=num_frames {
            // Likelihoods for this frame must be resident before compute.
            self.event_ll.wait().await;
            if frame < num_frames {
                // Prefetch the next acoustic frame into the other buffer; its
                // previous reader finished last frame, see the event wait
                // at the bottom of the loop.
                self.upload_frame(scorer, frame);
            }

            // The lattice stream must release the TokenState vector this
            // frame reuses before compute may clear it.
            self.stream_lat.drain().await;

            let core = self.core.clone();
            self.stream_comp.enqueue(move || core.process_tokens(frame));
            self.stream_comp.record(&self.event_pt);
            self.event_pt.wait().await;

            if self.core.active_count(frame) == 0 {
                self.dead = true;
                warn!(frame, "active token set is empty, decoding dead");
                return Err(Error::DecodingDead { frame });
            }
            self.num_frames_decoded = frame;

            self.stream_lat.wait_event(&self.event_pt);
            let core = self.core.clone();
            self.stream_lat.enqueue(move || core.collect_frame(frame));
            if frame % self.config.prune_interval == 0 {
                let core = self.core.clone();
                self.stream_lat
                    .enqueue(move || core.prune_active_tokens(frame));
            }
        }

        debug!(frames = num_frames, "utterance decoded");
        Ok(())
    }

    fn upload_frame(&self, scorer: &dyn AcousticScorer, acoustic_frame: u32) {
        // Host staging copy; the likelihood stream moves it into the
        // device-visible buffer for this parity.
        let staged = scorer.log_likelihoods(acoustic_frame as usize).to_vec();
        let core = self.core.clone();
        self.stream_ll.enqueue(move || {
            core.ll[acoustic_frame as usize % 2].upload(&staged);
        });
        self.stream_ll.record(&self.event_ll);
    }

    /// Drain outstanding lattice work, run the final backward pruning pass
    /// and hand the host buffers to the caller.
    pub async fn finalize(&mut self) -> Result<RawLattice> {
        self.stream_comp.drain().await;
        self.stream_ll.drain().await;
        self.stream_lat.drain().await;

        let core = &self.core;
        let graph = core.graph();
        let last = self.num_frames_decoded;
        let toks = core.frame_toks(last);
        let count = toks.size();

        // Boundary slack for the last frame: relative to the best token
        // through a final state when one is reachable, to the best cost
        // otherwise.
        let reached_final = (0..count).any(|i| graph.is_final(toks.get(i).state));
        let total = |i: u32| {
            let ts = toks.get(i);
            if reached_final {
                ts.cost + graph.final_cost(ts.state)
            } else {
                ts.cost
            }
        };
        let mut best_cost = f32::INFINITY;
        let mut best_idx = 0u32;
        for i in 0..count {
            if total(i) < best_cost {
                best_cost = total(i);
                best_idx = i;
            }
        }
        let boundary: Vec<f32> = (0..count).map(|i| total(i) - best_cost).collect();

        core.pruner
            .prune_final(last, &boundary, &core.arena, &core.arcs);
        core.arena.prefetch_allocated_to_host();

        let (arcs_buf, arcs_fr_size) = core.pruner.take_host_arcs();
        let lattice = RawLattice {
            toks_buf: core.arena.snapshot(),
            toks_fr_sidx: core.pruner.toks_frame_starts(),
            arcs_buf,
            arcs_fr_size,
            final_toks: toks.snapshot(),
            reached_final,
            best_token: (last, best_idx),
            best_cost,
            determinize: self.config.determinize_lattice,
        };
        info!(
            frames = lattice.num_frames(),
            tokens = lattice.toks_buf.len(),
            arcs = lattice.num_arcs(),
            reached_final,
            "lattice finalized"
        );
        Ok(lattice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphArc;
    use crate::likelihood::SliceScorer;

    fn small_config() -> DecoderConfig {
        DecoderConfig {
            beam: 16.0,
            lattice_beam: 5.0,
            max_tokens_per_frame: 64,
            max_lat_arc_per_frame: 64,
            max_tokens: 16_384,
            max_arcs: 32_768,
            prune_interval: 100,
            ..DecoderConfig::default()
        }
    }

    /// Two-state graph: emitting self-loop on the start state, epsilon arc
    /// into a final state.
    fn loop_graph(extra_loops: &[(i32, f32)]) -> Arc<DecodeGraph> {
        let mut arcs = vec![
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
                    ilabel: 0,
                    olabel: 0,
                    weight: 0.0,
                    nextstate: 1,
                },
            ),
        ];
        for &(ilabel, weight) in extra_loops {
            arcs.push((
                0,
                GraphArc {
                    ilabel,
                    olabel: 0,
                    weight,
                    nextstate: 0,
                },
            ));
        }
        Arc::new(DecodeGraph::from_arcs(2, 0, &arcs, vec![f32::INFINITY, 0.0]).unwrap())
    }

    #[tokio::test]
    async fn test_empty_decode_single_path() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let graph = loop_graph(&[]);
        let mut decoder = LatticeDecoder::new(graph.clone(), small_config()).unwrap();
        let scorer = SliceScorer::zeros(5, graph.num_pdfs());

        decoder.decode(&scorer).await.unwrap();
        assert_eq!(decoder.num_frames_decoded(), 5);
        assert!(decoder.reached_final());

        let lattice = decoder.finalize().await.unwrap();
        assert!(lattice.reached_final);
        assert_eq!(lattice.best_cost, 0.0);

        // One surviving path: five self-loops plus the final epsilon. Epsilon
        // arcs into dead-end mid-utterance tokens are pruned away.
        assert_eq!(lattice.num_frames(), 6);
        assert_eq!(lattice.num_arcs(), 6);
        let path = lattice.best_path().unwrap();
        assert_eq!(path.ilabels, vec![1; 5]);
        assert!(path.words.is_empty());
        assert_eq!(path.cost, 0.0);
    }

    #[tokio::test]
    async fn test_beam_cutoff_drops_expensive_branch() {
        // A parallel self-loop of weight 100 next to the free one.
        let graph = loop_graph(&[(2, 100.0)]);
        let scorer = SliceScorer::zeros(3, graph.num_pdfs());

        let mut narrow = LatticeDecoder::new(
            graph.clone(),
            DecoderConfig {
                beam: 5.0,
                ..small_config()
            },
        )
        .unwrap();
        narrow.decode(&scorer).await.unwrap();
        let lattice = narrow.finalize().await.unwrap();
        // The weight-100 loop was never admitted.
        assert!(lattice.arcs_buf.iter().all(|l| l.graph_cost < 100.0));

        let mut wide = LatticeDecoder::new(
            graph.clone(),
            DecoderConfig {
                beam: 200.0,
                lattice_beam: 300.0,
                ..small_config()
            },
        )
        .unwrap();
        wide.decode(&scorer).await.unwrap();
        let lattice = wide.finalize().await.unwrap();
        assert!(lattice.arcs_buf.iter().any(|l| l.graph_cost == 100.0));
    }

    #[tokio::test]
    async fn test_decoding_dead_reported() {
        // Only way forward costs 100 under a beam of 5.
        let graph = Arc::new(
            DecodeGraph::from_arcs(
                2,
                0,
                &[(
                    0,
                    GraphArc {
                        ilabel: 1,
                        olabel: 0,
                        weight: 100.0,
                        nextstate: 1,
                    },
                )],
                vec![f32::INFINITY, 0.0],
            )
            .unwrap(),
        );
        let mut decoder = LatticeDecoder::new(
            graph.clone(),
            DecoderConfig {
                beam: 5.0,
                ..small_config()
            },
        )
        .unwrap();
        let scorer = SliceScorer::zeros(2, graph.num_pdfs());

        let err = decoder.decode(&scorer).await.unwrap_err();
        assert!(matches!(err, Error::DecodingDead { frame: 1 }));
        assert!(!decoder.reached_final());
    }

    #[tokio::test]
    async fn test_decoder_reusable_across_utterances() {
        let graph = loop_graph(&[]);
        let mut decoder = LatticeDecoder::new(graph.clone(), small_config()).unwrap();

        for _ in 0..2 {
            let scorer = SliceScorer::zeros(4, graph.num_pdfs());
            decoder.decode(&scorer).await.unwrap();
            let lattice = decoder.finalize().await.unwrap();
            assert_eq!(lattice.num_frames(), 5);
            assert_eq!(lattice.best_cost, 0.0);
        }
    }

    #[tokio::test]
    async fn test_windowed_pruning_matches_lattice_beam() {
        // Parallel self-loops of weight 0 and 7: the detour carries slack 7
        // on every frame.
        let graph = loop_graph(&[(2, 7.0)]);
        let frames = 3000usize;
        let scorer = SliceScorer::zeros(frames, graph.num_pdfs());

        let mut decoder = LatticeDecoder::new(
            graph.clone(),
            DecoderConfig {
                beam: 16.0,
                lattice_beam: 5.0,
                prune_interval: 100,
                max_tokens_per_frame: 16,
                max_tokens: 8_192,
                max_arcs: 16_384,
                ..small_config()
            },
        )
        .unwrap();
        decoder.decode(&scorer).await.unwrap();
        let lattice = decoder.finalize().await.unwrap();

        assert_eq!(lattice.num_frames(), frames + 1);
        // Every frame keeps exactly the zero-slack loop; the slack-7 detours
        // sit outside the lattice beam.
        for frame in 1..frames as u32 {
            let arcs = lattice.arcs_at(frame);
            assert_eq!(arcs.len(), 1, "frame {}", frame);
            assert_eq!(arcs[0].graph_cost, 0.0);
        }
        // Retained arcs all satisfy the extra-cost bound.
        for frame in 1..=frames as u32 {
            for link in lattice.arcs_at(frame) {
                let (nf, ni) = crate::decoder::types::unpack_tok_ref(link.next_tok);
                let (pf, pi) = crate::decoder::types::unpack_tok_ref(link.prev_tok);
                let next = lattice.token(nf, ni);
                let prev = lattice.token(pf, pi);
                let slack = prev.cost + link.graph_cost + link.acoustic_cost - next.cost;
                assert!(next.extra_cost + slack <= 5.0 + 1e-4);
            }
        }

        // A wider lattice beam keeps the detours too.
        let mut dense = LatticeDecoder::new(
            graph.clone(),
            DecoderConfig {
                beam: 16.0,
                lattice_beam: 10.0,
                prune_interval: 100,
                max_tokens_per_frame: 16,
                max_tokens: 8_192,
                max_arcs: 16_384,
                ..small_config()
            },
        )
        .unwrap();
        dense.decode(&scorer).await.unwrap();
        let lattice = dense.finalize().await.unwrap();
        for frame in 1..frames as u32 {
            assert_eq!(lattice.arcs_at(frame).len(), 2, "frame {}", frame);
        }
    }
}
