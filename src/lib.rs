//! The `latgen` core library.
//!
//! A parallel token-passing lattice decoder for large-vocabulary continuous
//! speech recognition over a pre-built WFST recognition graph, plus an
//! in-memory hashed n-gram language-model store for rescoring partial
//! hypotheses. Given the flattened graph, a per-frame stream of acoustic
//! log-likelihoods and an ARPA back-off model, the decoder produces a pruned
//! word lattice of the most likely alternative transcriptions.

pub mod config;
pub mod constants;
pub mod decoder;
pub mod device;
pub mod error;
pub mod graph;
pub mod lattice;
pub mod likelihood;
pub mod lm;

pub use config::DecoderConfig;
pub use decoder::types::{LatLink, Token, TokenState};
pub use decoder::LatticeDecoder;
pub use error::{Error, Result};
pub use graph::{DecodeGraph, GraphArc};
pub use lattice::{BestPath, RawLattice};
pub use likelihood::{AcousticScorer, SliceScorer};
pub use lm::{ArpaOptions, LmArc, NgramLm, NgramLmBuilder, NgramLmFst};
