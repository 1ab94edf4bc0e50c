//! Hashed n-gram language model: ARPA reading, the fixed-capacity store, and
//! the deterministic on-demand transducer view used for lattice rescoring.

mod arpa;
mod fst;
mod store;

pub use arpa::ArpaOptions;
pub use fst::{LmArc, NgramLmFst};
pub use store::{NgramLm, NgramLmBuilder};
