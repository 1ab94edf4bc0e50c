//! Custom error types for the latgen decoder and language-model store.
//!
//! This module provides a centralized error handling system using the `thiserror` crate
//! to define structured, typed errors with clear messages and proper error conversion.

use std::io;
use thiserror::Error;

/// Primary error type for the crate, covering all possible error cases.
#[derive(Debug, Error)]
pub enum Error {
    /// A line of the ARPA input could not be parsed.
    #[error("bad ARPA format at line {line}: {message}")]
    BadFormat {
        /// 1-based line number in the input.
        line: usize,
        /// What went wrong on that line.
        message: String,
    },

    /// The ARPA input ended before a required section was seen.
    #[error("truncated ARPA input: {0}")]
    Truncated(String),

    /// Declared n-gram counts disagree with the entries actually read.
    ///
    /// Only raised in strict mode; the lenient default logs a warning instead.
    #[error("inconsistent ARPA header: order {order} declares {declared} n-grams, read {read}")]
    Inconsistent {
        /// The n-gram order whose count disagreed.
        order: usize,
        /// Count declared in the `\data\` header.
        declared: usize,
        /// Entries actually consumed from the section.
        read: usize,
    },

    /// No active tokens remained at the start of a frame; decoding cannot continue.
    #[error("no active tokens at frame {frame}; decoding is dead")]
    DecodingDead {
        /// The frame at which the active set became empty.
        frame: u32,
    },

    /// Errors from invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience type alias for Results with this crate's Error.
pub type Result<T> = std::result::Result<T, Error>;
