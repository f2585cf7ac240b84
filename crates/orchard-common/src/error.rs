//! Error types for the Orchard plotter.

use thiserror::Error;

/// Result type alias using PlotError.
pub type Result<T> = std::result::Result<T, PlotError>;

/// Errors that can abort a plot.
///
/// Transient I/O failures never appear here: the disk layer absorbs them
/// with an internal retry loop. Everything below propagates up and aborts
/// the plot without renaming partial output into place.
#[derive(Debug, Error)]
pub enum PlotError {
    /// A parameter violates a precondition (bad k, bucket count, stripe).
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The memory budget cannot cover the admission bound.
    #[error("insufficient memory: {0}")]
    InsufficientMemory(String),

    /// An unrecoverable I/O failure (e.g. open without the retry flag).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bit-pack invariant was violated on read-back.
    #[error("corruption: {0}")]
    Corruption(String),
}
