//! Transport error types.

use thiserror::Error;

/// Errors raised by the ARQ engine and its datagram adapter.
///
/// Every variant here is fatal to the owning connection: the engine cannot
/// resynchronize after malformed input, and a negative internal state means
/// the retransmission budget is exhausted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArqError {
    /// A received datagram could not be decoded as segments.
    #[error("malformed segment: {0}")]
    Input(&'static str),

    /// The application tried to enqueue more than the fragment limit allows.
    #[error("oversized send of {0} bytes")]
    OversizedSend(usize),

    /// The configured MTU cannot hold a segment header.
    #[error("invalid mtu {0}")]
    InvalidMtu(usize),

    /// The link is dead: a segment exceeded the retransmission budget.
    #[error("the arq connection is invalid")]
    ConnectionInvalid,
}

pub type Result<T> = std::result::Result<T, ArqError>;
