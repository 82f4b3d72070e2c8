//! The ARQ engine.
//!
//! A KCP-style protocol: application bytes are fragmented into numbered
//! segments, acknowledged per segment, retransmitted on timeout or after
//! duplicate ACKs, and reassembled in order on the far side. The engine is
//! pure: it consumes datagrams and a millisecond clock and emits datagrams
//! through an output sink.

pub mod engine;
pub mod segment;

pub use engine::{Kcp, OutputFn};
pub use segment::{Segment, CMD_ACK, CMD_PUSH, CMD_WASK, CMD_WINS, OVERHEAD};
