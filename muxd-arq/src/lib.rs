//! # muxd-arq: Reliable Ordered Transport over Lossy Datagrams
//!
//! This crate turns an unreliable packet channel into an ordered,
//! retransmitted byte stream between two endpoints. It is the bottom half
//! of the `muxd` stack; the stream-multiplexing layer lives in
//! `muxd-stream`.
//!
//! ## Layout
//!
//! ```text
//! muxd-arq/
//! ├── buffer   - chunk-list byte buffer with a read cursor
//! ├── kcp      - the ARQ engine (segments, ACKs, retransmission, windows)
//! ├── socket   - binds the engine to one datagram endpoint
//! └── error    - transport error types
//! ```
//!
//! ## Design Principles
//!
//! 1. **No I/O**: the engine consumes datagrams and time and produces
//!    datagrams through an output sink; the caller owns the actual socket.
//! 2. **Deterministic**: behavior is a function of the bytes fed in and the
//!    millisecond clock passed to [`socket::ArqUdpSocket::clock`].
//! 3. **Single-threaded**: nothing here locks; one event loop owns each
//!    connection.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod error;
pub mod kcp;
pub mod socket;

pub use buffer::ChunkBuf;
pub use error::{ArqError, Result};
pub use kcp::Kcp;
pub use socket::{ArqConfig, ArqUdpSocket, TICK_INTERVAL};
