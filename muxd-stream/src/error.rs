//! Error types of the streamed multiplexing layer.

use std::net::SocketAddr;

use muxd_arq::ArqError;
use thiserror::Error;

/// Errors surfaced by the handler, streams, and listener.
///
/// Handler-level failures collapse into the invalid callback; per-stream
/// and API-misuse errors surface synchronously to the caller without
/// affecting handler state. Protocol violations by the peer (repeated SYN,
/// FIN/RST for unknown streams) are never errors; they are logged at debug
/// level and dropped.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("handshake timed out")]
    HandshakeTimedOut,

    #[error("keepalive response timeout")]
    KeepaliveTimeout,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("transport is not ready")]
    NotReady,

    #[error("only the client side can open streams")]
    NotClient,

    #[error("stream {0} is not connected")]
    NotConnected(u32),

    #[error("stream {0} already exists")]
    StreamExists(u32),

    #[error("syn for stream {0} already sent")]
    SynAlreadySent(u32),

    #[error("stream {0} is already closed")]
    AlreadyClosed(u32),

    #[error("stream {0} is not tracked by this transport")]
    UnknownStream(u32),

    #[error("accepting stream {0} failed")]
    AcceptFailed(u32),

    #[error("arq udp socket removed from loop")]
    RemovedFromLoop,

    #[error("peer reported: {0}")]
    PeerError(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("unexpected hello from peer")]
    BadHandshake,

    #[error("cannot create more than one streamed listener per transport")]
    DuplicateListener,

    #[error("the listener is closed")]
    ListenerClosed,

    #[error("cannot bind {requested} (only {bound} is available)")]
    BindMismatch {
        requested: SocketAddr,
        bound: SocketAddr,
    },

    #[error(transparent)]
    Arq(#[from] ArqError),
}

pub type Result<T> = std::result::Result<T, StreamError>;
