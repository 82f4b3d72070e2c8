//! Per-stream virtual sockets.
//!
//! A [`StreamedFd`] is a socket-like handle for one multiplexed stream. It
//! owns no kernel fd: readiness is driven by software through the shared
//! [`VirtualReadySet`](crate::reactor::VirtualReadySet). The handler owns
//! the stream map and is authoritative on lifecycle; the application holds
//! an `Rc` and reads from the inbound buffer directly, while every write or
//! close goes through the handler.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;

use bytes::Bytes;
use muxd_arq::ChunkBuf;
use tracing::debug;

use crate::error::{Result, StreamError};
use crate::reactor::{FdToken, SharedReadySet};

/// Lifecycle of one stream. Transitions are monotone toward [`Dead`];
/// once dead a stream never leaves that state.
///
/// [`Dead`]: StreamState::Dead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, SYN not yet sent (client) or not yet accepted (server).
    Idle,
    /// SYN sent, awaiting SYN-ACK.
    SynSent,
    /// Both directions open.
    Established,
    /// We sent FIN; the peer may still send.
    FinSent,
    /// The peer sent FIN; we may still send.
    FinRecv,
    /// Terminal.
    Dead,
}

/// Outcome of a non-blocking stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRead {
    /// `n` bytes were copied into the destination.
    Data(usize),
    /// Nothing buffered; try again after the next readable edge.
    WouldBlock,
    /// End of stream: the peer finished and the buffer is drained.
    Eof,
}

/// A virtual socket for one multiplexed stream.
pub struct StreamedFd {
    id: u32,
    token: FdToken,
    local: SocketAddr,
    remote: SocketAddr,
    state: Cell<StreamState>,
    inbound: RefCell<ChunkBuf>,
    rst: Cell<bool>,
    rst_seen: Cell<bool>,
    ready: SharedReadySet,
}

impl StreamedFd {
    pub(crate) fn new(
        id: u32,
        token: FdToken,
        local: SocketAddr,
        remote: SocketAddr,
        ready: SharedReadySet,
    ) -> Self {
        Self {
            id,
            token,
            local,
            remote,
            state: Cell::new(StreamState::Idle),
            inbound: RefCell::new(ChunkBuf::new()),
            rst: Cell::new(false),
            rst_seen: Cell::new(false),
            ready,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn token(&self) -> FdToken {
        self.token
    }

    /// The synthetic address pair: the 32-bit stream id rendered as an IPv4
    /// address on the virtual end, the real ARQ-UDP address on the other.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    /// True once a RST has been observed for this stream.
    pub fn is_reset(&self) -> bool {
        self.rst.get()
    }

    pub(crate) fn set_state(&self, next: StreamState) {
        let prev = self.state.get();
        if prev == next {
            return;
        }
        // dead is terminal
        if prev == StreamState::Dead {
            return;
        }
        debug!(stream_id = self.id, ?prev, ?next, "stream state");
        self.state.set(next);
        if next == StreamState::FinRecv {
            // make EOF observable even with an empty buffer
            self.set_readable();
        }
    }

    pub(crate) fn set_rst(&self) {
        self.rst.set(true);
        self.set_readable();
    }

    /// Called by the handler when a PSH for this stream arrives.
    pub(crate) fn input_data(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.inbound.borrow_mut().push(data);
        self.set_readable();
    }

    /// Copies buffered bytes into `dst`.
    ///
    /// A reset surfaces as an error exactly once; subsequent reads report
    /// end-of-stream. With an empty buffer, `FinRecv` (and plain death)
    /// mean end-of-stream and anything else would block.
    pub fn read(&self, dst: &mut [u8]) -> Result<StreamRead> {
        if self.rst.get() {
            if !self.rst_seen.get() {
                self.rst_seen.set(true);
                return Err(StreamError::ConnectionReset);
            }
            return Ok(StreamRead::Eof);
        }
        let mut inbound = self.inbound.borrow_mut();
        if !inbound.is_empty() {
            let n = inbound.read_to(dst);
            if inbound.is_empty() && self.state.get() != StreamState::FinRecv {
                self.clear_readable();
            }
            return Ok(StreamRead::Data(n));
        }
        match self.state.get() {
            StreamState::FinRecv | StreamState::Dead => Ok(StreamRead::Eof),
            _ => {
                self.clear_readable();
                Ok(StreamRead::WouldBlock)
            }
        }
    }

    /// Bytes buffered but not yet consumed by the application.
    pub fn pending_read(&self) -> usize {
        self.inbound.borrow().len()
    }

    fn set_readable(&self) {
        self.ready.borrow_mut().set_readable(self.token);
    }

    fn clear_readable(&self) {
        self.ready.borrow_mut().clear_readable(self.token);
    }

    pub(crate) fn set_writable(&self) {
        self.ready.borrow_mut().set_writable(self.token);
    }

    pub(crate) fn cancel_writable(&self) {
        self.ready.borrow_mut().clear_writable(self.token);
    }
}

impl std::fmt::Debug for StreamedFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamedFd")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}
