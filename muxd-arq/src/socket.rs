//! Binds the ARQ engine to one datagram endpoint.
//!
//! The adapter owns the engine and exposes the byte-stream surface the
//! upper layers see: datagrams in, ordered bytes out, windowed writes, and
//! a millisecond clock. Actual UDP I/O stays with the caller: emitted
//! datagrams are queued and drained through [`ArqUdpSocket::poll_datagram`]
//! under the caller's writable discipline.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::buffer::ChunkBuf;
use crate::error::{ArqError, Result};
use crate::kcp::Kcp;

/// The clock cadence the engine requires from its driving loop.
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Tuning knobs for one ARQ connection.
///
/// The latency profile itself is not configurable: the adapter always runs
/// the engine with `nodelay(true, 10, 2, true)`: 10 ms internal clock,
/// retransmit after 2 duplicate ACKs, no slow-start (the "fast3" tuning).
#[derive(Debug, Clone)]
pub struct ArqConfig {
    pub mtu: usize,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            snd_wnd: 32,
            rcv_wnd: 128,
        }
    }
}

/// One reliable connection over a datagram pair.
pub struct ArqUdpSocket {
    kcp: Kcp,
    decoded: ChunkBuf,
    outbound: Rc<RefCell<VecDeque<Bytes>>>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl ArqUdpSocket {
    pub fn new(
        conv: u32,
        local: SocketAddr,
        remote: SocketAddr,
        config: ArqConfig,
    ) -> Result<Self> {
        let outbound: Rc<RefCell<VecDeque<Bytes>>> = Rc::default();
        let sink = outbound.clone();
        let mut kcp = Kcp::new(conv, Box::new(move |d| sink.borrow_mut().push_back(d)));
        kcp.set_nodelay(true, 10, 2, true);
        kcp.set_wndsize(config.snd_wnd, config.rcv_wnd);
        kcp.set_mtu(config.mtu)?;
        Ok(Self {
            kcp,
            decoded: ChunkBuf::new(),
            outbound,
            local,
            remote,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Feeds one datagram received from the network; decoded application
    /// bytes become available through [`read`](Self::read).
    pub fn input_datagram(&mut self, datagram: &[u8]) -> Result<()> {
        self.kcp.input(datagram)?;
        while self.kcp.can_recv() {
            let mut chunks = Vec::new();
            let n = self.kcp.recv(&mut chunks)?;
            if n == 0 {
                break;
            }
            for chunk in chunks {
                self.decoded.push(chunk);
            }
        }
        Ok(())
    }

    /// True when decoded bytes are waiting to be read.
    pub fn can_read(&self) -> bool {
        !self.decoded.is_empty()
    }

    /// Drains decoded bytes into `dst`; `Ok(0)` means none are buffered.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        Ok(self.decoded.read_to(dst))
    }

    /// True when the send window can accept at least one more segment.
    pub fn can_write(&self) -> bool {
        self.kcp.wait_snd() < self.kcp.snd_wnd() as usize
    }

    /// Enqueues bytes for reliable delivery, bounded by the free send
    /// window in whole-MSS units.
    ///
    /// Returns the bytes accepted; `Ok(0)` means the window is full and the
    /// caller should retry after acknowledgments arrive.
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let waiting = self.kcp.wait_snd();
        let window = self.kcp.snd_wnd() as usize;
        if waiting >= window {
            return Ok(0);
        }
        let budget = (window - waiting) * self.kcp.mss();
        let n = src.len().min(budget);
        self.kcp.send(&src[..n])?;
        Ok(n)
    }

    /// Drives retransmission and ACK emission; must be called on a
    /// [`TICK_INTERVAL`] cadence.
    ///
    /// Fails with [`ArqError::ConnectionInvalid`] once the engine declares
    /// the link dead.
    pub fn clock(&mut self, now_ms: u64) -> Result<()> {
        self.kcp.update(now_ms as u32);
        if self.kcp.state() < 0 {
            debug!(conv = self.kcp.conv(), "arq connection became invalid");
            return Err(ArqError::ConnectionInvalid);
        }
        Ok(())
    }

    /// Pops the next datagram the engine wants on the wire.
    pub fn poll_datagram(&mut self) -> Option<Bytes> {
        self.outbound.borrow_mut().pop_front()
    }
}
