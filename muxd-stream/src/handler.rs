//! The streamed handler: handshake, framer loop, and the write engine.
//!
//! One [`StreamedHandler`] drives one reliable ARQ connection and carries
//! any number of multiplexed streams on top of it. It is a pure state
//! machine from the loop's point of view: the loop feeds it datagrams,
//! readable/writable events, timer firings and a 10 ms clock, and the
//! handler answers through interest ops, timers, and the virtual ready set.
//!
//! ## The write engine
//!
//! All outgoing frames funnel through a single FIFO queue. `pending_write`
//! holds the frame currently being pushed into the transport; once started
//! it drains completely before the next frame begins, so frames never
//! interleave on the wire. Urgent frames (RST replies, keepalive replies,
//! the final error report) jump the queue via front-insertion but never
//! preempt `pending_write`.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use muxd_arq::{ArqUdpSocket, ChunkBuf};
use rustc_hash::FxHashMap;
use tracing::{debug, error, warn};

use crate::error::{Result, StreamError};
use crate::framer::{Frame, Framer};
use crate::reactor::{LoopCtx, SharedReadySet, TimerId, TimerKey};
use crate::stream::{StreamState, StreamedFd};

/// How long either side waits for the handshake to complete.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5_000);

/// How long a keepalive probe may go unanswered.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Grace period between a fatal failure and the invalid callback, giving
/// the transport a chance to deliver the final error frame.
pub const FAIL_NOTIFY_DELAY: Duration = Duration::from_millis(1_000);

/// How many unanswered probes the keepalive budget absorbs.
pub const KEEPALIVE_MAX_SUCCESS: u32 = 2;

const READ_CHUNK: usize = 1024;

/// Which end of the connection this handler drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Handshake progress.
///
/// The two middle phases read differently per role: on the client,
/// `Opening` means "hello not yet fully written" and `Finishing` means
/// "hello sent, waiting for the server's"; on the server, `Opening` means
/// "waiting for the client's hello" and `Finishing` means "own hello being
/// written".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Opening,
    Finishing,
    Active,
    Invalid,
}

enum Drain {
    Done,
    Blocked,
    Failed,
}

pub type ReadyCallback = Box<dyn FnMut()>;
pub type InvalidCallback = Box<dyn FnMut()>;
pub type AcceptCallback = Box<dyn FnMut(&Rc<StreamedFd>) -> bool>;

/// The per-connection state machine multiplexing streams over one ARQ-UDP
/// socket.
pub struct StreamedHandler {
    role: Role,
    socket: ArqUdpSocket,
    framer: Box<dyn Framer>,
    ready: SharedReadySet,

    phase: Phase,
    failed: bool,

    pending_write: Option<ChunkBuf>,
    write_queue: VecDeque<Bytes>,
    recv_buffer: Option<ChunkBuf>,

    fd_map: FxHashMap<u32, Rc<StreamedFd>>,

    handshake_timer: Option<TimerId>,
    keepalive_pending: FxHashMap<u64, TimerId>,
    next_keepalive_id: u64,
    keepalive_success: u32,

    on_ready: ReadyCallback,
    on_invalid: InvalidCallback,
    on_accept: AcceptCallback,
}

impl StreamedHandler {
    pub fn new(
        role: Role,
        socket: ArqUdpSocket,
        framer: Box<dyn Framer>,
        ready: SharedReadySet,
    ) -> Self {
        Self {
            role,
            socket,
            framer,
            ready,
            phase: Phase::Opening,
            failed: false,
            pending_write: None,
            write_queue: VecDeque::new(),
            recv_buffer: None,
            fd_map: FxHashMap::default(),
            handshake_timer: None,
            keepalive_pending: FxHashMap::default(),
            next_keepalive_id: 0,
            keepalive_success: KEEPALIVE_MAX_SUCCESS,
            on_ready: Box::new(|| {}),
            on_invalid: Box::new(|| {}),
            on_accept: Box::new(|_| false),
        }
    }

    /// Called once when the handshake completes.
    pub fn set_ready_callback(&mut self, cb: impl FnMut() + 'static) {
        self.on_ready = Box::new(cb);
    }

    /// Called once when the connection fails terminally.
    pub fn set_invalid_callback(&mut self, cb: impl FnMut() + 'static) {
        self.on_invalid = Box::new(cb);
    }

    /// Decides whether a peer-opened stream is accepted (server role).
    pub fn set_accept_callback(&mut self, cb: impl FnMut(&Rc<StreamedFd>) -> bool + 'static) {
        self.on_accept = Box::new(cb);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn socket(&self) -> &ArqUdpSocket {
        &self.socket
    }

    pub fn stream(&self, stream_id: u32) -> Option<Rc<StreamedFd>> {
        self.fd_map.get(&stream_id).cloned()
    }

    pub fn stream_count(&self) -> usize {
        self.fd_map.len()
    }

    // ------------------------------------------------------------------
    // loop-facing surface
    // ------------------------------------------------------------------

    /// Feeds one datagram from the underlying UDP fd.
    pub fn datagram_received(&mut self, datagram: &[u8], ctx: &mut dyn LoopCtx) {
        if let Err(e) = self.socket.input_datagram(datagram) {
            self.fail(e.into(), true, ctx);
        }
    }

    /// Pops the next datagram for the underlying UDP fd.
    pub fn poll_datagram(&mut self) -> Option<Bytes> {
        self.socket.poll_datagram()
    }

    /// Drives the ARQ clock; call every
    /// [`TICK_INTERVAL`](muxd_arq::TICK_INTERVAL).
    ///
    /// Keeps running after a failure so the final error frame still gets
    /// flushed during the grace period.
    pub fn tick(&mut self, now_ms: u64, ctx: &mut dyn LoopCtx) {
        if let Err(e) = self.socket.clock(now_ms) {
            self.fail(e.into(), true, ctx);
        }
    }

    /// The underlying transport connected (client role only).
    pub fn connected(&mut self, ctx: &mut dyn LoopCtx) {
        if self.role != Role::Client {
            warn!("server side should not see a `connected` event");
            return;
        }
        self.handshake_timer = Some(ctx.delay(HANDSHAKE_TIMEOUT, TimerKey::Handshake));

        let hello = self.framer.format_client_handshake();
        self.pending_write = Some(ChunkBuf::from_full(hello));
        match self.drive_pending(ctx) {
            Drain::Failed => {}
            Drain::Blocked => ctx.watch_writable(),
            Drain::Done => {
                self.phase = Phase::Finishing;
                ctx.unwatch_writable();
                ctx.watch_readable();
            }
        }
    }

    /// The underlying fd has decoded bytes to read.
    pub fn readable(&mut self, ctx: &mut dyn LoopCtx) {
        self.fill_recv(ctx);
        match self.recv_buffer.as_ref() {
            None => return,
            Some(buf) if buf.is_empty() => return,
            Some(_) => {}
        }
        match self.phase {
            Phase::Opening | Phase::Finishing => match self.role {
                Role::Client => self.client_handshake_readable(ctx),
                Role::Server => self.server_handshake_readable(ctx),
            },
            Phase::Active | Phase::Invalid => self.feed_loop(ctx),
        }
    }

    /// The underlying fd can accept more bytes.
    pub fn writable(&mut self, ctx: &mut dyn LoopCtx) {
        loop {
            if self.pending_write.is_some() {
                match self.drive_pending(ctx) {
                    Drain::Failed => return,
                    Drain::Blocked => {
                        // downstream cannot make progress until the
                        // transport drains
                        for fd in self.fd_map.values() {
                            fd.cancel_writable();
                        }
                        return;
                    }
                    Drain::Done => {}
                }
            }
            if matches!(self.phase, Phase::Opening | Phase::Finishing) {
                match self.role {
                    Role::Client => self.client_handshake_writable(ctx),
                    Role::Server => self.server_handshake_writable(ctx),
                }
                return;
            }
            match self.write_queue.pop_front() {
                None => {
                    ctx.unwatch_writable();
                    for fd in self.fd_map.values() {
                        if fd.state() == StreamState::Established {
                            fd.set_writable();
                        }
                    }
                    return;
                }
                Some(msg) => {
                    for fd in self.fd_map.values() {
                        if fd.state() == StreamState::Established {
                            fd.set_writable();
                        }
                    }
                    self.pending_write = Some(ChunkBuf::from_full(msg));
                }
            }
        }
    }

    /// The underlying fd was removed from the event loop.
    pub fn removed(&mut self, ctx: &mut dyn LoopCtx) {
        warn!("arq udp socket removed from loop, invalidating");
        self.fail(StreamError::RemovedFromLoop, true, ctx);
    }

    /// A timer armed through [`LoopCtx::delay`] fired.
    pub fn timer_fired(&mut self, key: TimerKey, ctx: &mut dyn LoopCtx) {
        match key {
            TimerKey::Handshake => {
                if matches!(self.phase, Phase::Opening | Phase::Finishing) {
                    self.fail(StreamError::HandshakeTimedOut, true, ctx);
                }
            }
            TimerKey::Keepalive(kid) => {
                self.keepalive_pending.remove(&kid);
                if self.failed {
                    return;
                }
                if self.keepalive_success == 0 {
                    self.fail(StreamError::KeepaliveTimeout, true, ctx);
                } else {
                    self.keepalive_success -= 1;
                }
            }
            TimerKey::InvalidNotify => (self.on_invalid)(),
        }
    }

    /// Periodic liveness probe; the external cadence is the caller's
    /// business (typically tens of seconds).
    ///
    /// Probes are only sent while the link is idle, so load never produces
    /// false positives.
    pub fn probe(&mut self, ctx: &mut dyn LoopCtx) {
        if self.failed {
            return;
        }
        if self.pending_write.is_none() && self.write_queue.is_empty() {
            self.next_keepalive_id += 1;
            let kid = self.next_keepalive_id;
            let timer = ctx.delay(KEEPALIVE_TIMEOUT, TimerKey::Keepalive(kid));
            self.keepalive_pending.insert(kid, timer);
            let msg = self.framer.format_keepalive(kid, false);
            self.push_message_to_write(msg, ctx);
            debug!(keepalive_id = kid, "keepalive probe sent");
        }
        for (id, fd) in &self.fd_map {
            debug!(
                stream_id = *id,
                state = ?fd.state(),
                local = %fd.local_addr(),
                remote = %fd.remote_addr(),
                "stream record"
            );
        }
    }

    // ------------------------------------------------------------------
    // application-facing stream operations
    // ------------------------------------------------------------------

    /// Opens a fresh stream (client role). The stream starts idle; call
    /// [`send_syn`](Self::send_syn) to start it.
    pub fn open(&mut self) -> Result<Rc<StreamedFd>> {
        if self.role != Role::Client {
            return Err(StreamError::NotClient);
        }
        if self.phase != Phase::Active {
            return Err(StreamError::NotReady);
        }
        let stream_id = self.framer.next_stream_id();
        if self.fd_map.contains_key(&stream_id) {
            warn!(stream_id, "allocated stream id already exists");
            return Err(StreamError::StreamExists(stream_id));
        }
        Ok(self.new_stream(stream_id))
    }

    /// Frames a SYN for an idle stream.
    pub fn send_syn(&mut self, fd: &Rc<StreamedFd>, ctx: &mut dyn LoopCtx) -> Result<()> {
        self.ensure_tracked(fd)?;
        if fd.state() != StreamState::Idle {
            return Err(StreamError::SynAlreadySent(fd.id()));
        }
        let msg = self.framer.format_syn(fd.id());
        self.add_message_to_write(msg, ctx);
        fd.set_state(StreamState::SynSent);
        Ok(())
    }

    /// Frames `src` as a PSH for the stream; the frame copies the bytes, so
    /// the full length is always accepted.
    pub fn send(&mut self, fd: &Rc<StreamedFd>, src: &[u8], ctx: &mut dyn LoopCtx) -> Result<usize> {
        self.ensure_tracked(fd)?;
        if !matches!(
            fd.state(),
            StreamState::SynSent | StreamState::Established | StreamState::FinRecv
        ) {
            return Err(StreamError::NotConnected(fd.id()));
        }
        if src.is_empty() {
            return Ok(0);
        }
        let msg = self.framer.format_psh(fd.id(), Bytes::copy_from_slice(src));
        self.add_message_to_write(msg, ctx);
        Ok(src.len())
    }

    /// Frames a FIN and advances the stream toward death.
    pub fn send_fin(&mut self, fd: &Rc<StreamedFd>, ctx: &mut dyn LoopCtx) -> Result<()> {
        self.ensure_tracked(fd)?;
        if fd.state() == StreamState::Dead {
            return Err(StreamError::AlreadyClosed(fd.id()));
        }
        let msg = self.framer.format_fin(fd.id());
        self.add_message_to_write(msg, ctx);
        match fd.state() {
            StreamState::Idle | StreamState::SynSent | StreamState::FinRecv => {
                fd.set_state(StreamState::Dead);
                self.remove_stream(fd.id());
            }
            StreamState::Established => fd.set_state(StreamState::FinSent),
            StreamState::FinSent | StreamState::Dead => {}
        }
        Ok(())
    }

    /// Frames a RST and kills the stream.
    pub fn send_rst(&mut self, fd: &Rc<StreamedFd>, ctx: &mut dyn LoopCtx) -> Result<()> {
        self.ensure_tracked(fd)?;
        if fd.state() == StreamState::Dead {
            return Err(StreamError::AlreadyClosed(fd.id()));
        }
        let msg = self.framer.format_rst(fd.id());
        self.add_message_to_write(msg, ctx);
        fd.set_state(StreamState::Dead);
        self.remove_stream(fd.id());
        Ok(())
    }

    /// Tears down every stream and timer; the handler is unusable after.
    pub fn clear(&mut self, ctx: &mut dyn LoopCtx) {
        for fd in self.fd_map.values() {
            fd.set_state(StreamState::Dead);
        }
        for (_, timer) in self.keepalive_pending.drain() {
            ctx.cancel_timer(timer);
        }
        self.pending_write = None;
        self.recv_buffer = None;
        self.write_queue.clear();
        self.fd_map.clear();
    }

    // ------------------------------------------------------------------
    // handshake
    // ------------------------------------------------------------------

    fn handshake_done(&mut self, ctx: &mut dyn LoopCtx) {
        if let Some(timer) = self.handshake_timer.take() {
            ctx.cancel_timer(timer);
        }
        self.phase = Phase::Active;
        debug!(role = ?self.role, "handshake complete");
        (self.on_ready)();
    }

    fn client_handshake_readable(&mut self, ctx: &mut dyn LoopCtx) {
        match self.phase {
            Phase::Opening => {
                warn!("client should not see readable before its hello is sent");
            }
            Phase::Finishing => {
                let parsed = match self.recv_buffer.as_mut() {
                    Some(buf) => self.framer.parse_server_handshake(buf.coalesce()),
                    None => return,
                };
                match parsed {
                    Err(e) => self.fail(e, true, ctx),
                    Ok(0) => {} // hello not complete yet
                    Ok(n) => {
                        self.consume_recv(n);
                        self.handshake_done(ctx);
                    }
                }
            }
            _ => {}
        }
    }

    fn server_handshake_readable(&mut self, ctx: &mut dyn LoopCtx) {
        match self.phase {
            Phase::Opening => {
                let parsed = match self.recv_buffer.as_mut() {
                    Some(buf) => self.framer.parse_client_handshake(buf.coalesce()),
                    None => return,
                };
                match parsed {
                    Err(e) => self.fail(e, true, ctx),
                    Ok(0) => {} // hello not complete yet
                    Ok(n) => {
                        self.consume_recv(n);
                        self.phase = Phase::Finishing;
                        self.handshake_timer =
                            Some(ctx.delay(HANDSHAKE_TIMEOUT, TimerKey::Handshake));
                        let hello = self.framer.format_server_handshake();
                        self.pending_write = Some(ChunkBuf::from_full(hello));
                        match self.drive_pending(ctx) {
                            Drain::Failed => {}
                            Drain::Blocked => ctx.watch_writable(),
                            Drain::Done => self.handshake_done(ctx),
                        }
                    }
                }
            }
            Phase::Finishing => {
                warn!("server should not see readable while writing its hello");
            }
            _ => {}
        }
    }

    fn client_handshake_writable(&mut self, ctx: &mut dyn LoopCtx) {
        match self.phase {
            Phase::Opening => {
                // hello fully written
                self.phase = Phase::Finishing;
                ctx.unwatch_writable();
                ctx.watch_readable();
            }
            Phase::Finishing => {
                warn!("client should not see writable while awaiting the server hello");
            }
            _ => {}
        }
    }

    fn server_handshake_writable(&mut self, ctx: &mut dyn LoopCtx) {
        match self.phase {
            Phase::Opening => {
                warn!("server should not see writable before the client hello");
            }
            Phase::Finishing => {
                ctx.unwatch_writable();
                self.handshake_done(ctx);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // receive path
    // ------------------------------------------------------------------

    /// Drains the fd into `recv_buffer`, concatenating chunks.
    fn fill_recv(&mut self, ctx: &mut dyn LoopCtx) {
        let mut tmp = [0u8; READ_CHUNK];
        let mut got: Option<ChunkBuf> = None;
        loop {
            match self.socket.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => {
                    got.get_or_insert_with(ChunkBuf::new)
                        .push(Bytes::copy_from_slice(&tmp[..n]));
                }
                Err(e) => {
                    if got.is_none() {
                        self.fail(e.into(), true, ctx);
                        return;
                    }
                    // keep what was read; the failure will resurface
                    break;
                }
            }
        }
        if let Some(chunks) = got {
            match self.recv_buffer.as_mut() {
                Some(buf) => buf.concat(chunks),
                None => self.recv_buffer = Some(chunks),
            }
        }
    }

    fn consume_recv(&mut self, n: usize) {
        if let Some(buf) = self.recv_buffer.as_mut() {
            buf.skip(n);
            if buf.is_empty() {
                self.recv_buffer = None;
            }
        }
    }

    /// Parses and dispatches frames until the framer needs more bytes, the
    /// buffer empties, or a failure clears it.
    fn feed_loop(&mut self, ctx: &mut dyn LoopCtx) {
        loop {
            let empty = match self.recv_buffer.as_ref() {
                None => return,
                Some(buf) => buf.is_empty(),
            };
            if empty {
                self.recv_buffer = None;
                return;
            }
            let parsed = match self.recv_buffer.as_mut() {
                Some(buf) => {
                    let bytes = buf.coalesce();
                    match self.role {
                        Role::Client => self.framer.client_feed(bytes),
                        Role::Server => self.framer.server_feed(bytes),
                    }
                }
                None => return,
            };
            match parsed {
                Err(e) => {
                    self.fail(e, true, ctx);
                    return;
                }
                Ok(None) => return, // need more bytes
                Ok(Some((frame, n))) => {
                    self.consume_recv(n);
                    self.dispatch_frame(frame, ctx);
                }
            }
        }
    }

    fn dispatch_frame(&mut self, frame: Frame, ctx: &mut dyn LoopCtx) {
        match frame {
            Frame::Psh { stream_id, data } => self.data_for_stream(stream_id, data),
            Frame::Syn { stream_id } => match self.role {
                Role::Server => self.syn_received(stream_id, ctx),
                Role::Client => debug!(stream_id, "dropping syn on client side"),
            },
            Frame::SynAck { stream_id } => match self.role {
                Role::Client => self.syn_received(stream_id, ctx),
                Role::Server => debug!(stream_id, "dropping syn-ack on server side"),
            },
            Frame::Fin { stream_id } => self.fin_received(stream_id),
            Frame::Rst { stream_id } => self.rst_received(stream_id, ctx),
            Frame::Keepalive { id, ack } => self.keepalive_received(id, ack, ctx),
            Frame::Error { message } => self.fail(StreamError::PeerError(message), false, ctx),
        }
    }

    fn data_for_stream(&mut self, stream_id: u32, data: Bytes) {
        match self.fd_map.get(&stream_id) {
            Some(fd) => fd.input_data(data),
            None => debug!(stream_id, "dropping data for unknown stream"),
        }
    }

    /// SYN on the server, SYN-ACK on the client.
    fn syn_received(&mut self, stream_id: u32, ctx: &mut dyn LoopCtx) {
        match self.role {
            Role::Client => {
                let Some(fd) = self.fd_map.get(&stream_id).cloned() else {
                    debug!(stream_id, "syn-ack for unknown stream");
                    return;
                };
                if fd.state() != StreamState::SynSent {
                    debug!(stream_id, state = ?fd.state(), "syn-ack in unexpected state");
                    return;
                }
                fd.set_state(StreamState::Established);
            }
            Role::Server => {
                if self.fd_map.contains_key(&stream_id) {
                    debug!(stream_id, "repeated syn for existing stream");
                    return;
                }
                let fd = self.new_stream(stream_id);
                if !(self.on_accept)(&fd) {
                    warn!(stream_id, "accept callback refused stream");
                    self.fail(StreamError::AcceptFailed(stream_id), true, ctx);
                    return;
                }
                fd.set_state(StreamState::Established);
                let msg = self.framer.format_syn_ack(stream_id);
                self.add_message_to_write(msg, ctx);
            }
        }
    }

    fn fin_received(&mut self, stream_id: u32) {
        let Some(fd) = self.fd_map.get(&stream_id).cloned() else {
            debug!(stream_id, "fin for unknown stream");
            return;
        };
        match fd.state() {
            StreamState::Idle => debug!(stream_id, "fin before syn"),
            StreamState::Dead => debug!(stream_id, "fin for dead stream"),
            StreamState::Established => fd.set_state(StreamState::FinRecv),
            _ => {
                fd.set_state(StreamState::Dead);
                self.remove_stream(stream_id);
            }
        }
    }

    fn rst_received(&mut self, stream_id: u32, ctx: &mut dyn LoopCtx) {
        let Some(fd) = self.fd_map.get(&stream_id).cloned() else {
            debug!(stream_id, "rst for unknown stream");
            return;
        };
        if fd.state() == StreamState::Dead {
            debug!(stream_id, "rst for dead stream");
            return;
        }
        fd.set_state(StreamState::Dead);
        fd.set_rst();
        self.remove_stream(stream_id);
        let msg = self.framer.format_rst(stream_id);
        self.push_message_to_write(msg, ctx);
    }

    fn keepalive_received(&mut self, kid: u64, ack: bool, ctx: &mut dyn LoopCtx) {
        if ack {
            match self.keepalive_pending.remove(&kid) {
                Some(timer) => {
                    ctx.cancel_timer(timer);
                    self.keepalive_success =
                        (self.keepalive_success + 1).min(KEEPALIVE_MAX_SUCCESS);
                    debug!(keepalive_id = kid, "keepalive acknowledged");
                }
                None => {
                    warn!(keepalive_id = kid, "keepalive timer already canceled or missing");
                }
            }
        } else {
            debug!(keepalive_id = kid, "answering peer keepalive");
            let msg = self.framer.format_keepalive(kid, true);
            self.push_message_to_write(msg, ctx);
        }
    }

    // ------------------------------------------------------------------
    // write engine
    // ------------------------------------------------------------------

    /// Pushes the pending buffer into the transport.
    fn drive_pending(&mut self, ctx: &mut dyn LoopCtx) -> Drain {
        let wrote = match self.pending_write.as_mut() {
            None => return Drain::Done,
            Some(pending) => {
                let chunk = pending.coalesce();
                self.socket.write(chunk)
            }
        };
        match wrote {
            Err(e) => {
                self.fail(e.into(), true, ctx);
                Drain::Failed
            }
            Ok(n) => match self.pending_write.as_mut() {
                None => Drain::Done,
                Some(pending) => {
                    pending.skip(n);
                    if pending.is_empty() {
                        self.pending_write = None;
                        Drain::Done
                    } else {
                        Drain::Blocked
                    }
                }
            },
        }
    }

    /// Appends a frame to the tail of the queue. Empty frames are
    /// discarded.
    fn add_message_to_write(&mut self, msg: Bytes, ctx: &mut dyn LoopCtx) {
        if msg.is_empty() {
            return;
        }
        self.write_queue.push_back(msg);
        ctx.watch_writable();
    }

    /// Inserts a frame at the head of the queue: RST replies, keepalive
    /// replies, and the final error frame only.
    fn push_message_to_write(&mut self, msg: Bytes, ctx: &mut dyn LoopCtx) {
        if msg.is_empty() {
            return;
        }
        self.write_queue.push_front(msg);
        ctx.watch_writable();
    }

    // ------------------------------------------------------------------
    // streams
    // ------------------------------------------------------------------

    fn ensure_tracked(&self, fd: &Rc<StreamedFd>) -> Result<()> {
        match self.fd_map.get(&fd.id()) {
            Some(existing) if Rc::ptr_eq(existing, fd) => Ok(()),
            _ => Err(StreamError::UnknownStream(fd.id())),
        }
    }

    /// Materializes a stream with its synthetic address pair: the stream id
    /// as a big-endian IPv4 address on the virtual end, the real ARQ-UDP
    /// address on the other.
    fn new_stream(&mut self, stream_id: u32) -> Rc<StreamedFd> {
        let virtual_ip = IpAddr::V4(Ipv4Addr::from(stream_id.to_be_bytes()));
        let virtual_port = match self.role {
            Role::Client => self.socket.local_addr().port(),
            Role::Server => self.socket.remote_addr().port(),
        };
        let virtual_addr = SocketAddr::new(virtual_ip, virtual_port);
        let (local, remote) = match self.role {
            Role::Client => (virtual_addr, self.socket.remote_addr()),
            Role::Server => (self.socket.local_addr(), virtual_addr),
        };
        let token = self.ready.borrow_mut().alloc_token();
        let fd = Rc::new(StreamedFd::new(
            stream_id,
            token,
            local,
            remote,
            self.ready.clone(),
        ));
        debug!(stream_id, %local, %remote, "new stream");
        self.fd_map.insert(stream_id, fd.clone());
        fd
    }

    fn remove_stream(&mut self, stream_id: u32) {
        if self.fd_map.remove(&stream_id).is_some() {
            debug!(stream_id, "stream removed");
        }
    }

    // ------------------------------------------------------------------
    // failure
    // ------------------------------------------------------------------

    /// The single terminal path. Idempotent.
    fn fail(&mut self, err: StreamError, send_rst: bool, ctx: &mut dyn LoopCtx) {
        if self.failed {
            return;
        }
        self.failed = true;
        error!(error = %err, role = ?self.role, "streamed transport failed");
        for fd in self.fd_map.values() {
            fd.set_state(StreamState::Dead);
        }
        self.phase = Phase::Invalid;
        self.recv_buffer = None;
        if send_rst {
            let msg = self.framer.format_error(&err.to_string());
            self.push_message_to_write(msg, ctx);
            // give the transport a chance to deliver the final bytes
            ctx.delay(FAIL_NOTIFY_DELAY, TimerKey::InvalidNotify);
        } else {
            (self.on_invalid)();
        }
    }
}
