//! Deterministic driver for end-to-end tests: a virtual clock, a timer
//! queue, interest flags standing in for a selector, and an in-memory
//! datagram pipe with programmable loss.

#![allow(dead_code)]

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use muxd_arq::{ArqConfig, ArqUdpSocket};
use muxd_stream::{
    shared_ready_set, BinaryFramer, Frame, Framer, ListenerSlot, LoopCtx, Result, Role,
    StreamedFd, StreamedHandler, StreamedListener, TimerId, TimerKey,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CONV: u32 = 99;

pub fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("addr")
}

// ----------------------------------------------------------------------
// loop context
// ----------------------------------------------------------------------

struct TimerEntry {
    id: TimerId,
    key: TimerKey,
    fire_at: u64,
    canceled: bool,
}

/// One endpoint's view of its event loop.
pub struct TestCtx {
    pub read_interest: bool,
    pub write_interest: bool,
    pub now: u64,
    next_timer: u64,
    timers: Vec<TimerEntry>,
}

impl TestCtx {
    fn new() -> Self {
        Self {
            read_interest: false,
            write_interest: false,
            now: 0,
            next_timer: 0,
            timers: Vec::new(),
        }
    }

    /// Removes and returns the keys of every timer due at `now`.
    fn take_due(&mut self, now: u64) -> Vec<TimerKey> {
        let mut due: Vec<(u64, TimerId, TimerKey)> = self
            .timers
            .iter()
            .filter(|t| !t.canceled && t.fire_at <= now)
            .map(|t| (t.fire_at, t.id, t.key))
            .collect();
        due.sort_by_key(|(at, id, _)| (*at, id.0));
        self.timers.retain(|t| t.canceled || t.fire_at > now);
        due.into_iter().map(|(_, _, key)| key).collect()
    }
}

impl LoopCtx for TestCtx {
    fn watch_readable(&mut self) {
        self.read_interest = true;
    }

    fn watch_writable(&mut self) {
        self.write_interest = true;
    }

    fn unwatch_writable(&mut self) {
        self.write_interest = false;
    }

    fn delay(&mut self, after: Duration, key: TimerKey) -> TimerId {
        self.next_timer += 1;
        let id = TimerId(self.next_timer);
        self.timers.push(TimerEntry {
            id,
            key,
            fire_at: self.now + after.as_millis() as u64,
            canceled: false,
        });
        id
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        for t in &mut self.timers {
            if t.id == timer {
                t.canceled = true;
            }
        }
    }
}

// ----------------------------------------------------------------------
// frame accounting
// ----------------------------------------------------------------------

/// Counts the frames an endpoint formats, for wire-level assertions.
#[derive(Debug, Default)]
pub struct FrameCounts {
    pub syn: Cell<u32>,
    pub syn_ack: Cell<u32>,
    pub psh: Cell<u32>,
    pub fin: Cell<u32>,
    pub rst: Cell<u32>,
    pub keepalive: Cell<u32>,
    pub error: Cell<u32>,
}

struct CountingFramer {
    inner: BinaryFramer,
    counts: Rc<FrameCounts>,
}

impl Framer for CountingFramer {
    fn format_client_handshake(&mut self) -> Bytes {
        self.inner.format_client_handshake()
    }

    fn format_server_handshake(&mut self) -> Bytes {
        self.inner.format_server_handshake()
    }

    fn parse_client_handshake(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.parse_client_handshake(buf)
    }

    fn parse_server_handshake(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.parse_server_handshake(buf)
    }

    fn format_syn(&mut self, stream_id: u32) -> Bytes {
        self.counts.syn.set(self.counts.syn.get() + 1);
        self.inner.format_syn(stream_id)
    }

    fn format_syn_ack(&mut self, stream_id: u32) -> Bytes {
        self.counts.syn_ack.set(self.counts.syn_ack.get() + 1);
        self.inner.format_syn_ack(stream_id)
    }

    fn format_psh(&mut self, stream_id: u32, data: Bytes) -> Bytes {
        self.counts.psh.set(self.counts.psh.get() + 1);
        self.inner.format_psh(stream_id, data)
    }

    fn format_fin(&mut self, stream_id: u32) -> Bytes {
        self.counts.fin.set(self.counts.fin.get() + 1);
        self.inner.format_fin(stream_id)
    }

    fn format_rst(&mut self, stream_id: u32) -> Bytes {
        self.counts.rst.set(self.counts.rst.get() + 1);
        self.inner.format_rst(stream_id)
    }

    fn format_keepalive(&mut self, id: u64, ack: bool) -> Bytes {
        self.counts.keepalive.set(self.counts.keepalive.get() + 1);
        self.inner.format_keepalive(id, ack)
    }

    fn format_error(&mut self, message: &str) -> Bytes {
        self.counts.error.set(self.counts.error.get() + 1);
        self.inner.format_error(message)
    }

    fn client_feed(&mut self, buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        self.inner.client_feed(buf)
    }

    fn server_feed(&mut self, buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        self.inner.server_feed(buf)
    }

    fn next_stream_id(&mut self) -> u32 {
        self.inner.next_stream_id()
    }
}

// ----------------------------------------------------------------------
// the harness
// ----------------------------------------------------------------------

pub struct Endpoint {
    pub handler: StreamedHandler,
    pub ctx: TestCtx,
    pub counts: Rc<FrameCounts>,
    pub ready_calls: Rc<Cell<u32>>,
    pub invalid_calls: Rc<Cell<u32>>,
}

/// Two endpoints joined by an in-memory datagram pipe.
pub struct Harness {
    pub now: u64,
    pub client: Endpoint,
    pub server: Endpoint,
    pub listener: Rc<StreamedListener>,
    pub refuse_accepts: Rc<Cell<bool>>,

    /// Drop everything server -> client.
    pub drop_to_client: bool,
    /// Drop everything client -> server.
    pub drop_to_server: bool,
    /// Drop everything, both directions.
    pub paused: bool,
    /// Per-datagram loss probability, both directions.
    pub loss: f64,
    rng: StdRng,
}

fn endpoint(role: Role, local: SocketAddr, remote: SocketAddr) -> Endpoint {
    let socket = ArqUdpSocket::new(CONV, local, remote, ArqConfig::default()).expect("socket");
    let counts: Rc<FrameCounts> = Rc::default();
    let framer = CountingFramer {
        inner: BinaryFramer::new(),
        counts: counts.clone(),
    };
    let mut handler = StreamedHandler::new(role, socket, Box::new(framer), shared_ready_set());

    let ready_calls: Rc<Cell<u32>> = Rc::default();
    let invalid_calls: Rc<Cell<u32>> = Rc::default();
    let seen = ready_calls.clone();
    handler.set_ready_callback(move || seen.set(seen.get() + 1));
    let seen = invalid_calls.clone();
    handler.set_invalid_callback(move || seen.set(seen.get() + 1));

    Endpoint {
        handler,
        ctx: TestCtx::new(),
        counts,
        ready_calls,
        invalid_calls,
    }
}

impl Harness {
    pub fn new() -> Self {
        let client = endpoint(Role::Client, addr(4000), addr(5000));
        let mut server = endpoint(Role::Server, addr(5000), addr(4000));

        let slot = ListenerSlot::new();
        let listener =
            StreamedListener::listen(&slot, addr(5000), shared_ready_set()).expect("listen");
        let refuse_accepts: Rc<Cell<bool>> = Rc::default();

        let hook_listener = listener.clone();
        let hook_refuse = refuse_accepts.clone();
        server
            .handler
            .set_accept_callback(move |fd: &Rc<StreamedFd>| {
                if hook_refuse.get() {
                    return false;
                }
                hook_listener.accepted(fd.clone());
                true
            });
        // the server registers with read interest from the start
        server.ctx.read_interest = true;

        Self {
            now: 0,
            client,
            server,
            listener,
            refuse_accepts,
            drop_to_client: false,
            drop_to_server: false,
            paused: false,
            loss: 0.0,
            rng: StdRng::seed_from_u64(0x6d757864),
        }
    }

    /// Fires the client's `connected` event; traffic flows from here on.
    pub fn start(&mut self) {
        self.client.ctx.now = self.now;
        self.client.handler.connected(&mut self.client.ctx);
    }

    /// Runs both endpoints `ms` virtual milliseconds forward.
    pub fn run_ms(&mut self, ms: u64) {
        for _ in 0..ms {
            self.step();
        }
    }

    fn step(&mut self) {
        self.now += 1;
        self.client.ctx.now = self.now;
        self.server.ctx.now = self.now;

        for key in self.client.ctx.take_due(self.now) {
            self.client.handler.timer_fired(key, &mut self.client.ctx);
        }
        for key in self.server.ctx.take_due(self.now) {
            self.server.handler.timer_fired(key, &mut self.server.ctx);
        }

        if self.now % 10 == 0 {
            self.client.handler.tick(self.now, &mut self.client.ctx);
            self.server.handler.tick(self.now, &mut self.server.ctx);
        }

        // pump datagrams and readiness until quiescent
        for _ in 0..8 {
            let mut progressed = self.transfer();
            progressed |= Self::dispatch(&mut self.client);
            progressed |= Self::dispatch(&mut self.server);
            if !progressed {
                break;
            }
        }
    }

    fn transfer(&mut self) -> bool {
        let mut moved = false;
        while let Some(d) = self.client.handler.poll_datagram() {
            moved = true;
            if self.paused || self.drop_to_server || self.rng.gen_bool(self.loss) {
                continue;
            }
            self.server
                .handler
                .datagram_received(&d, &mut self.server.ctx);
        }
        while let Some(d) = self.server.handler.poll_datagram() {
            moved = true;
            if self.paused || self.drop_to_client || self.rng.gen_bool(self.loss) {
                continue;
            }
            self.client
                .handler
                .datagram_received(&d, &mut self.client.ctx);
        }
        moved
    }

    fn dispatch(ep: &mut Endpoint) -> bool {
        let mut progressed = false;
        if ep.ctx.read_interest && ep.handler.socket().can_read() {
            ep.handler.readable(&mut ep.ctx);
            progressed = true;
        }
        if ep.ctx.write_interest && ep.handler.socket().can_write() {
            ep.handler.writable(&mut ep.ctx);
            progressed = true;
        }
        progressed
    }

    /// Starts and runs the handshake to completion.
    pub fn establish(&mut self) {
        self.start();
        self.run_ms(300);
        assert!(self.client.handler.phase() == muxd_stream::Phase::Active);
        assert!(self.server.handler.phase() == muxd_stream::Phase::Active);
    }

    /// Opens a client stream, completes SYN / SYN-ACK, and returns both
    /// ends.
    pub fn open_stream(&mut self) -> (Rc<StreamedFd>, Rc<StreamedFd>) {
        let client_fd = self.client.handler.open().expect("open");
        self.client
            .handler
            .send_syn(&client_fd, &mut self.client.ctx)
            .expect("send_syn");
        self.run_ms(100);
        let server_fd = self
            .listener
            .accept()
            .expect("accept")
            .expect("accepted stream");
        (client_fd, server_fd)
    }
}
