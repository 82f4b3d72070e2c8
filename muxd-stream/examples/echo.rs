//! Two in-process endpoints over an in-memory datagram pipe: handshake,
//! one stream, an echo, and a graceful close.
//!
//! ```sh
//! cargo run --example echo
//! ```

use std::time::Duration;

use muxd_arq::{ArqConfig, ArqUdpSocket};
use muxd_stream::{
    shared_ready_set, BinaryFramer, ListenerSlot, LoopCtx, Role, StreamRead, StreamedHandler,
    StreamedListener, TimerId, TimerKey,
};
use tracing::info;

/// A minimal single-endpoint loop state: interest flags plus a timer list.
#[derive(Default)]
struct MiniLoop {
    read_interest: bool,
    write_interest: bool,
    now: u64,
    next_timer: u64,
    timers: Vec<(TimerId, TimerKey, u64, bool)>,
}

impl MiniLoop {
    fn take_due(&mut self, now: u64) -> Vec<TimerKey> {
        let due: Vec<TimerKey> = self
            .timers
            .iter()
            .filter(|(_, _, at, canceled)| !canceled && *at <= now)
            .map(|(_, key, _, _)| *key)
            .collect();
        self.timers.retain(|(_, _, at, canceled)| *canceled || *at > now);
        due
    }
}

impl LoopCtx for MiniLoop {
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
        self.timers
            .push((id, key, self.now + after.as_millis() as u64, false));
        id
    }
    fn cancel_timer(&mut self, timer: TimerId) {
        for t in &mut self.timers {
            if t.0 == timer {
                t.3 = true;
            }
        }
    }
}

fn pump(
    now: u64,
    a: (&mut StreamedHandler, &mut MiniLoop),
    b: (&mut StreamedHandler, &mut MiniLoop),
) {
    let (client, client_loop) = a;
    let (server, server_loop) = b;
    client_loop.now = now;
    server_loop.now = now;
    for key in client_loop.take_due(now) {
        client.timer_fired(key, client_loop);
    }
    for key in server_loop.take_due(now) {
        server.timer_fired(key, server_loop);
    }
    if now % 10 == 0 {
        client.tick(now, client_loop);
        server.tick(now, server_loop);
    }
    for _ in 0..4 {
        let mut moved = false;
        while let Some(d) = client.poll_datagram() {
            server.datagram_received(&d, server_loop);
            moved = true;
        }
        while let Some(d) = server.poll_datagram() {
            client.datagram_received(&d, client_loop);
            moved = true;
        }
        for (h, l) in [(&mut *client, &mut *client_loop), (&mut *server, &mut *server_loop)] {
            if l.read_interest && h.socket().can_read() {
                h.readable(l);
                moved = true;
            }
            if l.write_interest && h.socket().can_write() {
                h.writable(l);
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let client_addr = "127.0.0.1:4000".parse().expect("addr");
    let server_addr = "127.0.0.1:5000".parse().expect("addr");

    let mut client = StreamedHandler::new(
        Role::Client,
        ArqUdpSocket::new(7, client_addr, server_addr, ArqConfig::default()).expect("socket"),
        Box::new(BinaryFramer::new()),
        shared_ready_set(),
    );
    let mut server = StreamedHandler::new(
        Role::Server,
        ArqUdpSocket::new(7, server_addr, client_addr, ArqConfig::default()).expect("socket"),
        Box::new(BinaryFramer::new()),
        shared_ready_set(),
    );

    let slot = ListenerSlot::new();
    let listener = StreamedListener::listen(&slot, server_addr, shared_ready_set()).expect("listen");
    let hook = listener.clone();
    server.set_accept_callback(move |fd| {
        hook.accepted(fd.clone());
        true
    });
    server.set_ready_callback(|| info!("server: handshake complete"));
    client.set_ready_callback(|| info!("client: handshake complete"));

    let mut client_loop = MiniLoop::default();
    let mut server_loop = MiniLoop {
        read_interest: true,
        ..Default::default()
    };

    let mut now = 0u64;
    client.connected(&mut client_loop);
    for _ in 0..100 {
        now += 1;
        pump(now, (&mut client, &mut client_loop), (&mut server, &mut server_loop));
    }

    let stream = client.open().expect("open stream");
    client.send_syn(&stream, &mut client_loop).expect("send_syn");
    for _ in 0..50 {
        now += 1;
        pump(now, (&mut client, &mut client_loop), (&mut server, &mut server_loop));
    }

    let accepted = listener.accept().expect("accept").expect("stream");
    info!(stream_id = accepted.id(), "server accepted stream");

    client.send(&stream, b"hello, muxd", &mut client_loop).expect("send");
    for _ in 0..50 {
        now += 1;
        pump(now, (&mut client, &mut client_loop), (&mut server, &mut server_loop));
    }

    let mut buf = [0u8; 64];
    if let StreamRead::Data(n) = accepted.read(&mut buf).expect("read") {
        info!(payload = %String::from_utf8_lossy(&buf[..n]), "server received");
        server.send(&accepted, &buf[..n], &mut server_loop).expect("send");
    }
    for _ in 0..50 {
        now += 1;
        pump(now, (&mut client, &mut client_loop), (&mut server, &mut server_loop));
    }

    if let StreamRead::Data(n) = stream.read(&mut buf).expect("read") {
        info!(payload = %String::from_utf8_lossy(&buf[..n]), "client echoed back");
    }

    client.send_fin(&stream, &mut client_loop).expect("send_fin");
    for _ in 0..50 {
        now += 1;
        pump(now, (&mut client, &mut client_loop), (&mut server, &mut server_loop));
    }
    info!(state = ?accepted.state(), "server stream after client fin");
}
