//! Stream lifecycle scenarios: open/echo, graceful close, reset, refused
//! accept, and bulk transfer under window pressure.

mod common;

use common::Harness;
use muxd_stream::{StreamError, StreamRead, StreamState};

fn read_all(fd: &muxd_stream::StreamedFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match fd.read(&mut buf) {
            Ok(StreamRead::Data(n)) => out.extend_from_slice(&buf[..n]),
            Ok(StreamRead::WouldBlock) | Ok(StreamRead::Eof) => break,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
    out
}

#[test]
fn open_and_echo() {
    let mut h = Harness::new();
    h.establish();

    let (client_fd, server_fd) = h.open_stream();
    assert_eq!(client_fd.id(), 1);
    assert_eq!(client_fd.state(), StreamState::Established);
    assert_eq!(server_fd.state(), StreamState::Established);

    let n = h
        .client
        .handler
        .send(&client_fd, b"ping", &mut h.client.ctx)
        .expect("send");
    assert_eq!(n, 4);
    h.run_ms(100);

    assert_eq!(read_all(&server_fd), b"ping");

    // echo it back
    h.server
        .handler
        .send(&server_fd, b"ping", &mut h.server.ctx)
        .expect("send");
    h.run_ms(100);
    assert_eq!(read_all(&client_fd), b"ping");

    // exactly one SYN and one PSH from the client, one SYN-ACK and one
    // PSH from the server
    assert_eq!(h.client.counts.syn.get(), 1);
    assert_eq!(h.client.counts.psh.get(), 1);
    assert_eq!(h.client.counts.fin.get(), 0);
    assert_eq!(h.client.counts.rst.get(), 0);
    assert_eq!(h.server.counts.syn_ack.get(), 1);
    assert_eq!(h.server.counts.psh.get(), 1);
}

#[test]
fn graceful_close_both_ways() {
    let mut h = Harness::new();
    h.establish();
    let (client_fd, server_fd) = h.open_stream();

    h.client
        .handler
        .send(&client_fd, b"ping", &mut h.client.ctx)
        .expect("send");
    h.run_ms(100);

    // client half-closes
    h.client
        .handler
        .send_fin(&client_fd, &mut h.client.ctx)
        .expect("send_fin");
    assert_eq!(client_fd.state(), StreamState::FinSent);
    h.run_ms(100);

    assert_eq!(server_fd.state(), StreamState::FinRecv);
    // the application drains the data, then sees EOF
    assert_eq!(read_all(&server_fd), b"ping");
    let mut buf = [0u8; 8];
    assert_eq!(server_fd.read(&mut buf).expect("read"), StreamRead::Eof);

    // server closes its side; both ends die and leave the maps
    h.server
        .handler
        .send_fin(&server_fd, &mut h.server.ctx)
        .expect("send_fin");
    assert_eq!(server_fd.state(), StreamState::Dead);
    assert!(h.server.handler.stream(server_fd.id()).is_none());
    h.run_ms(100);

    assert_eq!(client_fd.state(), StreamState::Dead);
    assert!(h.client.handler.stream(client_fd.id()).is_none());
    assert_eq!(h.client.counts.fin.get(), 1);
    assert_eq!(h.server.counts.fin.get(), 1);
}

#[test]
fn rst_round_trip() {
    let mut h = Harness::new();
    h.establish();
    let (client_fd, server_fd) = h.open_stream();

    // the server aborts the stream
    h.server
        .handler
        .send_rst(&server_fd, &mut h.server.ctx)
        .expect("send_rst");
    assert_eq!(server_fd.state(), StreamState::Dead);
    assert!(h.server.handler.stream(server_fd.id()).is_none());
    h.run_ms(100);

    // the client observes the reset and answers with its own RST
    assert_eq!(client_fd.state(), StreamState::Dead);
    assert!(client_fd.is_reset());
    assert!(h.client.handler.stream(client_fd.id()).is_none());
    assert_eq!(h.client.counts.rst.get(), 1);

    // the reset surfaces on read exactly once, then EOF
    let mut buf = [0u8; 8];
    assert!(matches!(
        client_fd.read(&mut buf),
        Err(StreamError::ConnectionReset)
    ));
    assert_eq!(client_fd.read(&mut buf).expect("read"), StreamRead::Eof);

    // neither handler failed over a single stream reset
    assert!(!h.client.handler.is_failed());
    assert!(!h.server.handler.is_failed());
    h.run_ms(500);
    assert_eq!(h.client.invalid_calls.get(), 0);
    assert_eq!(h.server.invalid_calls.get(), 0);
}

#[test]
fn refused_accept_tears_the_connection_down() {
    let mut h = Harness::new();
    h.establish();
    h.refuse_accepts.set(true);

    let client_fd = h.client.handler.open().expect("open");
    h.client
        .handler
        .send_syn(&client_fd, &mut h.client.ctx)
        .expect("send_syn");
    h.run_ms(100);

    // the server failed and pushed its error report ahead of everything
    assert!(h.server.handler.is_failed());
    assert_eq!(h.server.counts.error.get(), 1);
    assert_eq!(h.server.invalid_calls.get(), 0);

    // the error frame reaches the client, which fails without a grace
    // period of its own
    assert_eq!(h.client.invalid_calls.get(), 1);
    assert!(h.client.handler.is_failed());
    assert_eq!(client_fd.state(), StreamState::Dead);

    // the server's invalid callback fires after the grace period
    h.run_ms(1100);
    assert_eq!(h.server.invalid_calls.get(), 1);
    h.run_ms(1000);
    assert_eq!(h.server.invalid_calls.get(), 1);
}

#[test]
fn bulk_transfer_under_window_pressure() {
    let mut h = Harness::new();
    h.establish();
    let (client_fd, server_fd) = h.open_stream();

    let mut sent = Vec::new();
    for i in 0..15u32 {
        let chunk: Vec<u8> = (0..2048).map(|j| (i as usize + j) as u8).collect();
        let n = h
            .client
            .handler
            .send(&client_fd, &chunk, &mut h.client.ctx)
            .expect("send");
        assert_eq!(n, chunk.len());
        sent.extend_from_slice(&chunk);
        h.run_ms(20);
    }
    h.run_ms(2000);

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match server_fd.read(&mut buf).expect("read") {
            StreamRead::Data(n) => received.extend_from_slice(&buf[..n]),
            _ => break,
        }
    }
    assert_eq!(received.len(), sent.len());
    assert_eq!(received, sent);
}
