//! Handshake establishment and timeout behavior, end to end over the ARQ
//! transport.

mod common;

use common::Harness;
use muxd_stream::Phase;

#[test]
fn handshake_completes_and_fires_ready_once() {
    let mut h = Harness::new();
    h.start();
    h.run_ms(300);

    assert_eq!(h.client.handler.phase(), Phase::Active);
    assert_eq!(h.server.handler.phase(), Phase::Active);
    assert_eq!(h.client.ready_calls.get(), 1);
    assert_eq!(h.server.ready_calls.get(), 1);

    // nothing re-fires later
    h.run_ms(1000);
    assert_eq!(h.client.ready_calls.get(), 1);
    assert_eq!(h.server.ready_calls.get(), 1);
    assert_eq!(h.client.invalid_calls.get(), 0);
    assert_eq!(h.server.invalid_calls.get(), 0);
}

#[test]
fn handshake_completes_despite_datagram_loss() {
    let mut h = Harness::new();
    h.loss = 0.25;
    h.start();
    h.run_ms(4000);

    assert_eq!(h.client.handler.phase(), Phase::Active);
    assert_eq!(h.server.handler.phase(), Phase::Active);
    assert_eq!(h.client.ready_calls.get(), 1);
    assert_eq!(h.server.ready_calls.get(), 1);
}

#[test]
fn client_times_out_when_server_hello_never_arrives() {
    let mut h = Harness::new();
    h.drop_to_client = true;
    h.start();

    // just before the deadline nothing has happened yet
    h.run_ms(4900);
    assert!(!h.client.handler.is_failed());

    h.run_ms(200);
    assert!(h.client.handler.is_failed());
    assert_eq!(h.client.handler.phase(), Phase::Invalid);
    assert_eq!(h.client.ready_calls.get(), 0);
    // the invalid notification waits out the grace period
    assert_eq!(h.client.invalid_calls.get(), 0);

    h.run_ms(1100);
    assert_eq!(h.client.invalid_calls.get(), 1);
    // failing twice is impossible
    h.run_ms(2000);
    assert_eq!(h.client.invalid_calls.get(), 1);
}
