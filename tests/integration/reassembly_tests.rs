//! Inbound framing through `GatewayTransport::on_fragment`.

use core::time::Duration;
use std::sync::Arc;

use gatelink::config::TransportConfig;
use gatelink::transport::protocol::{ACK_MARKER, CANCEL_MARKER, END_MARKER, START_MARKER};
use gatelink::transport::worker::{self, CommandOutcome};

use crate::mocks::{Harness, RecordingHandler, documents};

fn harness_with_recorder(cfg: TransportConfig) -> (Harness, Arc<RecordingHandler>) {
    let h = Harness::with_config(cfg);
    h.connect_with_mtu(247);
    let handler = Arc::new(RecordingHandler::default());
    h.transport.register_handler(handler.clone());
    h.link.take_sent();
    (h, handler)
}

fn drain(h: &Harness) -> usize {
    let mut n = 0;
    while worker::process_next(&h.transport, Duration::ZERO).is_some() {
        n += 1;
    }
    n
}

#[test]
fn fragmented_command_reaches_handler_intact() {
    let (h, handler) = harness_with_recorder(TransportConfig::default());
    let payload = br#"{"type":"read_registers","slave":3,"start":40001,"count":12}"#;

    h.write_command(payload, 7);

    assert_eq!(h.transport.queue_len(), 1);
    assert_eq!(
        worker::process_next(&h.transport, Duration::ZERO),
        Some(CommandOutcome::Handled)
    );
    let seen = handler.commands.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["slave"], 3);
    assert_eq!(seen[0]["count"], 12);
}

#[test]
fn restart_mid_command_drops_partial() {
    let (h, handler) = harness_with_recorder(TransportConfig::default());

    h.transport.on_fragment(START_MARKER);
    h.transport.on_fragment(br#"{"type":"half"#);
    h.write_command(br#"{"type":"whole"}"#, 4);

    assert_eq!(drain(&h), 1);
    assert_eq!(handler.commands.lock()[0]["type"], "whole");
}

#[test]
fn stale_partial_cleared_before_next_fragment() {
    let (h, handler) = harness_with_recorder(TransportConfig::default());

    h.transport.on_fragment(br#"{"type":"stale","x":"#);
    h.clock.advance(5_001);
    h.transport.on_fragment(br#"{"type":"fresh"}"#);
    h.transport.on_fragment(END_MARKER);

    assert_eq!(drain(&h), 1);
    assert_eq!(handler.commands.lock()[0]["type"], "fresh");
    assert_eq!(h.transport.metrics().unwrap().stale_clears, 1);
}

#[test]
fn idle_exactly_at_timeout_is_kept() {
    let (h, handler) = harness_with_recorder(TransportConfig::default());

    h.transport.on_fragment(br#"{"type":"#);
    h.clock.advance(5_000);
    h.transport.on_fragment(br#""slow"}"#);
    h.transport.on_fragment(END_MARKER);

    assert_eq!(drain(&h), 1);
    assert_eq!(handler.commands.lock()[0]["type"], "slow");
    assert_eq!(h.transport.metrics().unwrap().stale_clears, 0);
}

#[test]
fn overflow_reports_once_and_dispatches_nothing() {
    let cfg = TransportConfig {
        reassembly_capacity: 64,
        ..TransportConfig::default()
    };
    let (h, handler) = harness_with_recorder(cfg);

    let oversized = format!(r#"{{"type":"write","data":"{}"}}"#, "A".repeat(80));
    h.write_command(oversized.as_bytes(), 10);

    // The callback only records the failure; the worker reports it.
    assert_eq!(h.transport.queue_len(), 0);
    assert!(h.link.sent().is_empty());
    assert_eq!(drain(&h), 0);
    assert!(handler.commands.lock().is_empty());

    let docs = documents(&h.link.sent());
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["status"], "error");
    assert_eq!(docs[0]["type"], "parse");
    assert_eq!(docs[0]["config"], serde_json::json!([]));

    let m = h.transport.metrics().unwrap();
    assert_eq!(m.framing_errors, 1);
    assert_eq!(m.commands_queued, 0);

    // The link recovers for the next command.
    h.write_command(br#"{"type":"ping"}"#, 10);
    assert_eq!(drain(&h), 1);
}

#[test]
fn overflow_during_stream_does_not_block_callback() {
    let cfg = TransportConfig {
        reassembly_capacity: 64,
        ..TransportConfig::default()
    };
    let (h, _handler) = harness_with_recorder(cfg);
    h.link.set_notify_delay(40);
    let doc = serde_json::json!({"type": "get_config", "data": "x".repeat(2_000)});

    let transport = Arc::clone(&h.transport);
    let reply = doc.clone();
    let streaming = std::thread::spawn(move || transport.send_response(&reply));
    std::thread::sleep(Duration::from_millis(60));

    let started = std::time::Instant::now();
    h.transport.on_fragment(START_MARKER);
    h.transport.on_fragment(&[b'A'; 80]);
    assert!(started.elapsed() < Duration::from_millis(100));

    assert!(streaming.join().unwrap().is_ok());
    h.link.set_notify_delay(0);
    assert!(worker::process_next(&h.transport, Duration::ZERO).is_none());

    let docs = documents(&h.link.sent());
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0], doc);
    assert_eq!(docs[1]["message"], "Command too large");
    assert_eq!(docs[1]["type"], "parse");
}

#[test]
fn empty_command_is_ignored() {
    let (h, handler) = harness_with_recorder(TransportConfig::default());

    h.transport.on_fragment(START_MARKER);
    h.transport.on_fragment(END_MARKER);
    h.transport.on_fragment(END_MARKER);

    assert_eq!(h.transport.queue_len(), 0);
    assert!(handler.commands.lock().is_empty());
    assert!(h.link.sent().is_empty());
}

#[test]
fn cancel_clears_partial_and_acknowledges() {
    let (h, _handler) = harness_with_recorder(TransportConfig::default());

    h.transport.on_fragment(START_MARKER);
    h.transport.on_fragment(br#"{"type":"#);
    h.transport.on_fragment(CANCEL_MARKER);
    h.transport.on_fragment(END_MARKER);

    assert_eq!(h.link.sent(), vec![ACK_MARKER.to_vec()]);
    assert_eq!(h.transport.queue_len(), 0);
    assert!(h.transport.cancel_token().is_cancelled());
}

#[test]
fn marker_inside_payload_is_data() {
    let (h, handler) = harness_with_recorder(TransportConfig::default());

    h.transport.on_fragment(START_MARKER);
    h.transport.on_fragment(br#"{"type":"<END>"}"#);
    h.transport.on_fragment(END_MARKER);

    assert_eq!(drain(&h), 1);
    assert_eq!(handler.commands.lock()[0]["type"], "<END>");
}

#[test]
fn inbound_counters_track_fragments() {
    let (h, _handler) = harness_with_recorder(TransportConfig::default());
    let payload = br#"{"type":"x"}"#;

    h.write_command(payload, 4);

    let m = h.transport.metrics().unwrap();
    // <START> + 3 payload writes + <END>
    assert_eq!(m.fragments_received, 5);
    assert_eq!(
        m.bytes_received as usize,
        START_MARKER.len() + payload.len() + END_MARKER.len()
    );
    assert_eq!(m.commands_queued, 1);
}
