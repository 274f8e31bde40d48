//! Connect/disconnect handling, link events, streaming and metrics
//! publication.

use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use gatelink::events::{self, Event};
use gatelink::transport::monitor;
use gatelink::transport::negotiation::LinkState;
use gatelink::transport::protocol::{END_MARKER, START_MARKER};
use gatelink::transport::stream;
use gatelink::transport::worker;
use serde_json::json;

use crate::mocks::{Harness, QueueTelemetry, RecordingHandler, RecordingSink, documents};

#[test]
fn connect_resets_counters() {
    let h = Harness::new();
    h.connect_with_mtu(247);
    h.write_command(br#"{"type":"a"}"#, 4);
    assert_eq!(h.transport.metrics().unwrap().commands_queued, 1);

    h.disconnect();
    h.connect_with_mtu(247);

    let m = h.transport.metrics().unwrap();
    assert_eq!(m.commands_queued, 0);
    assert_eq!(m.fragments_received, 0);
    assert_eq!(m.negotiated_mtu, 247);
}

#[test]
fn disconnect_discards_partial_command() {
    let h = Harness::new();
    h.connect_with_mtu(247);
    h.transport.on_fragment(START_MARKER);
    h.transport.on_fragment(br#"{"type":"unfinished"#);

    h.disconnect();
    h.transport.on_fragment(br#"{"type":"next"}"#);
    h.transport.on_fragment(END_MARKER);

    assert_eq!(h.transport.queue_len(), 1);
    assert_eq!(h.link.adverts.load(Ordering::Relaxed), 1);
}

#[test]
fn writes_before_connect_handling_survive() {
    let h = Harness::new();
    h.link.grant_mtu(Some(247));
    h.link.connect(23);
    h.transport.on_link_up();

    // The peer starts writing before the main loop handles the connect.
    h.transport.on_fragment(START_MARKER);
    h.transport.on_fragment(br#"{"type":"#);
    h.transport.on_connect();
    h.transport.on_fragment(br#""early"}"#);
    h.transport.on_fragment(END_MARKER);

    assert_eq!(h.transport.queue_len(), 1);
    let m = h.transport.metrics().unwrap();
    assert_eq!(m.fragments_received, 4);
    assert_eq!(m.commands_queued, 1);
}

#[test]
fn link_up_drops_previous_peer_state() {
    let h = Harness::new();
    h.connect_with_mtu(247);
    h.transport.on_fragment(START_MARKER);
    h.transport.on_fragment(br#"{"type":"half"#);
    h.link.disconnect();

    // Disconnect event lost; the next link-up still starts clean.
    h.link.connect(23);
    h.transport.on_link_up();
    h.transport.on_fragment(br#"{"type":"next"}"#);
    h.transport.on_fragment(END_MARKER);
    assert_eq!(h.transport.metrics().unwrap().fragments_received, 2);

    let handler = Arc::new(RecordingHandler::default());
    h.transport.register_handler(handler.clone());
    worker::process_next(&h.transport, Duration::ZERO);
    assert_eq!(*handler.commands.lock(), vec![json!({"type": "next"})]);
}

#[test]
fn disconnect_stops_streaming() {
    let h = Harness::new();
    h.connect_with_mtu(247);
    assert!(h.transport.enable_streaming());
    assert!(h.transport.is_streaming());

    h.disconnect();

    assert!(!h.transport.is_streaming());
}

#[test]
fn link_events_route_to_lifecycle() {
    let h = Harness::new();
    h.link.grant_mtu(None);
    h.link.connect(23);

    events::route(Event::LinkConnected, &h.transport);
    assert!(h.transport.link_state().unwrap().is_negotiating());

    h.link.set_mtu(247);
    events::route(Event::MtuUpdated, &h.transport);
    assert_eq!(h.transport.link_state(), Some(LinkState::Completed { mtu: 247 }));

    h.link.disconnect();
    events::route(Event::LinkDisconnected, &h.transport);
    assert_eq!(h.transport.link_state(), Some(LinkState::Idle));
    assert_eq!(h.link.adverts.load(Ordering::Relaxed), 1);
}

#[test]
fn streamer_forwards_only_while_enabled() {
    let h = Harness::new();
    h.connect_with_mtu(247);
    h.link.take_sent();
    let source = QueueTelemetry::default();
    source.docs.lock().extend([
        json!({"type": "telemetry", "slave": 1, "reg": 40001, "value": 17}),
        json!({"type": "telemetry", "slave": 2, "reg": 40002, "value": 99}),
    ]);

    assert_eq!(stream::pump(&h.transport, &source), 0);
    assert_eq!(source.docs.lock().len(), 2);

    h.transport.enable_streaming();
    assert_eq!(stream::pump(&h.transport, &source), 2);
    assert!(source.docs.lock().is_empty());

    let docs = documents(&h.link.sent());
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[1]["value"], 99);
}

#[test]
fn monitor_publishes_snapshot() {
    let h = Harness::new();
    h.connect_with_mtu(247);
    h.write_command(br#"{"type":"a"}"#, 32);

    let mut sink = RecordingSink::default();
    assert!(monitor::publish(&h.transport, &mut sink));

    let (metrics, state) = sink.published[0];
    assert_eq!(metrics.commands_queued, 1);
    assert_eq!(state, LinkState::Completed { mtu: 247 });
}

#[test]
fn shutdown_stops_background_tasks() {
    let h = Harness::new();
    h.connect_with_mtu(247);
    let transport = Arc::clone(&h.transport);
    let telemetry = Arc::new(QueueTelemetry::default());

    let streamer = {
        let t = Arc::clone(&transport);
        std::thread::spawn(move || stream::run_streamer(t, telemetry))
    };
    let monitor = {
        let t = Arc::clone(&transport);
        std::thread::spawn(move || monitor::run_monitor(t, Box::new(RecordingSink::default())))
    };

    std::thread::sleep(Duration::from_millis(20));
    assert!(transport.shutdown(Duration::from_millis(100)));
    assert!(transport.is_shutting_down());
    streamer.join().unwrap();
    monitor.join().unwrap();
}
