//! Queue bound, worker parsing and the high-priority flag.

use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use gatelink::adapters::time::SystemClock;
use gatelink::config::{COMMAND_QUEUE_DEPTH, TransportConfig};
use gatelink::transport::GatewayTransport;
use gatelink::transport::command::QueuedCommand;
use gatelink::transport::worker::{self, CommandOutcome};
use serde_json::json;

use crate::mocks::{Harness, MockHeap, MockLink, RecordingHandler, documents};

fn connected() -> (Harness, Arc<RecordingHandler>) {
    let h = Harness::new();
    h.connect_with_mtu(247);
    let handler = Arc::new(RecordingHandler::default());
    h.transport.register_handler(handler.clone());
    h.link.take_sent();
    (h, handler)
}

#[test]
fn twenty_first_command_is_dropped() {
    let (h, handler) = connected();

    for i in 0..=COMMAND_QUEUE_DEPTH {
        h.write_command(format!(r#"{{"type":"poll","seq":{i}}}"#).as_bytes(), 16);
    }

    assert_eq!(h.transport.queue_len(), COMMAND_QUEUE_DEPTH);
    let m = h.transport.metrics().unwrap();
    assert_eq!(m.queue_drops, 1);
    assert_eq!(m.commands_queued, COMMAND_QUEUE_DEPTH as u32);
    assert_eq!(m.queue_peak as usize, COMMAND_QUEUE_DEPTH);

    while worker::process_next(&h.transport, Duration::ZERO).is_some() {}
    let m = h.transport.metrics().unwrap();
    assert_eq!(m.commands_processed, COMMAND_QUEUE_DEPTH as u32);
    assert_eq!(m.queue_depth, 0);
    let seen = handler.commands.lock();
    assert_eq!(seen.len(), COMMAND_QUEUE_DEPTH);
    // First in, first out; the late one is the casualty.
    assert_eq!(seen[0]["seq"], 0);
    assert_eq!(seen[COMMAND_QUEUE_DEPTH - 1]["seq"], COMMAND_QUEUE_DEPTH - 1);
}

#[test]
fn malformed_json_answers_parse_error() {
    let (h, handler) = connected();
    h.write_command(br#"{"type":"set_config","#, 8);

    assert_eq!(
        worker::process_next(&h.transport, Duration::ZERO),
        Some(CommandOutcome::ParseError)
    );

    assert!(handler.commands.lock().is_empty());
    let docs = documents(&h.link.sent());
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["status"], "error");
    assert_eq!(docs[0]["type"], "parse");
    assert_eq!(h.transport.metrics().unwrap().parse_errors, 1);
}

#[test]
fn missing_handler_is_reported() {
    let h = Harness::new();
    h.connect_with_mtu(247);
    h.link.take_sent();
    h.write_command(br#"{"type":"get_config"}"#, 64);

    assert_eq!(
        worker::process_next(&h.transport, Duration::ZERO),
        Some(CommandOutcome::NoHandler)
    );
    let docs = documents(&h.link.sent());
    assert_eq!(docs[0]["message"], "No command handler");
    assert_eq!(docs[0]["type"], "handler");
    assert!(!h.transport.is_high_priority());
    assert_eq!(h.transport.metrics().unwrap().commands_processed, 1);
}

#[test]
fn oversize_command_is_rejected_by_worker() {
    let h = Harness::with_config(TransportConfig {
        reassembly_capacity: 64,
        ..TransportConfig::default()
    });
    h.connect_with_mtu(247);
    let handler = Arc::new(RecordingHandler::default());
    h.transport.register_handler(handler.clone());
    h.link.take_sent();

    // Built directly: reassembly would never produce one this long.
    let cmd = QueuedCommand::try_copy_from(&[b'a'; 100]).unwrap();
    assert_eq!(
        worker::process_command(&h.transport, cmd),
        CommandOutcome::Oversize
    );

    assert!(handler.commands.lock().is_empty());
    let docs = documents(&h.link.sent());
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["message"], "Command too large");
    assert_eq!(docs[0]["type"], "parse");
    assert!(!h.transport.is_high_priority());
    assert_eq!(h.transport.metrics().unwrap().parse_errors, 1);
}

#[test]
fn priority_raised_only_while_handling() {
    let (h, handler) = connected();
    let query = h.transport.priority_query();
    h.write_command(br#"{"type":"get_config"}"#, 64);

    assert!(!query.is_high_priority());
    worker::process_next(&h.transport, Duration::ZERO);

    assert!(handler.saw_high_priority.load(Ordering::Relaxed));
    assert!(!query.is_high_priority());
    assert!(!h.transport.is_high_priority());
}

#[test]
fn priority_cleared_after_parse_failure() {
    let (h, _handler) = connected();
    h.write_command(b"not json", 64);

    worker::process_next(&h.transport, Duration::ZERO);

    assert!(!h.transport.is_high_priority());
}

#[test]
fn empty_queue_waits_then_returns_none() {
    let (h, _handler) = connected();
    let before = h.transport.uptime_ms();

    assert!(worker::process_next(&h.transport, Duration::from_millis(100)).is_none());

    assert!(h.transport.uptime_ms() - before >= 100);
}

#[test]
fn handler_reply_streams_back() {
    let h = Harness::new();
    h.connect_with_mtu(247);
    h.link.take_sent();
    h.transport.register_handler(Arc::new(RecordingHandler {
        reply_ok: true,
        ..RecordingHandler::default()
    }));

    h.write_command(br#"{"type":"set_config","slave":1}"#, 10);
    worker::process_next(&h.transport, Duration::ZERO);

    assert_eq!(
        documents(&h.link.sent()),
        vec![json!({"status": "ok", "message": "Success", "type": "set_config", "config": []})]
    );
}

#[test]
fn worker_task_drains_queue_until_shutdown() {
    let link = Arc::new(MockLink::new());
    link.grant_mtu(Some(247));
    link.connect(247);
    let cfg = TransportConfig {
        connect_settle_ms: 0,
        worker_wait_ms: 10,
        ..TransportConfig::default()
    };
    let transport = Arc::new(
        GatewayTransport::new(cfg, link.clone(), Arc::new(SystemClock::new()), Arc::new(MockHeap::new()))
            .unwrap(),
    );
    let handler = Arc::new(RecordingHandler::default());
    transport.register_handler(handler.clone());
    transport.on_connect();

    let worker = {
        let t = Arc::clone(&transport);
        std::thread::spawn(move || worker::run_worker(t))
    };
    for i in 0..3 {
        transport.on_fragment(b"<START>");
        transport.on_fragment(format!(r#"{{"type":"poll","seq":{i}}}"#).as_bytes());
        transport.on_fragment(b"<END>");
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while handler.commands.lock().len() < 3 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(transport.shutdown(Duration::from_millis(100)));
    worker.join().unwrap();

    assert_eq!(handler.commands.lock().len(), 3);
    assert_eq!(transport.queue_len(), 0);
}
