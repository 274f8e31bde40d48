//! MTU negotiation driven through the monitor tick.

use core::time::Duration;

use gatelink::config::TransportConfig;
use gatelink::ports::Clock;
use gatelink::transport::negotiation::{LinkState, Resolution};
use serde_json::json;

use crate::mocks::Harness;

const MONITOR_MS: u64 = 500;

/// Tick the monitor every 500 ms until negotiation leaves the
/// negotiating states or `limit_ms` passes. Returns the resolutions seen.
fn run_monitor(h: &Harness, limit_ms: u64) -> Vec<Resolution> {
    let mut resolutions = Vec::new();
    while h.clock.now_ms() <= limit_ms {
        if let Some(r) = h.transport.monitor_tick() {
            resolutions.push(r);
        }
        if matches!(
            h.transport.link_state(),
            Some(LinkState::Completed { .. } | LinkState::Failed { .. })
        ) {
            break;
        }
        h.clock.sleep(Duration::from_millis(MONITOR_MS));
    }
    resolutions
}

#[test]
fn peer_granting_mtu_completes_on_connect() {
    let h = Harness::new();
    h.connect_with_mtu(247);

    assert_eq!(h.transport.link_state(), Some(LinkState::Completed { mtu: 247 }));
    assert_eq!(h.transport.chunk_size(), 244);
    let m = h.transport.metrics().unwrap();
    assert_eq!(m.negotiated_mtu, 247);
    assert_eq!(m.negotiation_attempts, 1);
}

#[test]
fn late_exchange_completes_on_later_tick() {
    let h = Harness::new();
    h.link.grant_mtu(None);
    h.link.connect(23);
    h.transport.on_connect();
    assert!(h.transport.link_state().unwrap().is_negotiating());

    h.clock.advance(1_000);
    h.link.set_mtu(185);
    assert!(h.transport.monitor_tick().is_none());

    assert_eq!(h.transport.link_state(), Some(LinkState::Completed { mtu: 185 }));
    assert_eq!(h.transport.chunk_size(), 182);
}

#[test]
fn silent_peer_falls_back_within_bound() {
    let h = Harness::new();
    h.link.grant_mtu(None);
    h.link.connect(23);
    let start = h.clock.now_ms();
    h.transport.on_connect();

    let resolutions = run_monitor(&h, start + 30_000);
    let elapsed = h.clock.now_ms() - start;

    // 3 timeouts + 2 backoffs (with jitter) + monitor granularity + settle.
    assert!(elapsed <= 17_200, "fallback after {elapsed} ms");
    assert!(elapsed > 15_000, "fallback after {elapsed} ms");
    assert_eq!(h.transport.link_state(), Some(LinkState::Failed { fallback_mtu: 185 }));

    let retries: Vec<u8> = resolutions
        .iter()
        .filter_map(|r| match r {
            Resolution::Retrying { attempt, delay } => {
                let base = 100u64 << (attempt - 1);
                let ms = delay.as_millis() as u64;
                assert!((base..=base + 100).contains(&ms), "backoff {ms} ms");
                Some(*attempt)
            }
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
    assert!(matches!(
        resolutions.last(),
        Some(Resolution::Failed { fallback_mtu: 185 })
    ));

    let m = h.transport.metrics().unwrap();
    assert_eq!(m.negotiation_attempts, 3);
    assert_eq!(m.negotiation_timeouts, 3);
    assert_eq!(m.negotiation_failures, 1);
    assert_eq!(m.negotiated_mtu, 185);
}

#[test]
fn next_send_uses_fallback_unit() {
    let h = Harness::new();
    h.link.grant_mtu(None);
    h.link.connect(23);
    h.transport.on_connect();
    run_monitor(&h, 30_000);
    h.link.take_sent();

    h.transport
        .send_response(&json!({"type": "get_config", "data": "y".repeat(600)}))
        .unwrap();

    let sent = h.link.sent();
    assert_eq!(sent[0].len(), 182);
    assert_eq!(h.transport.chunk_size(), 182);
}

#[test]
fn fallback_is_floored_at_one_hundred() {
    let cfg = TransportConfig {
        fallback_mtu: 100,
        negotiation_max_retries: 0,
        ..TransportConfig::default()
    };
    let h = Harness::with_config(cfg);
    h.link.grant_mtu(None);
    h.link.connect(23);
    h.transport.on_connect();

    run_monitor(&h, 30_000);

    assert_eq!(h.transport.link_state(), Some(LinkState::Failed { fallback_mtu: 100 }));
    assert_eq!(h.transport.chunk_size(), 97);
}

#[test]
fn disconnect_invalidates_pending_negotiation() {
    let h = Harness::new();
    h.link.grant_mtu(None);
    h.link.connect(23);
    h.transport.on_connect();

    h.disconnect();
    assert_eq!(h.transport.link_state(), Some(LinkState::Idle));

    h.clock.advance(60_000);
    assert!(h.transport.monitor_tick().is_none());
    assert_eq!(h.transport.link_state(), Some(LinkState::Idle));
}

#[test]
fn reconnect_restarts_negotiation() {
    let h = Harness::new();
    h.link.grant_mtu(None);
    h.link.connect(23);
    h.transport.on_connect();
    run_monitor(&h, 30_000);
    assert!(matches!(h.transport.link_state(), Some(LinkState::Failed { .. })));

    h.disconnect();
    h.connect_with_mtu(247);

    assert_eq!(h.transport.link_state(), Some(LinkState::Completed { mtu: 247 }));
    assert_eq!(h.transport.metrics().unwrap().negotiation_failures, 0);
}
