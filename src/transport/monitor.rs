//! Low-priority monitor task: negotiation timeouts and periodic metrics
//! publication.

use core::time::Duration;
use std::sync::Arc;

use log::info;

use super::gateway::GatewayTransport;
use crate::ports::MetricsSink;

/// Push one metrics snapshot to `sink`. `false` if a lock was busy.
pub fn publish(transport: &GatewayTransport, sink: &mut dyn MetricsSink) -> bool {
    match (transport.metrics(), transport.link_state()) {
        (Some(metrics), Some(state)) => {
            sink.publish(&metrics, state);
            true
        }
        _ => false,
    }
}

/// Monitor task body. Returns once shutdown is requested.
pub fn run_monitor(transport: Arc<GatewayTransport>, mut sink: Box<dyn MetricsSink>) {
    let interval = Duration::from_millis(u64::from(transport.config().monitor_interval_ms));
    let publish_every = transport.config().metrics_publish_ticks.max(1);
    let mut ticks = 0u32;

    info!("MONITOR: started ({} ms)", interval.as_millis());
    while !transport.is_shutting_down() {
        transport.monitor_tick();

        ticks += 1;
        if ticks >= publish_every {
            ticks = 0;
            publish(&transport, sink.as_mut());
        }
        transport.clock().sleep(interval);
    }
    info!("MONITOR: stopped");
}
