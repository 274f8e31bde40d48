//! Command processing worker.
//!
//! Drains the command queue with a bounded wait so it notices shutdown,
//! parses each command and hands it to the registered handler. The
//! high-priority flag is up for exactly as long as one command is being
//! processed.

use std::sync::Arc;

use core::time::Duration;
use log::{info, warn};

use super::command::QueuedCommand;
use super::gateway::GatewayTransport;

/// How processing of one command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Handled,
    ParseError,
    Oversize,
    NoHandler,
}

/// Process one dequeued command. The command buffer is released when
/// this returns, on every path.
pub fn process_command(transport: &GatewayTransport, cmd: QueuedCommand) -> CommandOutcome {
    let _priority = transport.priority().raise();
    let outcome = execute(transport, &cmd);
    transport.metrics_hub().update(|m| m.commands_processed += 1);
    outcome
}

fn execute(transport: &GatewayTransport, cmd: &QueuedCommand) -> CommandOutcome {
    let capacity = transport.config().reassembly_capacity as usize;
    if cmd.as_nul_terminated().len() > capacity {
        warn!("WORKER: {} byte command exceeds {} byte limit", cmd.len(), capacity);
        transport.metrics_hub().update(|m| m.parse_errors += 1);
        reply_error(transport, "Command too large", "parse");
        return CommandOutcome::Oversize;
    }

    let command: serde_json::Value = match serde_json::from_slice(cmd.payload()) {
        Ok(v) => v,
        Err(e) => {
            let message = e.to_string();
            warn!("WORKER: parse failed: {}", message);
            transport.metrics_hub().update(|m| m.parse_errors += 1);
            reply_error(transport, &message, "parse");
            return CommandOutcome::ParseError;
        }
    };

    let Some(handler) = transport.handler() else {
        warn!("WORKER: no command handler registered");
        reply_error(transport, "No command handler", "handler");
        return CommandOutcome::NoHandler;
    };
    handler.handle(transport, command);
    CommandOutcome::Handled
}

fn reply_error(transport: &GatewayTransport, message: &str, kind: &str) {
    if let Err(e) = transport.send_error(message, kind) {
        warn!("WORKER: error reply not delivered: {}", e);
    }
}

/// Report pending inbound faults, then wait up to `wait` for one queued
/// command and process it. `None` if nothing arrived.
pub fn process_next(transport: &GatewayTransport, wait: Duration) -> Option<CommandOutcome> {
    transport.flush_faults();
    let Some(cmd) = transport.queue().next(wait, transport.clock()) else {
        transport.flush_faults();
        return None;
    };
    let depth = transport.queue_len() as u8;
    transport.metrics_hub().update(|m| m.queue_depth = depth);
    Some(process_command(transport, cmd))
}

/// Worker task body. Returns once shutdown is requested.
pub fn run_worker(transport: Arc<GatewayTransport>) {
    let wait = Duration::from_millis(u64::from(transport.config().worker_wait_ms));
    info!("WORKER: started");
    while !transport.is_shutting_down() {
        process_next(&transport, wait);
    }
    info!("WORKER: stopped");
}
