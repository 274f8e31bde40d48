//! Background task placement.
//!
//! ```text
//!  Core 1 (APP)                       Core 0 (PRO)
//!  ┌───────────────────┐              ┌──────────────────┐
//!  │ ble-worker  pri 5 │◀── queue ────│ Bluedroid GATT   │
//!  │ ble-stream  pri 4 │              │ callbacks        │
//!  │ ble-monitor pri 2 │              └──────────────────┘
//!  └───────────────────┘
//! ```

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::gateway::GatewayTransport;
use super::{monitor, stream, worker};
use crate::drivers::task_pin::{Core, TaskSpec, spawn_on_core};
use crate::ports::{MetricsSink, TelemetrySource};

pub const WORKER_TASK: TaskSpec = TaskSpec {
    core: Core::App,
    priority: 5,
    stack_kb: 12,
    name: "ble-worker\0",
};

pub const STREAM_TASK: TaskSpec = TaskSpec {
    core: Core::App,
    priority: 4,
    stack_kb: 8,
    name: "ble-stream\0",
};

pub const MONITOR_TASK: TaskSpec = TaskSpec {
    core: Core::App,
    priority: 2,
    stack_kb: 6,
    name: "ble-monitor\0",
};

/// Handles of the running transport tasks.
pub struct TaskHandles {
    pub worker: JoinHandle<()>,
    pub streamer: JoinHandle<()>,
    pub monitor: JoinHandle<()>,
}

impl TaskHandles {
    /// Wait for all tasks to exit after [`GatewayTransport::shutdown`].
    pub fn join(self) {
        for (name, handle) in [
            ("worker", self.worker),
            ("streamer", self.streamer),
            ("monitor", self.monitor),
        ] {
            if handle.join().is_err() {
                log::error!("TASKS: {} panicked", name);
            }
        }
    }
}

/// Start the worker, streamer and monitor tasks.
pub fn spawn_all(
    transport: &Arc<GatewayTransport>,
    telemetry: Arc<dyn TelemetrySource>,
    sink: Box<dyn MetricsSink>,
) -> io::Result<TaskHandles> {
    let t = Arc::clone(transport);
    let worker = spawn_on_core(WORKER_TASK, move || worker::run_worker(t))?;

    let t = Arc::clone(transport);
    let streamer = spawn_on_core(STREAM_TASK, move || stream::run_streamer(t, telemetry))?;

    let t = Arc::clone(transport);
    let monitor = spawn_on_core(MONITOR_TASK, move || monitor::run_monitor(t, sink))?;

    Ok(TaskHandles {
        worker,
        streamer,
        monitor,
    })
}
