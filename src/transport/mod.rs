//! BLE command transport.
//!
//! Inbound commands arrive as framed GATT writes, are reassembled, queued
//! and handed to a single worker. Responses and telemetry stream back as
//! MTU-sized notifications with pacing chosen from payload size and free
//! heap.
//!
//! ```text
//!  GATT write ──▶ reassembly ──▶ dispatch ──▶ [queue 20] ──▶ worker ──▶ handler
//!                     │                                                  │
//!                 <CANCEL> ──▶ cancel token                              ▼
//!                                   │                           send_response
//!                                   ▼                                  │
//!  notify ◀── chunk stream ◀── engine (lock, caps, pools) ◀────────────┘
//!                 ▲
//!  negotiation ───┘ (unit MTU)          streamer ──▶ send_telemetry
//! ```

pub mod command;
pub mod dispatch;
pub mod engine;
pub mod gateway;
pub mod metrics;
pub mod monitor;
pub mod negotiation;
pub mod priority;
pub mod protocol;
pub mod reassembly;
pub mod stream;
pub mod tasks;
pub mod worker;

pub use gateway::GatewayTransport;
