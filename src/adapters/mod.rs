//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter    | Implements    | Connects to                 |
//! |------------|---------------|-----------------------------|
//! | `ble`      | LinkPort      | Bluedroid GATT server       |
//! | `heap`     | HeapPort      | ESP-IDF heap (PSRAM + DRAM) |
//! | `log_sink` | MetricsSink   | Serial log output           |
//! | `time`     | Clock         | ESP32 high-resolution timer |

pub mod ble;
pub mod heap;
pub mod log_sink;
pub mod time;
