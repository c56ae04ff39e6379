//! # mpu_relay
//!
//! Streams MPU-9250 motion samples from an IIO character device to several TCP
//! clients at once.
//!
//! ## Architecture
//! - **SensorBuffer:** configures the device's channel set, derives the packet
//!   layout from sysfs metadata, reads scans on a dedicated thread and pushes
//!   decoded samples onto a bounded drop-oldest queue.
//! - **SensorServer:** non-blocking dispatch loop over all sockets, per-client
//!   subscriptions, and a broadcast thread that fans samples out per mask.
//! - **Arbiter:** the hardware carries one channel set, so it is driven by the
//!   union of all client masks, and the reader runs only while someone streams.
//!
//! ## Wire protocol
//! Newline-delimited JSON. Commands: `config_channels`, `start_send`,
//! `stop_send`, `disconnect`. Samples: `{"accel_x": 0.98, "anglvel_z": -0.01}`.

pub mod sensor;
pub mod server;
pub mod utils;
