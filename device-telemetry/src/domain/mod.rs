//! Domain layer for device-telemetry.
//!
//! Devices are owned by the registry; the pipeline only ever sees read-only
//! snapshots of them and the measurements they produce.

pub mod device;
pub mod measurement;

pub use device::{DEFAULT_INTERVAL_MS, Device, DeviceId, DevicePayload};
pub use measurement::{Measurement, RoutingKey};
