//! Measurement value object and its routing key.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::device::{Device, DeviceId};

/// One reading emitted by a device on a single tick.
///
/// The serialized form keeps the `Id`/`Value` field names used on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "Id")]
    pub device_id: DeviceId,
    #[serde(rename = "Value")]
    pub value: f64,
}

impl Measurement {
    pub fn new(device_id: impl Into<DeviceId>, value: f64) -> Self {
        Self {
            device_id: device_id.into(),
            value,
        }
    }

    /// Snapshot the device's current value.
    pub fn from_device(device: &Device) -> Self {
        Self {
            device_id: device.id.clone(),
            value: device.value,
        }
    }

    pub fn routing_key(&self) -> RoutingKey {
        RoutingKey::for_device(&self.device_id)
    }
}

/// Broker routing label, derived 1:1 from a device id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn for_device(id: &DeviceId) -> Self {
        Self(id.as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoutingKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
