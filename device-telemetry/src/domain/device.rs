//! Device entity and registration payload.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Interval applied when a registration payload leaves it unset.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

const NAME_MIN_LEN: usize = 2;
const NAME_MAX_LEN: usize = 30;

/// Opaque device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a fresh identifier (32 lowercase hex characters).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered virtual device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub value: f64,
    /// Emission period in milliseconds. Always positive for registered devices.
    pub interval_ms: u64,
}

impl Device {
    pub fn new(
        id: impl Into<DeviceId>,
        name: impl Into<String>,
        value: f64,
        interval_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value,
            interval_ms,
        }
    }

    /// Emission period as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Reject devices the emission pipeline cannot drive.
    pub fn ensure_emittable(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(Error::validation(format!(
                "device {} has a zero emission interval",
                self.id
            )));
        }
        Ok(())
    }
}

/// Registration input for a new device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePayload {
    pub name: String,
    #[serde(default, alias = "interval")]
    pub interval_ms: u64,
    #[serde(default)]
    pub value: f64,
}

impl DevicePayload {
    pub fn new(name: impl Into<String>, interval_ms: u64, value: f64) -> Self {
        Self {
            name: name.into(),
            interval_ms,
            value,
        }
    }

    /// Fill defaults and check constraints, returning the normalized payload.
    pub fn validated(mut self) -> Result<Self> {
        if self.interval_ms == 0 {
            self.interval_ms = DEFAULT_INTERVAL_MS;
        }

        let name_len = self.name.chars().count();
        if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&name_len) {
            return Err(Error::validation(format!(
                "device name must be {}..={} characters, got {}",
                NAME_MIN_LEN, NAME_MAX_LEN, name_len
            )));
        }

        if !self.value.is_finite() {
            return Err(Error::validation("device value must be a finite number"));
        }

        Ok(self)
    }

    /// Build a device from this payload under the given id.
    pub fn into_device(self, id: DeviceId) -> Device {
        Device {
            id,
            name: self.name,
            value: self.value,
            interval_ms: self.interval_ms,
        }
    }
}
