//! In-memory device registry.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{DeviceRegistry, page_bounds};
use crate::domain::{Device, DeviceId, DevicePayload};
use crate::{Error, Result};

/// Registry backed by a vector, preserving registration order.
#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
    devices: RwLock<Vec<Device>>,
}

impl InMemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered devices.
    pub fn count(&self) -> usize {
        self.devices.read().len()
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn add_device(&self, payload: DevicePayload) -> Result<Device> {
        let payload = payload.validated()?;
        let device = payload.into_device(DeviceId::generate());

        debug!(
            device_id = %device.id,
            name = %device.name,
            interval_ms = device.interval_ms,
            "Registering device"
        );
        self.devices.write().push(device.clone());
        Ok(device)
    }

    async fn get_device(&self, id: &DeviceId) -> Result<Device> {
        self.devices
            .read()
            .iter()
            .find(|d| &d.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("Device", id.as_str()))
    }

    async fn list_devices(&self, limit: usize, page: usize) -> Result<Vec<Device>> {
        let devices = self.devices.read();
        let (lower, upper) = page_bounds(limit, page, devices.len());
        Ok(devices[lower..upper].to_vec())
    }

    async fn all_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_get_device() {
        let registry = InMemoryDeviceRegistry::new();
        let device = registry
            .add_device(DevicePayload::new("thermo", 500, 21.5))
            .await
            .unwrap();

        let fetched = registry.get_device(&device.id).await.unwrap();
        assert_eq!(fetched, device);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_not_stored() {
        let registry = InMemoryDeviceRegistry::new();
        let err = registry
            .add_device(DevicePayload::new("x", 500, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_get_unknown_device() {
        let registry = InMemoryDeviceRegistry::new();
        let err = registry.get_device(&DeviceId::from("missing")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_devices_paginates_in_order() {
        let registry = InMemoryDeviceRegistry::new();
        for name in ["alpha", "bravo", "charlie", "delta", "echo"] {
            registry
                .add_device(DevicePayload::new(name, 100, 0.0))
                .await
                .unwrap();
        }

        let page: Vec<String> = registry
            .list_devices(2, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(page, vec!["charlie", "delta"]);

        assert_eq!(registry.list_devices(2, 2).await.unwrap().len(), 1);
        assert!(registry.list_devices(2, 9).await.unwrap().is_empty());
        assert_eq!(registry.list_devices(0, 0).await.unwrap().len(), 5);
    }
}
