//! Device registry.
//!
//! The registry owns device records. The emission pipeline only reads a
//! snapshot of all devices once, at start time.

mod memory;

pub use memory::InMemoryDeviceRegistry;

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::Result;
use crate::domain::{Device, DeviceId, DevicePayload};

/// Default page size when a listing does not specify one.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Device registry trait.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Validate and register a device, returning the stored record.
    async fn add_device(&self, payload: DevicePayload) -> Result<Device>;
    async fn get_device(&self, id: &DeviceId) -> Result<Device>;
    /// List one page of devices in registration order. `limit == 0` returns all.
    async fn list_devices(&self, limit: usize, page: usize) -> Result<Vec<Device>>;
    async fn all_devices(&self) -> Result<Vec<Device>>;
}

/// Compute the `[lower, upper)` slice bounds for a page over `len` items.
///
/// A zero limit selects everything; a page past the end selects nothing.
pub fn page_bounds(limit: usize, page: usize, len: usize) -> (usize, usize) {
    if limit == 0 {
        return (0, len);
    }
    let lower = limit.saturating_mul(page);
    let upper = lower.saturating_add(limit);
    if len < lower {
        (0, 0)
    } else {
        (lower, upper.min(len))
    }
}

/// Read a JSON array of registration payloads from disk.
pub async fn load_payloads(path: &Path) -> Result<Vec<DevicePayload>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let payloads: Vec<DevicePayload> = serde_json::from_str(&raw)?;
    info!(path = %path.display(), count = payloads.len(), "Loaded device payloads");
    Ok(payloads)
}

/// Register every payload, stopping at the first invalid one.
pub async fn seed<R>(registry: &R, payloads: Vec<DevicePayload>) -> Result<usize>
where
    R: DeviceRegistry + ?Sized,
{
    let mut count = 0;
    for payload in payloads {
        registry.add_device(payload).await?;
        count += 1;
    }
    Ok(count)
}
