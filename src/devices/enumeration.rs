// Device discovery and collaborator contracts
//
// This module defines the boundary traits the core consumes (inventory
// enumeration, availability probing, session apply) and a caching
// enumeration service with refresh-on-miss device resolution.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::types::{DeviceDescriptor, DeviceKind};

/// Host-environment device inventory query
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// Availability check for a single device id
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    async fn is_device_available(&self, device_id: &str, kind: DeviceKind) -> Result<bool>;
}

/// Live-session boundary that binds a chosen device to the running media
/// streams. Opaque to this crate.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn set_camera(&self, device_id: &str) -> Result<()>;
    async fn set_microphone(&self, device_id: &str) -> Result<()>;
    async fn set_speaker(&self, device_id: &str) -> Result<()>;
}

/// Dispatch a device apply to the right sink method for its kind
pub(crate) async fn apply_to_session(
    session: &dyn SessionSink,
    kind: DeviceKind,
    device_id: &str,
) -> Result<()> {
    match kind {
        DeviceKind::Camera => session.set_camera(device_id).await,
        DeviceKind::Microphone => session.set_microphone(device_id).await,
        DeviceKind::Speaker => session.set_speaker(device_id).await,
    }
}

/// Default availability probe: re-enumerate and test membership
pub struct EnumerationProbe {
    enumerator: Arc<dyn DeviceEnumerator>,
}

impl EnumerationProbe {
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>) -> Self {
        Self { enumerator }
    }
}

#[async_trait]
impl AvailabilityProbe for EnumerationProbe {
    async fn is_device_available(&self, device_id: &str, kind: DeviceKind) -> Result<bool> {
        let devices = self.enumerator.enumerate_devices().await?;
        Ok(devices.iter().any(|d| d.id == device_id && d.kind == kind))
    }
}

/// Enumeration service with a device cache keyed by id
pub struct EnumerationService {
    enumerator: Arc<dyn DeviceEnumerator>,
    devices_cache: Arc<Mutex<HashMap<String, DeviceDescriptor>>>,
}

impl EnumerationService {
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>) -> Self {
        Self {
            enumerator,
            devices_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Query the full inventory and refresh the cache
    pub async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        crate::device_debug!("Starting device enumeration...");
        let devices = self.enumerator.enumerate_devices().await?;

        crate::device_debug!("Enumerated {} devices", devices.len());
        {
            let mut cache_guard = self.devices_cache.lock().await;
            cache_guard.clear();
            for device in &devices {
                cache_guard.insert(device.id.clone(), device.clone());
            }
        }

        Ok(devices)
    }

    /// Get device by ID from cache
    pub async fn get_device(&self, device_id: &str) -> Option<DeviceDescriptor> {
        let cache = self.devices_cache.lock().await;
        cache.get(device_id).cloned()
    }

    /// Resolve a device id to its descriptor for the given kind
    ///
    /// Tries the cache first; on a miss the inventory is refreshed once and
    /// the lookup retried, so a descriptor for a just-plugged device still
    /// resolves. Returns `Ok(None)` when the device is absent for the kind.
    pub async fn resolve_device(
        &self,
        device_id: &str,
        kind: DeviceKind,
    ) -> Result<Option<DeviceDescriptor>> {
        if let Some(descriptor) = self.get_device(device_id).await {
            if descriptor.kind == kind {
                return Ok(Some(descriptor));
            }
        }

        // Not cached for this kind, refresh the inventory and try again
        info!("Device {} not in cache, refreshing device list...", device_id);
        let _refreshed = self.enumerate_devices().await?;

        match self.get_device(device_id).await {
            Some(descriptor) if descriptor.kind == kind => Ok(Some(descriptor)),
            _ => Ok(None),
        }
    }

    pub fn enumerator(&self) -> Arc<dyn DeviceEnumerator> {
        self.enumerator.clone()
    }
}

impl std::fmt::Debug for EnumerationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnumerationService")
            .field("devices_cache", &"HashMap<String, DeviceDescriptor>")
            .finish()
    }
}
