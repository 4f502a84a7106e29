// Shared test doubles for the device management integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use rtc_devices::{DeviceDescriptor, DeviceEnumerator, DeviceKind, DevicePreference, SessionSink};

/// Scriptable inventory backend
pub struct FakeEnumerator {
    devices: Mutex<Vec<DeviceDescriptor>>,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl FakeEnumerator {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        })
    }

    pub async fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        *self.devices.lock().await = devices;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceEnumerator for FakeEnumerator {
    async fn enumerate_devices(&self) -> anyhow::Result<Vec<DeviceDescriptor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Real enumeration is I/O; give the scheduler a chance to interleave
        tokio::task::yield_now().await;
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("enumeration backend offline");
        }
        Ok(self.devices.lock().await.clone())
    }
}

/// Session boundary that records applied devices
pub struct FakeSession {
    applied: Mutex<Vec<(DeviceKind, String)>>,
    failing: AtomicBool,
}

impl FakeSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            applied: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn applied(&self) -> Vec<(DeviceKind, String)> {
        self.applied.lock().await.clone()
    }

    async fn record(&self, kind: DeviceKind, device_id: &str) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("session renegotiation failed");
        }
        self.applied.lock().await.push((kind, device_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl SessionSink for FakeSession {
    async fn set_camera(&self, device_id: &str) -> anyhow::Result<()> {
        self.record(DeviceKind::Camera, device_id).await
    }

    async fn set_microphone(&self, device_id: &str) -> anyhow::Result<()> {
        self.record(DeviceKind::Microphone, device_id).await
    }

    async fn set_speaker(&self, device_id: &str) -> anyhow::Result<()> {
        self.record(DeviceKind::Speaker, device_id).await
    }
}

pub fn descriptor(id: &str, kind: DeviceKind, label: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        id: id.to_string(),
        kind,
        label: label.to_string(),
        group_id: format!("group-{}", id),
    }
}

pub fn camera(id: &str, label: &str) -> DeviceDescriptor {
    descriptor(id, DeviceKind::Camera, label)
}

pub fn microphone(id: &str, label: &str) -> DeviceDescriptor {
    descriptor(id, DeviceKind::Microphone, label)
}

pub fn speaker(id: &str, label: &str) -> DeviceDescriptor {
    descriptor(id, DeviceKind::Speaker, label)
}

pub fn preference(device_id: &str, label: &str, priority: u32, is_fallback: bool) -> DevicePreference {
    DevicePreference {
        device_id: device_id.to_string(),
        label: label.to_string(),
        priority,
        is_fallback,
        metadata: Default::default(),
    }
}
