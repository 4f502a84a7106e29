// Typed event surface consumed by outer layers (UI, logging, protocol workers)
//
// All components publish into one shared broadcast bus so consumers get a
// single ordered view of state changes, monitor diffs, and recovery
// progress. Emitting with no subscribers attached is not an error.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::types::{
    DeviceChange, DeviceDescriptor, DeviceDiff, DeviceKind, DevicePreference, DeviceState,
    ManagerStatus, StrategyResult,
};

/// Everything the subsystem reports to the outside world
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    StateChanged {
        kind: DeviceKind,
        state: DeviceState,
    },
    PreferenceUpdated {
        kind: DeviceKind,
        preference: DevicePreference,
    },
    PreferencesLoaded {
        kind: DeviceKind,
        count: usize,
    },
    PreferencesSaved {
        kind: DeviceKind,
        count: usize,
    },
    PreferencesCleared {
        kind: Option<DeviceKind>,
    },
    DeviceUnavailable {
        kind: DeviceKind,
        device_id: String,
    },
    RecoveryStarted {
        kind: DeviceKind,
        attempt_id: Uuid,
    },
    RecoverySucceeded {
        kind: DeviceKind,
        device_id: String,
        method: String,
    },
    RecoveryFailed {
        kind: DeviceKind,
        error: String,
    },
    RecoveryCancelled {
        kind: DeviceKind,
        reason: String,
    },
    RecoveryCompleted {
        kind: DeviceKind,
        success: bool,
    },
    StrategyExecuted {
        kind: DeviceKind,
        strategy: String,
        result: StrategyResult,
    },
    StatusChanged {
        status: ManagerStatus,
    },
    MonitorStarted,
    MonitorStopped {
        reason: Option<String>,
    },
    MonitorError {
        message: String,
        timestamp: DateTime<Utc>,
    },
    MonitorChange {
        diff: DeviceDiff,
    },
    MonitorDeviceAdded {
        device: DeviceDescriptor,
    },
    MonitorDeviceRemoved {
        device: DeviceDescriptor,
    },
    MonitorDeviceChanged {
        change: DeviceChange,
    },
}

/// Shared broadcast bus carrying [`DeviceEvent`]s
///
/// Cheap to clone; every component holds its own handle. Slow consumers
/// that lag past the channel capacity miss old events, they are never
/// blocked on.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DeviceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all events emitted from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; a bus with no subscribers swallows it
    pub fn emit(&self, event: DeviceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
