// Core device types and enums for session device management
//
// This module contains the fundamental data structures used throughout
// the device preference and recovery system, including per-kind device
// state tracking, stored preferences, recovery attempt records, and the
// crate-wide error taxonomy.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of device kinds a live session binds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Camera,
    Microphone,
    Speaker,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [
        DeviceKind::Camera,
        DeviceKind::Microphone,
        DeviceKind::Speaker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Camera => "camera",
            DeviceKind::Microphone => "microphone",
            DeviceKind::Speaker => "speaker",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "camera" => Ok(DeviceKind::Camera),
            "microphone" => Ok(DeviceKind::Microphone),
            "speaker" => Ok(DeviceKind::Speaker),
            other => Err(format!("unknown device kind: {}", other)),
        }
    }
}

/// Device identity as reported by the host environment's enumeration
///
/// Descriptors are opaque to this crate: they are produced by the
/// enumeration collaborator and never constructed internally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
    #[serde(default)]
    pub group_id: String,
}

/// A stored, prioritized association between a device kind and a device
///
/// Within one kind's list `device_id` is unique and the list is kept
/// stable-sorted ascending by `priority` (1 = highest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePreference {
    pub device_id: String,
    pub label: String,
    pub priority: u32,
    #[serde(default)]
    pub is_fallback: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Caller-supplied preference fields for `set_camera`/`set_microphone`/`set_speaker`
///
/// A `None` priority keeps the existing priority when updating a known
/// device, or appends at the end of the list for a new one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreferenceUpdate {
    pub priority: Option<u32>,
    #[serde(default)]
    pub is_fallback: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Tracked state for one device kind
///
/// Mutated exclusively by the `DeviceManager`; read-only everywhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: Option<String>,
    pub is_available: bool,
    pub is_active: bool,
    pub label: Option<String>,
    pub group_id: Option<String>,
    pub error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl DeviceState {
    /// Create a fresh state record with no device bound
    pub fn new() -> Self {
        Self {
            device_id: None,
            is_available: false,
            is_active: false,
            label: None,
            group_id: None,
            error: None,
            last_updated: Utc::now(),
        }
    }

    /// Bind a resolved descriptor as the active device
    pub fn mark_active(&mut self, descriptor: &DeviceDescriptor) {
        self.device_id = Some(descriptor.id.clone());
        self.label = Some(descriptor.label.clone());
        self.group_id = Some(descriptor.group_id.clone());
        self.is_available = true;
        self.is_active = true;
        self.error = None;
        self.last_updated = Utc::now();
    }

    /// Mark the currently bound device as gone
    pub fn mark_unavailable(&mut self, error: impl Into<String>) {
        self.is_available = false;
        self.is_active = false;
        self.error = Some(error.into());
        self.last_updated = Utc::now();
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of one recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Succeeded | AttemptStatus::Failed | AttemptStatus::Cancelled
        )
    }
}

/// Terminal outcome recorded on a sealed attempt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub device_id: Option<String>,
    pub method: Option<String>,
    pub error: Option<String>,
}

/// One execution of the recovery process for one device kind
///
/// Attempts are created `Pending`, promoted to `InProgress`, sealed with a
/// terminal status, and appended to history exactly once. Never mutated
/// after sealing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: Uuid,
    pub kind: DeviceKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub retry_count: u32,
    pub result: Option<AttemptOutcome>,
}

impl RecoveryAttempt {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            start_time: Utc::now(),
            end_time: None,
            status: AttemptStatus::Pending,
            retry_count: 0,
            result: None,
        }
    }

    pub fn begin(&mut self) {
        self.status = AttemptStatus::InProgress;
    }

    pub fn seal(&mut self, status: AttemptStatus, outcome: AttemptOutcome) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.end_time = Some(Utc::now());
        self.result = Some(outcome);
    }
}

/// Result of one strategy execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyResult {
    pub success: bool,
    pub device_id: Option<String>,
    pub confidence: f64,
    pub reason: String,
}

impl StrategyResult {
    pub fn accepted(device_id: impl Into<String>, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            success: true,
            device_id: Some(device_id.into()),
            confidence,
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            device_id: None,
            confidence: 0.0,
            reason: reason.into(),
        }
    }
}

/// Outcome of a whole recovery run, reported to callers as a value
///
/// Recovery never surfaces its failures as errors; callers inspect
/// `success` and `error` instead.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub kind: DeviceKind,
    pub device_id: Option<String>,
    pub method: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl RecoveryResult {
    pub fn succeeded(
        kind: DeviceKind,
        device_id: String,
        method: String,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: true,
            kind,
            device_id: Some(device_id),
            method: Some(method),
            attempts,
            duration_ms,
            error: None,
        }
    }

    pub fn failed(kind: DeviceKind, error: impl Into<String>, attempts: u32, duration_ms: u64) -> Self {
        Self {
            success: false,
            kind,
            device_id: None,
            method: None,
            attempts,
            duration_ms,
            error: Some(error.into()),
        }
    }

    /// Immediate rejection before any attempt was recorded
    pub fn rejected(kind: DeviceKind, error: impl Into<String>) -> Self {
        Self::failed(kind, error, 0, 0)
    }
}

/// Counts of recovery work currently known to the engine
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RecoveryStatus {
    pub active: usize,
    /// Second attempts per kind are rejected, never queued, so this stays 0
    pub queued: usize,
}

/// A change detected for a device whose id persisted across snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceChange {
    pub previous: DeviceDescriptor,
    pub current: DeviceDescriptor,
}

/// Diff between two consecutive inventory snapshots
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDiff {
    pub added: Vec<DeviceDescriptor>,
    pub removed: Vec<DeviceDescriptor>,
    pub changed: Vec<DeviceChange>,
}

impl DeviceDiff {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.changed.is_empty()
    }
}

/// Manager-level status snapshot for outer layers
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub is_monitoring: bool,
    pub active_recoveries: usize,
}

/// Errors raised by preference persistence backends
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend unavailable")]
    Unavailable,

    #[error("failed to serialize preferences for key {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to deserialize preferences for key {key}: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage I/O failed for key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur during device management operations
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {device_id} ({kind})")]
    DeviceNotFound {
        device_id: String,
        kind: DeviceKind,
    },

    #[error("Recovery exhausted for {kind} after {attempts} strategy executions")]
    RecoveryExhausted { kind: DeviceKind, attempts: u32 },

    #[error("Recovery already in progress for {kind}")]
    ConcurrentRecovery { kind: DeviceKind },

    #[error("Device enumeration failed: {0}")]
    Enumeration(#[source] anyhow::Error),

    #[error("Session apply failed: {0}")]
    SessionApply(#[source] anyhow::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Recovery strategy not found: {name}")]
    StrategyNotFound { name: String },

    #[error("Recovery strategy {name} not applicable for {kind}")]
    StrategyNotApplicable { name: String, kind: DeviceKind },
}

pub type Result<T> = std::result::Result<T, DeviceError>;
