// Device manager configuration surface
//
// Everything is optional with defaults; per-kind overrides win over the
// global flags where present.

use std::collections::HashMap;

use super::monitor::MonitorConfig;
use super::recovery::RecoveryEngineConfig;
use super::types::DeviceKind;

/// Per-kind overrides of the global behavior
#[derive(Debug, Clone, Default)]
pub struct KindConfig {
    /// Override the global auto-recovery flag for this kind
    pub auto_recover: Option<bool>,
}

/// Top-level configuration for [`super::manager::DeviceManager`]
#[derive(Debug, Clone)]
pub struct DeviceManagerConfig {
    /// Trigger recovery automatically when an active device disappears
    pub auto_recover: bool,

    pub kind_overrides: HashMap<DeviceKind, KindConfig>,

    /// Persist preference lists through the configured store
    pub persist_preferences: bool,

    /// Namespace prefix for persisted preference keys
    pub storage_key_prefix: String,

    /// Master switch for `start_monitoring`
    pub enable_monitoring: bool,

    pub monitor: MonitorConfig,
    pub recovery: RecoveryEngineConfig,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        Self {
            auto_recover: true,
            kind_overrides: HashMap::new(),
            persist_preferences: true,
            storage_key_prefix: "devices.preferences".to_string(),
            enable_monitoring: true,
            monitor: MonitorConfig::default(),
            recovery: RecoveryEngineConfig::default(),
        }
    }
}

impl DeviceManagerConfig {
    /// Effective auto-recovery flag for a kind
    pub fn auto_recover_for(&self, kind: DeviceKind) -> bool {
        self.kind_overrides
            .get(&kind)
            .and_then(|c| c.auto_recover)
            .unwrap_or(self.auto_recover)
    }

    /// Storage key for a kind's persisted preference list
    pub fn storage_key(&self, kind: DeviceKind) -> String {
        format!("{}.{}", self.storage_key_prefix, kind)
    }
}
