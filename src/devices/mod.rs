// Session devices module - preference, monitoring, and recovery management
//
// This module provides device preference and recovery management through
// a modular architecture with clear separation of concerns:
// - types: Core device types, attempt records, and error taxonomy
// - events: Typed broadcast event surface for outer layers
// - enumeration: Collaborator contracts and cached device resolution
// - preferences: Preference list maintenance and key/value persistence
// - monitor: Inventory change detection with debounced triggers
// - strategies: Pluggable replacement-selection policies
// - recovery: Multi-strategy recovery engine with attempt history
// - config: Manager configuration surface
// - manager: High-level public API and orchestration

pub mod config;
pub mod enumeration;
pub mod events;
pub mod manager;
pub mod monitor;
pub mod preferences;
pub mod recovery;
pub mod strategies;
pub mod types;

// Re-export main public API
pub use manager::DeviceManager;

// Re-export core types
pub use types::{
    AttemptOutcome, AttemptStatus, DeviceChange, DeviceDescriptor, DeviceDiff, DeviceError,
    DeviceKind, DevicePreference, DeviceState, ManagerStatus, PreferenceUpdate, RecoveryAttempt,
    RecoveryResult, RecoveryStatus, Result, StorageError, StrategyResult,
};

// Re-export the event surface
pub use events::{DeviceEvent, EventBus};

// Re-export collaborator contracts
pub use enumeration::{
    AvailabilityProbe, DeviceEnumerator, EnumerationProbe, EnumerationService, SessionSink,
};

// Re-export persistence
pub use preferences::{
    preference_store, FilePreferenceStore, MemoryPreferenceStore, PreferenceStore,
};

// Re-export monitoring
pub use monitor::{DeviceChangeMonitor, MonitorConfig, MonitorStats};

// Re-export recovery
pub use recovery::{RecoveryEngine, RecoveryEngineConfig, RetryPolicy};
pub use strategies::{
    default_strategies, DefaultDeviceStrategy, ExactMatchStrategy, LabelMatchStrategy,
    PreferredFallbackStrategy, RecoveryStrategy, StrategyContext,
};

// Re-export configuration
pub use config::{DeviceManagerConfig, KindConfig};
