pub mod devices;
pub mod log;

// Re-export the device management surface for embedding applications
pub use devices::{
    preference_store, DeviceChangeMonitor, DeviceDescriptor, DeviceDiff, DeviceEnumerator,
    DeviceError, DeviceEvent, DeviceKind, DeviceManager, DeviceManagerConfig, DevicePreference,
    DeviceState, EventBus, FilePreferenceStore, MemoryPreferenceStore, MonitorConfig,
    PreferenceStore, PreferenceUpdate, RecoveryEngine, RecoveryEngineConfig, RecoveryResult,
    RecoveryStrategy, RetryPolicy, SessionSink, StrategyResult,
};
