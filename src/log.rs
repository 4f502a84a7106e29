use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

/// Global flag to control verbose device debug logging
pub static DEVICE_DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Set device debug logging on/off
pub fn set_device_debug(enabled: bool) {
    DEVICE_DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
    tracing::info!(
        "🔧 Device debug logging {}",
        if enabled { "ENABLED" } else { "DISABLED" }
    );
}

/// Check if device debug logging is enabled
pub fn is_device_debug_enabled() -> bool {
    DEVICE_DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Install a default tracing subscriber honoring `RUST_LOG`
///
/// Convenience for binaries and examples embedding this crate; calling it
/// twice is harmless (the second install attempt is ignored).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Device debug macro - only logs if device debug is enabled
#[macro_export]
macro_rules! device_debug {
    ($($arg:tt)*) => {
        if $crate::log::DEVICE_DEBUG_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            tracing::debug!($($arg)*);
        }
    };
}
