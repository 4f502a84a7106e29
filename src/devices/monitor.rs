// Device inventory change monitoring
//
// This service re-enumerates the device inventory, diffs consecutive
// snapshots, and emits added/removed/changed events. Three trigger sources
// funnel into one detection routine: a polling timer, debounced native
// change notifications, and visibility/focus regain. Enumeration failures
// mid-run are reported and the loop keeps going; only a failed baseline
// snapshot fails `start()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::enumeration::DeviceEnumerator;
use super::events::{DeviceEvent, EventBus};
use super::types::{DeviceChange, DeviceDescriptor, DeviceDiff, DeviceError, Result};

/// Monitoring configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often the polling trigger re-checks the inventory
    pub poll_interval: Duration,

    /// Collapse window for bursts of native change notifications
    pub debounce_delay: Duration,

    /// Settle delay after a visibility/focus regain before checking
    pub visibility_delay: Duration,

    /// Disable to rely on notifications only
    pub enable_polling: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            debounce_delay: Duration::from_millis(300),
            visibility_delay: Duration::from_millis(250),
            enable_polling: true,
        }
    }
}

/// Monitoring statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MonitorStats {
    pub started_at: Option<DateTime<Utc>>,
    pub checks_performed: u64,
    pub changes_detected: u64,
    pub enumeration_failures: u64,
    pub last_check: Option<DateTime<Utc>>,
}

enum MonitorTrigger {
    Native,
    Visibility,
}

/// Device inventory monitor
///
/// Owns its timers and trigger channel; everything is torn down in
/// `stop()`/`destroy()`, no process-wide state.
pub struct DeviceChangeMonitor {
    enumerator: Arc<dyn DeviceEnumerator>,
    events: EventBus,
    config: MonitorConfig,

    /// Last observed inventory; `None` until `start()` takes the baseline
    snapshot: Arc<AsyncMutex<Option<Vec<DeviceDescriptor>>>>,

    is_running: Arc<AtomicBool>,
    trigger_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<MonitorTrigger>>>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
    stats: Arc<AsyncMutex<MonitorStats>>,
}

impl DeviceChangeMonitor {
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        events: EventBus,
        config: MonitorConfig,
    ) -> Self {
        Self {
            enumerator,
            events,
            config,
            snapshot: Arc::new(AsyncMutex::new(None)),
            is_running: Arc::new(AtomicBool::new(false)),
            trigger_tx: std::sync::Mutex::new(None),
            task: AsyncMutex::new(None),
            stats: Arc::new(AsyncMutex::new(MonitorStats::default())),
        }
    }

    /// Take the baseline snapshot and arm all triggers
    ///
    /// Fails only when the initial enumeration fails. Re-invoking while
    /// active is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Device change monitor already running");
            return Ok(());
        }

        let baseline = match self.enumerator.enumerate_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                self.is_running.store(false, Ordering::SeqCst);
                return Err(DeviceError::Enumeration(e));
            }
        };

        info!(
            "🔍 Starting device change monitor ({} devices in baseline)",
            baseline.len()
        );
        *self.snapshot.lock().await = Some(baseline);
        {
            let mut stats = self.stats.lock().await;
            *stats = MonitorStats::default();
            stats.started_at = Some(Utc::now());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.trigger_tx.lock().unwrap() = Some(tx);

        // Clone references for the monitoring task
        let enumerator = self.enumerator.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let snapshot = self.snapshot.clone();
        let is_running = self.is_running.clone();
        let stats = self.stats.clone();

        let handle = tokio::spawn(async move {
            Self::monitoring_loop(enumerator, events, config, snapshot, is_running, stats, rx)
                .await;
        });
        *self.task.lock().await = Some(handle);

        self.events.emit(DeviceEvent::MonitorStarted);
        Ok(())
    }

    /// Disarm every trigger and timer; idempotent
    pub async fn stop(&self, reason: Option<&str>) {
        if self
            .is_running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        *self.trigger_tx.lock().unwrap() = None;
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }

        self.events.emit(DeviceEvent::MonitorStopped {
            reason: reason.map(str::to_string),
        });
        match reason {
            Some(reason) => info!("🛑 Device change monitor stopped: {}", reason),
            None => info!("🛑 Device change monitor stopped"),
        }
    }

    /// Stop and drop all monitor state
    pub async fn destroy(&self) {
        self.stop(Some("destroyed")).await;
        *self.snapshot.lock().await = None;
    }

    /// Feed a native device-change notification into the debounced trigger
    pub fn notify_devices_changed(&self) {
        self.send_trigger(MonitorTrigger::Native);
    }

    /// Feed a visibility/focus regain into the trigger queue
    pub fn notify_visibility_regained(&self) {
        self.send_trigger(MonitorTrigger::Visibility);
    }

    fn send_trigger(&self, trigger: MonitorTrigger) {
        let guard = self.trigger_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(trigger);
            }
            None => debug!("Monitor trigger ignored, monitor not running"),
        }
    }

    /// Re-enumerate and diff against the last snapshot immediately
    ///
    /// Returns the diff when at least one change was found. Enumeration
    /// failures surface as a `MonitorError` event, not an error return.
    pub async fn check_devices(&self) -> Option<DeviceDiff> {
        Self::run_detection(&self.enumerator, &self.events, &self.snapshot, &self.stats).await
    }

    pub fn is_active(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub async fn get_last_known_devices(&self) -> Vec<DeviceDescriptor> {
        self.snapshot.lock().await.clone().unwrap_or_default()
    }

    pub async fn get_stats(&self) -> MonitorStats {
        self.stats.lock().await.clone()
    }

    /// Main monitoring loop multiplexing all trigger sources
    async fn monitoring_loop(
        enumerator: Arc<dyn DeviceEnumerator>,
        events: EventBus,
        config: MonitorConfig,
        snapshot: Arc<AsyncMutex<Option<Vec<DeviceDescriptor>>>>,
        is_running: Arc<AtomicBool>,
        stats: Arc<AsyncMutex<MonitorStats>>,
        mut triggers: mpsc::UnboundedReceiver<MonitorTrigger>,
    ) {
        let mut poll = interval(config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The baseline was just taken; consume the immediate first tick
        poll.tick().await;

        info!("🔄 Device monitoring loop started");

        while is_running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = poll.tick(), if config.enable_polling => {
                    Self::run_detection(&enumerator, &events, &snapshot, &stats).await;
                }

                trigger = triggers.recv() => {
                    match trigger {
                        Some(MonitorTrigger::Native) => {
                            // Let the notification burst settle, then drain
                            // the backlog so it collapses into one check
                            sleep(config.debounce_delay).await;
                            while triggers.try_recv().is_ok() {}
                            Self::run_detection(&enumerator, &events, &snapshot, &stats).await;
                        }
                        Some(MonitorTrigger::Visibility) => {
                            sleep(config.visibility_delay).await;
                            while triggers.try_recv().is_ok() {}
                            Self::run_detection(&enumerator, &events, &snapshot, &stats).await;
                        }
                        None => {
                            debug!("Trigger channel closed, ending monitoring loop");
                            break;
                        }
                    }
                }
            }
        }

        info!("🛑 Device monitoring loop ended");
    }

    /// Single detection pass shared by every trigger source
    async fn run_detection(
        enumerator: &Arc<dyn DeviceEnumerator>,
        events: &EventBus,
        snapshot: &Arc<AsyncMutex<Option<Vec<DeviceDescriptor>>>>,
        stats: &Arc<AsyncMutex<MonitorStats>>,
    ) -> Option<DeviceDiff> {
        let devices = match enumerator.enumerate_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("⚠️ Device enumeration failed during monitoring: {}", e);
                {
                    let mut stats_guard = stats.lock().await;
                    stats_guard.enumeration_failures += 1;
                }
                events.emit(DeviceEvent::MonitorError {
                    message: e.to_string(),
                    timestamp: Utc::now(),
                });
                return None;
            }
        };

        let diff = {
            let mut snapshot_guard = snapshot.lock().await;
            let diff = match snapshot_guard.as_deref() {
                Some(previous) => diff_devices(previous, &devices),
                // No baseline yet, establish one quietly
                None => DeviceDiff::default(),
            };
            *snapshot_guard = Some(devices);
            diff
        };

        {
            let mut stats_guard = stats.lock().await;
            stats_guard.checks_performed += 1;
            stats_guard.last_check = Some(Utc::now());
            if diff.has_changes() {
                stats_guard.changes_detected += 1;
            }
        }

        if !diff.has_changes() {
            crate::device_debug!("Device check found no inventory changes");
            return None;
        }

        info!(
            "🔌 Device inventory changed: {} added, {} removed, {} changed",
            diff.added.len(),
            diff.removed.len(),
            diff.changed.len()
        );

        events.emit(DeviceEvent::MonitorChange { diff: diff.clone() });
        for device in &diff.added {
            events.emit(DeviceEvent::MonitorDeviceAdded {
                device: device.clone(),
            });
        }
        for device in &diff.removed {
            events.emit(DeviceEvent::MonitorDeviceRemoved {
                device: device.clone(),
            });
        }
        for change in &diff.changed {
            events.emit(DeviceEvent::MonitorDeviceChanged {
                change: change.clone(),
            });
        }

        Some(diff)
    }
}

impl std::fmt::Debug for DeviceChangeMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceChangeMonitor")
            .field("config", &self.config)
            .field("is_running", &self.is_active())
            .finish()
    }
}

/// Diff two inventory snapshots by device id
///
/// An item counts as changed when its id persists but its label, group id,
/// or kind differs between snapshots.
pub fn diff_devices(previous: &[DeviceDescriptor], current: &[DeviceDescriptor]) -> DeviceDiff {
    let mut diff = DeviceDiff::default();

    for device in current {
        match previous.iter().find(|p| p.id == device.id) {
            None => diff.added.push(device.clone()),
            Some(prev) => {
                if prev.label != device.label
                    || prev.group_id != device.group_id
                    || prev.kind != device.kind
                {
                    diff.changed.push(DeviceChange {
                        previous: prev.clone(),
                        current: device.clone(),
                    });
                }
            }
        }
    }

    for device in previous {
        if !current.iter().any(|c| c.id == device.id) {
            diff.removed.push(device.clone());
        }
    }

    diff
}
