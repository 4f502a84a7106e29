// High-level device management and public API
//
// This module provides the DeviceManager facade that composes preference
// storage, inventory monitoring, and the recovery engine. It is the only
// component allowed to mutate per-kind device state and the in-memory
// preference lists, and it wires monitor removals to recovery triggers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::DeviceManagerConfig;
use super::enumeration::{
    apply_to_session, AvailabilityProbe, DeviceEnumerator, EnumerationProbe, EnumerationService,
    SessionSink,
};
use super::events::{DeviceEvent, EventBus};
use super::monitor::DeviceChangeMonitor;
use super::preferences::{sort_preferences, upsert_preference, PreferenceStore};
use super::recovery::RecoveryEngine;
use super::types::{
    DeviceDescriptor, DeviceError, DeviceKind, DevicePreference, DeviceState, ManagerStatus,
    PreferenceUpdate, RecoveryResult, Result,
};

/// Shared handles the monitor-wiring and auto-recovery tasks run on
#[derive(Clone)]
struct ManagerShared {
    config: DeviceManagerConfig,
    events: EventBus,
    enumeration: Arc<EnumerationService>,
    engine: Arc<RecoveryEngine>,
    states: Arc<AsyncMutex<HashMap<DeviceKind, DeviceState>>>,
    preferences: Arc<AsyncMutex<HashMap<DeviceKind, Vec<DevicePreference>>>>,
}

/// Session device facade: current state, preferences, monitoring, recovery
pub struct DeviceManager {
    shared: ManagerShared,
    store: Arc<dyn PreferenceStore>,
    session: Arc<dyn SessionSink>,
    monitor: Arc<DeviceChangeMonitor>,
    wiring_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
    /// Create a manager with its own event bus
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        session: Arc<dyn SessionSink>,
        store: Arc<dyn PreferenceStore>,
        config: DeviceManagerConfig,
    ) -> Self {
        Self::with_events(enumerator, session, store, config, EventBus::default())
    }

    /// Create a manager publishing into an existing event bus
    pub fn with_events(
        enumerator: Arc<dyn DeviceEnumerator>,
        session: Arc<dyn SessionSink>,
        store: Arc<dyn PreferenceStore>,
        config: DeviceManagerConfig,
        events: EventBus,
    ) -> Self {
        let enumeration = Arc::new(EnumerationService::new(enumerator.clone()));
        let probe: Arc<dyn AvailabilityProbe> = Arc::new(EnumerationProbe::new(enumerator.clone()));
        let engine = Arc::new(RecoveryEngine::new(
            enumerator.clone(),
            probe,
            session.clone(),
            events.clone(),
            config.recovery.clone(),
        ));
        let monitor = Arc::new(DeviceChangeMonitor::new(
            enumerator,
            events.clone(),
            config.monitor.clone(),
        ));

        let mut states = HashMap::new();
        for kind in DeviceKind::ALL {
            states.insert(kind, DeviceState::new());
        }

        Self {
            shared: ManagerShared {
                config,
                events,
                enumeration,
                engine,
                states: Arc::new(AsyncMutex::new(states)),
                preferences: Arc::new(AsyncMutex::new(HashMap::new())),
            },
            store,
            session,
            monitor,
            wiring_task: AsyncMutex::new(None),
        }
    }

    /// Load persisted preference lists (best-effort)
    pub async fn initialize(&self) {
        if !self.shared.config.persist_preferences {
            return;
        }
        if !self.store.is_available() {
            warn!("Preference store unavailable, starting with empty preferences");
            return;
        }

        for kind in DeviceKind::ALL {
            let key = self.shared.config.storage_key(kind);
            match self.store.load(&key).await {
                Ok(Some(mut list)) => {
                    sort_preferences(&mut list);
                    let count = list.len();
                    self.shared.preferences.lock().await.insert(kind, list);
                    self.shared
                        .events
                        .emit(DeviceEvent::PreferencesLoaded { kind, count });
                    info!("Loaded {} stored {} preference(s)", count, kind);
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to load {} preferences: {}", kind, e),
            }
        }
    }

    pub async fn set_camera(
        &self,
        device_id: &str,
        preference: Option<PreferenceUpdate>,
    ) -> Result<()> {
        self.set_device(DeviceKind::Camera, device_id, preference)
            .await
    }

    pub async fn set_microphone(
        &self,
        device_id: &str,
        preference: Option<PreferenceUpdate>,
    ) -> Result<()> {
        self.set_device(DeviceKind::Microphone, device_id, preference)
            .await
    }

    pub async fn set_speaker(
        &self,
        device_id: &str,
        preference: Option<PreferenceUpdate>,
    ) -> Result<()> {
        self.set_device(DeviceKind::Speaker, device_id, preference)
            .await
    }

    /// Select a device for a kind, optionally recording it as a preference
    ///
    /// Rejects with [`DeviceError::DeviceNotFound`] when the id is absent
    /// from the inventory for the kind. State and preference updates commit
    /// before the session apply; an apply failure propagates unchanged and
    /// leaves the commits in place.
    pub async fn set_device(
        &self,
        kind: DeviceKind,
        device_id: &str,
        preference: Option<PreferenceUpdate>,
    ) -> Result<()> {
        let descriptor = self
            .shared
            .enumeration
            .resolve_device(device_id, kind)
            .await
            .map_err(DeviceError::Enumeration)?
            .ok_or_else(|| DeviceError::DeviceNotFound {
                device_id: device_id.to_string(),
                kind,
            })?;

        // Commit state in memory before any suspension point
        {
            let mut states = self.shared.states.lock().await;
            let state = states.entry(kind).or_default();
            state.mark_active(&descriptor);
            self.shared.events.emit(DeviceEvent::StateChanged {
                kind,
                state: state.clone(),
            });
        }

        let updated_list = if let Some(update) = preference {
            let mut prefs = self.shared.preferences.lock().await;
            let list = prefs.entry(kind).or_default();
            let stored = upsert_preference(list, &descriptor, update);
            self.shared.events.emit(DeviceEvent::PreferenceUpdated {
                kind,
                preference: stored,
            });
            Some(list.clone())
        } else {
            None
        };

        if let Some(list) = updated_list {
            if self.shared.config.persist_preferences {
                self.persist_for(kind, &list).await;
            }
        }

        // Session apply last; its failures are the caller's to handle
        apply_to_session(self.session.as_ref(), kind, &descriptor.id)
            .await
            .map_err(DeviceError::SessionApply)?;

        info!("🎛️ {} set to {} ({})", kind, descriptor.id, descriptor.label);
        Ok(())
    }

    pub async fn get_device_state(&self, kind: DeviceKind) -> DeviceState {
        let states = self.shared.states.lock().await;
        states.get(&kind).cloned().unwrap_or_default()
    }

    pub async fn get_preferences(&self, kind: DeviceKind) -> Vec<DevicePreference> {
        let prefs = self.shared.preferences.lock().await;
        prefs.get(&kind).cloned().unwrap_or_default()
    }

    /// Remove preferences for one kind, or all kinds when `None`
    pub async fn clear_preferences(&self, kind: Option<DeviceKind>) {
        {
            let mut prefs = self.shared.preferences.lock().await;
            match kind {
                Some(kind) => {
                    prefs.remove(&kind);
                }
                None => prefs.clear(),
            }
        }

        if self.shared.config.persist_preferences {
            let kinds: Vec<DeviceKind> = match kind {
                Some(kind) => vec![kind],
                None => DeviceKind::ALL.to_vec(),
            };
            for kind in kinds {
                let key = self.shared.config.storage_key(kind);
                if let Err(e) = self.store.clear(&key).await {
                    warn!("Failed to clear stored {} preferences: {}", kind, e);
                }
            }
        }

        self.shared
            .events
            .emit(DeviceEvent::PreferencesCleared { kind });
        match kind {
            Some(kind) => info!("Cleared {} preferences", kind),
            None => info!("Cleared preferences for all device kinds"),
        }
    }

    /// Run recovery for a kind with the current state and preferences
    pub async fn recover_device(&self, kind: DeviceKind) -> RecoveryResult {
        self.shared.recover_and_commit(kind).await
    }

    /// Start inventory monitoring and the removal-to-recovery wiring
    pub async fn start_monitoring(&self) -> Result<()> {
        if !self.shared.config.enable_monitoring {
            debug!("Monitoring disabled by configuration");
            return Ok(());
        }

        self.monitor.start().await?;

        let mut wiring = self.wiring_task.lock().await;
        if wiring.is_none() {
            let shared = self.shared.clone();
            let mut rx = self.shared.events.subscribe();
            *wiring = Some(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(DeviceEvent::MonitorDeviceRemoved { device }) => {
                            shared.handle_device_removed(device).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Device event listener lagged, missed {} events", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        drop(wiring);

        self.emit_status().await;
        Ok(())
    }

    /// Stop monitoring; idempotent
    pub async fn stop_monitoring(&self) {
        self.monitor.stop(None).await;
        if let Some(handle) = self.wiring_task.lock().await.take() {
            handle.abort();
        }
        self.emit_status().await;
    }

    pub async fn get_status(&self) -> ManagerStatus {
        ManagerStatus {
            is_monitoring: self.monitor.is_active(),
            active_recoveries: self.shared.engine.get_recovery_status().await.active,
        }
    }

    /// The bus every component publishes into
    pub fn events(&self) -> EventBus {
        self.shared.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    /// The composed recovery engine (history, diagnostics, cancellation)
    pub fn recovery_engine(&self) -> &Arc<RecoveryEngine> {
        &self.shared.engine
    }

    /// The composed inventory monitor (notification feeds, stats)
    pub fn monitor(&self) -> &Arc<DeviceChangeMonitor> {
        &self.monitor
    }

    /// Stop everything and clear state and preference maps
    pub async fn destroy(&self) {
        self.stop_monitoring().await;
        self.monitor.destroy().await;
        self.shared.engine.destroy().await;

        {
            let mut states = self.shared.states.lock().await;
            for state in states.values_mut() {
                *state = DeviceState::new();
            }
        }
        self.shared.preferences.lock().await.clear();

        self.emit_status().await;
        info!("Device manager destroyed");
    }

    async fn persist_for(&self, kind: DeviceKind, list: &[DevicePreference]) {
        let key = self.shared.config.storage_key(kind);
        match self.store.save(&key, list).await {
            Ok(()) => {
                self.shared.events.emit(DeviceEvent::PreferencesSaved {
                    kind,
                    count: list.len(),
                });
            }
            // Persistence is best-effort, a failed save never fails the
            // device switch that triggered it
            Err(e) => warn!("Failed to persist {} preferences: {}", kind, e),
        }
    }

    async fn emit_status(&self) {
        let status = self.get_status().await;
        self.shared
            .events
            .emit(DeviceEvent::StatusChanged { status });
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("config", &self.shared.config)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl ManagerShared {
    /// React to a removed device: mark the kind unavailable and, when
    /// enabled, kick off auto-recovery off the monitor's detection path
    async fn handle_device_removed(&self, device: DeviceDescriptor) {
        let kind = device.kind;
        let was_current = {
            let mut states = self.states.lock().await;
            let state = states.entry(kind).or_default();
            if state.device_id.as_deref() == Some(device.id.as_str()) && state.is_available {
                state.mark_unavailable("device removed from inventory");
                true
            } else {
                false
            }
        };
        if !was_current {
            return;
        }

        warn!("🔌 Active {} {} disappeared from inventory", kind, device.id);
        self.events.emit(DeviceEvent::DeviceUnavailable {
            kind,
            device_id: device.id.clone(),
        });

        if self.config.auto_recover_for(kind) {
            let shared = self.clone();
            tokio::spawn(async move {
                let result = shared.recover_and_commit(kind).await;
                if !result.success {
                    // Reported, never thrown back into the monitor path
                    warn!(
                        "Auto-recovery for {} failed: {}",
                        kind,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            });
        }
    }

    /// Delegate to the engine and commit a successful result to state
    async fn recover_and_commit(&self, kind: DeviceKind) -> RecoveryResult {
        let current_state = {
            let states = self.states.lock().await;
            states.get(&kind).cloned()
        };
        let preferences = {
            let prefs = self.preferences.lock().await;
            prefs.get(&kind).cloned().unwrap_or_default()
        };

        let result = self
            .engine
            .recover_device(kind, current_state.as_ref(), &preferences)
            .await;

        if result.success {
            if let Some(device_id) = result.device_id.clone() {
                // Prefer the fresh descriptor when it resolves; keep the id
                // either way, the engine already verified it
                let descriptor = self
                    .enumeration
                    .resolve_device(&device_id, kind)
                    .await
                    .ok()
                    .flatten();

                let mut states = self.states.lock().await;
                let state = states.entry(kind).or_default();
                match descriptor {
                    Some(descriptor) => state.mark_active(&descriptor),
                    None => {
                        state.device_id = Some(device_id);
                        state.is_available = true;
                        state.is_active = true;
                        state.error = None;
                        state.last_updated = Utc::now();
                    }
                }
                self.events.emit(DeviceEvent::StateChanged {
                    kind,
                    state: state.clone(),
                });
            }
        }

        self.events.emit(DeviceEvent::RecoveryCompleted {
            kind,
            success: result.success,
        });
        result
    }
}
