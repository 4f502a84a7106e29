// Multi-strategy device recovery engine
//
// Given a device kind whose current selection became unusable, the engine
// walks its strategy registry in priority order until one yields a
// verified, available replacement, then applies it through the session
// boundary. At most one attempt per kind is in flight; rejected calls and
// exhausted attempts are reported as result values, never as panics or
// errors. Sealed attempts land in a FIFO-capped history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use colored::Colorize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::enumeration::{apply_to_session, AvailabilityProbe, DeviceEnumerator, SessionSink};
use super::events::{DeviceEvent, EventBus};
use super::strategies::{default_strategies, RecoveryStrategy, StrategyContext};
use super::types::{
    AttemptOutcome, AttemptStatus, DeviceError, DeviceKind, DevicePreference, DeviceState,
    RecoveryAttempt, RecoveryResult, RecoveryStatus, Result, StrategyResult,
};

/// Retry behavior for a whole strategy pass
///
/// `max_attempts` counts full passes over the registry, so 1 means a
/// single pass with no retries. The sleep before pass `n+1` is
/// `delay * backoff^n`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::from_millis(250),
            backoff: 2.0,
        }
    }
}

/// Recovery engine configuration
#[derive(Debug, Clone)]
pub struct RecoveryEngineConfig {
    /// Ceiling on attempts per kind within the rolling window
    pub max_attempts_per_window: u32,

    /// Rolling window the ceiling applies to
    pub attempt_window: Duration,

    /// Total sealed attempts kept in history, oldest evicted first
    pub max_history_size: usize,

    /// Strategy names to run first, in the given order; unlisted
    /// strategies follow in their own ascending priority order
    pub priority_order: Vec<String>,

    pub retry: RetryPolicy,
}

impl Default for RecoveryEngineConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_window: 5,
            attempt_window: Duration::from_secs(300),
            max_history_size: 50,
            priority_order: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

struct ActiveRecovery {
    attempt_id: Uuid,
    cancel: Arc<std::sync::Mutex<Option<String>>>,
}

/// How one attempt's strategy walk ended
enum AttemptFlow {
    Succeeded {
        device_id: String,
        method: String,
        executed: u32,
        retries: u32,
    },
    Exhausted {
        executed: u32,
        retries: u32,
    },
    Errored {
        error: String,
        executed: u32,
        retries: u32,
    },
    Cancelled {
        reason: String,
        executed: u32,
        retries: u32,
    },
}

/// Priority-ordered, pluggable device recovery
pub struct RecoveryEngine {
    enumerator: Arc<dyn DeviceEnumerator>,
    probe: Arc<dyn AvailabilityProbe>,
    session: Arc<dyn SessionSink>,
    events: EventBus,
    config: RecoveryEngineConfig,

    strategies: AsyncMutex<HashMap<String, Arc<dyn RecoveryStrategy>>>,
    active: AsyncMutex<HashMap<DeviceKind, ActiveRecovery>>,
    history: AsyncMutex<VecDeque<RecoveryAttempt>>,
}

impl RecoveryEngine {
    /// Create an engine pre-loaded with the default strategy set
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        probe: Arc<dyn AvailabilityProbe>,
        session: Arc<dyn SessionSink>,
        events: EventBus,
        config: RecoveryEngineConfig,
    ) -> Self {
        let mut strategies = HashMap::new();
        for strategy in default_strategies() {
            strategies.insert(strategy.name().to_string(), strategy);
        }

        Self {
            enumerator,
            probe,
            session,
            events,
            config,
            strategies: AsyncMutex::new(strategies),
            active: AsyncMutex::new(HashMap::new()),
            history: AsyncMutex::new(VecDeque::new()),
        }
    }

    /// Register a strategy, replacing any previous one with the same name
    pub async fn register_strategy(&self, strategy: Arc<dyn RecoveryStrategy>) {
        let name = strategy.name().to_string();
        let mut strategies = self.strategies.lock().await;
        if strategies.insert(name.clone(), strategy).is_some() {
            info!("Replaced recovery strategy: {}", name);
        } else {
            info!("Registered recovery strategy: {}", name);
        }
    }

    pub async fn unregister_strategy(&self, name: &str) -> bool {
        let mut strategies = self.strategies.lock().await;
        strategies.remove(name).is_some()
    }

    /// Find and apply a replacement device for the given kind
    ///
    /// Never returns an error: rejections (concurrent attempt, attempt
    /// ceiling) and failures are reported inside the [`RecoveryResult`].
    pub async fn recover_device(
        &self,
        kind: DeviceKind,
        current_state: Option<&DeviceState>,
        preferences: &[DevicePreference],
    ) -> RecoveryResult {
        let cancel = Arc::new(std::sync::Mutex::new(None::<String>));
        let mut attempt = RecoveryAttempt::new(kind);

        {
            let mut active = self.active.lock().await;
            if active.contains_key(&kind) {
                warn!("⚠️ Recovery already in progress for {}, rejecting", kind);
                return RecoveryResult::rejected(
                    kind,
                    DeviceError::ConcurrentRecovery { kind }.to_string(),
                );
            }

            let recent = self.attempts_in_window(kind).await;
            if recent >= self.config.max_attempts_per_window as usize {
                warn!(
                    "⚠️ Recovery attempt ceiling reached for {} ({} in the last {:?})",
                    kind, recent, self.config.attempt_window
                );
                return RecoveryResult::rejected(
                    kind,
                    format!(
                        "recovery attempt limit reached for {}: {} attempts in the last {:?}",
                        kind, recent, self.config.attempt_window
                    ),
                );
            }

            attempt.begin();
            active.insert(
                kind,
                ActiveRecovery {
                    attempt_id: attempt.id,
                    cancel: cancel.clone(),
                },
            );
        }

        info!(
            "🔧 {}: starting recovery for {} (attempt {})",
            "DEVICE_RECOVERY".red(),
            kind,
            attempt.id
        );
        self.events.emit(DeviceEvent::RecoveryStarted {
            kind,
            attempt_id: attempt.id,
        });

        let started = tokio::time::Instant::now();
        let flow = self
            .execute_attempt(kind, current_state, preferences, &cancel)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        {
            let mut active = self.active.lock().await;
            active.remove(&kind);
        }

        let result = match flow {
            AttemptFlow::Succeeded {
                device_id,
                method,
                executed,
                retries,
            } => {
                attempt.retry_count = retries;
                attempt.seal(
                    AttemptStatus::Succeeded,
                    AttemptOutcome {
                        device_id: Some(device_id.clone()),
                        method: Some(method.clone()),
                        error: None,
                    },
                );
                info!(
                    "✅ Recovery for {} succeeded with {} via {}",
                    kind, device_id, method
                );
                self.events.emit(DeviceEvent::RecoverySucceeded {
                    kind,
                    device_id: device_id.clone(),
                    method: method.clone(),
                });
                RecoveryResult::succeeded(kind, device_id, method, executed, duration_ms)
            }
            AttemptFlow::Exhausted { executed, retries } => {
                attempt.retry_count = retries;
                let error = DeviceError::RecoveryExhausted {
                    kind,
                    attempts: executed,
                }
                .to_string();
                attempt.seal(
                    AttemptStatus::Failed,
                    AttemptOutcome {
                        error: Some(error.clone()),
                        ..Default::default()
                    },
                );
                warn!("❌ {}", error);
                self.events.emit(DeviceEvent::RecoveryFailed {
                    kind,
                    error: error.clone(),
                });
                RecoveryResult::failed(kind, error, executed, duration_ms)
            }
            AttemptFlow::Errored {
                error,
                executed,
                retries,
            } => {
                attempt.retry_count = retries;
                attempt.seal(
                    AttemptStatus::Failed,
                    AttemptOutcome {
                        error: Some(error.clone()),
                        ..Default::default()
                    },
                );
                warn!("❌ Recovery for {} failed: {}", kind, error);
                self.events.emit(DeviceEvent::RecoveryFailed {
                    kind,
                    error: error.clone(),
                });
                RecoveryResult::failed(kind, error, executed, duration_ms)
            }
            AttemptFlow::Cancelled {
                reason,
                executed,
                retries,
            } => {
                attempt.retry_count = retries;
                attempt.seal(
                    AttemptStatus::Cancelled,
                    AttemptOutcome {
                        error: Some(reason.clone()),
                        ..Default::default()
                    },
                );
                // recovery.cancelled was already emitted by cancel_recovery
                info!("🛑 Recovery for {} cancelled: {}", kind, reason);
                RecoveryResult::failed(
                    kind,
                    format!("recovery cancelled: {}", reason),
                    executed,
                    duration_ms,
                )
            }
        };

        self.push_history(attempt).await;
        result
    }

    /// Run the strategy walk, retrying whole passes per the retry policy
    async fn execute_attempt(
        &self,
        kind: DeviceKind,
        current_state: Option<&DeviceState>,
        preferences: &[DevicePreference],
        cancel: &Arc<std::sync::Mutex<Option<String>>>,
    ) -> AttemptFlow {
        let mut executed = 0u32;
        let mut retries = 0u32;
        let total_passes = self.config.retry.max_attempts.max(1);

        for pass in 0..total_passes {
            if let Some(reason) = cancelled(cancel) {
                return AttemptFlow::Cancelled {
                    reason,
                    executed,
                    retries,
                };
            }

            let inventory = match self.enumerator.enumerate_devices().await {
                Ok(inventory) => inventory,
                Err(e) => {
                    warn!(
                        "Enumeration failed during recovery pass {}: {}",
                        pass + 1,
                        e
                    );
                    if pass + 1 < total_passes {
                        retries += 1;
                        self.backoff_sleep(pass).await;
                        continue;
                    }
                    return AttemptFlow::Errored {
                        error: format!("device enumeration failed: {}", e),
                        executed,
                        retries,
                    };
                }
            };

            let ctx = StrategyContext {
                kind,
                state: current_state,
                preferences,
                inventory: &inventory,
            };

            for strategy in self.ordered_strategies().await {
                if let Some(reason) = cancelled(cancel) {
                    return AttemptFlow::Cancelled {
                        reason,
                        executed,
                        retries,
                    };
                }

                if !strategy.can_handle(&ctx) {
                    crate::device_debug!("Strategy {} skipped for {}", strategy.name(), kind);
                    continue;
                }

                let result = strategy.execute(&ctx).await;
                executed += 1;
                self.events.emit(DeviceEvent::StrategyExecuted {
                    kind,
                    strategy: strategy.name().to_string(),
                    result: result.clone(),
                });

                // A cancel that landed while the strategy ran discards its
                // result; in-flight collaborator calls are never aborted
                if let Some(reason) = cancelled(cancel) {
                    return AttemptFlow::Cancelled {
                        reason,
                        executed,
                        retries,
                    };
                }

                if !result.success {
                    continue;
                }
                let device_id = match result.device_id {
                    Some(device_id) => device_id,
                    None => continue,
                };

                // Re-verify before accepting; a failed (or failing) probe
                // falls through to the next strategy
                let available = self
                    .probe
                    .is_device_available(&device_id, kind)
                    .await
                    .unwrap_or(false);
                if !available {
                    debug!(
                        "Strategy {} proposed {}, but verification failed",
                        strategy.name(),
                        device_id
                    );
                    continue;
                }

                if let Err(e) = apply_to_session(self.session.as_ref(), kind, &device_id).await {
                    return AttemptFlow::Errored {
                        error: format!("failed to apply {} to session: {}", device_id, e),
                        executed,
                        retries,
                    };
                }

                return AttemptFlow::Succeeded {
                    device_id,
                    method: strategy.name().to_string(),
                    executed,
                    retries,
                };
            }

            if pass + 1 < total_passes {
                retries += 1;
                self.backoff_sleep(pass).await;
            }
        }

        AttemptFlow::Exhausted { executed, retries }
    }

    async fn backoff_sleep(&self, pass: u32) {
        let retry = &self.config.retry;
        let delay = retry.delay.mul_f64(retry.backoff.powi(pass as i32));
        debug!("Backing off {:?} before next recovery pass", delay);
        sleep(delay).await;
    }

    /// Execute a single strategy by name, for diagnostics
    ///
    /// Fails when the strategy is unknown or declines the context; never
    /// applies a device and never touches attempt history.
    pub async fn try_strategy(
        &self,
        name: &str,
        kind: DeviceKind,
        current_state: Option<&DeviceState>,
        preferences: &[DevicePreference],
    ) -> Result<StrategyResult> {
        let strategy = {
            let strategies = self.strategies.lock().await;
            strategies.get(name).cloned()
        }
        .ok_or_else(|| DeviceError::StrategyNotFound {
            name: name.to_string(),
        })?;

        let inventory = self
            .enumerator
            .enumerate_devices()
            .await
            .map_err(DeviceError::Enumeration)?;

        let ctx = StrategyContext {
            kind,
            state: current_state,
            preferences,
            inventory: &inventory,
        };

        if !strategy.can_handle(&ctx) {
            return Err(DeviceError::StrategyNotApplicable {
                name: name.to_string(),
                kind,
            });
        }

        Ok(strategy.execute(&ctx).await)
    }

    /// Cooperatively cancel the in-flight recovery for a kind
    ///
    /// Returns false when nothing is in flight. The pending
    /// `recover_device` call resolves with a failure result carrying the
    /// reason.
    pub async fn cancel_recovery(&self, kind: DeviceKind, reason: &str) -> bool {
        let active = self.active.lock().await;
        match active.get(&kind) {
            Some(entry) => {
                *entry.cancel.lock().unwrap() = Some(reason.to_string());
                info!(
                    "🛑 Cancelling recovery {} for {}: {}",
                    entry.attempt_id, kind, reason
                );
                self.events.emit(DeviceEvent::RecoveryCancelled {
                    kind,
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub async fn get_recovery_history(&self, kind: Option<DeviceKind>) -> Vec<RecoveryAttempt> {
        let history = self.history.lock().await;
        history
            .iter()
            .filter(|a| kind.map_or(true, |k| a.kind == k))
            .cloned()
            .collect()
    }

    pub async fn clear_history(&self, kind: Option<DeviceKind>) {
        let mut history = self.history.lock().await;
        match kind {
            Some(kind) => history.retain(|a| a.kind != kind),
            None => history.clear(),
        }
    }

    pub async fn get_recovery_status(&self) -> RecoveryStatus {
        let active = self.active.lock().await;
        RecoveryStatus {
            active: active.len(),
            queued: 0,
        }
    }

    /// Cancel every active attempt and release engine state
    pub async fn destroy(&self) {
        let kinds: Vec<DeviceKind> = {
            let active = self.active.lock().await;
            active.keys().copied().collect()
        };
        for kind in kinds {
            self.cancel_recovery(kind, "engine destroyed").await;
        }
        self.history.lock().await.clear();
        info!("Recovery engine destroyed");
    }

    /// Registry snapshot in execution order
    ///
    /// Names listed in `priority_order` run first in the configured order;
    /// the rest follow by their own ascending priority.
    async fn ordered_strategies(&self) -> Vec<Arc<dyn RecoveryStrategy>> {
        let strategies = self.strategies.lock().await;
        let mut list: Vec<Arc<dyn RecoveryStrategy>> = strategies.values().cloned().collect();
        let order = &self.config.priority_order;
        list.sort_by_key(|s| {
            let slot = order
                .iter()
                .position(|name| name == s.name())
                .unwrap_or(usize::MAX);
            (slot, s.priority(), s.name().to_string())
        });
        list
    }

    async fn attempts_in_window(&self, kind: DeviceKind) -> usize {
        let window = chrono::Duration::from_std(self.config.attempt_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let cutoff = Utc::now() - window;
        let history = self.history.lock().await;
        history
            .iter()
            .filter(|a| a.kind == kind && a.start_time >= cutoff)
            .count()
    }

    async fn push_history(&self, attempt: RecoveryAttempt) {
        debug_assert!(attempt.status.is_terminal());
        let mut history = self.history.lock().await;
        history.push_back(attempt);
        while history.len() > self.config.max_history_size {
            history.pop_front();
        }
    }
}

impl std::fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("config", &self.config)
            .finish()
    }
}

fn cancelled(cancel: &Arc<std::sync::Mutex<Option<String>>>) -> Option<String> {
    cancel.lock().unwrap().clone()
}
