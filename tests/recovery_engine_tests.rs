use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use tokio::time::timeout;

use rtc_devices::devices::enumeration::{AvailabilityProbe, EnumerationProbe};
use rtc_devices::devices::strategies::{RecoveryStrategy, StrategyContext};
use rtc_devices::{
    DeviceError, DeviceEvent, DeviceKind, DeviceState, EventBus, RecoveryEngine,
    RecoveryEngineConfig, RetryPolicy, StrategyResult,
};

mod common;
use common::{camera, microphone, preference, FakeEnumerator, FakeSession};

mock! {
    pub Probe {}

    #[async_trait]
    impl AvailabilityProbe for Probe {
        async fn is_device_available(&self, device_id: &str, kind: DeviceKind) -> anyhow::Result<bool>;
    }
}

fn build_engine(
    enumerator: &Arc<FakeEnumerator>,
    session: &Arc<FakeSession>,
    events: &EventBus,
    config: RecoveryEngineConfig,
) -> RecoveryEngine {
    let probe: Arc<dyn AvailabilityProbe> = Arc::new(EnumerationProbe::new(enumerator.clone()));
    RecoveryEngine::new(
        enumerator.clone(),
        probe,
        session.clone(),
        events.clone(),
        config,
    )
}

fn state_with(device_id: &str, label: &str) -> DeviceState {
    let mut state = DeviceState::new();
    state.device_id = Some(device_id.to_string());
    state.label = Some(label.to_string());
    state.is_available = false;
    state
}

/// A strategy that takes long enough to cancel mid-flight
struct SlowStrategy;

#[async_trait]
impl RecoveryStrategy for SlowStrategy {
    fn name(&self) -> &str {
        "slow"
    }

    fn priority(&self) -> u32 {
        1
    }

    fn can_handle(&self, _ctx: &StrategyContext<'_>) -> bool {
        true
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> StrategyResult {
        tokio::time::sleep(Duration::from_millis(400)).await;
        match ctx.inventory.first() {
            Some(device) => StrategyResult::accepted(device.id.clone(), 0.5, "slow pick"),
            None => StrategyResult::rejected("empty inventory"),
        }
    }
}

/// Test the multi-strategy recovery engine
#[cfg(test)]
mod recovery_engine_tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_match_recovers_previous_device() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        let state = state_with("cam1", "Front Camera");
        let result = engine
            .recover_device(DeviceKind::Camera, Some(&state), &[])
            .await;

        assert!(result.success, "Recovery should succeed: {:?}", result.error);
        assert_eq!(result.device_id.as_deref(), Some("cam1"));
        assert_eq!(result.method.as_deref(), Some("exact_match"));
        assert_eq!(
            session.applied().await,
            vec![(DeviceKind::Camera, "cam1".to_string())],
            "The recovered device should be applied to the session"
        );
    }

    #[tokio::test]
    async fn test_preference_fallback_when_previous_device_gone() {
        // Previous camera cam1 vanished, preferences point at cam2
        let enumerator = FakeEnumerator::new(vec![
            camera("cam2", "Back Camera"),
            microphone("mic1", "Headset"),
        ]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        let state = state_with("cam1", "Front Camera");
        let preferences = vec![preference("cam2", "", 1, true)];
        let result = engine
            .recover_device(DeviceKind::Camera, Some(&state), &preferences)
            .await;

        assert!(result.success, "Recovery should succeed: {:?}", result.error);
        assert_eq!(result.device_id.as_deref(), Some("cam2"));
        assert_eq!(result.method.as_deref(), Some("fallback"));
    }

    #[tokio::test]
    async fn test_label_match_recovers_by_label() {
        // Same label, new id (device re-enumerated under a fresh id)
        let enumerator = FakeEnumerator::new(vec![camera("cam9", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        let state = state_with("cam1", "Front Camera");
        let result = engine
            .recover_device(DeviceKind::Camera, Some(&state), &[])
            .await;

        assert!(result.success);
        assert_eq!(result.device_id.as_deref(), Some("cam9"));
        assert_eq!(result.method.as_deref(), Some("label_match"));
    }

    #[tokio::test]
    async fn test_exhaustion_with_empty_inventory_never_throws() {
        let enumerator = FakeEnumerator::new(vec![microphone("mic1", "Headset")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        let mut rx = events.subscribe();
        let result = engine.recover_device(DeviceKind::Camera, None, &[]).await;

        assert!(!result.success, "No camera in inventory, recovery must fail");
        assert!(result.error.is_some(), "Failure should carry an error");
        assert!(
            session.applied().await.is_empty(),
            "Nothing should be applied to the session"
        );

        let mut saw_failed = false;
        while let Ok(Ok(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
            if matches!(event, DeviceEvent::RecoveryFailed { .. }) {
                saw_failed = true;
                break;
            }
        }
        assert!(saw_failed, "A recovery.failed event should be emitted");

        let history = engine.get_recovery_history(Some(DeviceKind::Camera)).await;
        assert_eq!(history.len(), 1, "The failed attempt should be in history");
        assert_eq!(
            history[0].status,
            rtc_devices::devices::types::AttemptStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_concurrent_recovery_for_same_kind_is_rejected() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        let state = state_with("cam1", "Front Camera");
        let (r1, r2) = tokio::join!(
            engine.recover_device(DeviceKind::Camera, Some(&state), &[]),
            engine.recover_device(DeviceKind::Camera, Some(&state), &[]),
        );

        let successes = [&r1, &r2].iter().filter(|r| r.success).count();
        assert_eq!(successes, 1, "Exactly one concurrent call should succeed");

        let rejected = if r1.success { &r2 } else { &r1 };
        assert!(
            rejected
                .error
                .as_deref()
                .unwrap_or_default()
                .contains("already in progress"),
            "The losing call should be rejected as concurrent: {:?}",
            rejected.error
        );

        let history = engine.get_recovery_history(Some(DeviceKind::Camera)).await;
        assert_eq!(
            history.len(),
            1,
            "A rejected concurrent call must not record an attempt"
        );
    }

    #[tokio::test]
    async fn test_recovery_for_different_kinds_can_overlap() {
        let enumerator = FakeEnumerator::new(vec![
            camera("cam1", "Front Camera"),
            microphone("mic1", "Headset"),
        ]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        let cam_state = state_with("cam1", "Front Camera");
        let mic_state = state_with("mic1", "Headset");
        let (r1, r2) = tokio::join!(
            engine.recover_device(DeviceKind::Camera, Some(&cam_state), &[]),
            engine.recover_device(DeviceKind::Microphone, Some(&mic_state), &[]),
        );

        assert!(r1.success, "Camera recovery should succeed");
        assert!(r2.success, "Microphone recovery should succeed");
    }

    #[tokio::test]
    async fn test_attempt_ceiling_within_window() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let config = RecoveryEngineConfig {
            max_attempts_per_window: 2,
            attempt_window: Duration::from_secs(300),
            ..Default::default()
        };
        let engine = build_engine(&enumerator, &session, &events, config);

        let state = state_with("cam1", "Front Camera");
        for _ in 0..2 {
            let result = engine
                .recover_device(DeviceKind::Camera, Some(&state), &[])
                .await;
            assert!(result.success);
        }

        let third = engine
            .recover_device(DeviceKind::Camera, Some(&state), &[])
            .await;
        assert!(!third.success, "The third attempt should hit the ceiling");
        assert!(
            third
                .error
                .as_deref()
                .unwrap_or_default()
                .contains("attempt limit"),
            "Rejection should name the attempt limit: {:?}",
            third.error
        );

        let history = engine.get_recovery_history(Some(DeviceKind::Camera)).await;
        assert_eq!(history.len(), 2, "The rejected call must not be recorded");
    }

    #[tokio::test]
    async fn test_history_is_capped_fifo() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let config = RecoveryEngineConfig {
            max_history_size: 2,
            ..Default::default()
        };
        let engine = build_engine(&enumerator, &session, &events, config);

        let state = state_with("cam1", "Front Camera");
        let mut attempt_ids = Vec::new();
        for _ in 0..3 {
            engine
                .recover_device(DeviceKind::Camera, Some(&state), &[])
                .await;
            let history = engine.get_recovery_history(None).await;
            attempt_ids.push(history.last().unwrap().id);
        }

        let history = engine.get_recovery_history(None).await;
        assert_eq!(history.len(), 2, "History should be capped at 2 entries");
        assert_eq!(
            history.iter().map(|a| a.id).collect::<Vec<_>>(),
            &attempt_ids[1..],
            "The oldest attempt should be evicted first"
        );
    }

    #[tokio::test]
    async fn test_history_filter_and_clear_by_kind() {
        let enumerator = FakeEnumerator::new(vec![
            camera("cam1", "Front Camera"),
            microphone("mic1", "Headset"),
        ]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        engine
            .recover_device(DeviceKind::Camera, Some(&state_with("cam1", "Front Camera")), &[])
            .await;
        engine
            .recover_device(
                DeviceKind::Microphone,
                Some(&state_with("mic1", "Headset")),
                &[],
            )
            .await;

        assert_eq!(engine.get_recovery_history(None).await.len(), 2);
        assert_eq!(
            engine
                .get_recovery_history(Some(DeviceKind::Camera))
                .await
                .len(),
            1
        );

        engine.clear_history(Some(DeviceKind::Camera)).await;
        assert_eq!(engine.get_recovery_history(None).await.len(), 1);
        engine.clear_history(None).await;
        assert!(engine.get_recovery_history(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_verification_failure_falls_through_to_next_strategy() {
        // cam1 keeps showing up in the inventory but never verifies; the
        // fallback pick of cam2 should win
        let enumerator =
            FakeEnumerator::new(vec![camera("cam2", "Back Camera"), camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();

        let mut probe = MockProbe::new();
        probe
            .expect_is_device_available()
            .returning(|device_id, _kind| Ok(device_id != "cam1"));
        let probe: Arc<dyn AvailabilityProbe> = Arc::new(probe);

        let engine = RecoveryEngine::new(
            enumerator.clone(),
            probe,
            session.clone(),
            events.clone(),
            Default::default(),
        );

        let state = state_with("cam1", "Front Camera");
        let result = engine
            .recover_device(DeviceKind::Camera, Some(&state), &[])
            .await;

        assert!(result.success, "Recovery should fall through to cam2");
        assert_eq!(result.device_id.as_deref(), Some("cam2"));
        assert_eq!(result.method.as_deref(), Some("fallback"));
        assert!(
            result.attempts >= 3,
            "exact_match and label_match should have executed before fallback"
        );
    }

    #[tokio::test]
    async fn test_session_apply_failure_seals_attempt_failed() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        session.set_failing(true);
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        let state = state_with("cam1", "Front Camera");
        let result = engine
            .recover_device(DeviceKind::Camera, Some(&state), &[])
            .await;

        assert!(!result.success, "A failed session apply fails the attempt");
        assert!(
            result
                .error
                .as_deref()
                .unwrap_or_default()
                .contains("apply"),
            "Error should mention the apply step: {:?}",
            result.error
        );
    }

    #[tokio::test]
    async fn test_retry_policy_runs_extra_passes() {
        // No camera ever appears, so both passes exhaust
        let enumerator = FakeEnumerator::new(vec![microphone("mic1", "Headset")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let config = RecoveryEngineConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                delay: Duration::from_millis(10),
                backoff: 1.0,
            },
            ..Default::default()
        };
        let engine = build_engine(&enumerator, &session, &events, config);

        let state = state_with("cam1", "Front Camera");
        let result = engine
            .recover_device(DeviceKind::Camera, Some(&state), &[])
            .await;

        assert!(!result.success);
        // exact_match and label_match execute (and reject) on each pass
        assert_eq!(result.attempts, 4, "Both passes should execute strategies");

        let history = engine.get_recovery_history(Some(DeviceKind::Camera)).await;
        assert_eq!(history.len(), 1, "Retries stay within one attempt record");
        assert_eq!(history[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_priority_order_override() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let config = RecoveryEngineConfig {
            priority_order: vec!["default_device".to_string()],
            ..Default::default()
        };
        let engine = build_engine(&enumerator, &session, &events, config);

        let state = state_with("cam1", "Front Camera");
        let result = engine
            .recover_device(DeviceKind::Camera, Some(&state), &[])
            .await;

        assert!(result.success);
        assert_eq!(
            result.method.as_deref(),
            Some("default_device"),
            "The configured order should run default_device before exact_match"
        );
    }

    #[tokio::test]
    async fn test_unregister_strategy_changes_selection() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        assert!(engine.unregister_strategy("exact_match").await);
        assert!(
            !engine.unregister_strategy("exact_match").await,
            "Second unregister should report absence"
        );

        let state = state_with("cam1", "Front Camera");
        let result = engine
            .recover_device(DeviceKind::Camera, Some(&state), &[])
            .await;

        assert!(result.success);
        assert_eq!(
            result.method.as_deref(),
            Some("label_match"),
            "Without exact_match the label strategy should win"
        );
    }

    #[tokio::test]
    async fn test_registered_strategy_runs_by_priority() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        engine.register_strategy(Arc::new(SlowStrategy)).await;

        let result = engine.recover_device(DeviceKind::Camera, None, &[]).await;
        assert!(result.success);
        assert_eq!(
            result.method.as_deref(),
            Some("slow"),
            "Priority 1 should run before the built-in strategies"
        );
    }

    #[tokio::test]
    async fn test_cancel_resolves_pending_call_with_reason() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = Arc::new(build_engine(&enumerator, &session, &events, Default::default()));
        engine.register_strategy(Arc::new(SlowStrategy)).await;

        let mut rx = events.subscribe();
        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.recover_device(DeviceKind::Camera, None, &[]).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.get_recovery_status().await.active, 1);
        assert!(engine.cancel_recovery(DeviceKind::Camera, "user switched devices").await);

        let result = task.await.expect("Recovery task should not panic");
        assert!(!result.success, "A cancelled recovery resolves as failure");
        assert!(
            result
                .error
                .as_deref()
                .unwrap_or_default()
                .contains("user switched devices"),
            "The failure should carry the cancel reason: {:?}",
            result.error
        );

        let mut saw_cancelled = false;
        while let Ok(Ok(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
            if matches!(event, DeviceEvent::RecoveryCancelled { .. }) {
                saw_cancelled = true;
                break;
            }
        }
        assert!(saw_cancelled, "A recovery.cancelled event should be emitted");

        let history = engine.get_recovery_history(Some(DeviceKind::Camera)).await;
        assert_eq!(history.len(), 1);
        assert_eq!(
            history[0].status,
            rtc_devices::devices::types::AttemptStatus::Cancelled
        );
        assert_eq!(engine.get_recovery_status().await.active, 0);
    }

    #[tokio::test]
    async fn test_cancel_without_active_recovery_returns_false() {
        let enumerator = FakeEnumerator::new(vec![]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        assert!(!engine.cancel_recovery(DeviceKind::Camera, "nothing running").await);
    }

    #[tokio::test]
    async fn test_destroy_cancels_active_attempts() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = Arc::new(build_engine(&enumerator, &session, &events, Default::default()));
        engine.register_strategy(Arc::new(SlowStrategy)).await;

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.recover_device(DeviceKind::Camera, None, &[]).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.destroy().await;

        let result = task.await.expect("Recovery task should not panic");
        assert!(!result.success);
        assert!(
            result
                .error
                .as_deref()
                .unwrap_or_default()
                .contains("engine destroyed"),
            "Destroy should cancel with its reason: {:?}",
            result.error
        );
    }

    #[tokio::test]
    async fn test_try_strategy_diagnostics() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        // Unknown name
        let err = engine
            .try_strategy("nope", DeviceKind::Camera, None, &[])
            .await
            .expect_err("Unknown strategy should fail");
        assert!(matches!(err, DeviceError::StrategyNotFound { .. }));

        // Known but not applicable without previous state
        let err = engine
            .try_strategy("exact_match", DeviceKind::Camera, None, &[])
            .await
            .expect_err("exact_match needs a previous device id");
        assert!(matches!(err, DeviceError::StrategyNotApplicable { .. }));

        // Applicable strategy returns its result without touching history
        let result = engine
            .try_strategy("fallback", DeviceKind::Camera, None, &[])
            .await
            .expect("fallback should be applicable");
        assert!(result.success);
        assert_eq!(result.device_id.as_deref(), Some("cam1"));

        assert!(
            engine.get_recovery_history(None).await.is_empty(),
            "try_strategy must not record attempts"
        );
        assert!(
            session.applied().await.is_empty(),
            "try_strategy must not apply devices"
        );
    }

    #[tokio::test]
    async fn test_recovery_event_sequence() {
        let enumerator = FakeEnumerator::new(vec![camera("cam1", "Front Camera")]);
        let session = FakeSession::new();
        let events = EventBus::default();
        let engine = build_engine(&enumerator, &session, &events, Default::default());

        let mut rx = events.subscribe();
        let state = state_with("cam1", "Front Camera");
        let result = engine
            .recover_device(DeviceKind::Camera, Some(&state), &[])
            .await;
        assert!(result.success);

        let mut names = Vec::new();
        while let Ok(Ok(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
            names.push(match event {
                DeviceEvent::RecoveryStarted { .. } => "started",
                DeviceEvent::StrategyExecuted { .. } => "strategy",
                DeviceEvent::RecoverySucceeded { .. } => "succeeded",
                _ => "other",
            });
            if names.last() == Some(&"succeeded") {
                break;
            }
        }
        assert_eq!(
            names,
            vec!["started", "strategy", "succeeded"],
            "Events should follow started -> strategy -> succeeded"
        );
    }
}
