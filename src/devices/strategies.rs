// Pluggable device recovery strategies
//
// A strategy is a named, ordered policy for choosing a replacement device
// from the current inventory. The engine iterates registered strategies in
// ascending priority, skipping any whose `can_handle` declines, and stops
// at the first accepted and verified result. Custom strategies can be
// registered and removed at any time.

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{
    DeviceDescriptor, DeviceKind, DevicePreference, DeviceState, StrategyResult,
};

/// Inputs a strategy decides over
pub struct StrategyContext<'a> {
    pub kind: DeviceKind,
    pub state: Option<&'a DeviceState>,
    pub preferences: &'a [DevicePreference],
    pub inventory: &'a [DeviceDescriptor],
}

impl<'a> StrategyContext<'a> {
    /// Inventory items matching the kind under recovery, in inventory order
    pub fn inventory_of_kind(&self) -> impl Iterator<Item = &'a DeviceDescriptor> {
        let kind = self.kind;
        self.inventory.iter().filter(move |d| d.kind == kind)
    }
}

/// A replacement-device selection policy
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Unique registry key
    fn name(&self) -> &str;

    /// Ascending execution order (lower runs earlier)
    fn priority(&self) -> u32;

    /// Whether this strategy applies to the given kind/state/preferences/inventory
    fn can_handle(&self, ctx: &StrategyContext<'_>) -> bool;

    async fn execute(&self, ctx: &StrategyContext<'_>) -> StrategyResult;
}

/// Accept only the previously used device id, if still present
pub struct ExactMatchStrategy;

#[async_trait]
impl RecoveryStrategy for ExactMatchStrategy {
    fn name(&self) -> &str {
        "exact_match"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn can_handle(&self, ctx: &StrategyContext<'_>) -> bool {
        ctx.state.map_or(false, |s| s.device_id.is_some())
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> StrategyResult {
        let previous_id = match ctx.state.and_then(|s| s.device_id.as_deref()) {
            Some(id) => id,
            None => return StrategyResult::rejected("no previous device id to match"),
        };

        if ctx.inventory_of_kind().any(|d| d.id == previous_id) {
            StrategyResult::accepted(previous_id, 1.0, "previous device present in inventory")
        } else {
            StrategyResult::rejected(format!(
                "previous device {} not present in inventory",
                previous_id
            ))
        }
    }
}

/// Match by label against the prior state or the top stored preference
pub struct LabelMatchStrategy;

impl LabelMatchStrategy {
    fn target_labels<'a>(ctx: &'a StrategyContext<'_>) -> Vec<&'a str> {
        let mut labels = Vec::new();
        if let Some(label) = ctx.state.and_then(|s| s.label.as_deref()) {
            if !label.is_empty() {
                labels.push(label);
            }
        }
        // Preference lists are kept sorted, the first entry is the
        // highest-priority one
        if let Some(label) = ctx.preferences.first().map(|p| p.label.as_str()) {
            if !label.is_empty() {
                labels.push(label);
            }
        }
        labels
    }
}

#[async_trait]
impl RecoveryStrategy for LabelMatchStrategy {
    fn name(&self) -> &str {
        "label_match"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn can_handle(&self, ctx: &StrategyContext<'_>) -> bool {
        !Self::target_labels(ctx).is_empty()
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> StrategyResult {
        let labels = Self::target_labels(ctx);
        for device in ctx.inventory_of_kind() {
            if labels.iter().any(|l| *l == device.label) {
                return StrategyResult::accepted(
                    device.id.clone(),
                    0.8,
                    format!("label \"{}\" matched inventory device", device.label),
                );
            }
        }
        StrategyResult::rejected("no inventory device matched the known labels")
    }
}

/// Walk stored preferences in priority order, else take the first device
/// of the kind at all
pub struct PreferredFallbackStrategy;

#[async_trait]
impl RecoveryStrategy for PreferredFallbackStrategy {
    fn name(&self) -> &str {
        "fallback"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn can_handle(&self, ctx: &StrategyContext<'_>) -> bool {
        ctx.inventory_of_kind().next().is_some()
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> StrategyResult {
        for preference in ctx.preferences {
            if ctx.inventory_of_kind().any(|d| d.id == preference.device_id) {
                return StrategyResult::accepted(
                    preference.device_id.clone(),
                    0.6,
                    format!(
                        "stored preference {} (priority {}) present in inventory",
                        preference.device_id, preference.priority
                    ),
                );
            }
        }

        match ctx.inventory_of_kind().next() {
            Some(device) => StrategyResult::accepted(
                device.id.clone(),
                0.4,
                format!("first available {} in inventory", ctx.kind),
            ),
            None => StrategyResult::rejected(format!("no {} devices in inventory", ctx.kind)),
        }
    }
}

/// Prefer the platform default device, else the first of the kind
pub struct DefaultDeviceStrategy;

#[async_trait]
impl RecoveryStrategy for DefaultDeviceStrategy {
    fn name(&self) -> &str {
        "default_device"
    }

    fn priority(&self) -> u32 {
        40
    }

    fn can_handle(&self, ctx: &StrategyContext<'_>) -> bool {
        ctx.inventory_of_kind().next().is_some()
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> StrategyResult {
        if let Some(device) = ctx
            .inventory_of_kind()
            .find(|d| d.id.is_empty() || d.id == "default")
        {
            return StrategyResult::accepted(
                device.id.clone(),
                0.3,
                "platform default device present in inventory",
            );
        }

        match ctx.inventory_of_kind().next() {
            Some(device) => StrategyResult::accepted(
                device.id.clone(),
                0.2,
                format!("first available {} in inventory", ctx.kind),
            ),
            None => StrategyResult::rejected(format!("no {} devices in inventory", ctx.kind)),
        }
    }
}

/// The built-in strategy set in execution order
pub fn default_strategies() -> Vec<Arc<dyn RecoveryStrategy>> {
    vec![
        Arc::new(ExactMatchStrategy),
        Arc::new(LabelMatchStrategy),
        Arc::new(PreferredFallbackStrategy),
        Arc::new(DefaultDeviceStrategy),
    ]
}
