//! Device signals consulted before gated work.
//!
//! Implementations report live values; callers poll right before each
//! gated action and never cache the answers.

use std::sync::Mutex;

pub trait DeviceConditions: Send + Sync {
    fn is_network_available(&self) -> bool;

    /// Battery charge in `0.0..=1.0`, or `None` when unknown (simulator,
    /// desktop, plugged-in devices that do not report).
    fn battery_level(&self) -> Option<f32>;

    fn is_low_power_mode(&self) -> bool;
}

/// Snapshot of device signals
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceSnapshot {
    pub network_available: bool,
    pub battery_level: Option<f32>,
    pub low_power_mode: bool,
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        Self {
            network_available: true,
            battery_level: None,
            low_power_mode: false,
        }
    }
}

/// Settable conditions, for hosts that push state changes rather than
/// answer queries, and for tests.
#[derive(Debug, Default)]
pub struct StaticConditions {
    state: Mutex<DeviceSnapshot>,
}

impl StaticConditions {
    pub fn new(state: DeviceSnapshot) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn online() -> Self {
        Self::default()
    }

    pub fn offline() -> Self {
        Self::new(DeviceSnapshot {
            network_available: false,
            ..Default::default()
        })
    }

    fn update(&self, f: impl FnOnce(&mut DeviceSnapshot)) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state);
    }

    fn snapshot(&self) -> DeviceSnapshot {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_network_available(&self, available: bool) {
        self.update(|s| s.network_available = available);
    }

    pub fn set_battery_level(&self, level: Option<f32>) {
        self.update(|s| s.battery_level = level);
    }

    pub fn set_low_power_mode(&self, enabled: bool) {
        self.update(|s| s.low_power_mode = enabled);
    }
}

impl DeviceConditions for StaticConditions {
    fn is_network_available(&self) -> bool {
        self.snapshot().network_available
    }

    fn battery_level(&self) -> Option<f32> {
        self.snapshot().battery_level
    }

    fn is_low_power_mode(&self) -> bool {
        self.snapshot().low_power_mode
    }
}
