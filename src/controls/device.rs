//! device.rs
//! Power and network state as reported by the host OS.
//!
//! The resolver queries these on demand; the worker consults the last known
//! network state before touching the transport. Unknown inputs are `None`
//! and resolve to the passive policy.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerState {
    pub charging: bool,
    pub full: bool,
    /// 0..=100
    pub battery_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// Metered mobile data with usable throughput (LTE/5G class).
    Cellular,
    /// Unmetered link: wifi or ethernet.
    Wifi,
    /// Connected but slow or unknown (2G, captive).
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub connected: bool,
    pub kind: NetworkType,
}

impl NetworkState {
    pub fn disconnected() -> Self {
        Self { connected: false, kind: NetworkType::Other }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceState {
    pub power: Option<PowerState>,
    pub network: Option<NetworkState>,
}

impl DeviceState {
    /// Conditions under which flushing often is cheap enough.
    pub fn favours_aggressive(&self) -> bool {
        let Some(power) = self.power else {
            return false;
        };
        if power.full || (power.charging && power.battery_percent > 30.0) {
            return true;
        }
        match self.network {
            Some(NetworkState { connected: true, kind: NetworkType::Cellular }) => power.battery_percent > 80.0,
            Some(NetworkState { connected: true, kind: NetworkType::Wifi }) => power.battery_percent > 60.0,
            _ => false,
        }
    }

    /// True only once the host has reported the link down; unknown counts as connected.
    pub fn is_disconnected(&self) -> bool {
        matches!(self.network, Some(NetworkState { connected: false, .. }))
    }
}

pub trait DeviceStateProvider: Send + Sync {
    fn power(&self) -> Option<PowerState>;
    fn network(&self) -> Option<NetworkState>;

    fn snapshot(&self) -> DeviceState {
        DeviceState {
            power: self.power(),
            network: self.network(),
        }
    }
}

/// Device state pushed by the host's OS callbacks.
#[derive(Debug, Default)]
pub struct SharedDeviceState {
    state: RwLock<DeviceState>,
}

impl SharedDeviceState {
    pub fn new(initial: DeviceState) -> Self {
        Self { state: RwLock::new(initial) }
    }

    pub fn set_power(&self, power: PowerState) {
        self.state.write().power = Some(power);
    }

    pub fn set_network(&self, network: NetworkState) {
        self.state.write().network = Some(network);
    }
}

impl DeviceStateProvider for SharedDeviceState {
    fn power(&self) -> Option<PowerState> {
        self.state.read().power
    }

    fn network(&self) -> Option<NetworkState> {
        self.state.read().network
    }

    fn snapshot(&self) -> DeviceState {
        *self.state.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(charging: bool, full: bool, pct: f32, net: Option<(bool, NetworkType)>) -> DeviceState {
        DeviceState {
            power: Some(PowerState { charging, full, battery_percent: pct }),
            network: net.map(|(connected, kind)| NetworkState { connected, kind }),
        }
    }

    #[test]
    fn charging_above_thirty_is_aggressive() {
        assert!(state(true, false, 31.0, None).favours_aggressive());
        assert!(!state(true, false, 30.0, None).favours_aggressive());
    }

    #[test]
    fn full_battery_is_aggressive() {
        assert!(state(false, true, 100.0, None).favours_aggressive());
    }

    #[test]
    fn cellular_needs_eighty_percent() {
        assert!(state(false, false, 81.0, Some((true, NetworkType::Cellular))).favours_aggressive());
        assert!(!state(false, false, 75.0, Some((true, NetworkType::Cellular))).favours_aggressive());
    }

    #[test]
    fn wifi_needs_sixty_percent() {
        assert!(state(false, false, 61.0, Some((true, NetworkType::Wifi))).favours_aggressive());
        assert!(!state(false, false, 59.0, Some((true, NetworkType::Wifi))).favours_aggressive());
        assert!(!state(false, false, 95.0, Some((false, NetworkType::Wifi))).favours_aggressive());
        assert!(!state(false, false, 95.0, Some((true, NetworkType::Other))).favours_aggressive());
    }

    #[test]
    fn missing_inputs_are_passive() {
        assert!(!DeviceState::default().favours_aggressive());
        assert!(!DeviceState::default().is_disconnected());
    }

    #[test]
    fn shared_state_snapshot_reflects_updates() {
        let shared = SharedDeviceState::default();
        shared.set_network(NetworkState::disconnected());
        assert!(shared.snapshot().is_disconnected());
        shared.set_network(NetworkState { connected: true, kind: NetworkType::Wifi });
        shared.set_power(PowerState { charging: true, full: false, battery_percent: 50.0 });
        let snap = shared.snapshot();
        assert!(!snap.is_disconnected());
        assert!(snap.favours_aggressive());
    }
}
