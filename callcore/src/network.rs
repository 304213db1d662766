//! Network type tracking and transport tuning.
//!
//! The [`AdaptationController`] turns network-type change events into tuning
//! decisions for the active transport. It never tears a session down: at most
//! it asks for a soft reconnect when the current path cannot work under the
//! new network's characteristics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::CallState;

/// Kind of network the device is currently attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NetworkType {
    #[default]
    Wifi,
    CellularGprs,
    CellularEdge,
    Cellular3g,
    CellularLte,
}

impl NetworkType {
    pub fn is_cellular(&self) -> bool {
        !matches!(self, Self::Wifi)
    }

    /// Tuning parameters for this network type.
    pub fn profile(&self) -> NetworkProfile {
        match self {
            Self::Wifi => NetworkProfile {
                pacing_interval: Duration::from_millis(500),
                jitter_target: Duration::from_millis(40),
                probe_redundancy: 2,
                max_path_rtt: Duration::from_millis(1000),
                target_bitrate_kbps: 32,
            },
            Self::CellularLte => NetworkProfile {
                pacing_interval: Duration::from_millis(750),
                jitter_target: Duration::from_millis(60),
                probe_redundancy: 1,
                max_path_rtt: Duration::from_millis(1500),
                target_bitrate_kbps: 28,
            },
            Self::Cellular3g => NetworkProfile {
                pacing_interval: Duration::from_millis(1000),
                jitter_target: Duration::from_millis(100),
                probe_redundancy: 1,
                max_path_rtt: Duration::from_millis(2500),
                target_bitrate_kbps: 20,
            },
            Self::CellularEdge => NetworkProfile {
                pacing_interval: Duration::from_millis(1500),
                jitter_target: Duration::from_millis(160),
                probe_redundancy: 0,
                max_path_rtt: Duration::from_millis(4000),
                target_bitrate_kbps: 16,
            },
            Self::CellularGprs => NetworkProfile {
                pacing_interval: Duration::from_millis(2000),
                jitter_target: Duration::from_millis(200),
                probe_redundancy: 0,
                max_path_rtt: Duration::from_millis(5000),
                target_bitrate_kbps: 8,
            },
        }
    }
}

/// Transport tuning for one network type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkProfile {
    /// Interval between keepalive probes on the active path.
    pub pacing_interval: Duration,
    /// Playout delay the receiving jitter buffer should aim for.
    pub jitter_target: Duration,
    /// Extra keepalive probes sent back-to-back after an unanswered one.
    pub probe_redundancy: u8,
    /// Round-trip time above which the path is considered unusable.
    pub max_path_rtt: Duration,
    /// Audio bitrate the media path should encode at.
    pub target_bitrate_kbps: u32,
}

impl Default for NetworkProfile {
    fn default() -> Self {
        NetworkType::default().profile()
    }
}

/// Snapshot of the active path, used to judge it under a new network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathHealth {
    pub viable: bool,
    pub rtt: Duration,
}

/// What to do with the active transport after a network change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationDecision {
    /// Nothing changes.
    Unchanged,
    /// Apply the new profile to the running transport.
    Retune(NetworkProfile),
    /// Apply the new profile and negotiate a replacement path.
    SoftReconnect(NetworkProfile),
}

#[derive(Debug, Clone)]
pub struct AdaptationController {
    network_type: NetworkType,
    profile: NetworkProfile,
}

impl AdaptationController {
    pub fn new(network_type: NetworkType) -> Self {
        Self {
            network_type,
            profile: network_type.profile(),
        }
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    pub fn profile(&self) -> NetworkProfile {
        self.profile
    }

    /// Consume a network-type change event.
    ///
    /// `path` is the health of the active transport, `None` while no path has
    /// been established yet.
    pub fn on_network_changed(
        &mut self,
        network_type: NetworkType,
        state: CallState,
        path: Option<PathHealth>,
    ) -> AdaptationDecision {
        if state.is_terminal() || network_type == self.network_type {
            return AdaptationDecision::Unchanged;
        }

        self.network_type = network_type;
        self.profile = network_type.profile();

        match path {
            Some(health) if !health.viable || health.rtt > self.profile.max_path_rtt => {
                AdaptationDecision::SoftReconnect(self.profile)
            }
            _ => AdaptationDecision::Retune(self.profile),
        }
    }
}

const MICROS_PER_SEC: u64 = 1_000_000;

/// Token bucket holding outgoing media to a profile's bitrate.
///
/// Capacity is one second of budget. Amounts are kept in byte-microseconds so
/// refills over very short intervals are not rounded away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendBudget {
    bytes_per_sec: u64,
    available: u64,
}

impl SendBudget {
    pub fn new(bitrate_kbps: u32) -> Self {
        let bytes_per_sec = bytes_per_sec(bitrate_kbps);
        Self {
            bytes_per_sec,
            available: bytes_per_sec * MICROS_PER_SEC,
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Switch to a new bitrate. Budget already saved up beyond the new
    /// capacity is dropped.
    pub fn set_bitrate(&mut self, bitrate_kbps: u32) {
        self.bytes_per_sec = bytes_per_sec(bitrate_kbps);
        self.available = self.available.min(self.capacity());
    }

    pub fn refill(&mut self, elapsed: Duration) {
        let earned = self
            .bytes_per_sec
            .saturating_mul(elapsed.as_micros().min(u64::MAX as u128) as u64);
        self.available = self.available.saturating_add(earned).min(self.capacity());
    }

    /// Take `bytes` from the budget if it covers them.
    pub fn try_consume(&mut self, bytes: usize) -> bool {
        let cost = (bytes as u64).saturating_mul(MICROS_PER_SEC);
        if cost > self.available {
            return false;
        }
        self.available -= cost;
        true
    }

    fn capacity(&self) -> u64 {
        self.bytes_per_sec * MICROS_PER_SEC
    }
}

fn bytes_per_sec(bitrate_kbps: u32) -> u64 {
    u64::from(bitrate_kbps) * 1000 / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy(rtt_ms: u64) -> Option<PathHealth> {
        Some(PathHealth {
            viable: true,
            rtt: Duration::from_millis(rtt_ms),
        })
    }

    #[test]
    fn test_cellular_profiles_are_more_conservative() {
        let wifi = NetworkType::Wifi.profile();
        for cellular in [
            NetworkType::CellularGprs,
            NetworkType::CellularEdge,
            NetworkType::Cellular3g,
            NetworkType::CellularLte,
        ] {
            let profile = cellular.profile();
            assert!(cellular.is_cellular());
            assert!(profile.jitter_target > wifi.jitter_target);
            assert!(profile.pacing_interval > wifi.pacing_interval);
            assert!(profile.probe_redundancy <= wifi.probe_redundancy);
        }
    }

    #[test]
    fn test_viable_path_is_retuned() {
        let mut controller = AdaptationController::new(NetworkType::Wifi);
        let decision =
            controller.on_network_changed(NetworkType::CellularLte, CallState::Connected, healthy(80));

        assert_eq!(
            decision,
            AdaptationDecision::Retune(NetworkType::CellularLte.profile())
        );
        assert_eq!(controller.network_type(), NetworkType::CellularLte);
    }

    #[test]
    fn test_dead_path_requests_soft_reconnect() {
        let mut controller = AdaptationController::new(NetworkType::CellularLte);
        let decision = controller.on_network_changed(
            NetworkType::Wifi,
            CallState::Connected,
            Some(PathHealth {
                viable: false,
                rtt: Duration::from_millis(50),
            }),
        );
        assert!(matches!(decision, AdaptationDecision::SoftReconnect(_)));
    }

    #[test]
    fn test_slow_path_requests_soft_reconnect() {
        let mut controller = AdaptationController::new(NetworkType::CellularGprs);
        // 3s is fine on GPRS but not on wifi.
        let decision =
            controller.on_network_changed(NetworkType::Wifi, CallState::Connected, healthy(3000));
        assert!(matches!(decision, AdaptationDecision::SoftReconnect(_)));
    }

    #[test]
    fn test_failed_session_ignores_changes() {
        let mut controller = AdaptationController::new(NetworkType::Wifi);
        let decision =
            controller.on_network_changed(NetworkType::Cellular3g, CallState::Failed, None);

        assert_eq!(decision, AdaptationDecision::Unchanged);
        assert_eq!(controller.network_type(), NetworkType::Wifi);
    }

    #[test]
    fn test_same_type_is_unchanged() {
        let mut controller = AdaptationController::new(NetworkType::Cellular3g);
        let decision =
            controller.on_network_changed(NetworkType::Cellular3g, CallState::Connected, healthy(10));
        assert_eq!(decision, AdaptationDecision::Unchanged);
    }

    #[test]
    fn test_send_budget_holds_to_bitrate() {
        // 8 kbps is 1000 bytes per second.
        let mut budget = SendBudget::new(NetworkType::CellularGprs.profile().target_bitrate_kbps);
        assert_eq!(budget.bytes_per_sec(), 1000);

        assert!(budget.try_consume(600));
        assert!(!budget.try_consume(600));
        assert!(budget.try_consume(400));
        assert!(!budget.try_consume(1));

        budget.refill(Duration::from_millis(250));
        assert!(budget.try_consume(250));
        assert!(!budget.try_consume(1));

        // Short intervals still add up.
        for _ in 0..10 {
            budget.refill(Duration::from_micros(100));
        }
        assert!(budget.try_consume(1));
    }

    #[test]
    fn test_send_budget_shrinks_on_slower_network() {
        let mut budget = SendBudget::new(NetworkType::Wifi.profile().target_bitrate_kbps);
        assert_eq!(budget.bytes_per_sec(), 4000);

        budget.set_bitrate(NetworkType::CellularGprs.profile().target_bitrate_kbps);
        assert!(budget.try_consume(1000));
        assert!(!budget.try_consume(1));

        // Never refills past one second of the current rate.
        budget.refill(Duration::from_secs(60));
        assert!(budget.try_consume(1000));
        assert!(!budget.try_consume(1));
    }

    #[test]
    fn test_network_type_names_in_config() {
        assert_eq!(
            serde_json::to_string(&NetworkType::CellularLte).unwrap(),
            r#""CellularLte""#
        );
        let parsed: NetworkType = serde_json::from_str(r#""Cellular3g""#).unwrap();
        assert_eq!(parsed, NetworkType::Cellular3g);
        assert!(serde_json::from_str::<NetworkType>(r#""Satellite""#).is_err());
    }

    #[test]
    fn test_initializing_without_path_retunes() {
        let mut controller = AdaptationController::new(NetworkType::Wifi);
        let decision =
            controller.on_network_changed(NetworkType::CellularEdge, CallState::Initializing, None);
        assert_eq!(
            decision,
            AdaptationDecision::Retune(NetworkType::CellularEdge.profile())
        );
    }
}
