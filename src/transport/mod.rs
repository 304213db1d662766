//! Media transport for call sessions.
//!
//! # Architecture
//!
//! - [`PathConnector`]: opens a transport over one [`PathTarget`] (direct
//!   candidate or relay). The negotiator only talks to this trait.
//! - [`MediaTransport`]: an established, encrypted path carrying media.
//! - [`UdpConnector`] / [`UdpTransport`]: the UDP implementation.
//! - [`PeerReflector`]: the answering side of the probe protocol, optionally
//!   acting as a credentialed relay binding endpoint.

mod reflector;
mod udp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callcore::packet::PacketError;
use callcore::{CallDirection, CallError, CallKey, NetworkProfile, PathKind, PathTarget};

pub use reflector::{PeerReflector, ReflectorStats};
pub use udp::{UdpConnector, UdpTransport};

/// Everything a connector needs to open a path for a session.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub key: CallKey,
    pub direction: CallDirection,
    pub max_layer: i32,
    pub profile: NetworkProfile,
    pub muted: bool,
}

/// Counters reported by a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    /// Dropped while muted.
    pub frames_suppressed: u64,
    /// Dropped because the send budget for the current network was spent.
    pub frames_over_budget: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    /// Receive-side playout delay target from the current network profile.
    pub playout_delay: Duration,
}

/// Opens transports over negotiation targets.
#[async_trait]
pub trait PathConnector: Send + Sync {
    /// Establish and verify connectivity over `target`.
    ///
    /// Returns once the remote end has answered; the caller bounds the call
    /// with its own timeout.
    async fn connect(
        &self,
        target: &PathTarget,
        params: &TransportParams,
    ) -> Result<Arc<dyn MediaTransport>, TransportError>;
}

/// An established media path.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn path(&self) -> PathKind;

    /// Most recent round-trip estimate.
    fn rtt(&self) -> Duration;

    /// Protocol layer agreed with the peer: the lower of both sides' ceilings.
    fn max_layer(&self) -> i32;

    /// Whether the path still carries traffic.
    fn is_viable(&self) -> bool;

    /// Muted transports drop outgoing media frames.
    fn set_muted(&self, muted: bool);

    /// Retune keepalive pacing, the send budget and the playout delay.
    fn apply_profile(&self, profile: NetworkProfile);

    /// Send one media frame. Returns `false` when the frame was dropped for
    /// being muted or over the send budget.
    fn send_frame(&self, frame: &[u8]) -> Result<bool, TransportError>;

    /// Resolves once the path is no longer usable, either lost or closed.
    async fn closed(&self);

    fn close(&self);

    fn stats(&self) -> TransportStats;
}

/// Errors from media transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No usable address for {0}")]
    NoValidAddress(String),
    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("Call error: {0}")]
    Call(#[from] CallError),
    #[error("Relay rejected the bind request")]
    RelayRejected,
    #[error("Transport closed")]
    Closed,
}
