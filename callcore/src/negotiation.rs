//! Negotiation planning: which paths to try, in which order, and how often.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::candidate::{CandidateSet, ConnectionCandidate};
use crate::proxy::ProxyConfig;

/// One path the negotiator can attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathTarget {
    /// Straight to the peer over one candidate.
    Direct(ConnectionCandidate),
    /// Through the relay proxy, addressed to the peer by tag.
    Relay { proxy: ProxyConfig, peer_tag: Bytes },
}

impl PathTarget {
    pub fn kind(&self) -> PathKind {
        match self {
            Self::Direct(candidate) => PathKind::Direct {
                candidate_id: candidate.id,
            },
            Self::Relay { .. } => PathKind::Relay,
        }
    }

    pub fn peer_tag(&self) -> &Bytes {
        match self {
            Self::Direct(candidate) => &candidate.peer_tag,
            Self::Relay { peer_tag, .. } => peer_tag,
        }
    }
}

impl std::fmt::Display for PathTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(c) => write!(f, "direct#{} ({}:{})", c.id, c.ipv4, c.port),
            Self::Relay { proxy, .. } => write!(f, "relay ({})", proxy.endpoint()),
        }
    }
}

/// The kind of path a transport ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PathKind {
    Direct { candidate_id: i64 },
    Relay,
}

/// Ordered targets for one negotiation run.
#[derive(Debug, Clone, Default)]
pub struct NegotiationPlan {
    pub primary: Option<PathTarget>,
    pub alternatives: Vec<PathTarget>,
    pub relay: Option<PathTarget>,
}

impl NegotiationPlan {
    /// Direct paths come first when P2P is allowed, then the relay if a proxy
    /// is configured. With neither, the plan is empty.
    pub fn build(candidates: &CandidateSet, proxy: Option<&ProxyConfig>, allow_p2p: bool) -> Self {
        let (primary, alternatives) = if allow_p2p {
            (
                Some(PathTarget::Direct(candidates.primary().clone())),
                candidates
                    .alternatives()
                    .iter()
                    .cloned()
                    .map(PathTarget::Direct)
                    .collect(),
            )
        } else {
            (None, Vec::new())
        };

        let relay = proxy.map(|proxy| PathTarget::Relay {
            proxy: proxy.clone(),
            peer_tag: candidates.primary().peer_tag.clone(),
        });

        Self {
            primary,
            alternatives,
            relay,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.alternatives.is_empty() && self.relay.is_none()
    }

    /// Every target in attempt order.
    pub fn targets(&self) -> impl Iterator<Item = &PathTarget> {
        self.primary
            .iter()
            .chain(self.alternatives.iter())
            .chain(self.relay.iter())
    }
}

/// Per-target retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Upper bound for a single connect attempt.
    pub attempt_timeout: Duration,
    /// Attempts per target, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(3),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
