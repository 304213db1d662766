//! Connection candidates for a call session.
//!
//! A candidate describes one network path to the remote peer: an IPv4 and/or
//! IPv6 address, a port and the opaque peer tag the remote end uses to
//! recognise traffic for this call. The [`CandidateSet`] holds the primary
//! candidate plus ordered alternatives and is read-only once built.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use log::warn;

use crate::error::CallError;

/// Peer tags travel with a one-byte length prefix.
pub const MAX_PEER_TAG_LEN: usize = 255;

/// One possible network path to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCandidate {
    pub id: i64,
    pub ipv4: String,
    pub ipv6: String,
    pub port: i32,
    pub peer_tag: Bytes,
}

impl ConnectionCandidate {
    pub fn new(
        id: i64,
        ipv4: impl Into<String>,
        ipv6: impl Into<String>,
        port: i32,
        peer_tag: impl Into<Bytes>,
    ) -> Self {
        Self {
            id,
            ipv4: ipv4.into(),
            ipv6: ipv6.into(),
            port,
            peer_tag: peer_tag.into(),
        }
    }

    /// Checks the fields a path attempt cannot work without.
    pub fn validate(&self) -> Result<(), CallError> {
        if self.peer_tag.is_empty() {
            return Err(CallError::InvalidCandidate(format!(
                "candidate {} has an empty peer tag",
                self.id
            )));
        }
        if self.peer_tag.len() > MAX_PEER_TAG_LEN {
            return Err(CallError::InvalidCandidate(format!(
                "candidate {} has a {}-byte peer tag (max {})",
                self.id,
                self.peer_tag.len(),
                MAX_PEER_TAG_LEN
            )));
        }
        if !(1..=i32::from(u16::MAX)).contains(&self.port) {
            return Err(CallError::InvalidCandidate(format!(
                "candidate {} has port {} outside 1..=65535",
                self.id, self.port
            )));
        }
        Ok(())
    }

    /// Parseable socket addresses for this candidate, preferred family first.
    ///
    /// Empty or malformed address strings are skipped.
    pub fn socket_addrs(&self, prefer_ipv6: bool) -> Vec<SocketAddr> {
        let Ok(port) = u16::try_from(self.port) else {
            return Vec::new();
        };

        let v4 = self
            .ipv4
            .parse::<Ipv4Addr>()
            .ok()
            .map(|ip| SocketAddr::new(IpAddr::V4(ip), port));
        let v6 = self
            .ipv6
            .parse::<Ipv6Addr>()
            .ok()
            .map(|ip| SocketAddr::new(IpAddr::V6(ip), port));

        let ordered = if prefer_ipv6 { [v6, v4] } else { [v4, v6] };
        ordered.into_iter().flatten().collect()
    }
}

/// Primary candidate plus ordered alternatives, fixed for the session lifetime.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    primary: ConnectionCandidate,
    alternatives: Vec<ConnectionCandidate>,
}

impl CandidateSet {
    /// Validates and freezes the candidates for a session.
    ///
    /// The primary candidate must be valid. Alternatives that could never be
    /// dialed are dropped with a warning. Ids must be unique across the set.
    pub fn new(
        primary: ConnectionCandidate,
        alternatives: Vec<ConnectionCandidate>,
    ) -> Result<Self, CallError> {
        primary.validate()?;

        let mut seen = HashSet::new();
        seen.insert(primary.id);

        let mut kept = Vec::with_capacity(alternatives.len());
        for candidate in alternatives {
            if !seen.insert(candidate.id) {
                return Err(CallError::InvalidCandidate(format!(
                    "duplicate candidate id {}",
                    candidate.id
                )));
            }
            match candidate.validate() {
                Ok(()) => kept.push(candidate),
                Err(e) => warn!("Skipping alternative candidate: {}", e),
            }
        }

        Ok(Self {
            primary,
            alternatives: kept,
        })
    }

    pub fn primary(&self) -> &ConnectionCandidate {
        &self.primary
    }

    pub fn alternatives(&self) -> &[ConnectionCandidate] {
        &self.alternatives
    }

    /// Primary first, then alternatives in their given order.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionCandidate> {
        std::iter::once(&self.primary).chain(self.alternatives.iter())
    }
}
