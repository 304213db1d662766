//! Answering side of the call datagram protocol.
//!
//! A [`PeerReflector`] plays the remote participant: it acknowledges probes
//! and keepalives and counts media. It also accepts relay bind requests, so
//! the same endpoint can stand in for a relay proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use callcore::packet::{Message, PacketCodec, RelayFrame, parse_header};
use callcore::{CallDirection, CallKey};
use log::{debug, info, warn};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::task::JoinHandle;

use super::TransportError;

/// Counters kept by a [`PeerReflector`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReflectorStats {
    pub probes: u64,
    pub keepalives: u64,
    pub media_frames: u64,
    pub relay_binds: u64,
    pub relay_rejections: u64,
}

#[derive(Default)]
struct Counters {
    probes: AtomicU64,
    keepalives: AtomicU64,
    media_frames: AtomicU64,
    relay_binds: AtomicU64,
    relay_rejections: AtomicU64,
}

struct Inner {
    socket: UdpSocket,
    codec: PacketCodec,
    max_layer: i32,
    relay_credentials: Option<(String, String)>,
    silent: AtomicBool,
    counters: Counters,
}

impl Inner {
    async fn reply(&self, message: &Message, to: SocketAddr) {
        let sent = match self.codec.seal(message) {
            Ok(datagram) => self.socket.send_to(&datagram, to).await.map(|_| ()),
            Err(e) => {
                warn!(target: "Call/Reflector", "Failed to seal {:?}: {}", message.kind(), e);
                return;
            }
        };
        if let Err(e) = sent {
            debug!(target: "Call/Reflector", "Reply to {} failed: {}", to, e);
        }
    }

    async fn handle_relay(&self, data: &[u8], from: SocketAddr) {
        let frame = match RelayFrame::decode(data) {
            Ok(frame @ RelayFrame::Bind { .. }) => frame,
            Ok(_) => return,
            Err(e) => {
                debug!(target: "Call/Reflector", "Bad relay frame from {}: {}", from, e);
                return;
            }
        };
        let RelayFrame::Bind { peer_tag, .. } = &frame else {
            return;
        };

        let (username, password) = self
            .relay_credentials
            .as_ref()
            .map(|(u, p)| (u.as_str(), p.as_str()))
            .unwrap_or(("", ""));
        let accepted =
            peer_tag == self.codec.peer_tag() && frame.verify_bind(username, password);

        let reply = if accepted {
            self.counters.relay_binds.fetch_add(1, Ordering::Relaxed);
            info!(target: "Call/Reflector", "Relay bind from {} accepted", from);
            RelayFrame::Bound {
                peer_tag: peer_tag.clone(),
            }
        } else {
            self.counters.relay_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(target: "Call/Reflector", "Relay bind from {} rejected", from);
            RelayFrame::Rejected {
                peer_tag: peer_tag.clone(),
            }
        };

        match reply.encode() {
            Ok(datagram) => {
                if let Err(e) = self.socket.send_to(&datagram, from).await {
                    debug!(target: "Call/Reflector", "Relay reply to {} failed: {}", from, e);
                }
            }
            Err(e) => warn!(target: "Call/Reflector", "Failed to encode relay reply: {}", e),
        }
    }

    async fn handle(&self, data: &[u8], from: SocketAddr) {
        if self.silent.load(Ordering::Relaxed) {
            return;
        }
        match parse_header(data) {
            Ok(header) if header.kind.is_relay() => return self.handle_relay(data, from).await,
            Ok(_) => {}
            Err(e) => {
                debug!(target: "Call/Reflector", "Dropping datagram from {}: {}", from, e);
                return;
            }
        }

        let message = match self.codec.open(data) {
            Ok(message) => message,
            Err(e) => {
                debug!(target: "Call/Reflector", "Dropping datagram from {}: {}", from, e);
                return;
            }
        };

        match message {
            Message::Probe {
                seq,
                timestamp_us,
                max_layer,
            } => {
                self.counters.probes.fetch_add(1, Ordering::Relaxed);
                if max_layer != self.max_layer {
                    debug!(
                        target: "Call/Reflector",
                        "Probe from {} offers layer {}, answering with {}",
                        from, max_layer, self.max_layer
                    );
                }
                let ack = Message::ProbeAck {
                    seq,
                    timestamp_us,
                    max_layer: self.max_layer,
                };
                self.reply(&ack, from).await;
            }
            Message::Keepalive { seq, timestamp_us } => {
                self.counters.keepalives.fetch_add(1, Ordering::Relaxed);
                self.reply(&Message::KeepaliveAck { seq, timestamp_us }, from)
                    .await;
            }
            Message::Media { .. } => {
                self.counters.media_frames.fetch_add(1, Ordering::Relaxed);
            }
            Message::ProbeAck { .. } | Message::KeepaliveAck { .. } => {}
        }
    }
}

/// A UDP endpoint that answers one call's probes, keepalives and relay binds.
pub struct PeerReflector {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl PeerReflector {
    /// Bind and start answering.
    ///
    /// `direction` is the reflector's own side of the call, so a reflector
    /// answering an outgoing caller runs as [`CallDirection::Incoming`].
    /// `max_layer` is the ceiling announced in probe acks. Relay binds must
    /// carry `relay_credentials` when given, and no credentials otherwise.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        key: &CallKey,
        peer_tag: Bytes,
        direction: CallDirection,
        max_layer: i32,
        relay_credentials: Option<(String, String)>,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let codec = PacketCodec::new(key, direction, peer_tag)?;

        let inner = Arc::new(Inner {
            socket,
            codec,
            max_layer,
            relay_credentials,
            silent: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let worker = inner.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match worker.socket.recv_from(&mut buf).await {
                    Ok((len, from)) => worker.handle(&buf[..len], from).await,
                    Err(e) => debug!(target: "Call/Reflector", "Receive error: {}", e),
                }
            }
        });

        info!(
            target: "Call/Reflector",
            "Listening on {} as {:?} (layer {})",
            local_addr, direction, max_layer
        );
        Ok(Self {
            inner,
            local_addr,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop answering without closing the socket, simulating a dead path.
    pub fn set_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ReflectorStats {
        let c = &self.inner.counters;
        ReflectorStats {
            probes: c.probes.load(Ordering::Relaxed),
            keepalives: c.keepalives.load(Ordering::Relaxed),
            media_frames: c.media_frames.load(Ordering::Relaxed),
            relay_binds: c.relay_binds.load(Ordering::Relaxed),
            relay_rejections: c.relay_rejections.load(Ordering::Relaxed),
        }
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for PeerReflector {
    fn drop(&mut self) {
        self.close();
    }
}
