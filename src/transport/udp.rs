//! UDP media transport.
//!
//! A direct path is a connected UDP socket to one candidate address. A relay
//! path first binds at the proxy with a credentialed [`RelayFrame::Bind`] and
//! then runs the same encrypted protocol through it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use callcore::packet::{Message, PacketCodec, RelayFrame, parse_header};
use callcore::{NetworkProfile, PathKind, PathTarget, ProxyConfig, SendBudget};
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

use super::{MediaTransport, PathConnector, TransportError, TransportParams, TransportStats};
use crate::config::CallConfig;

const RECV_BUFFER_SIZE: usize = 2048;

/// Opens [`UdpTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct UdpConnector {
    config: CallConfig,
}

impl UdpConnector {
    pub fn new(config: CallConfig) -> Self {
        Self { config }
    }

    async fn connect_direct(
        &self,
        target: &PathTarget,
        params: &TransportParams,
    ) -> Result<Arc<UdpTransport>, TransportError> {
        let PathTarget::Direct(candidate) = target else {
            return Err(TransportError::NoValidAddress(target.to_string()));
        };

        let remote = candidate
            .socket_addrs(self.config.prefer_ipv6)
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::NoValidAddress(target.to_string()))?;

        let socket = bind_for(remote).await?;
        socket.connect(remote).await?;
        debug!(target: "Call/Udp", "Probing {} at {}", target, remote);

        UdpTransport::establish(
            Arc::new(socket),
            target.kind(),
            candidate.peer_tag.clone(),
            params,
            &self.config,
        )
        .await
    }

    async fn connect_relay(
        &self,
        proxy: &ProxyConfig,
        peer_tag: &Bytes,
        params: &TransportParams,
    ) -> Result<Arc<UdpTransport>, TransportError> {
        let remote = tokio::net::lookup_host(proxy.endpoint())
            .await?
            .next()
            .ok_or_else(|| TransportError::NoValidAddress(proxy.endpoint()))?;

        let socket = Arc::new(bind_for(remote).await?);
        socket.connect(remote).await?;

        info!(
            target: "Call/Udp",
            "Binding at relay {} (credentials: {})",
            remote,
            proxy.credentials().is_some()
        );
        let bind = RelayFrame::bind(peer_tag.clone(), proxy.credentials())?.encode()?;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            socket.send(&bind).await?;

            let Ok(received) = timeout(self.config.probe_interval(), socket.recv(&mut buf)).await
            else {
                continue;
            };
            let len = match received {
                Ok(len) => len,
                Err(e) => {
                    debug!(target: "Call/Udp", "Relay bind receive error: {}", e);
                    tokio::time::sleep(self.config.probe_interval()).await;
                    continue;
                }
            };

            match RelayFrame::decode(&buf[..len]) {
                Ok(RelayFrame::Bound { peer_tag: bound }) if &bound == peer_tag => break,
                Ok(RelayFrame::Rejected { .. }) => {
                    warn!(target: "Call/Udp", "Relay {} rejected the bind", remote);
                    return Err(TransportError::RelayRejected);
                }
                Ok(other) => debug!(target: "Call/Udp", "Ignoring relay frame {:?}", other),
                Err(e) => debug!(target: "Call/Udp", "Ignoring datagram during bind: {}", e),
            }
        }

        UdpTransport::establish(socket, PathKind::Relay, peer_tag.clone(), params, &self.config)
            .await
    }
}

#[async_trait]
impl PathConnector for UdpConnector {
    async fn connect(
        &self,
        target: &PathTarget,
        params: &TransportParams,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let transport = match target {
            PathTarget::Direct(_) => self.connect_direct(target, params).await?,
            PathTarget::Relay { proxy, peer_tag } => {
                self.connect_relay(proxy, peer_tag, params).await?
            }
        };
        Ok(transport as Arc<dyn MediaTransport>)
    }
}

async fn bind_for(remote: SocketAddr) -> Result<UdpSocket, TransportError> {
    let local = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    Ok(UdpSocket::bind(local).await?)
}

/// Outgoing media budget and when it was last topped up.
struct MediaBudget {
    budget: SendBudget,
    refilled_at: Instant,
}

impl MediaBudget {
    fn spend(&mut self, bytes: usize) -> bool {
        let now = Instant::now();
        self.budget.refill(now.duration_since(self.refilled_at));
        self.refilled_at = now;
        self.budget.try_consume(bytes)
    }
}

/// State shared between the transport handle and its background tasks.
struct Shared {
    socket: Arc<UdpSocket>,
    codec: PacketCodec,
    epoch: Instant,
    /// Our own layer ceiling, announced in probes and probe acks.
    local_layer: i32,
    agreed_layer: AtomicI32,
    rtt_us: AtomicU64,
    last_heard_us: AtomicU64,
    seq: AtomicU32,
    muted: AtomicBool,
    budget: Mutex<MediaBudget>,
    frames_sent: AtomicU64,
    frames_suppressed: AtomicU64,
    frames_over_budget: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    /// `true` once the path is lost or closed.
    down: watch::Sender<bool>,
    profile: watch::Sender<NetworkProfile>,
}

impl Shared {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn record_rtt(&self, timestamp_us: u64) {
        let sample = self.now_us().saturating_sub(timestamp_us);
        self.rtt_us.store(sample, Ordering::Relaxed);
    }

    fn agree_layer(&self, peer_layer: i32) -> i32 {
        let agreed = self.local_layer.min(peer_layer);
        self.agreed_layer.store(agreed, Ordering::Relaxed);
        agreed
    }

    fn heard(&self) {
        self.last_heard_us.store(self.now_us(), Ordering::Relaxed);
    }

    fn mark_down(&self) {
        self.down.send_replace(true);
    }

    fn is_down(&self) -> bool {
        *self.down.borrow()
    }

    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let datagram = self.codec.seal(message)?;
        self.socket.send(&datagram).await?;
        Ok(())
    }

    async fn handle_datagram(&self, data: &[u8]) {
        if parse_header(data).is_ok_and(|h| h.kind.is_relay()) {
            return;
        }

        let message = match self.codec.open(data) {
            Ok(message) => message,
            Err(e) => {
                debug!(target: "Call/Udp", "Dropping datagram: {}", e);
                return;
            }
        };
        self.heard();

        let reply = match message {
            Message::Probe {
                seq, timestamp_us, ..
            } => Some(Message::ProbeAck {
                seq,
                timestamp_us,
                max_layer: self.local_layer,
            }),
            Message::Keepalive { seq, timestamp_us } => {
                Some(Message::KeepaliveAck { seq, timestamp_us })
            }
            Message::ProbeAck { timestamp_us, .. } | Message::KeepaliveAck { timestamp_us, .. } => {
                self.record_rtt(timestamp_us);
                None
            }
            Message::Media { .. } => {
                self.frames_received.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        if let Some(reply) = reply
            && let Err(e) = self.send(&reply).await
        {
            debug!(target: "Call/Udp", "Failed to answer {:?}: {}", reply.kind(), e);
        }
    }
}

/// An established, encrypted UDP path.
pub struct UdpTransport {
    shared: Arc<Shared>,
    path: PathKind,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Probe the remote end until it answers, then start the receive and
    /// keepalive loops. Never returns on silence; callers bound it.
    async fn establish(
        socket: Arc<UdpSocket>,
        path: PathKind,
        peer_tag: Bytes,
        params: &TransportParams,
        config: &CallConfig,
    ) -> Result<Arc<Self>, TransportError> {
        let codec = PacketCodec::new(&params.key, params.direction, peer_tag)?;
        let (down, _) = watch::channel(false);
        let (profile, _) = watch::channel(params.profile);

        let shared = Arc::new(Shared {
            socket,
            codec,
            epoch: Instant::now(),
            local_layer: params.max_layer,
            agreed_layer: AtomicI32::new(params.max_layer),
            rtt_us: AtomicU64::new(0),
            last_heard_us: AtomicU64::new(0),
            seq: AtomicU32::new(0),
            muted: AtomicBool::new(params.muted),
            budget: Mutex::new(MediaBudget {
                budget: SendBudget::new(params.profile.target_bitrate_kbps),
                refilled_at: Instant::now(),
            }),
            frames_sent: AtomicU64::new(0),
            frames_suppressed: AtomicU64::new(0),
            frames_over_budget: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            down,
            profile,
        });

        probe_until_answered(&shared, config.probe_interval()).await?;
        shared.heard();
        info!(
            target: "Call/Udp",
            "Path {:?} answered (RTT: {:?}, layer {})",
            path,
            Duration::from_micros(shared.rtt_us.load(Ordering::Relaxed)),
            shared.agreed_layer.load(Ordering::Relaxed)
        );

        let recv_task = tokio::spawn(recv_loop(shared.clone()));
        let keepalive_task = tokio::spawn(keepalive_loop(shared.clone(), config.loss_timeout()));

        Ok(Arc::new(Self {
            shared,
            path,
            tasks: Mutex::new(vec![recv_task, keepalive_task]),
        }))
    }
}

async fn probe_until_answered(shared: &Shared, interval: Duration) -> Result<(), TransportError> {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut first_seq = None;

    loop {
        let seq = shared.next_seq();
        let first = *first_seq.get_or_insert(seq);
        shared
            .send(&Message::Probe {
                seq,
                timestamp_us: shared.now_us(),
                max_layer: shared.local_layer,
            })
            .await?;

        let deadline = Instant::now() + interval;
        while let Ok(received) = tokio::time::timeout_at(deadline, shared.socket.recv(&mut buf)).await
        {
            let len = match received {
                Ok(len) => len,
                Err(e) => {
                    // ICMP unreachable surfaces here on connected sockets.
                    debug!(target: "Call/Udp", "Probe receive error: {}", e);
                    tokio::time::sleep_until(deadline).await;
                    break;
                }
            };
            match shared.codec.open(&buf[..len]) {
                Ok(Message::ProbeAck {
                    seq: acked,
                    timestamp_us,
                    max_layer,
                }) if (first..=seq).contains(&acked) => {
                    shared.record_rtt(timestamp_us);
                    let agreed = shared.agree_layer(max_layer);
                    if agreed < shared.local_layer {
                        debug!(target: "Call/Udp", "Peer caps the layer at {}", agreed);
                    }
                    return Ok(());
                }
                Ok(other) => debug!(target: "Call/Udp", "Ignoring {:?} while probing", other.kind()),
                Err(e) => debug!(target: "Call/Udp", "Ignoring datagram while probing: {}", e),
            }
        }
    }
}

async fn recv_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        match shared.socket.recv(&mut buf).await {
            Ok(len) => shared.handle_datagram(&buf[..len]).await,
            Err(e) => {
                debug!(target: "Call/Udp", "Receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn keepalive_loop(shared: Arc<Shared>, loss_timeout: Duration) {
    let mut profile_rx = shared.profile.subscribe();

    loop {
        let profile = *profile_rx.borrow_and_update();

        tokio::select! {
            _ = tokio::time::sleep(profile.pacing_interval) => {}
            changed = profile_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        }

        let last_heard = shared.last_heard_us.load(Ordering::Relaxed);
        let silent_for = Duration::from_micros(shared.now_us().saturating_sub(last_heard));
        if silent_for >= loss_timeout {
            warn!(target: "Call/Udp", "No traffic for {:?}, path lost", silent_for);
            shared.mark_down();
            return;
        }

        // Unanswered keepalives get redundant copies on lossy networks.
        let copies = if silent_for > profile.pacing_interval * 2 {
            1 + profile.probe_redundancy as usize
        } else {
            1
        };
        for _ in 0..copies {
            let keepalive = Message::Keepalive {
                seq: shared.next_seq(),
                timestamp_us: shared.now_us(),
            };
            if let Err(e) = shared.send(&keepalive).await {
                debug!(target: "Call/Udp", "Keepalive send failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl MediaTransport for UdpTransport {
    fn path(&self) -> PathKind {
        self.path
    }

    fn rtt(&self) -> Duration {
        Duration::from_micros(self.shared.rtt_us.load(Ordering::Relaxed))
    }

    fn max_layer(&self) -> i32 {
        self.shared.agreed_layer.load(Ordering::Relaxed)
    }

    fn is_viable(&self) -> bool {
        !self.shared.is_down()
    }

    fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    fn apply_profile(&self, profile: NetworkProfile) {
        if let Ok(mut media) = self.shared.budget.lock() {
            media.budget.set_bitrate(profile.target_bitrate_kbps);
        }
        self.shared.profile.send_replace(profile);
    }

    fn send_frame(&self, frame: &[u8]) -> Result<bool, TransportError> {
        if self.shared.is_down() {
            return Err(TransportError::Closed);
        }
        if self.shared.muted.load(Ordering::Relaxed) {
            self.shared.frames_suppressed.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        let within_budget = self
            .shared
            .budget
            .lock()
            .map(|mut media| media.spend(frame.len()))
            .unwrap_or(true);
        if !within_budget {
            self.shared.frames_over_budget.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let datagram = self.shared.codec.seal(&Message::Media {
            seq: self.shared.next_seq(),
            payload: Bytes::copy_from_slice(frame),
        })?;
        let sent = self.shared.socket.try_send(&datagram)?;

        self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.shared
            .bytes_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        Ok(true)
    }

    async fn closed(&self) {
        let mut down = self.shared.down.subscribe();
        // The sender lives in `shared`, which outlives this borrow.
        let _ = down.wait_for(|down| *down).await;
    }

    fn close(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.shared.mark_down();
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            frames_suppressed: self.shared.frames_suppressed.load(Ordering::Relaxed),
            frames_over_budget: self.shared.frames_over_budget.load(Ordering::Relaxed),
            frames_received: self.shared.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            playout_delay: self.shared.profile.borrow().jitter_target,
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("path", &self.path)
            .field("viable", &self.is_viable())
            .field("rtt", &self.rtt())
            .field("max_layer", &self.max_layer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcore::{CallDirection, CallKey, ConnectionCandidate};

    fn params() -> TransportParams {
        TransportParams {
            key: CallKey::new(vec![5u8; 32]).unwrap(),
            direction: CallDirection::Outgoing,
            max_layer: 92,
            profile: NetworkProfile::default(),
            muted: false,
        }
    }

    #[tokio::test]
    async fn test_candidate_without_address_is_rejected() {
        let connector = UdpConnector::default();
        let target = PathTarget::Direct(ConnectionCandidate::new(1, "", "", 3478, &b"tag"[..]));

        let result = connector.connect(&target, &params()).await;
        assert!(matches!(result, Err(TransportError::NoValidAddress(_))));
    }

    #[tokio::test]
    async fn test_bind_matches_remote_family() {
        let socket = bind_for("127.0.0.1:9".parse().unwrap()).await.unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
    }
}
