// Shared helpers: a scripted path connector and an in-memory transport.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use callcore::{CallState, ConnectionCandidate, NetworkProfile, PathKind, PathTarget};
use ongoing_call::CallContext;
use ongoing_call::transport::{
    MediaTransport, PathConnector, TransportError, TransportParams, TransportStats,
};
use tokio::sync::watch;

pub const KEY: [u8; 32] = [7u8; 32];

pub fn candidate(id: i64) -> ConnectionCandidate {
    ConnectionCandidate::new(id, format!("10.0.0.{id}"), "", 3478, &b"peer-tag"[..])
}

pub fn direct(id: i64) -> PathKind {
    PathKind::Direct { candidate_id: id }
}

/// Record every state the observer sees.
pub fn observe(context: &CallContext) -> Arc<Mutex<Vec<CallState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    context.set_state_changed(move |state| sink.lock().unwrap().push(state));
    seen
}

/// Let the actor and negotiation tasks run. Time is paused in these tests,
/// so this auto-advances through every pending timer up to `secs`.
pub async fn run_for(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Answer after `delay` with the given RTT.
    Succeed { delay: Duration, rtt: Duration },
    /// Fail right away.
    Fail,
    /// Never answer; only the attempt timeout ends it.
    Hang,
}

impl Behavior {
    pub fn ok(rtt_ms: u64) -> Self {
        Self::Succeed {
            delay: Duration::from_millis(5),
            rtt: Duration::from_millis(rtt_ms),
        }
    }
}

/// Counts hanging attempts until their future is dropped.
struct PendingAttempt(Arc<AtomicUsize>);

impl PendingAttempt {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for PendingAttempt {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Path connector driven by per-path scripts. Each script is consumed one
/// attempt at a time and its last entry repeats; unscripted paths hang.
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<HashMap<PathKind, VecDeque<Behavior>>>,
    attempts: Mutex<Vec<PathKind>>,
    opened: Mutex<Vec<Arc<MockTransport>>>,
    pending: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, path: PathKind, behaviors: impl IntoIterator<Item = Behavior>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(path, behaviors.into_iter().collect());
    }

    pub fn attempts(&self) -> Vec<PathKind> {
        self.attempts.lock().unwrap().clone()
    }

    /// Hanging attempts whose futures are still alive.
    pub fn pending_attempts(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<Arc<MockTransport>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn last_opened(&self) -> Arc<MockTransport> {
        self.opened().last().cloned().expect("no transport opened")
    }

    fn next_behavior(&self, path: PathKind) -> Behavior {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&path) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(Behavior::Hang),
            Some(script) => script.front().copied().unwrap_or(Behavior::Hang),
            None => Behavior::Hang,
        }
    }
}

#[async_trait]
impl PathConnector for ScriptedConnector {
    async fn connect(
        &self,
        target: &PathTarget,
        params: &TransportParams,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let path = target.kind();
        self.attempts.lock().unwrap().push(path);

        match self.next_behavior(path) {
            Behavior::Succeed { delay, rtt } => {
                tokio::time::sleep(delay).await;
                let transport = Arc::new(MockTransport::new(path, rtt, params));
                self.opened.lock().unwrap().push(transport.clone());
                Ok(transport as Arc<dyn MediaTransport>)
            }
            Behavior::Fail => Err(TransportError::Closed),
            Behavior::Hang => {
                let _pending = PendingAttempt::new(&self.pending);
                std::future::pending().await
            }
        }
    }
}

pub struct MockTransport {
    path: PathKind,
    rtt_ms: AtomicU64,
    max_layer: i32,
    muted: AtomicBool,
    closed_by_owner: AtomicBool,
    profile: Mutex<NetworkProfile>,
    frames_sent: AtomicU64,
    frames_suppressed: AtomicU64,
    down: watch::Sender<bool>,
}

impl MockTransport {
    fn new(path: PathKind, rtt: Duration, params: &TransportParams) -> Self {
        let (down, _) = watch::channel(false);
        Self {
            path,
            rtt_ms: AtomicU64::new(rtt.as_millis() as u64),
            max_layer: params.max_layer,
            muted: AtomicBool::new(params.muted),
            closed_by_owner: AtomicBool::new(false),
            profile: Mutex::new(params.profile),
            frames_sent: AtomicU64::new(0),
            frames_suppressed: AtomicU64::new(0),
            down,
        }
    }

    /// Simulate the path dying underneath the session.
    pub fn lose(&self) {
        self.down.send_replace(true);
    }

    pub fn set_rtt(&self, rtt: Duration) {
        self.rtt_ms.store(rtt.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn was_closed(&self) -> bool {
        self.closed_by_owner.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn profile(&self) -> NetworkProfile {
        *self.profile.lock().unwrap()
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn path(&self) -> PathKind {
        self.path
    }

    fn rtt(&self) -> Duration {
        Duration::from_millis(self.rtt_ms.load(Ordering::SeqCst))
    }

    fn max_layer(&self) -> i32 {
        self.max_layer
    }

    fn is_viable(&self) -> bool {
        !*self.down.borrow()
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn apply_profile(&self, profile: NetworkProfile) {
        *self.profile.lock().unwrap() = profile;
    }

    fn send_frame(&self, _frame: &[u8]) -> Result<bool, TransportError> {
        if !self.is_viable() {
            return Err(TransportError::Closed);
        }
        if self.is_muted() {
            self.frames_suppressed.fetch_add(1, Ordering::SeqCst);
            return Ok(false);
        }
        self.frames_sent.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn closed(&self) {
        let mut down = self.down.subscribe();
        let _ = down.wait_for(|down| *down).await;
    }

    fn close(&self) {
        self.closed_by_owner.store(true, Ordering::SeqCst);
        self.down.send_replace(true);
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::SeqCst),
            frames_suppressed: self.frames_suppressed.load(Ordering::SeqCst),
            frames_over_budget: 0,
            frames_received: 0,
            bytes_sent: 0,
            playout_delay: self.profile().jitter_target,
        }
    }
}
