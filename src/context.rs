//! Public facade for one call.
//!
//! A [`CallContext`] owns a session actor. Every operation is posted to the
//! actor's queue and handled there one at a time, so callers may use the
//! context from any thread without further synchronization.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use callcore::{
    CallDirection, CallError, CallKey, CallState, CandidateSet, ConnectionCandidate, NetworkType,
    PathKind, ProxyConfig,
};
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::actors::CURRENT_CONTEXT;
use crate::actors::messages::{SessionCommand, StartRequest};
use crate::actors::session_actor::spawn_session_actor;
use crate::config::CallConfig;
use crate::negotiator::TransportNegotiator;
use crate::transport::{PathConnector, UdpConnector};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Snapshot of a running session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallStats {
    pub session_id: u64,
    pub state: CallState,
    pub path: Option<PathKind>,
    pub rtt: Option<Duration>,
    /// Protocol layer agreed with the peer on the active path.
    pub max_layer: Option<i32>,
    pub network_type: NetworkType,
    pub muted: bool,
    pub soft_reconnects: u32,
    pub frames_sent: u64,
    pub frames_suppressed: u64,
    pub frames_over_budget: u64,
    /// Receive-side playout delay target on the active path.
    pub playout_delay: Option<Duration>,
    pub connected_at: Option<DateTime<Utc>>,
}

pub struct CallContext {
    id: u64,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    started: AtomicBool,
}

impl CallContext {
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::new()
    }

    /// Validate the inputs and begin negotiating.
    ///
    /// Input errors are reported before any network activity. A context runs
    /// at most one session; later calls fail with [`CallError::AlreadyStarted`].
    pub fn start(
        &self,
        key: impl Into<Vec<u8>>,
        is_outgoing: bool,
        primary: ConnectionCandidate,
        alternatives: Vec<ConnectionCandidate>,
        max_layer: i32,
    ) -> Result<(), CallError> {
        if self.started.load(Ordering::Acquire) {
            return Err(CallError::AlreadyStarted);
        }

        let key = CallKey::new(key)?;
        let candidates = CandidateSet::new(primary, alternatives)?;

        if self.started.swap(true, Ordering::AcqRel) {
            return Err(CallError::AlreadyStarted);
        }

        self.post(SessionCommand::Start(StartRequest {
            key,
            direction: CallDirection::from_is_outgoing(is_outgoing),
            candidates,
            max_layer,
        }));
        Ok(())
    }

    /// Cancel negotiation and tear the session down. Safe to call repeatedly.
    pub fn stop(&self) {
        self.post(SessionCommand::Stop);
    }

    pub fn set_muted(&self, muted: bool) {
        self.post(SessionCommand::SetMuted(muted));
    }

    pub fn set_network_type(&self, network_type: NetworkType) {
        self.post(SessionCommand::SetNetworkType(network_type));
    }

    /// Register the state observer, replacing any previous one.
    ///
    /// The observer runs on the context's own execution context, once per
    /// state transition.
    pub fn set_state_changed<F>(&self, observer: F)
    where
        F: FnMut(CallState) + Send + 'static,
    {
        self.post(SessionCommand::SetObserver(Some(Box::new(observer))));
    }

    pub fn clear_state_changed(&self) {
        self.post(SessionCommand::SetObserver(None));
    }

    /// Queue one media frame for the active path. Dropped when no path is
    /// established; suppressed while muted.
    pub fn send_frame(&self, frame: impl Into<Bytes>) {
        self.post(SessionCommand::SendFrame(frame.into()));
    }

    /// `None` before `start` and after `stop`.
    pub async fn stats(&self) -> Option<CallStats> {
        let (tx, rx) = oneshot::channel();
        self.post(SessionCommand::Stats(tx));
        rx.await.ok().flatten()
    }

    /// Whether the caller is running on this context's execution context.
    pub fn is_current(&self) -> bool {
        CURRENT_CONTEXT
            .try_with(|id| *id == self.id)
            .unwrap_or(false)
    }

    fn post(&self, command: SessionCommand) {
        if let Err(e) = self.command_tx.send(command) {
            warn!(target: "Call/Context", "Session actor is gone, dropping {:?}", e.0);
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("id", &self.id)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

pub struct CallContextBuilder {
    allow_p2p: bool,
    proxy: Option<ProxyConfig>,
    network_type: NetworkType,
    config: CallConfig,
    connector: Option<Arc<dyn PathConnector>>,
}

impl Default for CallContextBuilder {
    fn default() -> Self {
        Self {
            allow_p2p: true,
            proxy: None,
            network_type: NetworkType::default(),
            config: CallConfig::default(),
            connector: None,
        }
    }
}

impl CallContextBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Whether direct paths may be attempted. Defaults to `true`.
    pub fn allow_p2p(mut self, allow: bool) -> Self {
        self.allow_p2p = allow;
        self
    }

    /// Relay used as the last resort. Without one, no relay is attempted.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_network_type(mut self, network_type: NetworkType) -> Self {
        self.network_type = network_type;
        self
    }

    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the UDP connector, e.g. with a scripted one in tests.
    pub fn with_connector(mut self, connector: Arc<dyn PathConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Spawn the session actor. Must run inside a Tokio runtime.
    pub fn build(self) -> anyhow::Result<CallContext> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("CallContext must be built inside a Tokio runtime")?;

        let connector: Arc<dyn PathConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(UdpConnector::new(self.config.clone())),
        };
        let negotiator = TransportNegotiator::new(connector, &self.config);

        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let command_tx = spawn_session_actor(
            &runtime,
            id,
            negotiator,
            self.allow_p2p,
            self.proxy,
            self.network_type,
        );

        Ok(CallContext {
            id,
            command_tx,
            started: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_outside_runtime_fails() {
        assert!(CallContext::builder().build().is_err());
    }

    #[tokio::test]
    async fn test_is_current_is_false_off_context() {
        let context = CallContext::builder().build().unwrap();
        assert!(!context.is_current());
    }

    #[tokio::test]
    async fn test_stats_before_start_is_none() {
        let context = CallContext::builder().build().unwrap();
        assert_eq!(context.stats().await, None);
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let context = CallContext::builder().build().unwrap();
        let primary = ConnectionCandidate::new(1, "127.0.0.1", "", 3478, &b"tag"[..]);

        let result = context.start(Vec::new(), true, primary, Vec::new(), 92);
        assert!(matches!(result, Err(CallError::InvalidKey(_))));
    }
}
