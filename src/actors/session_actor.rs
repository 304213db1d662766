use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use callcore::{
    AdaptationController, AdaptationDecision, CallDirection, CallError, CallKey, CallState,
    CallTransition, CandidateSet, NegotiationPlan, NetworkType, PathHealth, PathKind, ProxyConfig,
    SessionStateMachine,
};
use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::CURRENT_CONTEXT;
use super::messages::{NegotiationPurpose, SessionCommand, StartRequest, StateObserver};
use crate::context::CallStats;
use crate::negotiator::{NegotiatedPath, TransportNegotiator};
use crate::transport::{MediaTransport, TransportParams, TransportStats};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// The path currently carrying media.
struct ActivePath {
    transport: Arc<dyn MediaTransport>,
    path: PathKind,
    generation: u64,
    watcher: JoinHandle<()>,
}

impl ActivePath {
    fn retire(self) -> TransportStats {
        self.watcher.abort();
        self.transport.close();
        self.transport.stats()
    }
}

struct Session {
    id: u64,
    key: CallKey,
    direction: CallDirection,
    candidates: CandidateSet,
    max_layer: i32,
    machine: SessionStateMachine,
    /// Bumped for every negotiation; results carrying an older value are stale.
    generation: u64,
    negotiation: Option<JoinHandle<()>>,
    active: Option<ActivePath>,
    /// The one reconnect allowed after a loss has been spent.
    loss_reconnect_used: bool,
    soft_reconnects: u32,
    /// Counters of transports that have already been closed.
    retired: TransportStats,
}

impl Session {
    fn cancel_negotiation(&mut self) {
        if let Some(handle) = self.negotiation.take() {
            handle.abort();
        }
    }

    fn retire_active(&mut self) {
        if let Some(active) = self.active.take() {
            let stats = active.retire();
            self.retired.frames_sent += stats.frames_sent;
            self.retired.frames_suppressed += stats.frames_suppressed;
            self.retired.frames_over_budget += stats.frames_over_budget;
            self.retired.frames_received += stats.frames_received;
            self.retired.bytes_sent += stats.bytes_sent;
        }
    }

    fn teardown(&mut self) {
        self.cancel_negotiation();
        self.retire_active();
    }
}

pub(crate) struct SessionActor {
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    command_tx: mpsc::WeakUnboundedSender<SessionCommand>,
    negotiator: TransportNegotiator,
    allow_p2p: bool,
    proxy: Option<ProxyConfig>,
    adaptation: AdaptationController,
    muted: bool,
    observer: Option<StateObserver>,
    session: Option<Session>,
}

impl SessionActor {
    pub(crate) fn new(
        command_rx: mpsc::UnboundedReceiver<SessionCommand>,
        command_tx: mpsc::WeakUnboundedSender<SessionCommand>,
        negotiator: TransportNegotiator,
        allow_p2p: bool,
        proxy: Option<ProxyConfig>,
        network_type: NetworkType,
    ) -> Self {
        Self {
            command_rx,
            command_tx,
            negotiator,
            allow_p2p,
            proxy,
            adaptation: AdaptationController::new(network_type),
            muted: false,
            observer: None,
            session: None,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(target: "Call/Session", "SessionActor started");
        while let Some(command) = self.command_rx.recv().await {
            self.handle(command);
        }
        if let Some(session) = self.session.as_mut() {
            info!(target: "Call/Session", "Context dropped, tearing down session {}", session.id);
            session.teardown();
        }
        debug!(target: "Call/Session", "SessionActor stopped");
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start(request) => self.start(request),
            SessionCommand::Stop => self.stop(),
            SessionCommand::SetMuted(muted) => self.set_muted(muted),
            SessionCommand::SetNetworkType(network_type) => self.set_network_type(network_type),
            SessionCommand::SetObserver(observer) => self.observer = observer,
            SessionCommand::SendFrame(frame) => self.send_frame(&frame),
            SessionCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            SessionCommand::NegotiationFinished {
                session_id,
                generation,
                purpose,
                result,
            } => self.on_negotiation_finished(session_id, generation, purpose, result),
            SessionCommand::TransportLost {
                session_id,
                generation,
            } => self.on_transport_lost(session_id, generation),
        }
    }

    fn start(&mut self, request: StartRequest) {
        if self.session.is_some() {
            warn!(target: "Call/Session", "Start received for a context that already has a session");
            return;
        }

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "Call/Session",
            "Starting session {} ({:?}, {} alternatives, key {})",
            id,
            request.direction,
            request.candidates.alternatives().len(),
            request.key.fingerprint()
        );

        self.session = Some(Session {
            id,
            key: request.key,
            direction: request.direction,
            candidates: request.candidates,
            max_layer: request.max_layer,
            machine: SessionStateMachine::new(),
            generation: 0,
            negotiation: None,
            active: None,
            loss_reconnect_used: false,
            soft_reconnects: 0,
            retired: TransportStats::default(),
        });
        self.begin_negotiation(NegotiationPurpose::Initial);
    }

    fn stop(&mut self) {
        match self.session.take() {
            Some(mut session) => {
                info!(target: "Call/Session", "Stopping session {}", session.id);
                session.teardown();
            }
            None => debug!(target: "Call/Session", "Stop without a session, ignoring"),
        }
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(active) = self.session.as_ref().and_then(|s| s.active.as_ref()) {
            active.transport.set_muted(muted);
        }
        debug!(target: "Call/Session", "Muted: {}", muted);
    }

    fn set_network_type(&mut self, network_type: NetworkType) {
        let (state, health) = match &self.session {
            Some(session) => (
                session.machine.state(),
                session.active.as_ref().map(|active| PathHealth {
                    viable: active.transport.is_viable(),
                    rtt: active.transport.rtt(),
                }),
            ),
            None => (CallState::Initializing, None),
        };

        let decision = self
            .adaptation
            .on_network_changed(network_type, state, health);
        info!(target: "Call/Session", "Network changed to {:?}: {:?}", network_type, decision);

        match decision {
            AdaptationDecision::Unchanged => {}
            AdaptationDecision::Retune(profile) => {
                if let Some(active) = self.session.as_ref().and_then(|s| s.active.as_ref()) {
                    active.transport.apply_profile(profile);
                }
            }
            AdaptationDecision::SoftReconnect(profile) => {
                if let Some(active) = self.session.as_ref().and_then(|s| s.active.as_ref()) {
                    active.transport.apply_profile(profile);
                }
                self.begin_negotiation(NegotiationPurpose::SoftReconnect);
            }
        }
    }

    fn send_frame(&mut self, frame: &[u8]) {
        let Some(active) = self.session.as_ref().and_then(|s| s.active.as_ref()) else {
            debug!(target: "Call/Session", "Dropping {} byte frame: no active path", frame.len());
            return;
        };
        if let Err(e) = active.transport.send_frame(frame) {
            debug!(target: "Call/Session", "Frame send on {:?} failed: {}", active.path, e);
        }
    }

    fn stats(&self) -> Option<CallStats> {
        let session = self.session.as_ref()?;
        let active = session.active.as_ref();
        let live = active
            .map(|active| active.transport.stats())
            .unwrap_or_default();

        Some(CallStats {
            session_id: session.id,
            state: session.machine.state(),
            path: active.map(|active| active.path),
            rtt: active.map(|active| active.transport.rtt()),
            max_layer: active.map(|active| active.transport.max_layer()),
            network_type: self.adaptation.network_type(),
            muted: self.muted,
            soft_reconnects: session.soft_reconnects,
            frames_sent: session.retired.frames_sent + live.frames_sent,
            frames_suppressed: session.retired.frames_suppressed + live.frames_suppressed,
            frames_over_budget: session.retired.frames_over_budget + live.frames_over_budget,
            playout_delay: active.map(|_| live.playout_delay),
            connected_at: session.machine.connected_at(),
        })
    }

    /// Spawn a negotiation run under a fresh generation, superseding any run
    /// still in flight.
    fn begin_negotiation(&mut self, purpose: NegotiationPurpose) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.machine.state().is_terminal() {
            return;
        }

        session.cancel_negotiation();
        session.generation += 1;

        let plan = NegotiationPlan::build(&session.candidates, self.proxy.as_ref(), self.allow_p2p);
        let params = TransportParams {
            key: session.key.clone(),
            direction: session.direction,
            max_layer: session.max_layer,
            profile: self.adaptation.profile(),
            muted: self.muted,
        };
        let session_id = session.id;
        let generation = session.generation;
        let negotiator = self.negotiator.clone();
        let command_tx = self.command_tx.clone();

        debug!(
            target: "Call/Session",
            "Session {} negotiating ({:?}, generation {})",
            session_id, purpose, generation
        );

        session.negotiation = Some(tokio::spawn(async move {
            let result = negotiator.negotiate(plan, params).await;
            let Some(tx) = command_tx.upgrade() else {
                if let Ok(path) = result {
                    path.transport.close();
                }
                return;
            };
            let _ = tx.send(SessionCommand::NegotiationFinished {
                session_id,
                generation,
                purpose,
                result,
            });
        }));
    }

    fn on_negotiation_finished(
        &mut self,
        session_id: u64,
        generation: u64,
        purpose: NegotiationPurpose,
        result: Result<NegotiatedPath, CallError>,
    ) {
        let current = self.session.as_mut().filter(|s| {
            s.id == session_id && s.generation == generation && !s.machine.state().is_terminal()
        });
        let Some(session) = current else {
            debug!(
                target: "Call/Session",
                "Discarding stale negotiation result (session {}, generation {})",
                session_id, generation
            );
            if let Ok(path) = result {
                path.transport.close();
            }
            return;
        };
        session.negotiation = None;

        match (purpose, result) {
            (NegotiationPurpose::Initial, Ok(path)) => {
                info!(
                    target: "Call/Session",
                    "Session {} connected via {:?} (RTT: {:?}, layer {})",
                    session_id, path.path, path.rtt, path.max_layer
                );
                self.install_path(path, generation);
                self.transition(CallTransition::PathEstablished);
            }
            (NegotiationPurpose::Initial, Err(e)) => {
                warn!(target: "Call/Session", "Session {} negotiation failed: {}", session_id, e);
                self.transition(CallTransition::NegotiationFailed);
            }
            (NegotiationPurpose::SoftReconnect, Ok(path)) => {
                info!(
                    target: "Call/Session",
                    "Session {} moved to {:?} (RTT: {:?})",
                    session_id, path.path, path.rtt
                );
                session.retire_active();
                session.soft_reconnects += 1;
                session.loss_reconnect_used = false;
                self.install_path(path, generation);
            }
            (NegotiationPurpose::SoftReconnect, Err(e)) => {
                let old_viable = session
                    .active
                    .as_ref()
                    .is_some_and(|active| active.transport.is_viable());
                if old_viable {
                    info!(
                        target: "Call/Session",
                        "Session {} soft reconnect failed ({}), keeping current path",
                        session_id, e
                    );
                } else {
                    warn!(
                        target: "Call/Session",
                        "Session {} soft reconnect failed ({}) and the current path is gone",
                        session_id, e
                    );
                    self.transition(CallTransition::TransportLost);
                }
            }
        }
    }

    fn on_transport_lost(&mut self, session_id: u64, generation: u64) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let is_active = session.id == session_id
            && session
                .active
                .as_ref()
                .is_some_and(|active| active.generation == generation);
        if !is_active || !session.machine.state().is_connected() {
            debug!(
                target: "Call/Session",
                "Ignoring loss of inactive path (session {}, generation {})",
                session_id, generation
            );
            return;
        }

        if session.negotiation.is_some() {
            info!(target: "Call/Session", "Session {} lost its path during a reconnect", session_id);
            return;
        }
        if session.loss_reconnect_used {
            warn!(target: "Call/Session", "Session {} lost its path again", session_id);
            self.transition(CallTransition::TransportLost);
            return;
        }

        warn!(target: "Call/Session", "Session {} lost its path, reconnecting", session_id);
        session.loss_reconnect_used = true;
        self.begin_negotiation(NegotiationPurpose::SoftReconnect);
    }

    fn install_path(&mut self, path: NegotiatedPath, generation: u64) {
        let Some(session) = self.session.as_mut() else {
            path.transport.close();
            return;
        };

        path.transport.set_muted(self.muted);
        path.transport.apply_profile(self.adaptation.profile());

        let transport = path.transport.clone();
        let command_tx = self.command_tx.clone();
        let session_id = session.id;
        let watcher = tokio::spawn(async move {
            transport.closed().await;
            if let Some(tx) = command_tx.upgrade() {
                let _ = tx.send(SessionCommand::TransportLost {
                    session_id,
                    generation,
                });
            }
        });

        session.active = Some(ActivePath {
            transport: path.transport,
            path: path.path,
            generation,
            watcher,
        });
    }

    /// Apply a transition and notify the observer. Failed tears the session's
    /// resources down but keeps it around for stats.
    fn transition(&mut self, transition: CallTransition) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let state = match session.machine.apply(transition) {
            Ok(state) => state,
            Err(e) => {
                error!(target: "Call/Session", "Session {}: {}", session.id, e);
                return;
            }
        };
        if state == CallState::Failed {
            session.teardown();
        }

        info!(target: "Call/Session", "Session {} is now {:?}", session.id, state);
        if let Some(observer) = self.observer.as_mut() {
            observer(state);
        }
    }
}

/// Spawn the actor for one call context inside its task-local scope.
pub(crate) fn spawn_session_actor(
    runtime: &Handle,
    context_id: u64,
    negotiator: TransportNegotiator,
    allow_p2p: bool,
    proxy: Option<ProxyConfig>,
    network_type: NetworkType,
) -> mpsc::UnboundedSender<SessionCommand> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let actor = SessionActor::new(
        command_rx,
        command_tx.downgrade(),
        negotiator,
        allow_p2p,
        proxy,
        network_type,
    );

    runtime.spawn(CURRENT_CONTEXT.scope(context_id, actor.run()));

    command_tx
}
