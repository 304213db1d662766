use bytes::Bytes;
use callcore::{CallDirection, CallError, CallKey, CallState, CandidateSet, NetworkType};
use tokio::sync::oneshot;

use crate::context::CallStats;
use crate::negotiator::NegotiatedPath;

pub(crate) type StateObserver = Box<dyn FnMut(CallState) + Send>;

/// Validated inputs for a new session.
#[derive(Debug)]
pub(crate) struct StartRequest {
    pub key: CallKey,
    pub direction: CallDirection,
    pub candidates: CandidateSet,
    pub max_layer: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NegotiationPurpose {
    /// First path for a session in Initializing.
    Initial,
    /// Replacement path for a Connected session.
    SoftReconnect,
}

// --- Commands for the SessionActor ---
pub(crate) enum SessionCommand {
    Start(StartRequest),
    Stop,
    SetMuted(bool),
    SetNetworkType(NetworkType),
    SetObserver(Option<StateObserver>),
    SendFrame(Bytes),
    Stats(oneshot::Sender<Option<CallStats>>),

    // Posted back by tasks the actor spawned.
    NegotiationFinished {
        session_id: u64,
        generation: u64,
        purpose: NegotiationPurpose,
        result: Result<NegotiatedPath, CallError>,
    },
    TransportLost {
        session_id: u64,
        generation: u64,
    },
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start(request) => f.debug_tuple("Start").field(request).finish(),
            Self::Stop => write!(f, "Stop"),
            Self::SetMuted(muted) => f.debug_tuple("SetMuted").field(muted).finish(),
            Self::SetNetworkType(t) => f.debug_tuple("SetNetworkType").field(t).finish(),
            Self::SetObserver(observer) => f
                .debug_tuple("SetObserver")
                .field(&observer.is_some())
                .finish(),
            Self::SendFrame(frame) => write!(f, "SendFrame({} bytes)", frame.len()),
            Self::Stats(_) => write!(f, "Stats"),
            Self::NegotiationFinished {
                session_id,
                generation,
                purpose,
                result,
            } => f
                .debug_struct("NegotiationFinished")
                .field("session_id", session_id)
                .field("generation", generation)
                .field("purpose", purpose)
                .field("result", result)
                .finish(),
            Self::TransportLost {
                session_id,
                generation,
            } => f
                .debug_struct("TransportLost")
                .field("session_id", session_id)
                .field("generation", generation)
                .finish(),
        }
    }
}
