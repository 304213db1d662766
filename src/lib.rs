//! Call session engine.
//!
//! Negotiates a media path for an ongoing call (direct to the peer when
//! allowed, through a relay otherwise), tracks the session through
//! Initializing, Connected and Failed, and adapts the path to network changes.
//! The runtime-free pieces live in [`callcore`] and are re-exported here.

pub use callcore::{
    AdaptationDecision, CallDirection, CallError, CallState, CandidateSet, ConnectionCandidate,
    NetworkProfile, NetworkType, PathKind, PathTarget, ProxyConfig, RetryPolicy,
};

mod actors;
pub mod config;
pub mod context;
pub mod logging;
pub mod negotiator;
pub mod transport;

pub use config::CallConfig;
pub use context::{CallContext, CallContextBuilder, CallStats};
pub use logging::setup_logging_function;
