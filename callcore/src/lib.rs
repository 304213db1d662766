//! Runtime-agnostic core of the call session engine.
//!
//! Everything in this crate is pure logic: input validation, the session state
//! machine, network adaptation decisions, negotiation planning, key derivation
//! and the datagram codec. Socket I/O and task scheduling live in the
//! `ongoing-call` crate on top of it.

pub mod candidate;
pub mod crypto;
pub mod error;
pub mod key;
pub mod negotiation;
pub mod network;
pub mod packet;
pub mod proxy;
pub mod state;

pub use candidate::{CandidateSet, ConnectionCandidate};
pub use error::CallError;
pub use key::{CallDirection, CallKey, DerivedKeys};
pub use negotiation::{NegotiationPlan, PathKind, PathTarget, RetryPolicy};
pub use network::{
    AdaptationController, AdaptationDecision, NetworkProfile, NetworkType, PathHealth, SendBudget,
};
pub use proxy::ProxyConfig;
pub use state::{CallState, CallTransition, InvalidTransition, SessionStateMachine};
