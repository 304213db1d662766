//! Call engine error types.

use thiserror::Error;

use crate::packet::PacketError;
use crate::state::InvalidTransition;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("invalid call key: {0}")]
    InvalidKey(&'static str),

    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("call already started")]
    AlreadyStarted,

    #[error("negotiation attempt timed out: {0}")]
    NegotiationTimeout(String),

    #[error("negotiation failed: all paths exhausted")]
    NegotiationFailed,

    #[error("transport lost: {0}")]
    TransportLost(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
}
