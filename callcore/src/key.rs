//! Call encryption key and per-direction key derivation.
//!
//! Both endpoints hold the same opaque call key. Each side encrypts with the
//! key derived for its own direction and decrypts with the other one, so a
//! reflected datagram never authenticates as one of our own.

use serde::Serialize;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::hkdf_sha256;
use crate::error::CallError;

const INFO_INITIATOR: &[u8] = b"ongoing-call initiator->responder";
const INFO_RESPONDER: &[u8] = b"ongoing-call responder->initiator";
const KEY_SALT: &[u8] = b"ongoing-call v1";

/// Which side of the call we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl CallDirection {
    pub fn from_is_outgoing(is_outgoing: bool) -> Self {
        if is_outgoing {
            Self::Outgoing
        } else {
            Self::Incoming
        }
    }

    pub fn is_initiator(&self) -> bool {
        matches!(self, Self::Outgoing)
    }
}

/// Shared call key, fixed for the lifetime of a session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CallKey {
    bytes: Vec<u8>,
}

impl CallKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, CallError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(CallError::InvalidKey("key is empty"));
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Short hex fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.bytes);
        hex::encode(&digest[..8])
    }

    /// Derive the send/receive keys for one side of the call.
    pub fn derive(&self, direction: CallDirection) -> Result<DerivedKeys, CallError> {
        let initiator = self.expand(INFO_INITIATOR)?;
        let responder = self.expand(INFO_RESPONDER)?;

        Ok(if direction.is_initiator() {
            DerivedKeys {
                send: initiator,
                recv: responder,
            }
        } else {
            DerivedKeys {
                send: responder,
                recv: initiator,
            }
        })
    }

    fn expand(&self, info: &[u8]) -> Result<[u8; 32], CallError> {
        let okm = hkdf_sha256(&self.bytes, Some(KEY_SALT), info, 32)
            .map_err(|_| CallError::InvalidKey("key derivation failed"))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&okm);
        Ok(out)
    }
}

impl std::fmt::Debug for CallKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallKey")
            .field("len", &self.bytes.len())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// AES-256-GCM keys for one side of the call.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("send", &"[REDACTED]")
            .field("recv", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            CallKey::new(Vec::new()),
            Err(CallError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_directions_mirror_each_other() {
        let key = CallKey::new(vec![0x42; 256]).unwrap();
        let caller = key.derive(CallDirection::Outgoing).unwrap();
        let callee = key.derive(CallDirection::Incoming).unwrap();

        assert_eq!(caller.send, callee.recv);
        assert_eq!(caller.recv, callee.send);
        assert_ne!(caller.send, caller.recv);
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let key = CallKey::new(vec![0xAB; 32]).unwrap();
        let printed = format!("{:?}", key);
        assert!(!printed.contains("171, 171"));
        assert!(printed.contains(&key.fingerprint()));
        assert_eq!(key.fingerprint().len(), 16);
    }
}
