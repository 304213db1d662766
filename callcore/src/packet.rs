//! Datagram codec for call traffic.
//!
//! # Layout
//!
//! Every datagram starts with a cleartext header:
//!
//! ```text
//! magic "OCV1" | kind u8 | flags u8 | tag_len u8 | peer tag
//! ```
//!
//! Encrypted kinds (probe, keepalive, media) continue with a 12-byte nonce and
//! an AES-256-GCM ciphertext whose associated data is the header. Relay kinds
//! stay in cleartext because the relay never learns the call key; a bind
//! request is authenticated with HMAC-SHA256 keyed by the proxy password.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::candidate::MAX_PEER_TAG_LEN;
use crate::crypto::{
    self, CryptoError, GCM_NONCE_LEN, HMAC_LEN, hmac_sha256, hmac_sha256_verify,
};
use crate::error::CallError;
use crate::key::{CallDirection, CallKey, DerivedKeys};

pub const MAGIC: &[u8; 4] = b"OCV1";

const FLAG_FROM_INITIATOR: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram truncated")]
    Truncated,
    #[error("bad magic")]
    BadMagic,
    #[error("unknown packet kind {0:#04x}")]
    UnknownKind(u8),
    #[error("unexpected packet kind {0:?}")]
    UnexpectedKind(PacketKind),
    #[error("peer tag mismatch")]
    TagMismatch,
    #[error("datagram originated from our own side")]
    Reflected,
    #[error("field too long for its length prefix")]
    FieldTooLong,
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

/// Datagram kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Probe = 0x01,
    ProbeAck = 0x02,
    Keepalive = 0x03,
    KeepaliveAck = 0x04,
    Media = 0x05,
    RelayBind = 0x10,
    RelayBound = 0x11,
    RelayRejected = 0x12,
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Probe),
            0x02 => Ok(Self::ProbeAck),
            0x03 => Ok(Self::Keepalive),
            0x04 => Ok(Self::KeepaliveAck),
            0x05 => Ok(Self::Media),
            0x10 => Ok(Self::RelayBind),
            0x11 => Ok(Self::RelayBound),
            0x12 => Ok(Self::RelayRejected),
            other => Err(PacketError::UnknownKind(other)),
        }
    }
}

impl PacketKind {
    pub fn is_relay(&self) -> bool {
        matches!(
            self,
            Self::RelayBind | Self::RelayBound | Self::RelayRejected
        )
    }
}

/// Decrypted contents of a call datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Connectivity check; `timestamp_us` is echoed back for RTT measurement.
    Probe {
        seq: u32,
        timestamp_us: u64,
        max_layer: i32,
    },
    ProbeAck {
        seq: u32,
        timestamp_us: u64,
        max_layer: i32,
    },
    Keepalive {
        seq: u32,
        timestamp_us: u64,
    },
    KeepaliveAck {
        seq: u32,
        timestamp_us: u64,
    },
    Media {
        seq: u32,
        payload: Bytes,
    },
}

impl Message {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Probe { .. } => PacketKind::Probe,
            Self::ProbeAck { .. } => PacketKind::ProbeAck,
            Self::Keepalive { .. } => PacketKind::Keepalive,
            Self::KeepaliveAck { .. } => PacketKind::KeepaliveAck,
            Self::Media { .. } => PacketKind::Media,
        }
    }

    fn encode_body(&self, out: &mut BytesMut) {
        match self {
            Self::Probe {
                seq,
                timestamp_us,
                max_layer,
            }
            | Self::ProbeAck {
                seq,
                timestamp_us,
                max_layer,
            } => {
                out.put_u32(*seq);
                out.put_u64(*timestamp_us);
                out.put_i32(*max_layer);
            }
            Self::Keepalive { seq, timestamp_us } | Self::KeepaliveAck { seq, timestamp_us } => {
                out.put_u32(*seq);
                out.put_u64(*timestamp_us);
            }
            Self::Media { seq, payload } => {
                out.put_u32(*seq);
                out.put_slice(payload);
            }
        }
    }

    fn decode_body(kind: PacketKind, body: &[u8]) -> Result<Self, PacketError> {
        let mut buf = body;
        let need = |buf: &[u8], n: usize| {
            if buf.len() < n {
                Err(PacketError::Truncated)
            } else {
                Ok(())
            }
        };

        match kind {
            PacketKind::Probe | PacketKind::ProbeAck => {
                need(buf, 16)?;
                let seq = buf.get_u32();
                let timestamp_us = buf.get_u64();
                let max_layer = buf.get_i32();
                Ok(if kind == PacketKind::Probe {
                    Self::Probe {
                        seq,
                        timestamp_us,
                        max_layer,
                    }
                } else {
                    Self::ProbeAck {
                        seq,
                        timestamp_us,
                        max_layer,
                    }
                })
            }
            PacketKind::Keepalive | PacketKind::KeepaliveAck => {
                need(buf, 12)?;
                let seq = buf.get_u32();
                let timestamp_us = buf.get_u64();
                Ok(if kind == PacketKind::Keepalive {
                    Self::Keepalive { seq, timestamp_us }
                } else {
                    Self::KeepaliveAck { seq, timestamp_us }
                })
            }
            PacketKind::Media => {
                need(buf, 4)?;
                let seq = buf.get_u32();
                Ok(Self::Media {
                    seq,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            other => Err(PacketError::UnexpectedKind(other)),
        }
    }
}

/// Parsed cleartext header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub from_initiator: bool,
    pub peer_tag: Bytes,
    /// Length of the header on the wire.
    pub len: usize,
}

/// Parse the cleartext header without touching the payload.
pub fn parse_header(data: &[u8]) -> Result<PacketHeader, PacketError> {
    if data.len() < MAGIC.len() + 3 {
        return Err(PacketError::Truncated);
    }
    if &data[..MAGIC.len()] != MAGIC {
        return Err(PacketError::BadMagic);
    }
    let kind = PacketKind::try_from(data[4])?;
    let flags = data[5];
    let tag_len = data[6] as usize;
    let len = MAGIC.len() + 3 + tag_len;
    if data.len() < len {
        return Err(PacketError::Truncated);
    }

    Ok(PacketHeader {
        kind,
        from_initiator: flags & FLAG_FROM_INITIATOR != 0,
        peer_tag: Bytes::copy_from_slice(&data[MAGIC.len() + 3..len]),
        len,
    })
}

fn write_header(
    out: &mut BytesMut,
    kind: PacketKind,
    from_initiator: bool,
    peer_tag: &[u8],
) -> Result<(), PacketError> {
    if peer_tag.len() > MAX_PEER_TAG_LEN {
        return Err(PacketError::FieldTooLong);
    }
    out.put_slice(MAGIC);
    out.put_u8(kind as u8);
    out.put_u8(if from_initiator { FLAG_FROM_INITIATOR } else { 0 });
    out.put_u8(peer_tag.len() as u8);
    out.put_slice(peer_tag);
    Ok(())
}

/// Seals and opens encrypted datagrams for one side of one path.
#[derive(Clone)]
pub struct PacketCodec {
    keys: DerivedKeys,
    direction: CallDirection,
    peer_tag: Bytes,
}

impl PacketCodec {
    pub fn new(key: &CallKey, direction: CallDirection, peer_tag: Bytes) -> Result<Self, CallError> {
        if peer_tag.len() > MAX_PEER_TAG_LEN {
            return Err(PacketError::FieldTooLong.into());
        }
        Ok(Self {
            keys: key.derive(direction)?,
            direction,
            peer_tag,
        })
    }

    pub fn peer_tag(&self) -> &Bytes {
        &self.peer_tag
    }

    pub fn seal(&self, message: &Message) -> Result<Vec<u8>, PacketError> {
        let mut header = BytesMut::with_capacity(MAGIC.len() + 3 + self.peer_tag.len());
        write_header(
            &mut header,
            message.kind(),
            self.direction.is_initiator(),
            &self.peer_tag,
        )?;

        let mut body = BytesMut::with_capacity(32);
        message.encode_body(&mut body);

        let mut nonce = [0u8; GCM_NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = crypto::gcm_encrypt(&self.keys.send, &nonce, &body, &header)?;

        let mut out = Vec::with_capacity(header.len() + nonce.len() + ciphertext.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, data: &[u8]) -> Result<Message, PacketError> {
        let header = parse_header(data)?;
        if header.kind.is_relay() {
            return Err(PacketError::UnexpectedKind(header.kind));
        }
        if header.from_initiator == self.direction.is_initiator() {
            return Err(PacketError::Reflected);
        }
        if !bool::from(header.peer_tag[..].ct_eq(&self.peer_tag[..])) {
            return Err(PacketError::TagMismatch);
        }

        let rest = &data[header.len..];
        if rest.len() < GCM_NONCE_LEN {
            return Err(PacketError::Truncated);
        }
        let (nonce, ciphertext) = rest.split_at(GCM_NONCE_LEN);
        let body = crypto::gcm_decrypt(&self.keys.recv, nonce, ciphertext, &data[..header.len])?;

        Message::decode_body(header.kind, &body)
    }
}

impl std::fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCodec")
            .field("direction", &self.direction)
            .field("peer_tag", &hex::encode(&self.peer_tag))
            .finish()
    }
}

/// Cleartext relay control frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Bind {
        peer_tag: Bytes,
        username: String,
        mac: [u8; HMAC_LEN],
    },
    Bound {
        peer_tag: Bytes,
    },
    Rejected {
        peer_tag: Bytes,
    },
}

impl RelayFrame {
    /// Build a bind request; without credentials the MAC is keyed with an
    /// empty password and the username is empty.
    pub fn bind(peer_tag: Bytes, credentials: Option<(&str, &str)>) -> Result<Self, PacketError> {
        let (username, password) = credentials.unwrap_or(("", ""));
        if username.len() > u8::MAX as usize {
            return Err(PacketError::FieldTooLong);
        }
        let mac = hmac_sha256(password.as_bytes(), &[&peer_tag[..], username.as_bytes()])?;
        Ok(Self::Bind {
            peer_tag,
            username: username.to_string(),
            mac,
        })
    }

    /// Check a bind request against the expected credentials.
    pub fn verify_bind(&self, username: &str, password: &str) -> bool {
        match self {
            Self::Bind {
                peer_tag,
                username: sent,
                mac,
            } => {
                let user_ok = bool::from(sent.as_bytes().ct_eq(username.as_bytes()));
                let mac_ok = hmac_sha256_verify(
                    password.as_bytes(),
                    &[&peer_tag[..], sent.as_bytes()],
                    mac,
                );
                user_ok & mac_ok
            }
            _ => false,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut out = BytesMut::with_capacity(64);
        match self {
            Self::Bind {
                peer_tag,
                username,
                mac,
            } => {
                write_header(&mut out, PacketKind::RelayBind, false, peer_tag)?;
                if username.len() > u8::MAX as usize {
                    return Err(PacketError::FieldTooLong);
                }
                out.put_u8(username.len() as u8);
                out.put_slice(username.as_bytes());
                out.put_slice(mac);
            }
            Self::Bound { peer_tag } => {
                write_header(&mut out, PacketKind::RelayBound, false, peer_tag)?;
            }
            Self::Rejected { peer_tag } => {
                write_header(&mut out, PacketKind::RelayRejected, false, peer_tag)?;
            }
        }
        Ok(out.to_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let header = parse_header(data)?;
        let mut rest = &data[header.len..];
        match header.kind {
            PacketKind::RelayBind => {
                if rest.is_empty() {
                    return Err(PacketError::Truncated);
                }
                let user_len = rest.get_u8() as usize;
                if rest.len() < user_len + HMAC_LEN {
                    return Err(PacketError::Truncated);
                }
                let username = String::from_utf8_lossy(&rest[..user_len]).into_owned();
                let mut mac = [0u8; HMAC_LEN];
                mac.copy_from_slice(&rest[user_len..user_len + HMAC_LEN]);
                Ok(Self::Bind {
                    peer_tag: header.peer_tag,
                    username,
                    mac,
                })
            }
            PacketKind::RelayBound => Ok(Self::Bound {
                peer_tag: header.peer_tag,
            }),
            PacketKind::RelayRejected => Ok(Self::Rejected {
                peer_tag: header.peer_tag,
            }),
            other => Err(PacketError::UnexpectedKind(other)),
        }
    }
}
