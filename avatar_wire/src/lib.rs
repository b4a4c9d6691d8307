//! Wire protocol for avatar ping batches.
//!
//! Every message is a fixed-size header followed by a MessagePack payload.
//! Senders and receivers share this crate so batches framed on one side always
//! decode on the other.

use std::convert::TryFrom;

use bytes::Buf;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;

/// Bytes that prefix every message ("AVPG").
pub const HEADER_MAGIC: [u8; 4] = *b"AVPG";

/// Protocol revision understood by this crate.
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Length of the binary header in bytes.
pub const HEADER_LEN: usize = 4 + 2 + 2 + 4;

/// Message kinds understood by protocol v1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Hello = 0x0001,
    PingBatch = 0x0002,
}

/// Envelope describing the upcoming payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u16,
    pub kind: MessageKind,
    pub length: u32,
}

impl MessageHeader {
    /// Encode the header as big-endian bytes.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&HEADER_MAGIC);
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&(self.kind as u16).to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Decode a header from raw bytes.
    pub fn decode(input: &[u8]) -> Result<Self, ProtocolError> {
        if input.len() < HEADER_LEN {
            return Err(ProtocolError::TruncatedHeader);
        }
        if input[..4] != HEADER_MAGIC {
            return Err(ProtocolError::BadMagic);
        }
        let mut version_bytes = &input[4..6];
        let version = version_bytes.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let mut kind_bytes = &input[6..8];
        let kind_raw = kind_bytes.get_u16();
        let kind = MessageKind::try_from(kind_raw)
            .map_err(|_| ProtocolError::UnknownMessageKind(kind_raw))?;
        let mut len_bytes = &input[8..12];
        let length = len_bytes.get_u32();
        Ok(Self {
            version,
            kind,
            length,
        })
    }
}

impl TryFrom<u16> for MessageKind {
    type Error = ();

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::Hello),
            0x0002 => Ok(Self::PingBatch),
            _ => Err(()),
        }
    }
}

/// Handshake announcing which participant a connection carries pings for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol: String,
    pub participant: String,
}

impl Hello {
    pub fn new(participant: impl Into<String>) -> Self {
        Self {
            protocol: "AvatarPing".to_string(),
            participant: participant.into(),
        }
    }
}

/// One remote call: the sender's compact function id and its argument payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePing {
    pub id: i16,
    #[serde(default)]
    pub args: Value,
}

/// Every ping a participant's script queued during one tick, in send order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingBatch {
    pub sender: String,
    pub pings: Vec<WirePing>,
}

/// Error conditions returned by the protocol helpers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("header smaller than {HEADER_LEN} bytes")]
    TruncatedHeader,
    #[error("header magic mismatch")]
    BadMagic,
    #[error("protocol version {0:#06x} is not supported")]
    UnsupportedVersion(u16),
    #[error("message kind {0:#06x} is unknown")]
    UnknownMessageKind(u16),
    #[error("expected a {expected:?} message but received {actual:?}")]
    UnexpectedKind {
        expected: MessageKind,
        actual: MessageKind,
    },
    #[error("payload length mismatch: header declared {expected} bytes but read {actual}")]
    LengthMismatch { expected: u32, actual: usize },
    #[error("payload decode error: {0}")]
    PayloadDecode(#[from] rmp_serde::decode::Error),
    #[error("payload encode error: {0}")]
    PayloadEncode(#[from] rmp_serde::encode::Error),
}

/// Wraps a payload with framing suitable for the wire.
pub fn encode_message<T>(kind: MessageKind, payload: &T) -> Result<Vec<u8>, ProtocolError>
where
    T: Serialize,
{
    let payload_bytes = rmp_serde::to_vec_named(payload)?;
    let header = MessageHeader {
        version: PROTOCOL_VERSION,
        kind,
        length: u32::try_from(payload_bytes.len()).map_err(|_| ProtocolError::LengthMismatch {
            expected: u32::MAX,
            actual: payload_bytes.len(),
        })?,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload_bytes.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&payload_bytes);
    Ok(out)
}

/// Decodes a framed message returning both header and payload bytes.
pub fn decode_envelope(bytes: &[u8]) -> std::result::Result<(MessageHeader, &[u8]), ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::TruncatedHeader);
    }
    let header = MessageHeader::decode(&bytes[..HEADER_LEN])?;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != header.length as usize {
        return Err(ProtocolError::LengthMismatch {
            expected: header.length,
            actual: payload.len(),
        });
    }
    Ok((header, payload))
}

/// Decode a payload straight into the requested type.
pub fn decode_payload<T>(payload: &[u8]) -> std::result::Result<T, ProtocolError>
where
    T: for<'de> Deserialize<'de>,
{
    let value = rmp_serde::from_slice(payload)?;
    Ok(value)
}

/// Frames a ping batch.
pub fn encode_batch(batch: &PingBatch) -> Result<Vec<u8>, ProtocolError> {
    encode_message(MessageKind::PingBatch, batch)
}

/// Decodes a framed message that must carry a ping batch.
pub fn decode_batch(bytes: &[u8]) -> Result<PingBatch, ProtocolError> {
    let (header, payload) = decode_envelope(bytes)?;
    if header.kind != MessageKind::PingBatch {
        return Err(ProtocolError::UnexpectedKind {
            expected: MessageKind::PingBatch,
            actual: header.kind,
        });
    }
    decode_payload(payload)
}
