//! Wire protocol: packet framing, armor, fragmentation, compression.
//!
//! Every overlay datagram is either a packet or a fragment continuation:
//!
//! Packet layout (cleartext header, armored body):
//! ```text
//! [8]  packet id (also the armor nonce seed and outgoing counter)
//! [5]  destination address
//! [5]  source address
//! [1]  flags: bits 0-2 hops (mutable in flight, excluded from the MAC),
//!             bit 3 fragmented, bits 4-6 cipher suite
//! [8]  MAC (truncated Poly1305 over header-with-hops-zeroed + body)
//! [1]  verb (bit 7 = payload LZ4-compressed), armored
//! [N]  payload, armored
//! ```
//!
//! Fragment continuations are recognized by 0xff at byte 13, a value the
//! high byte of a real source address can never take.

pub mod compress;
pub mod fragment;
pub mod packet;

use thiserror::Error;

pub use fragment::{Fragment, FRAGMENT_INDICATOR};
pub use packet::{CipherSuite, Packet, Preamble};

/// Maximum UDP payload we will hand to the host per datagram.
pub const UDP_DEFAULT_PAYLOAD_MTU: usize = 1444;

/// Fragments use a 4-bit index; byte 0 of a packet never fragments away.
pub const MAX_FRAGMENTS: usize = 7;

/// Largest packet the engine will assemble or emit.
pub const PACKET_MAX_LEN: usize = UDP_DEFAULT_PAYLOAD_MTU * MAX_FRAGMENTS;

/// Cleartext header length including the armored verb byte.
pub const PACKET_HEADER_LEN: usize = 28;

/// Offset of the verb byte (start of the armored region).
pub const PACKET_IDX_VERB: usize = 27;

/// Current protocol version carried in HELLO.
pub const PROTO_VERSION: u8 = 1;

/// Payloads below this length are never worth compressing.
pub const COMPRESS_MIN_LEN: usize = 32;

/// Errors produced while parsing or authenticating wire data.
///
/// These never cross the crate boundary as entry-point errors; the Switch
/// converts them into counted drops.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short: need {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },

    #[error("packet exceeds maximum length: {0}")]
    TooLarge(usize),

    #[error("unknown verb: {0:#04x}")]
    InvalidVerb(u8),

    #[error("unknown cipher suite: {0}")]
    InvalidCipherSuite(u8),

    #[error("message authentication failed")]
    MacFailed,

    #[error("invalid overlay address")]
    InvalidAddress,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("unsupported key type: {0:#04x}")]
    UnsupportedKeyType(u8),

    #[error("unknown endpoint tag: {0:#04x}")]
    InvalidEndpointTag(u8),

    #[error("malformed fragment")]
    BadFragment,

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("invalid serialized data: {0}")]
    InvalidData(&'static str),
}

/// Semantic opcode of a packet's armored body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verb {
    Nop = 0x00,
    Hello = 0x01,
    Error = 0x02,
    Ok = 0x03,
    Whois = 0x04,
    Rendezvous = 0x05,
    Frame = 0x06,
    ExtFrame = 0x07,
    Echo = 0x08,
    MulticastLike = 0x09,
    NetworkCredentials = 0x0a,
    NetworkConfigRequest = 0x0b,
    NetworkConfig = 0x0c,
    MulticastGather = 0x0d,
    MulticastFrame = 0x0e,
    PushDirectPaths = 0x10,
    UserMessage = 0x14,
}

impl Verb {
    /// Mask for the compressed bit carried in the verb byte.
    pub const FLAG_COMPRESSED: u8 = 0x80;

    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value & !Self::FLAG_COMPRESSED {
            0x00 => Ok(Verb::Nop),
            0x01 => Ok(Verb::Hello),
            0x02 => Ok(Verb::Error),
            0x03 => Ok(Verb::Ok),
            0x04 => Ok(Verb::Whois),
            0x05 => Ok(Verb::Rendezvous),
            0x06 => Ok(Verb::Frame),
            0x07 => Ok(Verb::ExtFrame),
            0x08 => Ok(Verb::Echo),
            0x09 => Ok(Verb::MulticastLike),
            0x0a => Ok(Verb::NetworkCredentials),
            0x0b => Ok(Verb::NetworkConfigRequest),
            0x0c => Ok(Verb::NetworkConfig),
            0x0d => Ok(Verb::MulticastGather),
            0x0e => Ok(Verb::MulticastFrame),
            0x10 => Ok(Verb::PushDirectPaths),
            0x14 => Ok(Verb::UserMessage),
            other => Err(WireError::InvalidVerb(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Error codes carried in the ERROR verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0x00,
    InvalidRequest = 0x01,
    UnsupportedOperation = 0x02,
    ObjNotFound = 0x03,
    IdentityCollision = 0x04,
    NeedMembershipCertificate = 0x05,
    NetworkAccessDenied = 0x06,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::None),
            0x01 => Some(Self::InvalidRequest),
            0x02 => Some(Self::UnsupportedOperation),
            0x03 => Some(Self::ObjNotFound),
            0x04 => Some(Self::IdentityCollision),
            0x05 => Some(Self::NeedMembershipCertificate),
            0x06 => Some(Self::NetworkAccessDenied),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_roundtrip() {
        for v in [
            Verb::Nop,
            Verb::Hello,
            Verb::Error,
            Verb::Ok,
            Verb::Whois,
            Verb::Rendezvous,
            Verb::Frame,
            Verb::ExtFrame,
            Verb::Echo,
            Verb::MulticastLike,
            Verb::NetworkCredentials,
            Verb::NetworkConfigRequest,
            Verb::NetworkConfig,
            Verb::MulticastGather,
            Verb::MulticastFrame,
            Verb::PushDirectPaths,
            Verb::UserMessage,
        ] {
            assert_eq!(Verb::from_u8(v.as_u8()).unwrap(), v);
            // Compressed bit is transparent to verb identity.
            assert_eq!(Verb::from_u8(v.as_u8() | Verb::FLAG_COMPRESSED).unwrap(), v);
        }
        assert!(Verb::from_u8(0x7f).is_err());
    }

    #[test]
    fn test_error_code_roundtrip() {
        assert_eq!(ErrorCode::from_u8(0x06), Some(ErrorCode::NetworkAccessDenied));
        assert_eq!(ErrorCode::from_u8(0x7f), None);
    }
}
