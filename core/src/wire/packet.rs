//! Packet codec: header marshaling, armor (encrypt + authenticate), and
//! the compressed-payload bit.

use crate::crypto::{PacketCipher, PACKET_MAC_LEN, SHARED_KEY_LEN};
use crate::identity::Address;

use super::{compress, Verb, WireError, PACKET_HEADER_LEN, PACKET_IDX_VERB, PACKET_MAX_LEN};

const FLAGS_HOPS_MASK: u8 = 0x07;
const FLAG_FRAGMENTED: u8 = 0x08;
const FLAGS_CIPHER_SHIFT: u8 = 4;
const FLAGS_CIPHER_MASK: u8 = 0x70;

/// How a packet body is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    /// Authenticated but cleartext. Only HELLO uses this: the body carries
    /// the sender's identity, which the receiver needs before it can key
    /// anything.
    AuthOnly = 0,
    /// Encrypted and authenticated with the pairwise key. The normal case.
    Encrypted = 1,
    /// Neither: the datagram traveled a configured trusted physical network
    /// and the MAC field carries the trusted path id instead of a tag.
    TrustedPath = 2,
}

impl CipherSuite {
    fn from_bits(bits: u8) -> Result<Self, WireError> {
        match bits {
            0 => Ok(Self::AuthOnly),
            1 => Ok(Self::Encrypted),
            2 => Ok(Self::TrustedPath),
            other => Err(WireError::InvalidCipherSuite(other)),
        }
    }
}

/// The cleartext header fields, parseable before any key material is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub id: u64,
    pub dest: Address,
    pub source: Address,
    pub hops: u8,
    pub fragmented: bool,
    pub cipher: CipherSuite,
}

impl Preamble {
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < PACKET_HEADER_LEN {
            return Err(WireError::BufferTooShort { need: PACKET_HEADER_LEN, got: bytes.len() });
        }
        let id = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let dest = Address::read_from(&bytes[8..13])?;
        let source = Address::read_from(&bytes[13..18])?;
        if dest.is_reserved() || source.is_reserved() {
            return Err(WireError::InvalidAddress);
        }
        let flags = bytes[18];
        Ok(Self {
            id,
            dest,
            source,
            hops: flags & FLAGS_HOPS_MASK,
            fragmented: (flags & FLAG_FRAGMENTED) != 0,
            cipher: CipherSuite::from_bits((flags & FLAGS_CIPHER_MASK) >> FLAGS_CIPHER_SHIFT)?,
        })
    }

    /// Bump the hops counter in a raw datagram in place (used when
    /// relaying without re-armoring). False once the ceiling is reached.
    pub fn increment_hops(bytes: &mut [u8]) -> bool {
        if bytes.len() < PACKET_HEADER_LEN {
            return false;
        }
        let hops = bytes[18] & FLAGS_HOPS_MASK;
        if hops >= FLAGS_HOPS_MASK {
            return false;
        }
        bytes[18] = (bytes[18] & !FLAGS_HOPS_MASK) | (hops + 1);
        true
    }
}

/// A decoded (or not-yet-encoded) packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u64,
    pub dest: Address,
    pub source: Address,
    pub hops: u8,
    pub cipher: CipherSuite,
    pub fragmented: bool,
    pub verb: Verb,
    /// Plaintext, decompressed payload.
    pub payload: Vec<u8>,
    compressed: bool,
}

impl Packet {
    pub fn new(dest: Address, source: Address, verb: Verb, id: u64) -> Self {
        Self {
            id,
            dest,
            source,
            hops: 0,
            cipher: CipherSuite::Encrypted,
            fragmented: false,
            verb,
            payload: Vec::new(),
            compressed: false,
        }
    }

    /// Try to LZ4 the payload; keeps the original if compression loses.
    pub fn compress_payload(&mut self) {
        if self.compressed {
            return;
        }
        if let Some(compressed) = compress::maybe_compress(&self.payload) {
            self.payload = compressed;
            self.compressed = true;
        }
    }

    /// Length on the wire once encoded.
    pub fn wire_len(&self) -> usize {
        PACKET_HEADER_LEN + self.payload.len()
    }

    fn flags(&self) -> u8 {
        (self.hops & FLAGS_HOPS_MASK)
            | if self.fragmented { FLAG_FRAGMENTED } else { 0 }
            | (((self.cipher as u8) << FLAGS_CIPHER_SHIFT) & FLAGS_CIPHER_MASK)
    }

    /// The armor nonce: packet id, addressing, and the hops-masked flags.
    fn nonce(&self) -> [u8; 24] {
        let mut nonce = [0u8; 24];
        nonce[0..8].copy_from_slice(&self.id.to_be_bytes());
        nonce[8..13].copy_from_slice(&self.dest.to_bytes());
        nonce[13..18].copy_from_slice(&self.source.to_bytes());
        nonce[18] = self.flags() & !FLAGS_HOPS_MASK;
        nonce
    }

    /// Armor with the pairwise key and serialize. `self.cipher` must be
    /// `AuthOnly` or `Encrypted`.
    pub fn encode(&self, shared_key: &[u8; SHARED_KEY_LEN]) -> Result<Vec<u8>, WireError> {
        debug_assert_ne!(self.cipher, CipherSuite::TrustedPath);
        if self.wire_len() > PACKET_MAX_LEN {
            return Err(WireError::TooLarge(self.wire_len()));
        }

        let mut out = self.serialize_header(0);

        out.push(self.verb.as_u8() | if self.compressed { Verb::FLAG_COMPRESSED } else { 0 });
        out.extend_from_slice(&self.payload);

        let body_len = out.len() - PACKET_IDX_VERB;
        let mut cipher = PacketCipher::new(shared_key, &self.nonce(), body_len);
        if self.cipher == CipherSuite::Encrypted {
            cipher.apply_keystream(&mut out[PACKET_IDX_VERB..]);
        }

        let mac = cipher.mac(&mac_input(&out));
        out[19..19 + PACKET_MAC_LEN].copy_from_slice(&mac);
        Ok(out)
    }

    /// Serialize without armor for a trusted physical path; the MAC field
    /// carries the path's trust id.
    pub fn encode_trusted(&self, trust_id: u64) -> Result<Vec<u8>, WireError> {
        if self.wire_len() > PACKET_MAX_LEN {
            return Err(WireError::TooLarge(self.wire_len()));
        }
        let mut this = self.clone();
        this.cipher = CipherSuite::TrustedPath;
        let mut out = this.serialize_header(trust_id);
        out.push(this.verb.as_u8() | if this.compressed { Verb::FLAG_COMPRESSED } else { 0 });
        out.extend_from_slice(&this.payload);
        Ok(out)
    }

    fn serialize_header(&self, mac_field: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.id.to_be_bytes());
        self.dest.append_to(&mut out);
        self.source.append_to(&mut out);
        out.push(self.flags());
        out.extend_from_slice(&mac_field.to_be_bytes());
        out
    }

    /// Authenticate, decrypt and parse a datagram with a known pairwise key.
    pub fn decode(bytes: &[u8], shared_key: &[u8; SHARED_KEY_LEN]) -> Result<Self, WireError> {
        let preamble = Preamble::parse(bytes)?;
        if preamble.cipher == CipherSuite::TrustedPath {
            return Err(WireError::InvalidCipherSuite(CipherSuite::TrustedPath as u8));
        }
        if bytes.len() > PACKET_MAX_LEN {
            return Err(WireError::TooLarge(bytes.len()));
        }

        let mut body = bytes[PACKET_IDX_VERB..].to_vec();
        let mut shell = Self::from_preamble(preamble, Verb::Nop, Vec::new());

        let mut cipher = PacketCipher::new(shared_key, &shell.nonce(), body.len());
        let expected = cipher.mac(&mac_input(bytes));
        if expected[..] != bytes[19..19 + PACKET_MAC_LEN] {
            return Err(WireError::MacFailed);
        }
        if preamble.cipher == CipherSuite::Encrypted {
            cipher.apply_keystream(&mut body);
        }

        shell.finish_body(body)?;
        Ok(shell)
    }

    /// Parse an AuthOnly datagram WITHOUT checking its MAC. Used exactly
    /// once in the receive path: a HELLO from an unknown sender, whose
    /// cleartext body carries the identity needed to derive the key. The
    /// caller must re-decode with the agreed key before trusting anything.
    pub fn decode_unauthenticated(bytes: &[u8]) -> Result<Self, WireError> {
        let preamble = Preamble::parse(bytes)?;
        if preamble.cipher != CipherSuite::AuthOnly {
            return Err(WireError::InvalidCipherSuite(preamble.cipher as u8));
        }
        let mut shell = Self::from_preamble(preamble, Verb::Nop, Vec::new());
        shell.finish_body(bytes[PACKET_IDX_VERB..].to_vec())?;
        Ok(shell)
    }

    /// Parse a datagram that arrived over a trusted physical path. The
    /// caller has already matched `trust_id` against its configuration.
    pub fn decode_trusted(bytes: &[u8], trust_id: u64) -> Result<Self, WireError> {
        let preamble = Preamble::parse(bytes)?;
        if preamble.cipher != CipherSuite::TrustedPath {
            return Err(WireError::InvalidCipherSuite(preamble.cipher as u8));
        }
        let claimed = u64::from_be_bytes(bytes[19..27].try_into().unwrap());
        if claimed != trust_id {
            return Err(WireError::MacFailed);
        }
        let mut shell = Self::from_preamble(preamble, Verb::Nop, Vec::new());
        shell.finish_body(bytes[PACKET_IDX_VERB..].to_vec())?;
        Ok(shell)
    }

    fn from_preamble(p: Preamble, verb: Verb, payload: Vec<u8>) -> Self {
        Self {
            id: p.id,
            dest: p.dest,
            source: p.source,
            hops: p.hops,
            cipher: p.cipher,
            fragmented: p.fragmented,
            verb,
            payload,
            compressed: false,
        }
    }

    fn finish_body(&mut self, body: Vec<u8>) -> Result<(), WireError> {
        let verb_byte = *body.first().ok_or(WireError::BufferTooShort { need: 1, got: 0 })?;
        self.verb = Verb::from_u8(verb_byte)?;
        let raw = &body[1..];
        if (verb_byte & Verb::FLAG_COMPRESSED) != 0 {
            self.payload = compress::decompress(raw)?;
        } else {
            self.payload = raw.to_vec();
        }
        Ok(())
    }
}

/// The authenticated region: the 19 header bytes with hops zeroed, followed
/// by the (armored) body. The MAC field itself is excluded.
fn mac_input(wire: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(wire.len() - PACKET_MAC_LEN);
    input.extend_from_slice(&wire[..19]);
    input[18] &= !FLAGS_HOPS_MASK;
    input.extend_from_slice(&wire[PACKET_IDX_VERB..]);
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(v: u64) -> Address {
        Address::from_u64(v)
    }

    fn sample(verb: Verb, payload: &[u8]) -> Packet {
        let mut p = Packet::new(addr(0x1122334455), addr(0xaabbccdd01), verb, 0x0102030405060708);
        p.payload = payload.to_vec();
        p
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = [0x5a; 32];
        let p = sample(Verb::Frame, b"an ethernet frame");
        let wire = p.encode(&key).unwrap();
        assert_eq!(wire.len(), PACKET_HEADER_LEN + 17);

        let decoded = Packet::decode(&wire, &key).unwrap();
        assert_eq!(decoded.verb, Verb::Frame);
        assert_eq!(decoded.payload, b"an ethernet frame");
        assert_eq!(decoded.id, p.id);
        assert_eq!(decoded.dest, p.dest);
        assert_eq!(decoded.source, p.source);
    }

    #[test]
    fn test_payload_is_encrypted() {
        let key = [0x5a; 32];
        let p = sample(Verb::Frame, b"an ethernet frame");
        let wire = p.encode(&key).unwrap();
        assert!(!wire.windows(8).any(|w| w == b"ethernet"));
    }

    #[test]
    fn test_auth_only_is_cleartext_but_authenticated() {
        let key = [0x5a; 32];
        let mut p = sample(Verb::Hello, b"identity goes here");
        p.cipher = CipherSuite::AuthOnly;
        let wire = p.encode(&key).unwrap();
        assert!(wire.windows(8).any(|w| w == b"identity"));

        let mut tampered = wire.clone();
        *tampered.last_mut().unwrap() ^= 1;
        assert_eq!(Packet::decode(&tampered, &key), Err(WireError::MacFailed));
        assert!(Packet::decode(&wire, &key).is_ok());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let p = sample(Verb::Frame, b"payload");
        let wire = p.encode(&[0x5a; 32]).unwrap();
        assert_eq!(Packet::decode(&wire, &[0x5b; 32]), Err(WireError::MacFailed));
    }

    #[test]
    fn test_hops_mutable_without_breaking_mac() {
        let key = [0x5a; 32];
        let p = sample(Verb::Frame, b"payload");
        let mut wire = p.encode(&key).unwrap();
        assert!(Preamble::increment_hops(&mut wire));
        assert!(Preamble::increment_hops(&mut wire));
        let decoded = Packet::decode(&wire, &key).unwrap();
        assert_eq!(decoded.hops, 2);
    }

    #[test]
    fn test_hops_ceiling() {
        let key = [0x5a; 32];
        let p = sample(Verb::Frame, b"x");
        let mut wire = p.encode(&key).unwrap();
        for _ in 0..7 {
            Preamble::increment_hops(&mut wire);
        }
        assert!(!Preamble::increment_hops(&mut wire));
    }

    #[test]
    fn test_compression_roundtrip() {
        let key = [0x11; 32];
        let mut p = sample(Verb::UserMessage, &vec![0xabu8; 2000]);
        p.compress_payload();
        let wire = p.encode(&key).unwrap();
        assert!(wire.len() < 2000);

        let decoded = Packet::decode(&wire, &key).unwrap();
        assert_eq!(decoded.payload, vec![0xabu8; 2000]);
    }

    #[test]
    fn test_trusted_path_roundtrip() {
        let p = sample(Verb::Frame, b"over the trusted lan");
        let wire = p.encode_trusted(0xbeef).unwrap();
        let decoded = Packet::decode_trusted(&wire, 0xbeef).unwrap();
        assert_eq!(decoded.payload, b"over the trusted lan");
        assert_eq!(Packet::decode_trusted(&wire, 0xdead), Err(WireError::MacFailed));
    }

    #[test]
    fn test_truncated_rejected() {
        let key = [0x5a; 32];
        let wire = sample(Verb::Frame, b"payload").encode(&key).unwrap();
        assert!(Packet::decode(&wire[..20], &key).is_err());
    }
}
