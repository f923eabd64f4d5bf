//! Network credentials: certificates of membership, tags, capabilities,
//! and revocations.
//!
//! A certificate of membership (COM) is a sorted set of up to eight
//! `(id, value, max_delta)` qualifiers signed by the network controller.
//! Two members may talk iff their COMs *agree*: every qualifier present in
//! one must be present in the other with `|value_a - value_b|` within the
//! first COM's `max_delta`. Agreement is deliberately not symmetric; each
//! side enforces its own deltas.
//!
//! Revocations are threshold-time fences: a revocation with threshold T
//! invalidates any matching credential issued at or before T.

use serde::{Deserialize, Serialize};

use crate::crypto::SIGNATURE_LEN;
use crate::identity::{Address, Identity};
use crate::wire::WireError;

/// Absolute cap on qualifiers in one COM.
pub const COM_MAX_QUALIFIERS: usize = 8;

/// Reserved qualifier ids present in every issued COM.
pub mod com_qualifier {
    /// Timestamp of the certificate (delta-compared).
    pub const TIMESTAMP: u64 = 0;
    /// Network id (must match exactly).
    pub const NETWORK_ID: u64 = 1;
    /// Address the certificate was issued to (informational, any delta).
    pub const ISSUED_TO: u64 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CredentialType {
    Com = 1,
    Capability = 2,
    Tag = 3,
    Revocation = 6,
}

impl CredentialType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Com),
            2 => Some(Self::Capability),
            3 => Some(Self::Tag),
            6 => Some(Self::Revocation),
            _ => None,
        }
    }
}

/// Outcome of validating a credential whose signer may not be known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialAcceptance {
    Accepted,
    /// Signer identity unknown; a WHOIS is in flight.
    Pending,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qualifier {
    pub id: u64,
    pub value: u64,
    pub max_delta: u64,
}

// ============================================================================
// Certificate of Membership
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CertificateOfMembership {
    qualifiers: Vec<Qualifier>,
    signed_by: Address,
    signature: Vec<u8>,
}

impl CertificateOfMembership {
    /// Build the standard three-qualifier COM for issuance.
    pub fn new(timestamp: i64, timestamp_max_delta: u64, nwid: u64, issued_to: Address) -> Self {
        Self {
            qualifiers: vec![
                Qualifier {
                    id: com_qualifier::TIMESTAMP,
                    value: timestamp as u64,
                    max_delta: timestamp_max_delta,
                },
                Qualifier { id: com_qualifier::NETWORK_ID, value: nwid, max_delta: 0 },
                Qualifier {
                    id: com_qualifier::ISSUED_TO,
                    value: issued_to.to_u64(),
                    max_delta: u64::MAX,
                },
            ],
            signed_by: Address::default(),
            signature: Vec::new(),
        }
    }

    pub fn is_set(&self) -> bool {
        !self.qualifiers.is_empty()
    }

    fn qualifier(&self, id: u64) -> Option<u64> {
        self.qualifiers.iter().find(|q| q.id == id).map(|q| q.value)
    }

    pub fn timestamp(&self) -> i64 {
        self.qualifier(com_qualifier::TIMESTAMP).unwrap_or(0) as i64
    }

    pub fn network_id(&self) -> u64 {
        self.qualifier(com_qualifier::NETWORK_ID).unwrap_or(0)
    }

    pub fn issued_to(&self) -> Address {
        Address::from_u64(self.qualifier(com_qualifier::ISSUED_TO).unwrap_or(0))
    }

    pub fn signed_by(&self) -> Address {
        self.signed_by
    }

    /// Every qualifier present here must be present in `other` and agree
    /// to within *this* certificate's max delta.
    pub fn agrees_with(&self, other: &CertificateOfMembership) -> bool {
        if self.qualifiers.is_empty() {
            return false;
        }
        for mine in &self.qualifiers {
            let Some(theirs) = other.qualifier(mine.id) else {
                return false;
            };
            if mine.max_delta == u64::MAX {
                continue;
            }
            let delta = mine.value.abs_diff(theirs);
            if delta > mine.max_delta {
                return false;
            }
        }
        true
    }

    fn signed_portion(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.qualifiers.len() * 24);
        for q in &self.qualifiers {
            buf.extend_from_slice(&q.id.to_be_bytes());
            buf.extend_from_slice(&q.value.to_be_bytes());
            buf.extend_from_slice(&q.max_delta.to_be_bytes());
        }
        buf
    }

    /// Sign as the controller. Fails without a secret key.
    pub fn sign(&mut self, with: &Identity) -> bool {
        match with.sign(&self.signed_portion()) {
            Some(sig) => {
                self.signed_by = with.address();
                self.signature = sig.to_vec();
                true
            }
            None => false,
        }
    }

    /// Check the signature against the resolved signer identity. The
    /// caller is responsible for having resolved `signer` via WHOIS and
    /// for checking that it matches `signed_by`.
    pub fn verify_signature(&self, signer: &Identity) -> bool {
        signer.address() == self.signed_by
            && !self.signed_by.is_nil()
            && signer.verify(&self.signed_portion(), &self.signature)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(1u8);
        buf.extend_from_slice(&(self.qualifiers.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.signed_portion());
        self.signed_by.append_to(&mut buf);
        if !self.signed_by.is_nil() {
            buf.extend_from_slice(&self.signature);
        }
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < 3 {
            return Err(WireError::BufferTooShort { need: 3, got: buf.len() });
        }
        if buf[0] != 1 {
            return Err(WireError::InvalidData("com version"));
        }
        let count = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if count > COM_MAX_QUALIFIERS {
            return Err(WireError::InvalidData("too many com qualifiers"));
        }
        let mut p = 3;
        let mut qualifiers = Vec::with_capacity(count);
        let mut last_id: Option<u64> = None;
        for _ in 0..count {
            if buf.len() < p + 24 {
                return Err(WireError::BufferTooShort { need: p + 24, got: buf.len() });
            }
            let id = u64::from_be_bytes(buf[p..p + 8].try_into().unwrap());
            if let Some(last) = last_id {
                if id <= last {
                    return Err(WireError::InvalidData("com qualifiers not ascending"));
                }
            }
            last_id = Some(id);
            qualifiers.push(Qualifier {
                id,
                value: u64::from_be_bytes(buf[p + 8..p + 16].try_into().unwrap()),
                max_delta: u64::from_be_bytes(buf[p + 16..p + 24].try_into().unwrap()),
            });
            p += 24;
        }

        let signed_by = Address::read_from(&buf[p..])?;
        p += Address::LENGTH;
        let mut signature = Vec::new();
        if !signed_by.is_nil() {
            if buf.len() < p + SIGNATURE_LEN {
                return Err(WireError::BufferTooShort { need: p + SIGNATURE_LEN, got: buf.len() });
            }
            signature = buf[p..p + SIGNATURE_LEN].to_vec();
            p += SIGNATURE_LEN;
        }

        Ok((Self { qualifiers, signed_by, signature }, p))
    }
}

// ============================================================================
// Tag
// ============================================================================

/// A controller-assigned `(id, value)` pair used by tag-match rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub network_id: u64,
    pub timestamp: i64,
    pub id: u32,
    pub value: u32,
    pub issued_to: Address,
    pub signed_by: Address,
    pub signature: Vec<u8>,
}

impl Tag {
    pub fn new(network_id: u64, timestamp: i64, id: u32, value: u32, issued_to: Address) -> Self {
        Self {
            network_id,
            timestamp,
            id,
            value,
            issued_to,
            signed_by: Address::default(),
            signature: Vec::new(),
        }
    }

    fn signed_portion(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(29);
        buf.extend_from_slice(&self.network_id.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.value.to_be_bytes());
        self.issued_to.append_to(&mut buf);
        buf
    }

    pub fn sign(&mut self, with: &Identity) -> bool {
        match with.sign(&self.signed_portion()) {
            Some(sig) => {
                self.signed_by = with.address();
                self.signature = sig.to_vec();
                true
            }
            None => false,
        }
    }

    pub fn verify_signature(&self, signer: &Identity) -> bool {
        signer.address() == self.signed_by
            && !self.signed_by.is_nil()
            && signer.verify(&self.signed_portion(), &self.signature)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.signed_portion();
        self.signed_by.append_to(&mut buf);
        buf.extend_from_slice(&self.signature);
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let need = 29 + Address::LENGTH + SIGNATURE_LEN;
        if buf.len() < need {
            return Err(WireError::BufferTooShort { need, got: buf.len() });
        }
        Ok((
            Self {
                network_id: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
                timestamp: i64::from_be_bytes(buf[8..16].try_into().unwrap()),
                id: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
                value: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
                issued_to: Address::read_from(&buf[24..29])?,
                signed_by: Address::read_from(&buf[29..34])?,
                signature: buf[34..34 + SIGNATURE_LEN].to_vec(),
            },
            need,
        ))
    }
}

// ============================================================================
// Capability
// ============================================================================

/// A controller-granted permission token referenced during rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub network_id: u64,
    pub timestamp: i64,
    pub id: u32,
    pub issued_to: Address,
    pub signed_by: Address,
    pub signature: Vec<u8>,
}

impl Capability {
    pub fn new(network_id: u64, timestamp: i64, id: u32, issued_to: Address) -> Self {
        Self {
            network_id,
            timestamp,
            id,
            issued_to,
            signed_by: Address::default(),
            signature: Vec::new(),
        }
    }

    fn signed_portion(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(25);
        buf.extend_from_slice(&self.network_id.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.id.to_be_bytes());
        self.issued_to.append_to(&mut buf);
        buf
    }

    pub fn sign(&mut self, with: &Identity) -> bool {
        match with.sign(&self.signed_portion()) {
            Some(sig) => {
                self.signed_by = with.address();
                self.signature = sig.to_vec();
                true
            }
            None => false,
        }
    }

    pub fn verify_signature(&self, signer: &Identity) -> bool {
        signer.address() == self.signed_by
            && !self.signed_by.is_nil()
            && signer.verify(&self.signed_portion(), &self.signature)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.signed_portion();
        self.signed_by.append_to(&mut buf);
        buf.extend_from_slice(&self.signature);
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let need = 25 + Address::LENGTH + SIGNATURE_LEN;
        if buf.len() < need {
            return Err(WireError::BufferTooShort { need, got: buf.len() });
        }
        Ok((
            Self {
                network_id: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
                timestamp: i64::from_be_bytes(buf[8..16].try_into().unwrap()),
                id: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
                issued_to: Address::read_from(&buf[20..25])?,
                signed_by: Address::read_from(&buf[25..30])?,
                signature: buf[30..30 + SIGNATURE_LEN].to_vec(),
            },
            need,
        ))
    }
}

// ============================================================================
// Revocation
// ============================================================================

/// A threshold-time fence: credentials of `credential_type` issued to
/// `target` at or before `threshold` are void.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub id: u32,
    pub network_id: u64,
    pub credential_id: u32,
    pub threshold: i64,
    pub target: Address,
    pub credential_type: u8,
    pub signed_by: Address,
    pub signature: Vec<u8>,
}

impl Revocation {
    pub fn new(
        id: u32,
        network_id: u64,
        credential_id: u32,
        threshold: i64,
        target: Address,
        credential_type: CredentialType,
    ) -> Self {
        Self {
            id,
            network_id,
            credential_id,
            threshold,
            target,
            credential_type: credential_type as u8,
            signed_by: Address::default(),
            signature: Vec::new(),
        }
    }

    pub fn revokes(&self, credential_type: CredentialType, credential_id: u32, issued_to: Address, timestamp: i64) -> bool {
        self.credential_type == credential_type as u8
            && self.credential_id == credential_id
            && self.target == issued_to
            && timestamp <= self.threshold
    }

    fn signed_portion(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(30);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.network_id.to_be_bytes());
        buf.extend_from_slice(&self.credential_id.to_be_bytes());
        buf.extend_from_slice(&self.threshold.to_be_bytes());
        self.target.append_to(&mut buf);
        buf.push(self.credential_type);
        buf
    }

    pub fn sign(&mut self, with: &Identity) -> bool {
        match with.sign(&self.signed_portion()) {
            Some(sig) => {
                self.signed_by = with.address();
                self.signature = sig.to_vec();
                true
            }
            None => false,
        }
    }

    pub fn verify_signature(&self, signer: &Identity) -> bool {
        signer.address() == self.signed_by
            && !self.signed_by.is_nil()
            && signer.verify(&self.signed_portion(), &self.signature)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.signed_portion();
        self.signed_by.append_to(&mut buf);
        buf.extend_from_slice(&self.signature);
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let fixed = 4 + 8 + 4 + 8 + Address::LENGTH + 1;
        let need = fixed + Address::LENGTH + SIGNATURE_LEN;
        if buf.len() < need {
            return Err(WireError::BufferTooShort { need, got: buf.len() });
        }
        Ok((
            Self {
                id: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
                network_id: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
                credential_id: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
                threshold: i64::from_be_bytes(buf[16..24].try_into().unwrap()),
                target: Address::read_from(&buf[24..29])?,
                credential_type: buf[29],
                signed_by: Address::read_from(&buf[30..35])?,
                signature: buf[35..35 + SIGNATURE_LEN].to_vec(),
            },
            need,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn controller() -> Identity {
        Identity::generate()
    }

    #[test]
    fn test_com_reserved_accessors() {
        let com =
            CertificateOfMembership::new(12345, 60000, 0x8056c2e21c000001, Address::from_u64(0xabc));
        assert_eq!(com.timestamp(), 12345);
        assert_eq!(com.network_id(), 0x8056c2e21c000001);
        assert_eq!(com.issued_to(), Address::from_u64(0xabc));
    }

    #[test]
    fn test_agreement_is_reflexive() {
        let com = CertificateOfMembership::new(1000, 60000, 1, Address::from_u64(2));
        assert!(com.agrees_with(&com));
    }

    #[test]
    fn test_agreement_timestamp_window() {
        // The S3 scenario from the protocol description.
        let m1 = CertificateOfMembership::new(1050, 60000, 1, Address::from_u64(0x111));
        let m2 = CertificateOfMembership::new(70000, 60000, 1, Address::from_u64(0x222));
        assert!(!m1.agrees_with(&m2));
        assert!(m1.agrees_with(&m1));
        // 1050 vs 50000 is within the 60000 window.
        let m3 = CertificateOfMembership::new(50000, 60000, 1, Address::from_u64(0x333));
        assert!(m1.agrees_with(&m3));
    }

    #[test]
    fn test_agreement_not_symmetric_on_differing_deltas() {
        let tight = CertificateOfMembership::new(1000, 10, 1, Address::from_u64(2));
        let loose = CertificateOfMembership::new(2000, 60000, 1, Address::from_u64(3));
        assert!(loose.agrees_with(&tight));
        assert!(!tight.agrees_with(&loose));
    }

    #[test]
    fn test_agreement_requires_network_match() {
        let a = CertificateOfMembership::new(1000, 60000, 1, Address::from_u64(2));
        let b = CertificateOfMembership::new(1000, 60000, 2, Address::from_u64(3));
        assert!(!a.agrees_with(&b));
    }

    #[test]
    fn test_empty_com_agrees_with_nothing() {
        let empty = CertificateOfMembership::default();
        let real = CertificateOfMembership::new(1000, 60000, 1, Address::from_u64(2));
        assert!(!empty.agrees_with(&real));
        assert!(!empty.agrees_with(&empty));
    }

    #[test]
    fn test_com_sign_verify_serialize() {
        let ctrl = controller();
        let mut com = CertificateOfMembership::new(1000, 60000, 1, Address::from_u64(2));
        assert!(com.sign(&ctrl));
        assert!(com.verify_signature(&ctrl));
        assert!(!com.verify_signature(&controller()));

        let bytes = com.serialize();
        let (parsed, used) = CertificateOfMembership::deserialize(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(parsed, com);
        assert!(parsed.verify_signature(&ctrl));
    }

    #[test]
    fn test_com_deserialize_rejects_unordered_qualifiers() {
        let com = CertificateOfMembership::new(1000, 60000, 1, Address::from_u64(2));
        let mut bytes = com.serialize();
        // Swap the first two qualifier ids (bytes 3.. and 27..).
        let (a, b) = (3usize, 27usize);
        for i in 0..8 {
            bytes.swap(a + i, b + i);
        }
        assert!(CertificateOfMembership::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_tag_roundtrip_and_signature() {
        let ctrl = controller();
        let mut tag = Tag::new(1, 5000, 7, 42, Address::from_u64(0xabc));
        assert!(tag.sign(&ctrl));
        assert!(tag.verify_signature(&ctrl));

        let bytes = tag.serialize();
        let (parsed, used) = Tag::deserialize(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(parsed, tag);

        let mut tampered = parsed;
        tampered.value ^= 1;
        assert!(!tampered.verify_signature(&ctrl));
    }

    #[test]
    fn test_capability_roundtrip() {
        let ctrl = controller();
        let mut cap = Capability::new(1, 5000, 3, Address::from_u64(0xabc));
        assert!(cap.sign(&ctrl));
        let bytes = cap.serialize();
        let (parsed, _) = Capability::deserialize(&bytes).unwrap();
        assert_eq!(parsed, cap);
        assert!(parsed.verify_signature(&ctrl));
    }

    #[test]
    fn test_revocation_fencing() {
        let rev = Revocation::new(1, 1, 0, 5000, Address::from_u64(0xabc), CredentialType::Com);

        // Issued at/before the threshold: revoked.
        assert!(rev.revokes(CredentialType::Com, 0, Address::from_u64(0xabc), 5000));
        assert!(rev.revokes(CredentialType::Com, 0, Address::from_u64(0xabc), 100));
        // Issued after: survives.
        assert!(!rev.revokes(CredentialType::Com, 0, Address::from_u64(0xabc), 5001));
        // Different member: untouched.
        assert!(!rev.revokes(CredentialType::Com, 0, Address::from_u64(0xdef), 100));
        // Different credential type: untouched.
        assert!(!rev.revokes(CredentialType::Tag, 0, Address::from_u64(0xabc), 100));
    }

    #[test]
    fn test_revocation_roundtrip() {
        let ctrl = controller();
        let mut rev = Revocation::new(9, 1, 4, 5000, Address::from_u64(0xabc), CredentialType::Tag);
        assert!(rev.sign(&ctrl));
        let bytes = rev.serialize();
        let (parsed, _) = Revocation::deserialize(&bytes).unwrap();
        assert_eq!(parsed, rev);
        assert!(parsed.verify_signature(&ctrl));
    }
}
