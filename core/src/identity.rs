//! Node identities: an Ed25519 keypair plus the 40-bit overlay address
//! derived from it.
//!
//! ## Address derivation
//!
//! The address is not a free choice: it is taken from the tail of a
//! memory-hard digest of the public key, and only keypairs whose digest
//! meets a work criterion are acceptable. Grinding a keypair to a *chosen*
//! address therefore costs a full derivation per candidate, and the
//! derivation itself needs a scratch buffer that resists cheap ASIC/GPU
//! parallelism. Verification is a single derivation, O(1) in attempts.
//!
//! ## Security invariants
//!
//! - An identity's address always matches its public key (`locally_validate`).
//! - Secret key material is zeroized on drop and never leaves this module
//!   except through the signing and agreement primitives.

use std::fmt;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{self, SIGNATURE_LEN};
use crate::wire::WireError;

// ============================================================================
// Address
// ============================================================================

/// A 40-bit overlay address. Zero and the 0xff prefix are reserved and never
/// assigned (0xff marks fragment continuations on the wire).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Address(u64);

impl Address {
    pub const LENGTH: usize = 5;
    pub const RESERVED_PREFIX: u8 = 0xff;

    pub fn from_u64(v: u64) -> Self {
        Self(v & 0xff_ffff_ffff)
    }

    pub fn from_bytes(b: [u8; 5]) -> Self {
        Self(
            ((b[0] as u64) << 32)
                | ((b[1] as u64) << 24)
                | ((b[2] as u64) << 16)
                | ((b[3] as u64) << 8)
                | (b[4] as u64),
        )
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; 5] {
        [
            (self.0 >> 32) as u8,
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }

    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// Reserved addresses can never belong to a node.
    pub fn is_reserved(self) -> bool {
        self.0 == 0 || (self.0 >> 32) as u8 == Self::RESERVED_PREFIX
    }

    pub fn append_to(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::LENGTH {
            return Err(WireError::BufferTooShort { need: Self::LENGTH, got: buf.len() });
        }
        let mut b = [0u8; 5];
        b.copy_from_slice(&buf[..5]);
        Ok(Self::from_bytes(b))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:010x})", self.0)
    }
}

// ============================================================================
// Memory-hard address derivation
// ============================================================================

/// Scratch size for the derivation. Large enough that a parallel search is
/// memory-bound, small enough that verification stays in the millisecond
/// range on commodity hardware.
const DERIVATION_SCRATCH: usize = 1 << 18;

/// Serially-dependent random probes through the scratch buffer.
const DERIVATION_PROBES: usize = 4096;

/// A candidate public key is acceptable iff the first digest byte is at
/// most this value (expected ~15 keypairs ground per identity).
const DERIVATION_CRITERION: u8 = 0x10;

const DERIVATION_CONTEXT: &str = "weft v1 address derivation";

/// Run the memory-hard function over a public key, producing the 64-byte
/// derivation digest. Generation and verification both pay this cost.
fn derivation_digest(public_key: &[u8; 32]) -> [u8; 64] {
    let mut scratch = vec![0u8; DERIVATION_SCRATCH];
    blake3::Hasher::new_derive_key(DERIVATION_CONTEXT)
        .update(public_key)
        .finalize_xof()
        .fill(&mut scratch);

    // Pointer-chasing pass: each probe depends on the previous digest, and
    // each probe site is overwritten so probes cannot be served from a
    // smaller working set.
    let mut d = *blake3::hash(public_key).as_bytes();
    for _ in 0..DERIVATION_PROBES {
        let idx =
            (u64::from_le_bytes(d[..8].try_into().unwrap()) as usize) % (DERIVATION_SCRATCH - 64);
        let mut h = blake3::Hasher::new();
        h.update(&d);
        h.update(&scratch[idx..idx + 64]);
        d = *h.finalize().as_bytes();
        scratch[idx..idx + 32].copy_from_slice(&d);
    }

    let mut out = [0u8; 64];
    blake3::Hasher::new()
        .update(&d)
        .update(&scratch)
        .finalize_xof()
        .fill(&mut out);
    out
}

/// Derive the address for a public key, or None if the key fails the work
/// criterion or lands on a reserved address.
fn derive_address(public_key: &[u8; 32]) -> Option<Address> {
    let digest = derivation_digest(public_key);
    if digest[0] > DERIVATION_CRITERION {
        return None;
    }
    let mut b = [0u8; 5];
    b.copy_from_slice(&digest[59..64]);
    let addr = Address::from_bytes(b);
    if addr.is_reserved() {
        return None;
    }
    Some(addr)
}

// ============================================================================
// Identity
// ============================================================================

/// A node identity: public key, derived address, and (locally) the secret.
///
/// Identities compare equal on address and public key; the secret half is
/// never part of equality, serialization defaults, or Debug output.
#[derive(Clone)]
pub struct Identity {
    address: Address,
    public: [u8; 32],
    secret: Option<SigningKey>,
}

impl Identity {
    /// Wire length of the public form: address + type byte + public key.
    pub const MARSHALED_LEN: usize = Address::LENGTH + 1 + 32;

    /// Key type byte for the current Ed25519/Curve25519 scheme.
    const KEY_TYPE_C25519: u8 = 0x00;

    /// Generate a fresh identity. Grinds keypairs until one passes the
    /// derivation criterion; expect a few seconds of CPU.
    pub fn generate() -> Self {
        use rand::RngCore;
        loop {
            let mut seed = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut seed);
            let signing_key = SigningKey::from_bytes(&seed);
            seed.zeroize();

            let public = signing_key.verifying_key().to_bytes();
            if let Some(address) = derive_address(&public) {
                return Self { address, public, secret: Some(signing_key) };
            }
        }
    }

    /// Re-run the derivation and check it against the claimed address.
    /// Rejects identities whose address was not earned.
    pub fn locally_validate(&self) -> bool {
        derive_address(&self.public) == Some(self.address)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key_bytes(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Sign with this identity's secret key (96-byte detached form).
    pub fn sign(&self, data: &[u8]) -> Option<[u8; SIGNATURE_LEN]> {
        self.secret.as_ref().map(|sk| crypto::sign_detached(sk, data))
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        crypto::verify_detached(&self.public, data, signature)
    }

    /// Bare 64-byte signature for tagged sub-payloads (config chunks).
    pub fn sign_raw(&self, data: &[u8]) -> Option<[u8; 64]> {
        self.secret.as_ref().map(|sk| crypto::sign_raw(sk, data))
    }

    pub fn verify_raw(&self, data: &[u8], signature: &[u8]) -> bool {
        crypto::verify_raw(&self.public, data, signature)
    }

    /// Derive the pairwise packet key shared with `other`. Requires our
    /// secret half; fails for malformed remote keys.
    pub fn agree(&self, other: &Identity) -> Option<Zeroizing<[u8; 32]>> {
        let sk = self.secret.as_ref()?;
        crypto::key_agreement(sk, &other.public)
    }

    /// Strip the secret half (what we put on the wire or hand to peers).
    pub fn public_only(&self) -> Identity {
        Self { address: self.address, public: self.public, secret: None }
    }

    // ------------------------------------------------------------------
    // Wire form
    // ------------------------------------------------------------------

    pub fn append_to(&self, buf: &mut Vec<u8>) {
        self.address.append_to(buf);
        buf.push(Self::KEY_TYPE_C25519);
        buf.extend_from_slice(&self.public);
    }

    /// Parse the wire form; returns the identity and bytes consumed.
    /// Does not run the derivation; call `locally_validate` on untrusted
    /// input before believing the address.
    pub fn read_from(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < Self::MARSHALED_LEN {
            return Err(WireError::BufferTooShort { need: Self::MARSHALED_LEN, got: buf.len() });
        }
        let address = Address::read_from(buf)?;
        if address.is_reserved() {
            return Err(WireError::InvalidAddress);
        }
        if buf[5] != Self::KEY_TYPE_C25519 {
            return Err(WireError::UnsupportedKeyType(buf[5]));
        }
        let mut public = [0u8; 32];
        public.copy_from_slice(&buf[6..38]);
        if VerifyingKey::from_bytes(&public).is_err() {
            return Err(WireError::InvalidPublicKey);
        }
        Ok((Self { address, public, secret: None }, Self::MARSHALED_LEN))
    }

    // ------------------------------------------------------------------
    // Text form (persisted via the host's state callbacks)
    // ------------------------------------------------------------------

    /// `<address>:0:<public-hex>[:<secret-hex>]`
    pub fn to_text(&self, include_secret: bool) -> Zeroizing<String> {
        let mut s = format!("{}:0:{}", self.address, hex::encode(self.public));
        if include_secret {
            if let Some(sk) = &self.secret {
                s.push(':');
                s.push_str(&hex::encode(sk.to_bytes()));
            }
        }
        Zeroizing::new(s)
    }

    pub fn from_text(s: &str) -> Option<Self> {
        let mut parts = s.trim().split(':');
        let address = u64::from_str_radix(parts.next()?, 16).ok()?;
        let address = Address::from_u64(address);
        if address.is_reserved() || parts.next()? != "0" {
            return None;
        }

        let public_hex = parts.next()?;
        let public_bytes = hex::decode(public_hex).ok()?;
        let public: [u8; 32] = public_bytes.try_into().ok()?;
        VerifyingKey::from_bytes(&public).ok()?;

        let secret = match parts.next() {
            Some(secret_hex) => {
                let mut secret_bytes = Zeroizing::new(hex::decode(secret_hex).ok()?);
                let seed: [u8; 32] = secret_bytes.as_slice().try_into().ok()?;
                let sk = SigningKey::from_bytes(&seed);
                secret_bytes.zeroize();
                // A secret that does not produce this public key is garbage.
                if sk.verifying_key().to_bytes() != public {
                    return None;
                }
                Some(sk)
            }
            None => None,
        };

        Some(Self { address, public, secret })
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.public == other.public
    }
}

impl Eq for Identity {}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("public", &hex::encode(&self.public[..8]))
            .field("has_secret", &self.secret.is_some())
            .finish()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_byte_roundtrip() {
        let a = Address::from_u64(0x1122334455);
        assert_eq!(Address::from_bytes(a.to_bytes()), a);
        assert_eq!(a.to_string(), "1122334455");
        assert_eq!(Address::from_u64(0xff_1122334455).to_u64(), 0x1122334455);
    }

    #[test]
    fn test_reserved_addresses() {
        assert!(Address::from_u64(0).is_reserved());
        assert!(Address::from_u64(0xff00000001).is_reserved());
        assert!(!Address::from_u64(0x0100000001).is_reserved());
    }

    #[test]
    fn test_generate_validates() {
        let id = Identity::generate();
        assert!(!id.address().is_reserved());
        assert!(id.has_secret());
        assert!(id.locally_validate());
    }

    #[test]
    fn test_forged_address_fails_validation() {
        let id = Identity::generate();
        let forged = Identity {
            address: Address::from_u64(id.address().to_u64() ^ 1),
            public: *id.public_key_bytes(),
            secret: None,
        };
        assert!(!forged.locally_validate());
    }

    #[test]
    fn test_wire_roundtrip() {
        let id = Identity::generate();
        let mut buf = Vec::new();
        id.append_to(&mut buf);
        assert_eq!(buf.len(), Identity::MARSHALED_LEN);

        let (parsed, used) = Identity::read_from(&buf).unwrap();
        assert_eq!(used, Identity::MARSHALED_LEN);
        assert_eq!(parsed, id.public_only());
        assert!(parsed.locally_validate());
        assert!(!parsed.has_secret());
    }

    #[test]
    fn test_text_roundtrip_with_secret() {
        let id = Identity::generate();

        let public_text = id.to_text(false);
        let parsed = Identity::from_text(&public_text).unwrap();
        assert_eq!(parsed, id);
        assert!(!parsed.has_secret());

        let secret_text = id.to_text(true);
        let parsed = Identity::from_text(&secret_text).unwrap();
        assert_eq!(parsed, id);
        assert!(parsed.has_secret());

        let msg = b"prove it";
        let sig = parsed.sign(msg).unwrap();
        assert!(id.verify(msg, &sig));
    }

    #[test]
    fn test_text_rejects_mismatched_secret() {
        let a = Identity::generate();
        let b = Identity::generate();
        // Graft b's secret onto a's public half.
        let b_text = b.to_text(true);
        let b_secret_hex = b_text.rsplit(':').next().unwrap();
        let franken = format!("{}:0:{}:{}", a.address(), hex::encode(a.public_key_bytes()), b_secret_hex);
        assert!(Identity::from_text(&franken).is_none());
    }

    #[test]
    fn test_agreement_matches_across_peers() {
        let a = Identity::generate();
        let b = Identity::generate();
        let k1 = a.agree(&b.public_only()).unwrap();
        let k2 = b.agree(&a.public_only()).unwrap();
        assert_eq!(*k1, *k2);
        assert!(b.public_only().agree(&a).is_none());
    }
}
