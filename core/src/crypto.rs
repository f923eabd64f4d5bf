//! Cryptographic primitives shared by the packet engine and credentials.
//!
//! Long-term identity keys are Ed25519. Pairwise packet keys come from
//! X25519 ECDH between the static keys (both sides derive the same secret),
//! with Blake3 as the KDF. Packets are armored with the XChaCha20 stream
//! cipher and a Poly1305 one-time authenticator whose key is taken from the
//! first keystream block, truncated to 64 bits in the packet header.
//!
//! Detached signatures are 96 bytes: the Ed25519 signature followed by the
//! first 32 bytes of the Blake3 digest of the message. Verification checks
//! both, so a corrupted message is distinguishable from a forged signature.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use sha2::Digest;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

/// Length of a pairwise packet key.
pub const SHARED_KEY_LEN: usize = 32;

/// Length of a detached signature (Ed25519 + digest prefix).
pub const SIGNATURE_LEN: usize = 96;

/// Length of the truncated per-packet authenticator in the header.
pub const PACKET_MAC_LEN: usize = 8;

/// KDF context for deriving packet keys from ECDH shared secrets.
/// Changing this breaks compatibility with every deployed node.
const KDF_CONTEXT: &str = "weft v1 pairwise packet key";

/// Convert an Ed25519 signing key to an X25519 static secret for ECDH.
///
/// Ed25519 and X25519 share Curve25519, so the X25519 secret is derived
/// from the clamped SHA-512 hash of the Ed25519 seed, exactly how Ed25519
/// derives its own scalar internally.
fn ed25519_secret_to_x25519(signing_key: &SigningKey) -> StaticSecret {
    let mut hash = sha2::Sha512::digest(signing_key.to_bytes());
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(&hash[..32]);

    let secret = StaticSecret::from(secret_bytes);

    secret_bytes.zeroize();
    hash.as_mut_slice().zeroize();

    secret
}

/// Convert an Ed25519 verifying key to an X25519 public key via the
/// birational Edwards→Montgomery map. Fails for invalid curve points.
fn ed25519_public_to_x25519(public_key_bytes: &[u8; 32]) -> Option<X25519PublicKey> {
    let compressed = CompressedEdwardsY::from_slice(public_key_bytes).ok()?;
    let edwards_point = compressed.decompress()?;
    Some(X25519PublicKey::from(edwards_point.to_montgomery().to_bytes()))
}

/// Static-static key agreement: both peers derive the same 32-byte packet
/// key from their own secret and the other's public key.
pub fn key_agreement(
    local_secret: &SigningKey,
    remote_public: &[u8; 32],
) -> Option<Zeroizing<[u8; SHARED_KEY_LEN]>> {
    let remote_x25519 = ed25519_public_to_x25519(remote_public)?;
    let local_x25519 = ed25519_secret_to_x25519(local_secret);
    let shared = local_x25519.diffie_hellman(&remote_x25519);
    if !shared.was_contributory() {
        return None;
    }
    Some(Zeroizing::new(blake3::derive_key(KDF_CONTEXT, shared.as_bytes())))
}

/// Sign `data`, returning the 96-byte detached form.
pub fn sign_detached(signing_key: &SigningKey, data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let sig = signing_key.sign(data);
    let digest = blake3::hash(data);
    let mut out = [0u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&sig.to_bytes());
    out[64..].copy_from_slice(&digest.as_bytes()[..32]);
    out
}

/// Verify a 96-byte detached signature against a raw Ed25519 public key.
pub fn verify_detached(public_key_bytes: &[u8; 32], data: &[u8], signature: &[u8]) -> bool {
    if signature.len() != SIGNATURE_LEN {
        return false;
    }
    let digest = blake3::hash(data);
    if digest.as_bytes()[..32] != signature[64..] {
        return false;
    }
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key_bytes) else {
        return false;
    };
    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(&signature[..64]);
    let sig = Ed25519Signature::from_bytes(&sig_bytes);
    verifying_key.verify(data, &sig).is_ok()
}

/// Sign `data` with a bare 64-byte Ed25519 signature (the tagged
/// `(type=1, length=64)` form used by signed sub-payloads).
pub fn sign_raw(signing_key: &SigningKey, data: &[u8]) -> [u8; 64] {
    signing_key.sign(data).to_bytes()
}

/// Verify a bare 64-byte Ed25519 signature.
pub fn verify_raw(public_key_bytes: &[u8; 32], data: &[u8], signature: &[u8]) -> bool {
    if signature.len() != 64 {
        return false;
    }
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key_bytes) else {
        return false;
    };
    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(signature);
    verifying_key.verify(data, &Ed25519Signature::from_bytes(&sig_bytes)).is_ok()
}

/// One packet's worth of keystream state: an XChaCha20 cipher positioned
/// past the discard block, plus the Poly1305 one-time key taken from it.
pub struct PacketCipher {
    cipher: XChaCha20,
    mac_key: [u8; 32],
}

impl PacketCipher {
    /// Set up armoring for one packet.
    ///
    /// The nonce carries the packet id and addressing fields; the pairwise
    /// key is additionally mangled with the payload length so a truncated
    /// packet can never authenticate. The first 64-byte keystream block is
    /// discarded except for the Poly1305 key.
    pub fn new(shared_key: &[u8; SHARED_KEY_LEN], nonce: &[u8; 24], payload_len: usize) -> Self {
        let mut key = *shared_key;
        key[24] ^= payload_len as u8;
        key[25] ^= (payload_len >> 8) as u8;

        let mut cipher = XChaCha20::new(&key.into(), nonce.into());
        key.zeroize();

        let mut block = [0u8; 64];
        cipher.apply_keystream(&mut block);
        let mut mac_key = [0u8; 32];
        mac_key.copy_from_slice(&block[..32]);
        block.zeroize();

        Self { cipher, mac_key }
    }

    /// Encrypt or decrypt in place (XChaCha20 is an involution under the
    /// same keystream position).
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }

    /// Compute the truncated authenticator over `data`.
    pub fn mac(&self, data: &[u8]) -> [u8; PACKET_MAC_LEN] {
        let tag = Poly1305::new(&self.mac_key.into()).compute_unpadded(data);
        let mut out = [0u8; PACKET_MAC_LEN];
        out.copy_from_slice(&tag[..PACKET_MAC_LEN]);
        out
    }
}

impl Drop for PacketCipher {
    fn drop(&mut self) {
        self.mac_key.zeroize();
    }
}

/// Fast non-cryptographic PRNG (xorshift128+), seeded from the secure RNG.
/// Used for jitter, tie-breaks and update ids; never for key material.
pub struct Prng {
    state: [u64; 2],
}

impl Prng {
    pub fn new_seeded() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let s0 = u64::from_le_bytes(seed[..8].try_into().unwrap());
        let s1 = u64::from_le_bytes(seed[8..].try_into().unwrap());
        Self {
            // Both-zero state would be a fixed point.
            state: [s0 | 1, s1],
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state[0];
        let y = self.state[1];
        self.state[0] = y;
        x ^= x << 23;
        let z = x ^ y ^ (x >> 17) ^ (y >> 26);
        self.state[1] = z;
        z.wrapping_add(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn keypair() -> SigningKey {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let sk = SigningKey::from_bytes(&seed);
        seed.zeroize();
        sk
    }

    #[test]
    fn test_key_agreement_symmetric() {
        let a = keypair();
        let b = keypair();
        let ab = key_agreement(&a, b.verifying_key().as_bytes()).unwrap();
        let ba = key_agreement(&b, a.verifying_key().as_bytes()).unwrap();
        assert_eq!(*ab, *ba);

        let c = keypair();
        let ac = key_agreement(&a, c.verifying_key().as_bytes()).unwrap();
        assert_ne!(*ab, *ac);
    }

    #[test]
    fn test_detached_signature_roundtrip() {
        let sk = keypair();
        let pk = sk.verifying_key().to_bytes();
        let sig = sign_detached(&sk, b"frame of reference");

        assert!(verify_detached(&pk, b"frame of reference", &sig));
        assert!(!verify_detached(&pk, b"frame of difference", &sig));

        let mut bad = sig;
        bad[3] ^= 0x40;
        assert!(!verify_detached(&pk, b"frame of reference", &bad));

        // Digest half alone is not enough.
        let mut bad = sig;
        bad[70] ^= 0x01;
        assert!(!verify_detached(&pk, b"frame of reference", &bad));
    }

    #[test]
    fn test_packet_cipher_involution() {
        let key = [7u8; 32];
        let nonce = [9u8; 24];
        let mut data = b"twelve bytes".to_vec();

        let mut enc = PacketCipher::new(&key, &nonce, data.len());
        enc.apply_keystream(&mut data);
        assert_ne!(&data, b"twelve bytes");
        let mac1 = enc.mac(&data);

        let mut dec = PacketCipher::new(&key, &nonce, data.len());
        let mac2 = dec.mac(&data);
        dec.apply_keystream(&mut data);
        assert_eq!(&data, b"twelve bytes");
        assert_eq!(mac1, mac2);
    }

    #[test]
    fn test_packet_cipher_length_binding() {
        let key = [7u8; 32];
        let nonce = [9u8; 24];
        let a = PacketCipher::new(&key, &nonce, 100).mac(b"x");
        let b = PacketCipher::new(&key, &nonce, 101).mac(b"x");
        assert_ne!(a, b);
    }

    #[test]
    fn test_prng_advances() {
        let mut p = Prng::new_seeded();
        let a = p.next_u64();
        let b = p.next_u64();
        let c = p.next_u64();
        assert!(a != b || b != c);
    }
}
