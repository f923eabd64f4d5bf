//! Worlds: signed, versioned rosters of root nodes.
//!
//! The **planet** is the primary world every node carries; **moons** are
//! user-added supplemental worlds. A world names its roots (identity plus
//! stable endpoints) and the key that must sign any replacement. A newer
//! world of the same id replaces the current one iff its timestamp is
//! strictly newer and its body verifies against the *current* world's
//! update key, so control of a world can be rotated but never stolen.

use ed25519_dalek::SigningKey;

use crate::crypto::{self, SIGNATURE_LEN};
use crate::endpoint::Endpoint;
use crate::identity::Identity;
use crate::wire::WireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorldType {
    Planet = 0x01,
    Moon = 0x7f,
}

impl WorldType {
    fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0x01 => Ok(Self::Planet),
            0x7f => Ok(Self::Moon),
            _ => Err(WireError::InvalidData("world type")),
        }
    }
}

/// One root: who it is and where it can always be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    pub identity: Identity,
    pub stable_endpoints: Vec<Endpoint>,
}

const MAX_ROOTS: usize = 4;
const MAX_STABLE_ENDPOINTS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct World {
    pub world_type: WorldType,
    pub id: u64,
    pub timestamp: i64,
    /// Key any replacement world's body must verify against.
    pub updates_must_be_signed_by: [u8; 32],
    pub signature: [u8; SIGNATURE_LEN],
    pub roots: Vec<Root>,
}

impl World {
    /// An unpopulated planet slot (id 0 never verifies and is replaced by
    /// anything signed).
    pub fn nil(world_type: WorldType) -> Self {
        Self {
            world_type,
            id: 0,
            timestamp: 0,
            updates_must_be_signed_by: [0u8; 32],
            signature: [0u8; SIGNATURE_LEN],
            roots: Vec::new(),
        }
    }

    pub fn is_nil(&self) -> bool {
        self.id == 0
    }

    /// Build and sign a world. `update_key` both signs this revision and
    /// becomes the key replacements must chain to (rotate by passing the
    /// next key's public half via `next_update_public`).
    pub fn create(
        world_type: WorldType,
        id: u64,
        timestamp: i64,
        roots: Vec<Root>,
        update_key: &SigningKey,
        next_update_public: Option<[u8; 32]>,
    ) -> Self {
        let mut w = Self {
            world_type,
            id,
            timestamp,
            updates_must_be_signed_by: next_update_public
                .unwrap_or_else(|| update_key.verifying_key().to_bytes()),
            signature: [0u8; SIGNATURE_LEN],
            roots,
        };
        w.signature = crypto::sign_detached(update_key, &w.serialize_for_signing());
        w
    }

    /// Replacement policy: same type and id, strictly newer, and signed by
    /// the key the current world designated.
    pub fn should_be_replaced_by(&self, update: &World) -> bool {
        if self.is_nil() {
            return update.world_type == self.world_type && !update.is_nil();
        }
        update.world_type == self.world_type
            && update.id == self.id
            && update.timestamp > self.timestamp
            && crypto::verify_detached(
                &self.updates_must_be_signed_by,
                &update.serialize_for_signing(),
                &update.signature,
            )
    }

    fn serialize_inner(&self, for_signing: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.world_type as u8);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.updates_must_be_signed_by);
        if !for_signing {
            buf.extend_from_slice(&self.signature);
        }
        buf.push(self.roots.len() as u8);
        for root in &self.roots {
            root.identity.append_to(&mut buf);
            buf.push(root.stable_endpoints.len() as u8);
            for ep in &root.stable_endpoints {
                ep.append_to(&mut buf);
            }
        }
        buf
    }

    pub fn serialize_for_signing(&self) -> Vec<u8> {
        self.serialize_inner(true)
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_inner(false)
    }

    /// Parse a serialized world; returns bytes consumed.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let need = 1 + 8 + 8 + 32 + SIGNATURE_LEN + 1;
        if buf.len() < need {
            return Err(WireError::BufferTooShort { need, got: buf.len() });
        }
        let world_type = WorldType::from_u8(buf[0])?;
        let id = u64::from_be_bytes(buf[1..9].try_into().unwrap());
        let timestamp = i64::from_be_bytes(buf[9..17].try_into().unwrap());
        let mut updates_must_be_signed_by = [0u8; 32];
        updates_must_be_signed_by.copy_from_slice(&buf[17..49]);
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&buf[49..49 + SIGNATURE_LEN]);

        let mut p = 49 + SIGNATURE_LEN;
        let root_count = buf[p] as usize;
        p += 1;
        if root_count > MAX_ROOTS {
            return Err(WireError::InvalidData("too many roots"));
        }

        let mut roots = Vec::with_capacity(root_count);
        for _ in 0..root_count {
            let (identity, used) = Identity::read_from(&buf[p..])?;
            p += used;
            let ep_count =
                *buf.get(p).ok_or(WireError::BufferTooShort { need: p + 1, got: buf.len() })?
                    as usize;
            p += 1;
            if ep_count > MAX_STABLE_ENDPOINTS {
                return Err(WireError::InvalidData("too many stable endpoints"));
            }
            let mut stable_endpoints = Vec::with_capacity(ep_count);
            for _ in 0..ep_count {
                let (ep, used) = Endpoint::read_from(&buf[p..])?;
                p += used;
                stable_endpoints
                    .push(ep.ok_or(WireError::InvalidData("nil root endpoint"))?);
            }
            roots.push(Root { identity, stable_endpoints });
        }

        Ok((Self { world_type, id, timestamp, updates_must_be_signed_by, signature, roots }, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn signing_key() -> SigningKey {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        SigningKey::from_bytes(&seed)
    }

    fn sample_world(key: &SigningKey, timestamp: i64) -> World {
        let root = Root {
            identity: Identity::generate().public_only(),
            stable_endpoints: vec![
                Endpoint("198.51.100.7:9993".parse().unwrap()),
                Endpoint("[2001:db8::7]:9993".parse().unwrap()),
            ],
        };
        World::create(WorldType::Planet, 0x77, timestamp, vec![root], key, None)
    }

    #[test]
    fn test_serialize_roundtrip() {
        let key = signing_key();
        let w = sample_world(&key, 1000);
        let bytes = w.serialize();
        let (parsed, used) = World::deserialize(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(parsed, w);
    }

    #[test]
    fn test_replacement_policy() {
        let key = signing_key();
        let current = sample_world(&key, 1000);

        let newer = sample_world(&key, 2000);
        assert!(current.should_be_replaced_by(&newer));

        let older = sample_world(&key, 500);
        assert!(!current.should_be_replaced_by(&older));

        let same_ts = sample_world(&key, 1000);
        assert!(!current.should_be_replaced_by(&same_ts));

        let wrong_key = sample_world(&signing_key(), 2000);
        assert!(!current.should_be_replaced_by(&wrong_key));

        let mut wrong_id = sample_world(&key, 2000);
        wrong_id.id = 0x78;
        assert!(!current.should_be_replaced_by(&wrong_id));
    }

    #[test]
    fn test_key_rotation() {
        let key_a = signing_key();
        let key_b = signing_key();

        let root = Root { identity: Identity::generate().public_only(), stable_endpoints: vec![] };
        // Revision 1 signed by A, designating B for future updates.
        let rev1 = World::create(
            WorldType::Planet,
            0x77,
            1000,
            vec![root.clone()],
            &key_a,
            Some(key_b.verifying_key().to_bytes()),
        );
        // Revision 2 must now be signed by B, not A.
        let rev2_by_b = World::create(WorldType::Planet, 0x77, 2000, vec![root.clone()], &key_b, None);
        let rev2_by_a = World::create(WorldType::Planet, 0x77, 2000, vec![root], &key_a, None);

        assert!(rev1.should_be_replaced_by(&rev2_by_b));
        assert!(!rev1.should_be_replaced_by(&rev2_by_a));
    }

    #[test]
    fn test_nil_world_accepts_first_arrival() {
        let key = signing_key();
        let planet = sample_world(&key, 1000);
        assert!(World::nil(WorldType::Planet).should_be_replaced_by(&planet));
        assert!(!World::nil(WorldType::Planet).should_be_replaced_by(&World::nil(WorldType::Planet)));
    }
}
