//! The peer and path database: address→peer map, planet and moons, the
//! trusted-path table, and upstream selection.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::identity::{Address, Identity};
use crate::node::{Context, HostThread, NodeHost, StateObjectKind};
use crate::peer::Peer;
use crate::world::{World, WorldType};

/// Idle (non-upstream) peers are evicted after this long without traffic.
pub const PEER_IDLE_PURGE: i64 = 600_000;

/// What a given address is to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leaf,
    Upstream,
    Planet,
    Moon,
}

/// A configured trusted physical network: packets to/from it may skip
/// armor, tagged with the trust id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedPath {
    pub network: IpAddr,
    pub prefix_bits: u8,
    pub trust_id: u64,
}

/// Best-effort persisted hint about a peer: who it was and where it was
/// last reachable. Checksummed; a corrupt record is ignored, never trusted.
#[derive(Serialize, Deserialize)]
struct PeerCacheRecord {
    identity: Vec<u8>,
    endpoints: Vec<Endpoint>,
}

struct Worlds {
    planet: World,
    moons: Vec<World>,
    /// Moons requested by id whose world has not arrived yet, with the
    /// seed address to ask.
    moon_seeds: Vec<(u64, Address)>,
    /// Flattened root addresses of planet + moons, excluding ourselves.
    upstreams: Vec<Address>,
    am_root: bool,
}

pub struct Topology {
    local_identity: Identity,
    local_address: Address,
    peers: Mutex<HashMap<Address, Arc<Peer>>>,
    worlds: RwLock<Worlds>,
    trusted_paths: RwLock<Vec<TrustedPath>>,
}

impl Topology {
    /// Load the planet (if the host has one stored) and seed the peer map
    /// with its roots (a World carries full identities, so roots are
    /// peers from the start and can be HELLOed without a WHOIS).
    pub fn new(host: &dyn NodeHost, tptr: HostThread, local_identity: &Identity) -> Self {
        let local_address = local_identity.address();
        let planet = host
            .state_get(tptr, StateObjectKind::Planet, [0, 0])
            .and_then(|blob| World::deserialize(&blob).ok().map(|(w, _)| w))
            .filter(|w| w.world_type == WorldType::Planet)
            .unwrap_or_else(|| World::nil(WorldType::Planet));
        if !planet.is_nil() {
            tracing::info!(id = planet.id, roots = planet.roots.len(), "loaded planet");
        }

        let mut worlds =
            Worlds { planet, moons: Vec::new(), moon_seeds: Vec::new(), upstreams: Vec::new(), am_root: false };
        Self::recompute_upstreams(&mut worlds, local_address);

        let topology = Self {
            local_identity: local_identity.clone(),
            local_address,
            peers: Mutex::new(HashMap::new()),
            worlds: RwLock::new(worlds),
            trusted_paths: RwLock::new(Vec::new()),
        };
        topology.ensure_root_peers();
        topology
    }

    /// Make sure every root named by our worlds exists as a Peer.
    fn ensure_root_peers(&self) {
        let root_identities: Vec<Identity> = {
            let worlds = self.worlds.read();
            let mut ids: Vec<Identity> = Vec::new();
            let mut collect = |world: &World| {
                for root in &world.roots {
                    if root.identity.address() != self.local_address
                        && !ids.contains(&root.identity)
                    {
                        ids.push(root.identity.clone());
                    }
                }
            };
            collect(&worlds.planet);
            for moon in &worlds.moons {
                collect(moon);
            }
            ids
        };
        for identity in root_identities {
            if self.get_peer_in_memory(identity.address()).is_none() {
                if let Ok(peer) = Peer::new(&self.local_identity, identity) {
                    self.add_peer(Arc::new(peer));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer map
    // ------------------------------------------------------------------

    /// Look up a peer, falling back to the host's persisted peer cache.
    /// Cache hits come back with no paths; they only save a WHOIS.
    pub fn get_peer(&self, ctx: &Context, tptr: HostThread, address: Address) -> Option<Arc<Peer>> {
        if let Some(p) = self.peers.lock().get(&address) {
            return Some(p.clone());
        }

        let blob =
            ctx.host.state_get(tptr, StateObjectKind::Peer, [address.to_u64(), 0])?;
        let record = decode_checksummed::<PeerCacheRecord>(&blob)?;
        let (identity, _) = Identity::read_from(&record.identity).ok()?;
        if identity.address() != address {
            return None;
        }
        let peer = Arc::new(Peer::new(&ctx.identity, identity).ok()?);
        tracing::debug!(%address, "revived peer from cache");
        Some(self.add_peer(peer))
    }

    /// Map-only lookup (no cache, no ctx).
    pub fn get_peer_in_memory(&self, address: Address) -> Option<Arc<Peer>> {
        self.peers.lock().get(&address).cloned()
    }

    /// Insert, deduplicating by address: an existing peer with the same
    /// identity wins; a different (validated upstream of here) identity
    /// replaces it.
    pub fn add_peer(&self, peer: Arc<Peer>) -> Arc<Peer> {
        let mut peers = self.peers.lock();
        match peers.get(&peer.address()) {
            Some(existing) if existing.identity() == peer.identity() => existing.clone(),
            _ => {
                peers.insert(peer.address(), peer.clone());
                peer
            }
        }
    }

    /// Snapshot-then-apply iteration: the lock is not held while `f` runs.
    pub fn each_peer<F: FnMut(&Arc<Peer>)>(&self, mut f: F) {
        let snapshot: Vec<Arc<Peer>> = self.peers.lock().values().cloned().collect();
        for peer in &snapshot {
            f(peer);
        }
    }

    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    // ------------------------------------------------------------------
    // Upstreams and roles
    // ------------------------------------------------------------------

    pub fn am_root(&self) -> bool {
        self.worlds.read().am_root
    }

    pub fn is_upstream(&self, address: Address) -> bool {
        self.worlds.read().upstreams.contains(&address)
    }

    pub fn role(&self, address: Address) -> Role {
        let worlds = self.worlds.read();
        if worlds.planet.roots.iter().any(|r| r.identity.address() == address) {
            return Role::Planet;
        }
        if worlds.moons.iter().any(|m| m.roots.iter().any(|r| r.identity.address() == address)) {
            return Role::Moon;
        }
        if worlds.upstreams.contains(&address) {
            return Role::Upstream;
        }
        Role::Leaf
    }

    /// Best upstream for relaying and WHOIS: prefer one with a live path,
    /// then lowest latency.
    pub fn get_upstream_peer(&self, now: i64) -> Option<Arc<Peer>> {
        let upstreams = self.worlds.read().upstreams.clone();
        let peers = self.peers.lock();
        let mut best: Option<&Arc<Peer>> = None;
        let mut best_rank = (false, u32::MAX);
        for addr in &upstreams {
            if let Some(p) = peers.get(addr) {
                let latency = p.latency();
                let rank = (p.has_active_path(now), if latency == 0 { u32::MAX - 1 } else { latency });
                let better = match best {
                    None => true,
                    Some(_) => rank.0 && !best_rank.0 || (rank.0 == best_rank.0 && rank.1 < best_rank.1),
                };
                if better {
                    best = Some(p);
                    best_rank = rank;
                }
            }
        }
        best.cloned()
    }

    /// Every upstream we should be talking to, with the stable endpoints
    /// to try if no path exists. Pending moon seeds appear with no
    /// endpoints (they are resolved via WHOIS).
    pub fn upstreams_to_contact(&self) -> Vec<(Address, Vec<Endpoint>)> {
        let worlds = self.worlds.read();
        let mut out: Vec<(Address, Vec<Endpoint>)> = Vec::new();
        let mut push = |addr: Address, eps: &[Endpoint]| {
            if addr != self.local_address && !out.iter().any(|(a, _)| *a == addr) {
                out.push((addr, eps.to_vec()));
            }
        };
        for root in &worlds.planet.roots {
            push(root.identity.address(), &root.stable_endpoints);
        }
        for moon in &worlds.moons {
            for root in &moon.roots {
                push(root.identity.address(), &root.stable_endpoints);
            }
        }
        for (_, seed) in &worlds.moon_seeds {
            push(*seed, &[]);
        }
        out
    }

    /// Root identities are pinned to their advertised endpoints: any other
    /// endpoint claiming to be that root is prohibited.
    pub fn is_prohibited_endpoint(&self, address: Address, endpoint: Endpoint) -> bool {
        let worlds = self.worlds.read();
        let mut known_root = false;
        let mut ip_listed = false;
        let mut check = |roots: &[crate::world::Root]| {
            for root in roots {
                if root.identity.address() == address {
                    known_root = true;
                    if root.stable_endpoints.iter().any(|ep| ep.ip() == endpoint.ip()) {
                        ip_listed = true;
                    }
                }
            }
        };
        check(&worlds.planet.roots);
        for moon in &worlds.moons {
            check(&moon.roots);
        }
        known_root && !ip_listed
    }

    // ------------------------------------------------------------------
    // Worlds
    // ------------------------------------------------------------------

    pub fn planet(&self) -> World {
        self.worlds.read().planet.clone()
    }

    pub fn planet_summary(&self) -> (u64, i64) {
        let worlds = self.worlds.read();
        (worlds.planet.id, worlds.planet.timestamp)
    }

    pub fn moons(&self) -> Vec<World> {
        self.worlds.read().moons.clone()
    }

    /// Offer a world seen on the wire (HELLO/OK world updates). Applies
    /// the replacement policy; persists and recomputes upstreams on
    /// acceptance. Returns whether it was accepted.
    pub fn accept_world_update(&self, ctx: &Context, tptr: HostThread, update: World) -> bool {
        let mut worlds = self.worlds.write();
        let accepted = match update.world_type {
            WorldType::Planet => {
                if worlds.planet.should_be_replaced_by(&update) {
                    worlds.planet = update.clone();
                    true
                } else {
                    false
                }
            }
            WorldType::Moon => {
                if let Some(moon) = worlds.moons.iter_mut().find(|m| m.id == update.id) {
                    if moon.should_be_replaced_by(&update) {
                        *moon = update.clone();
                        true
                    } else {
                        false
                    }
                } else if let Some(idx) =
                    worlds.moon_seeds.iter().position(|(id, _)| *id == update.id)
                {
                    // Trust-on-first-use for a moon we explicitly asked for:
                    // it must at least be self-consistent.
                    if World::nil(WorldType::Moon).should_be_replaced_by(&update)
                        && crate::crypto::verify_detached(
                            &update.updates_must_be_signed_by,
                            &update.serialize_for_signing(),
                            &update.signature,
                        )
                    {
                        worlds.moon_seeds.remove(idx);
                        worlds.moons.push(update.clone());
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            }
        };

        if accepted {
            Self::recompute_upstreams(&mut worlds, self.local_address);
            drop(worlds);
            self.ensure_root_peers();
            tracing::info!(id = update.id, ty = ?update.world_type, ts = update.timestamp, "world updated");
            let (kind, id) = match update.world_type {
                WorldType::Planet => (StateObjectKind::Planet, [0u64, 0u64]),
                WorldType::Moon => (StateObjectKind::Moon, [update.id, 0]),
            };
            ctx.host.state_put(tptr, kind, id, &update.serialize());
        }
        accepted
    }

    /// Begin orbiting a moon: restore it from storage if present,
    /// otherwise remember the seed so the background pass WHOISes it.
    pub fn add_moon(&self, ctx: &Context, tptr: HostThread, world_id: u64, seed: Address) {
        {
            let worlds = self.worlds.read();
            if worlds.moons.iter().any(|m| m.id == world_id)
                || worlds.moon_seeds.iter().any(|(id, _)| *id == world_id)
            {
                return;
            }
        }

        if let Some(blob) = ctx.host.state_get(tptr, StateObjectKind::Moon, [world_id, 0]) {
            if let Ok((world, _)) = World::deserialize(&blob) {
                if world.world_type == WorldType::Moon && world.id == world_id {
                    {
                        let mut worlds = self.worlds.write();
                        worlds.moons.push(world);
                        Self::recompute_upstreams(&mut worlds, self.local_address);
                    }
                    self.ensure_root_peers();
                    return;
                }
            }
        }

        if !seed.is_nil() {
            let mut worlds = self.worlds.write();
            worlds.moon_seeds.push((world_id, seed));
        }
    }

    pub fn remove_moon(&self, ctx: &Context, tptr: HostThread, world_id: u64) {
        let mut worlds = self.worlds.write();
        worlds.moons.retain(|m| m.id != world_id);
        worlds.moon_seeds.retain(|(id, _)| *id != world_id);
        Self::recompute_upstreams(&mut worlds, self.local_address);
        drop(worlds);
        ctx.host.state_delete(tptr, StateObjectKind::Moon, [world_id, 0]);
    }

    fn recompute_upstreams(worlds: &mut Worlds, local: Address) {
        let mut upstreams = Vec::new();
        let mut am_root = false;
        {
            let mut add_roots = |world: &World| {
                for root in &world.roots {
                    let addr = root.identity.address();
                    if addr == local {
                        am_root = true;
                    } else if !upstreams.contains(&addr) {
                        upstreams.push(addr);
                    }
                }
            };
            add_roots(&worlds.planet);
            for moon in &worlds.moons {
                add_roots(moon);
            }
        }
        worlds.upstreams = upstreams;
        worlds.am_root = am_root;
    }

    // ------------------------------------------------------------------
    // Trusted paths
    // ------------------------------------------------------------------

    pub fn set_trusted_paths(&self, paths: Vec<TrustedPath>) {
        *self.trusted_paths.write() = paths;
    }

    /// Trust id for an endpoint, 0 if none configured.
    pub fn get_outbound_path_trust(&self, endpoint: Endpoint) -> u64 {
        for tp in self.trusted_paths.read().iter() {
            if ip_in_prefix(endpoint.ip(), tp.network, tp.prefix_bits) {
                return tp.trust_id;
            }
        }
        0
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Evict idle leaf peers, prune dead paths, refresh the peer cache.
    pub fn do_periodic_tasks(&self, ctx: &Context, tptr: HostThread, now: i64) {
        let evicted: Vec<Arc<Peer>> = {
            let upstreams = self.worlds.read().upstreams.clone();
            let mut peers = self.peers.lock();
            let doomed: Vec<Address> = peers
                .iter()
                .filter(|(addr, p)| {
                    !upstreams.contains(addr) && now - p.last_receive() > PEER_IDLE_PURGE
                })
                .map(|(addr, _)| *addr)
                .collect();
            doomed.iter().filter_map(|a| peers.remove(a)).collect()
        };
        for peer in &evicted {
            tracing::debug!(peer = %peer.address(), "evicted idle peer");
        }

        self.each_peer(|peer| {
            peer.prune_expired_paths(now);
            if peer.is_alive(now) {
                let record = PeerCacheRecord {
                    identity: {
                        let mut buf = Vec::new();
                        peer.identity().append_to(&mut buf);
                        buf
                    },
                    endpoints: peer.paths_snapshot().iter().map(|p| p.endpoint()).collect(),
                };
                ctx.host.state_put(
                    tptr,
                    StateObjectKind::Peer,
                    [peer.address().to_u64(), 0],
                    &encode_checksummed(&record),
                );
            }
        });
    }
}

fn ip_in_prefix(ip: IpAddr, network: IpAddr, bits: u8) -> bool {
    fn match_bytes(a: &[u8], b: &[u8], bits: u8) -> bool {
        let full = (bits / 8) as usize;
        if a[..full] != b[..full] {
            return false;
        }
        let rem = bits % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        (a[full] & mask) == (b[full] & mask)
    }
    match (ip, network) {
        (IpAddr::V4(a), IpAddr::V4(n)) => match_bytes(&a.octets(), &n.octets(), bits.min(32)),
        (IpAddr::V6(a), IpAddr::V6(n)) => match_bytes(&a.octets(), &n.octets(), bits.min(128)),
        _ => false,
    }
}

/// Persisted blobs carry a leading CRC32 so a torn or corrupted write is
/// ignored instead of deserialized.
fn encode_checksummed<T: Serialize>(value: &T) -> Vec<u8> {
    let body = bincode::serialize(value).unwrap_or_default();
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

fn decode_checksummed<T: for<'de> Deserialize<'de>>(blob: &[u8]) -> Option<T> {
    if blob.len() < 4 {
        return None;
    }
    let stored = u32::from_le_bytes(blob[..4].try_into().unwrap());
    let body = &blob[4..];
    if crc32fast::hash(body) != stored {
        return None;
    }
    bincode::deserialize(body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksummed_blob_roundtrip() {
        let record = PeerCacheRecord {
            identity: vec![1, 2, 3],
            endpoints: vec![Endpoint("198.51.100.7:9993".parse().unwrap())],
        };
        let blob = encode_checksummed(&record);
        let parsed: PeerCacheRecord = decode_checksummed(&blob).unwrap();
        assert_eq!(parsed.identity, record.identity);
        assert_eq!(parsed.endpoints, record.endpoints);

        let mut corrupted = blob.clone();
        *corrupted.last_mut().unwrap() ^= 0xff;
        assert!(decode_checksummed::<PeerCacheRecord>(&corrupted).is_none());
        assert!(decode_checksummed::<PeerCacheRecord>(&[1, 2]).is_none());
    }

    #[test]
    fn test_ip_prefix_matching() {
        let net: IpAddr = "10.0.0.0".parse().unwrap();
        assert!(ip_in_prefix("10.0.3.4".parse().unwrap(), net, 8));
        assert!(!ip_in_prefix("11.0.3.4".parse().unwrap(), net, 8));
        assert!(ip_in_prefix("10.0.0.200".parse().unwrap(), net, 24));
        assert!(!ip_in_prefix("10.0.1.200".parse().unwrap(), net, 24));
        // Family mismatch never matches.
        assert!(!ip_in_prefix("::1".parse().unwrap(), net, 8));
        // Non-octet-aligned prefix.
        assert!(ip_in_prefix("10.0.0.129".parse().unwrap(), "10.0.0.128".parse().unwrap(), 25));
        assert!(!ip_in_prefix("10.0.0.1".parse().unwrap(), "10.0.0.128".parse().unwrap(), 25));
    }
}
