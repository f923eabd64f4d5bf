//! Everything known about one remote node: identity, the pairwise packet
//! key, its paths, latency, and version.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::endpoint::{AddressFamily, Endpoint, IpScope};
use crate::identity::{Address, Identity};
use crate::node::{Context, HostThread};
use crate::path::{Path, LINK_QUALITY_THRESHOLD};
use crate::wire::{self, CipherSuite, Packet, Verb};
use crate::{Error, Result};

/// A peer with no traffic for this long is unreachable.
pub const PEER_ACTIVITY_TIMEOUT: i64 = 60_000;

/// How often to HELLO a peer we want to keep direct contact with. Two
/// pings fit inside the activity window so one loss does not flap it.
pub const PEER_PING_PERIOD: i64 = 25_000;

/// Paths per peer; overflow evicts the longest-silent one.
pub const PEER_MAX_PATHS: usize = 8;

/// Minimum interval between PUSH_DIRECT_PATHS bursts to one peer.
pub const DIRECT_PATH_PUSH_INTERVAL: i64 = 120_000;

/// Keepalive body. Content is ignored by the receiver; it only refreshes
/// NAT mappings, so a single junk byte suffices.
const KEEPALIVE: [u8; 1] = [0x00];

/// Small token bucket used to bound per-peer protocol chatter.
#[derive(Debug)]
pub struct RateLimiter {
    tokens: f64,
    capacity: f64,
    per_second: f64,
    last: i64,
}

impl RateLimiter {
    pub fn new(capacity: f64, per_second: f64) -> Self {
        Self { tokens: capacity, capacity, per_second, last: 0 }
    }

    pub fn try_take(&mut self, now: i64) -> bool {
        let elapsed = (now - self.last).max(0) as f64 / 1000.0;
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.per_second).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct PeerInner {
    paths: Vec<Arc<Path>>,
    last_receive: i64,
    last_hello_sent: i64,
    /// EWMA round-trip in milliseconds; 0 = unknown.
    latency: u32,
    remote_version: Option<(u8, u8, u16)>,
    last_direct_path_push: i64,
    push_limiter: RateLimiter,
}

pub struct Peer {
    identity: Identity,
    key: Zeroizing<[u8; 32]>,
    counter: AtomicU64,
    inner: Mutex<PeerInner>,
}

impl Peer {
    /// Key agreement happens here; a remote key we cannot agree with is a
    /// peer we cannot have.
    pub fn new(local: &Identity, remote: Identity) -> Result<Self> {
        let key = local.agree(&remote).ok_or(Error::InvalidArgument("key agreement failed"))?;
        use rand::RngCore;
        Ok(Self {
            identity: remote.public_only(),
            key,
            counter: AtomicU64::new(rand::rngs::OsRng.next_u64()),
            inner: Mutex::new(PeerInner {
                paths: Vec::new(),
                last_receive: 0,
                last_hello_sent: 0,
                latency: 0,
                remote_version: None,
                last_direct_path_push: 0,
                push_limiter: RateLimiter::new(4.0, 1.0 / 30.0),
            }),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Monotonic outgoing packet id for this peer.
    pub fn next_packet_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Activity
    // ------------------------------------------------------------------

    pub fn note_receive(&self, now: i64) {
        let mut inner = self.inner.lock();
        inner.last_receive = inner.last_receive.max(now);
    }

    pub fn last_receive(&self) -> i64 {
        self.inner.lock().last_receive
    }

    /// Received traffic within the activity window?
    pub fn is_alive(&self, now: i64) -> bool {
        now - self.last_receive() < PEER_ACTIVITY_TIMEOUT
    }

    pub fn record_latency(&self, rtt_ms: i64) {
        let rtt = rtt_ms.clamp(1, 60_000) as u32;
        let mut inner = self.inner.lock();
        inner.latency = if inner.latency == 0 { rtt } else { (inner.latency * 3 + rtt) / 4 };
    }

    pub fn latency(&self) -> u32 {
        self.inner.lock().latency
    }

    pub fn set_remote_version(&self, major: u8, minor: u8, revision: u16) {
        self.inner.lock().remote_version = Some((major, minor, revision));
    }

    pub fn remote_version(&self) -> Option<(u8, u8, u16)> {
        self.inner.lock().remote_version
    }

    // ------------------------------------------------------------------
    // Path table
    // ------------------------------------------------------------------

    pub fn find_path(&self, local_socket: i64, endpoint: Endpoint) -> Option<Arc<Path>> {
        self.inner.lock().paths.iter().find(|p| p.matches(local_socket, endpoint)).cloned()
    }

    /// Adopt a path; on overflow the longest-silent path is evicted.
    pub fn learn_path(&self, path: Arc<Path>) {
        let mut inner = self.inner.lock();
        if inner.paths.iter().any(|p| p.matches(path.local_socket(), path.endpoint())) {
            return;
        }
        if inner.paths.len() >= PEER_MAX_PATHS {
            if let Some((idx, _)) = inner
                .paths
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.last_in())
            {
                inner.paths.remove(idx);
            }
        }
        tracing::debug!(peer = %self.identity.address(), endpoint = %path.endpoint(), "learned path");
        inner.paths.push(path);
    }

    /// Best path: most recently active among those above the quality
    /// threshold, falling back to any most-recently-active one.
    pub fn get_best_path(
        &self,
        now: i64,
        include_expired: bool,
        family: Option<AddressFamily>,
    ) -> Option<Arc<Path>> {
        let inner = self.inner.lock();
        let candidates = inner
            .paths
            .iter()
            .filter(|p| include_expired || !p.expired(now))
            .filter(|p| family.map_or(true, |f| p.endpoint().family() == f));

        let mut best: Option<&Arc<Path>> = None;
        let mut best_rank = (false, i64::MIN);
        for p in candidates {
            let rank = (p.link_quality() >= LINK_QUALITY_THRESHOLD, p.last_in());
            if best.is_none() || rank > best_rank {
                best = Some(p);
                best_rank = rank;
            }
        }
        best.cloned()
    }

    pub fn paths_snapshot(&self) -> Vec<Arc<Path>> {
        self.inner.lock().paths.clone()
    }

    pub fn has_active_path(&self, now: i64) -> bool {
        self.inner.lock().paths.iter().any(|p| p.alive(now))
    }

    /// Drop paths in a scope whose reflexive mapping just changed, so new
    /// HELLOs re-establish them. Returns how many were dropped.
    pub fn reset_paths_in_scope(&self, scope: IpScope) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.paths.len();
        inner.paths.retain(|p| p.scope() != scope);
        before - inner.paths.len()
    }

    pub fn prune_expired_paths(&self, now: i64) {
        self.inner.lock().paths.retain(|p| !p.expired(now));
    }

    // ------------------------------------------------------------------
    // Protocol sends
    // ------------------------------------------------------------------

    /// Build and send a HELLO to an explicit endpoint (which may not be a
    /// known path yet; that is the point of HELLO).
    pub fn send_hello(
        &self,
        ctx: &Context,
        tptr: HostThread,
        local_socket: i64,
        endpoint: Endpoint,
        now: i64,
    ) {
        let mut packet =
            Packet::new(self.address(), ctx.identity.address(), Verb::Hello, self.next_packet_id());
        packet.cipher = CipherSuite::AuthOnly;
        packet.payload = build_hello_payload(ctx, endpoint, now);

        if let Ok(wire_bytes) = packet.encode(&self.key) {
            if ctx.host.wire_packet_send(tptr, local_socket, endpoint, &wire_bytes) {
                let mut inner = self.inner.lock();
                inner.last_hello_sent = now;
                if let Some(p) =
                    inner.paths.iter().find(|p| p.matches(local_socket, endpoint)).cloned()
                {
                    drop(inner);
                    p.sent(now);
                }
            }
        }
    }

    /// Ping/keepalive pass for one address family (None = any). Returns
    /// true if a usable path in that family existed.
    pub fn do_ping_and_keepalive(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        family: Option<AddressFamily>,
    ) -> bool {
        let Some(path) = self.get_best_path(now, false, family) else {
            return false;
        };
        let hello_recently = now - self.inner.lock().last_hello_sent < 2_500;
        if now - path.last_in() >= PEER_PING_PERIOD && !hello_recently {
            self.send_hello(ctx, tptr, path.local_socket(), path.endpoint(), now);
        } else if path.needs_heartbeat(now) {
            path.send(ctx, tptr, &KEEPALIVE, now);
        }
        true
    }

    /// Advertise our direct interface addresses, rate-limited per peer.
    pub fn push_direct_paths(&self, ctx: &Context, tptr: HostThread, path: &Path, now: i64) {
        {
            let mut inner = self.inner.lock();
            if now - inner.last_direct_path_push < DIRECT_PATH_PUSH_INTERVAL
                || !inner.push_limiter.try_take(now)
            {
                return;
            }
            inner.last_direct_path_push = now;
        }

        let direct: Vec<Endpoint> = ctx.direct_paths.lock().clone();
        if direct.is_empty() {
            return;
        }

        let mut packet = Packet::new(
            self.address(),
            ctx.identity.address(),
            Verb::PushDirectPaths,
            self.next_packet_id(),
        );
        let mut payload = Vec::new();
        payload.extend_from_slice(&(direct.len() as u16).to_be_bytes());
        for ep in &direct {
            ep.append_to(&mut payload);
        }
        packet.payload = payload;

        if let Ok(wire_bytes) = packet.encode(&self.key) {
            path.send(ctx, tptr, &wire_bytes, now);
        }
    }
}

/// HELLO body: protocol + software version, timestamp for latency echo,
/// our full public identity, the endpoint we addressed (so the receiver
/// can tell us our reflexive address), and our planet's (id, timestamp).
pub fn build_hello_payload(ctx: &Context, dest_endpoint: Endpoint, now: i64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(96);
    payload.push(wire::PROTO_VERSION);
    payload.push(crate::VERSION_MAJOR);
    payload.push(crate::VERSION_MINOR);
    payload.extend_from_slice(&crate::VERSION_REVISION.to_be_bytes());
    payload.extend_from_slice(&now.to_be_bytes());
    ctx.identity.append_to(&mut payload);
    dest_endpoint.append_to(&mut payload);
    let (planet_id, planet_ts) = ctx.topology.planet_summary();
    payload.extend_from_slice(&planet_id.to_be_bytes());
    payload.extend_from_slice(&planet_ts.to_be_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PATH_EXPIRATION;

    fn two_peers() -> (Identity, Peer) {
        let local = Identity::generate();
        let remote = Identity::generate();
        let peer = Peer::new(&local, remote).unwrap();
        (local, peer)
    }

    fn ep(s: &str) -> Endpoint {
        Endpoint(s.parse().unwrap())
    }

    #[test]
    fn test_new_peer_requires_agreeable_key() {
        let (local, peer) = two_peers();
        assert!(!peer.is_alive(1));
        assert_ne!(peer.address(), local.address());
        // Public-only local identity cannot key a peer.
        let other = Identity::generate();
        assert!(Peer::new(&local.public_only(), other).is_err());
    }

    #[test]
    fn test_path_learning_dedupes_and_caps() {
        let (_, peer) = two_peers();
        for i in 0..(PEER_MAX_PATHS + 3) {
            let path = Arc::new(Path::new(1, ep(&format!("198.51.100.{}:9993", i + 1)), 0));
            path.received(i as i64 * 1000);
            peer.learn_path(path);
        }
        assert_eq!(peer.paths_snapshot().len(), PEER_MAX_PATHS);
        // The longest-silent (earliest) paths were the ones evicted.
        assert!(peer.find_path(1, ep("198.51.100.1:9993")).is_none());
        assert!(peer.find_path(1, ep("198.51.100.11:9993")).is_some());

        // Re-learning an existing path is a no-op.
        peer.learn_path(Arc::new(Path::new(1, ep("198.51.100.11:9993"), 0)));
        assert_eq!(peer.paths_snapshot().len(), PEER_MAX_PATHS);
    }

    #[test]
    fn test_best_path_prefers_recent_quality() {
        let (_, peer) = two_peers();
        let old = Arc::new(Path::new(1, ep("198.51.100.1:9993"), 0));
        old.received(10_000);
        let fresh = Arc::new(Path::new(1, ep("198.51.100.2:9993"), 0));
        fresh.received(30_000);
        peer.learn_path(old);
        peer.learn_path(fresh.clone());

        let best = peer.get_best_path(31_000, false, None).unwrap();
        assert_eq!(best.endpoint(), fresh.endpoint());
    }

    #[test]
    fn test_best_path_family_filter() {
        let (_, peer) = two_peers();
        let v4 = Arc::new(Path::new(1, ep("198.51.100.1:9993"), 0));
        v4.received(1_000);
        let v6 = Arc::new(Path::new(1, ep("[2001:db8::1]:9993"), 0));
        v6.received(2_000);
        peer.learn_path(v4);
        peer.learn_path(v6);

        let best_v4 = peer.get_best_path(3_000, false, Some(AddressFamily::V4)).unwrap();
        assert_eq!(best_v4.endpoint().family(), AddressFamily::V4);
        let best_v6 = peer.get_best_path(3_000, false, Some(AddressFamily::V6)).unwrap();
        assert_eq!(best_v6.endpoint().family(), AddressFamily::V6);
    }

    #[test]
    fn test_activity_window() {
        let (_, peer) = two_peers();
        peer.note_receive(100_000);
        assert!(peer.is_alive(100_000 + PEER_ACTIVITY_TIMEOUT - 1));
        assert!(!peer.is_alive(100_000 + PEER_ACTIVITY_TIMEOUT));
    }

    #[test]
    fn test_latency_ewma() {
        let (_, peer) = two_peers();
        peer.record_latency(100);
        assert_eq!(peer.latency(), 100);
        peer.record_latency(20);
        assert!(peer.latency() < 100 && peer.latency() >= 20);
    }

    #[test]
    fn test_scope_reset() {
        let (_, peer) = two_peers();
        let lan = Arc::new(Path::new(1, ep("192.168.0.10:9993"), 0));
        let wan = Arc::new(Path::new(1, ep("198.51.100.1:9993"), 0));
        peer.learn_path(lan);
        peer.learn_path(wan);
        assert_eq!(peer.reset_paths_in_scope(IpScope::Private), 1);
        assert_eq!(peer.paths_snapshot().len(), 1);
    }

    #[test]
    fn test_prune_expired() {
        let (_, peer) = two_peers();
        let p = Arc::new(Path::new(1, ep("198.51.100.1:9993"), 0));
        p.received(1_000);
        peer.learn_path(p);
        peer.prune_expired_paths(1_000 + PATH_EXPIRATION + 1);
        assert!(peer.paths_snapshot().is_empty());
    }

    #[test]
    fn test_rate_limiter() {
        let mut rl = RateLimiter::new(2.0, 1.0);
        assert!(rl.try_take(0));
        assert!(rl.try_take(0));
        assert!(!rl.try_take(0));
        // One second refills one token.
        assert!(rl.try_take(1_000));
        assert!(!rl.try_take(1_000));
    }

    #[test]
    fn test_packet_ids_monotonic() {
        let (_, peer) = two_peers();
        let a = peer.next_packet_id();
        let b = peer.next_packet_id();
        assert_eq!(b, a.wrapping_add(1));
    }
}
