//! A path: one (local socket, remote endpoint) edge to a peer, with
//! liveness timestamps and a link-quality estimate.

use parking_lot::Mutex;

use crate::endpoint::{Endpoint, IpScope};
use crate::node::{Context, HostThread};

/// How often an otherwise-quiet path gets a keepalive, chosen to sit under
/// typical NAT UDP mapping lifetimes.
pub const PATH_HEARTBEAT_PERIOD: i64 = 14_000;

/// A path that has received nothing for this long is no longer preferred.
pub const PATH_ALIVE_TIMEOUT: i64 = 45_000;

/// A path silent past this is dead and eligible for reaping
/// (heartbeat period times four, plus slack).
pub const PATH_EXPIRATION: i64 = PATH_HEARTBEAT_PERIOD * 4 + 3_000;

/// Paths below this quality lose preference to fresher ones.
pub const LINK_QUALITY_THRESHOLD: u8 = 32;

#[derive(Debug)]
struct PathState {
    last_in: i64,
    last_out: i64,
    /// EWMA over receive cadence, 255 = perfect.
    quality: u8,
}

/// Liveness counters live behind a small lock so the Switch can hold an
/// `Arc<Path>` and stamp it without touching the owning Peer.
#[derive(Debug)]
pub struct Path {
    local_socket: i64,
    endpoint: Endpoint,
    /// 0 = cryptographic; nonzero = configured trusted network id on which
    /// armor may be bypassed.
    trusted_path_id: u64,
    state: Mutex<PathState>,
}

impl Path {
    pub fn new(local_socket: i64, endpoint: Endpoint, trusted_path_id: u64) -> Self {
        Self {
            local_socket,
            endpoint,
            trusted_path_id,
            state: Mutex::new(PathState { last_in: 0, last_out: 0, quality: 255 }),
        }
    }

    pub fn local_socket(&self) -> i64 {
        self.local_socket
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn scope(&self) -> IpScope {
        self.endpoint.scope()
    }

    pub fn trusted_path_id(&self) -> u64 {
        self.trusted_path_id
    }

    pub fn matches(&self, local_socket: i64, endpoint: Endpoint) -> bool {
        self.local_socket == local_socket && self.endpoint == endpoint
    }

    /// Record an authenticated inbound datagram. `last_in` is monotonic
    /// even if the host's clock wobbles between entry points.
    pub fn received(&self, now: i64) {
        let mut s = self.state.lock();
        let first = s.last_in == 0;
        let gap = now - s.last_in;
        s.last_in = s.last_in.max(now);

        // Cadence EWMA: on-time traffic pulls toward 255, gaps decay it in
        // proportion to how far past the heartbeat they stretched.
        let on_time = PATH_HEARTBEAT_PERIOD * 2;
        let instant: u8 = if !first && s.last_in == now && gap > on_time {
            ((on_time * 255) / gap).min(255) as u8
        } else {
            255
        };
        s.quality = ((s.quality as u32 + instant as u32) / 2) as u8;
    }

    pub fn sent(&self, now: i64) {
        let mut s = self.state.lock();
        s.last_out = s.last_out.max(now);
    }

    pub fn last_in(&self) -> i64 {
        self.state.lock().last_in
    }

    pub fn last_out(&self) -> i64 {
        self.state.lock().last_out
    }

    pub fn link_quality(&self) -> u8 {
        self.state.lock().quality
    }

    pub fn alive(&self, now: i64) -> bool {
        now - self.state.lock().last_in < PATH_ALIVE_TIMEOUT
    }

    pub fn expired(&self, now: i64) -> bool {
        let s = self.state.lock();
        now - s.last_in > PATH_EXPIRATION && now - s.last_out > PATH_EXPIRATION
    }

    pub fn needs_heartbeat(&self, now: i64) -> bool {
        let s = self.state.lock();
        now - s.last_out >= PATH_HEARTBEAT_PERIOD
    }

    /// Hand a datagram to the host over this path.
    pub fn send(&self, ctx: &Context, tptr: HostThread, data: &[u8], now: i64) -> bool {
        if ctx.host.wire_packet_send(tptr, self.local_socket, self.endpoint, data) {
            self.sent(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> Path {
        Path::new(1, Endpoint("198.51.100.7:9993".parse().unwrap()), 0)
    }

    #[test]
    fn test_liveness_windows() {
        let p = path();
        assert!(!p.alive(100_000));

        p.received(100_000);
        assert!(p.alive(100_000 + PATH_ALIVE_TIMEOUT - 1));
        assert!(!p.alive(100_000 + PATH_ALIVE_TIMEOUT));

        assert!(!p.expired(100_000 + PATH_EXPIRATION));
        assert!(p.expired(100_001 + PATH_EXPIRATION));
    }

    #[test]
    fn test_last_in_is_monotonic() {
        let p = path();
        p.received(5_000);
        p.received(3_000); // clock went backwards between entry points
        assert_eq!(p.last_in(), 5_000);
    }

    #[test]
    fn test_quality_decays_on_gaps() {
        let p = path();
        p.received(0);
        assert_eq!(p.link_quality(), 255);

        // Regular cadence keeps quality pinned.
        for t in 1..=5 {
            p.received(t * PATH_HEARTBEAT_PERIOD);
        }
        assert_eq!(p.link_quality(), 255);

        // A long outage drags it down.
        let mut t = 5 * PATH_HEARTBEAT_PERIOD;
        for _ in 0..8 {
            t += PATH_HEARTBEAT_PERIOD * 20;
            p.received(t);
        }
        assert!(p.link_quality() < LINK_QUALITY_THRESHOLD);
    }

    #[test]
    fn test_heartbeat_due() {
        let p = path();
        p.sent(1_000);
        assert!(!p.needs_heartbeat(1_000 + PATH_HEARTBEAT_PERIOD - 1));
        assert!(p.needs_heartbeat(1_000 + PATH_HEARTBEAT_PERIOD));
    }
}
