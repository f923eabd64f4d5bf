//! Multicast group membership and delivery.
//!
//! Subscriptions are soft state: a member LIKEs a group and must refresh
//! within [`MULTICAST_LIKE_EXPIRE`] or fall out. Sending a multicast frame
//! unicasts a copy to up to the network's `multicast_limit` known
//! subscribers; when fewer are known, a GATHER goes to an upstream and the
//! frame waits briefly in a bounded per-group queue so late-gathered
//! subscribers still get it.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::identity::Address;
use crate::mac::Mac;
use crate::node::{Context, HostThread};
use crate::wire::{Packet, Verb, WireError};

/// How long a MULTICAST_LIKE subscription stays valid.
pub const MULTICAST_LIKE_EXPIRE: i64 = 600_000;

/// Minimum interval between explicit GATHERs for one group.
const GATHER_INTERVAL: i64 = 5_000;

/// How long a queued frame waits for gather results.
const PENDING_TTL: i64 = 5_000;

/// Bounded pending-frame queue per group; overflow drops oldest.
const PENDING_CAP: usize = 16;

/// Subscribers requested per GATHER.
const GATHER_LIMIT: u32 = 255;

/// A multicast destination: group MAC plus a 32-bit additional
/// discriminator (e.g. the IPv4 subnet for scoped ARP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MulticastGroup {
    pub mac: Mac,
    pub adi: u32,
}

impl MulticastGroup {
    pub const MARSHALED_LEN: usize = Mac::LENGTH + 4;

    pub fn new(mac: Mac, adi: u32) -> Self {
        Self { mac, adi }
    }

    pub fn append_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.mac.to_bytes());
        buf.extend_from_slice(&self.adi.to_be_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < Self::MARSHALED_LEN {
            return Err(WireError::BufferTooShort { need: Self::MARSHALED_LEN, got: buf.len() });
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&buf[..6]);
        let adi = u32::from_be_bytes(buf[6..10].try_into().unwrap());
        Ok((Self { mac: Mac::from_bytes(mac), adi }, Self::MARSHALED_LEN))
    }
}

struct PendingFrame {
    created: i64,
    src_mac: Mac,
    ethertype: u16,
    payload: Vec<u8>,
    already_sent: Vec<Address>,
}

#[derive(Default)]
struct GroupState {
    /// Subscriber → last LIKE time.
    subscribers: HashMap<Address, i64>,
    last_gather: i64,
    pending: VecDeque<PendingFrame>,
}

#[derive(Default)]
pub struct Multicaster {
    groups: Mutex<HashMap<(u64, MulticastGroup), GroupState>>,
}

impl Multicaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription (from MULTICAST_LIKE or a gather result) and
    /// deliver any queued frames the new subscriber has not seen.
    pub fn add(
        &self,
        ctx: &Context,
        tptr: HostThread,
        nwid: u64,
        group: MulticastGroup,
        member: Address,
        now: i64,
    ) {
        if member == ctx.identity.address() {
            return;
        }
        let flush: Vec<(Mac, u16, Vec<u8>)> = {
            let mut groups = self.groups.lock();
            let state = groups.entry((nwid, group)).or_default();
            state.subscribers.insert(member, now);

            state
                .pending
                .iter_mut()
                .filter(|p| now - p.created <= PENDING_TTL && !p.already_sent.contains(&member))
                .map(|p| {
                    p.already_sent.push(member);
                    (p.src_mac, p.ethertype, p.payload.clone())
                })
                .collect()
        };

        for (src_mac, ethertype, payload) in flush {
            self.send_copy(ctx, tptr, now, member, nwid, group, src_mac, ethertype, &payload);
        }
    }

    /// Valid (unexpired) subscriber count.
    pub fn subscriber_count(&self, nwid: u64, group: MulticastGroup, now: i64) -> usize {
        self.groups
            .lock()
            .get(&(nwid, group))
            .map(|s| s.subscribers.values().filter(|t| now - **t < MULTICAST_LIKE_EXPIRE).count())
            .unwrap_or(0)
    }

    /// Subscribers for an OK(GATHER) answer, capped.
    pub fn gather(&self, nwid: u64, group: MulticastGroup, limit: usize, now: i64) -> Vec<Address> {
        self.groups
            .lock()
            .get(&(nwid, group))
            .map(|s| {
                s.subscribers
                    .iter()
                    .filter(|(_, t)| now - **t < MULTICAST_LIKE_EXPIRE)
                    .map(|(a, _)| *a)
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Send a multicast frame: unicast up to `limit` copies, gathering
    /// more subscribers from an upstream when we know too few.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        nwid: u64,
        group: MulticastGroup,
        limit: u32,
        src_mac: Mac,
        ethertype: u16,
        payload: &[u8],
    ) {
        let limit = limit.max(1) as usize;
        let (recipients, should_gather) = {
            let mut groups = self.groups.lock();
            let state = groups.entry((nwid, group)).or_default();

            let valid: Vec<Address> = state
                .subscribers
                .iter()
                .filter(|(_, t)| now - **t < MULTICAST_LIKE_EXPIRE)
                .map(|(a, _)| *a)
                .collect();

            let recipients = select_recipients(&valid, limit, ctx.next_prng());

            let short = valid.len() < limit;
            let gather_due = short && now - state.last_gather >= GATHER_INTERVAL;
            if gather_due {
                state.last_gather = now;
            }
            if short {
                if state.pending.len() >= PENDING_CAP {
                    state.pending.pop_front();
                }
                state.pending.push_back(PendingFrame {
                    created: now,
                    src_mac,
                    ethertype,
                    payload: payload.to_vec(),
                    already_sent: recipients.clone(),
                });
            }
            (recipients, gather_due)
        };

        for member in &recipients {
            self.send_copy(ctx, tptr, now, *member, nwid, group, src_mac, ethertype, payload);
        }

        if should_gather {
            self.send_gather(ctx, tptr, now, nwid, group);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send_copy(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        member: Address,
        nwid: u64,
        group: MulticastGroup,
        src_mac: Mac,
        ethertype: u16,
        payload: &[u8],
    ) {
        let mut packet = Packet::new(member, ctx.identity.address(), Verb::MulticastFrame, 0);
        let mut body = Vec::with_capacity(26 + payload.len());
        body.extend_from_slice(&nwid.to_be_bytes());
        body.extend_from_slice(&src_mac.to_bytes());
        group.append_to(&mut body);
        body.extend_from_slice(&ethertype.to_be_bytes());
        body.extend_from_slice(payload);
        packet.payload = body;
        packet.compress_payload();
        ctx.switch.send(ctx, tptr, now, packet, true);
    }

    fn send_gather(&self, ctx: &Context, tptr: HostThread, now: i64, nwid: u64, group: MulticastGroup) {
        let Some(upstream) = ctx.topology.get_upstream_peer(now) else {
            return;
        };
        let mut packet =
            Packet::new(upstream.address(), ctx.identity.address(), Verb::MulticastGather, 0);
        let mut body = Vec::with_capacity(22);
        body.extend_from_slice(&nwid.to_be_bytes());
        group.append_to(&mut body);
        body.extend_from_slice(&GATHER_LIMIT.to_be_bytes());
        packet.payload = body;
        ctx.switch.send(ctx, tptr, now, packet, true);
        tracing::debug!(nwid = format_args!("{:016x}", nwid), mac = %group.mac, "multicast gather");
    }

    /// Expire subscriptions, stale pending frames, and empty groups.
    pub fn clean(&self, now: i64) {
        let mut groups = self.groups.lock();
        groups.retain(|_, state| {
            state.subscribers.retain(|_, t| now - *t < MULTICAST_LIKE_EXPIRE);
            state.pending.retain(|p| now - p.created <= PENDING_TTL);
            !state.subscribers.is_empty() || !state.pending.is_empty()
        });
    }

    #[cfg(test)]
    pub(crate) fn raw_add(&self, nwid: u64, group: MulticastGroup, member: Address, now: i64) {
        self.groups
            .lock()
            .entry((nwid, group))
            .or_default()
            .subscribers
            .insert(member, now);
    }
}

/// Pick up to `limit` recipients, rotating the starting point by `seed` so
/// a capped send does not starve the same tail of subscribers every time.
fn select_recipients(valid: &[Address], limit: usize, seed: u64) -> Vec<Address> {
    if valid.is_empty() {
        return Vec::new();
    }
    let start = (seed as usize) % valid.len();
    (0..valid.len().min(limit)).map(|i| valid[(start + i) % valid.len()]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bcast() -> MulticastGroup {
        MulticastGroup::new(Mac::from_u64(0xffff_ffff_ffff), 0)
    }

    #[test]
    fn test_group_wire_roundtrip() {
        let g = MulticastGroup::new(Mac::from_u64(0x0133_00aa_bb01), 0x0a000000);
        let mut buf = Vec::new();
        g.append_to(&mut buf);
        let (parsed, used) = MulticastGroup::read_from(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(parsed, g);
    }

    #[test]
    fn test_subscriptions_expire() {
        let mc = Multicaster::new();
        mc.raw_add(1, bcast(), Address::from_u64(0xa), 0);
        mc.raw_add(1, bcast(), Address::from_u64(0xb), 400_000);

        assert_eq!(mc.subscriber_count(1, bcast(), 500_000), 2);
        assert_eq!(mc.subscriber_count(1, bcast(), MULTICAST_LIKE_EXPIRE), 1);

        mc.clean(400_000 + MULTICAST_LIKE_EXPIRE);
        assert_eq!(mc.subscriber_count(1, bcast(), 400_000 + MULTICAST_LIKE_EXPIRE), 0);
    }

    #[test]
    fn test_recipient_selection_caps_and_rotates() {
        let valid: Vec<Address> = (0..50u64).map(|i| Address::from_u64(0x100 + i)).collect();

        let picked = select_recipients(&valid, 32, 9);
        assert_eq!(picked.len(), 32);
        let unique: std::collections::HashSet<_> = picked.iter().collect();
        assert_eq!(unique.len(), 32, "no duplicate recipients");

        // Fewer subscribers than the limit: everyone gets a copy.
        assert_eq!(select_recipients(&valid[..5], 32, 9).len(), 5);
        assert!(select_recipients(&[], 32, 9).is_empty());

        // Different seeds shift the window.
        assert_ne!(select_recipients(&valid, 32, 0)[0], select_recipients(&valid, 32, 7)[0]);
    }

    #[test]
    fn test_gather_respects_limit() {
        let mc = Multicaster::new();
        for i in 0..50u64 {
            mc.raw_add(1, bcast(), Address::from_u64(0x100 + i), 1_000);
        }
        assert_eq!(mc.gather(1, bcast(), 32, 2_000).len(), 32);
        assert_eq!(mc.gather(1, bcast(), 255, 2_000).len(), 50);
        assert!(mc.gather(2, bcast(), 255, 2_000).is_empty());
    }
}
