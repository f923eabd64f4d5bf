//! The packet engine: inbound decrypt/dispatch, outbound encrypt/fragment,
//! WHOIS resolution, relaying, and rendezvous introductions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::identity::{Address, Identity};
use crate::mac::Mac;
use crate::multicaster::MulticastGroup;
use crate::node::{Context, Event, HostThread};
use crate::path::Path;
use crate::peer::Peer;
use crate::trace::DropReason;
use crate::wire::{
    self, fragment, CipherSuite, ErrorCode, Fragment, Packet, Preamble, Verb,
    UDP_DEFAULT_PAYLOAD_MTU,
};
use crate::world::World;

/// WHOIS retry cadence and budget; a target still unresolved after the
/// last retry is abandoned along with anything queued behind it.
pub const WHOIS_RETRY_INTERVAL: i64 = 500;
pub const WHOIS_RETRY_COUNT: u32 = 4;

/// Distinct addresses with WHOIS in flight at once.
pub const WHOIS_MAX_OUTSTANDING: usize = 64;

/// Packets parked while WHOIS resolves, receive and transmit side.
const RX_QUEUE_CAP: usize = 32;
const TX_QUEUE_CAP: usize = 32;

/// Partial fragment assemblies older than this are dropped.
pub const FRAGMENT_TTL: i64 = 5_000;

/// Minimum interval between rendezvous introductions for one pair.
const UNITE_INTERVAL: i64 = 30_000;

struct WhoisRequest {
    last_sent: i64,
    retries: u32,
}

struct RxQueueEntry {
    arrived: i64,
    local_socket: i64,
    remote: Endpoint,
    source: Address,
    raw: Vec<u8>,
}

struct TxQueueEntry {
    created: i64,
    packet: Packet,
    encrypt: bool,
}

#[derive(Default)]
pub struct Switch {
    whois: Mutex<HashMap<Address, WhoisRequest>>,
    rx_queue: Mutex<VecDeque<RxQueueEntry>>,
    tx_queue: Mutex<VecDeque<TxQueueEntry>>,
    defrag: Mutex<HashMap<u64, fragment::FragmentAssembly>>,
    last_unite: Mutex<HashMap<(Address, Address), i64>>,
}

impl Switch {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================================================================
    // Inbound
    // ==================================================================

    /// Entry point for every datagram the host receives.
    pub fn on_remote_packet(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        local_socket: i64,
        remote: Endpoint,
        data: &[u8],
    ) {
        // Keepalives and runts carry no protocol content.
        if data.len() < fragment::FRAGMENT_HEADER_LEN {
            return;
        }

        if fragment::is_fragment(data) {
            self.handle_inbound_fragment(ctx, tptr, now, local_socket, remote, data);
            return;
        }

        let Ok(preamble) = Preamble::parse(data) else {
            ctx.trace.incoming_packet_dropped(Address::default(), Some(remote), DropReason::Malformed);
            return;
        };

        if preamble.dest != ctx.identity.address() {
            self.relay(ctx, tptr, now, preamble, data);
            return;
        }

        if preamble.fragmented {
            let complete = {
                let mut defrag = self.defrag.lock();
                let asm = defrag
                    .entry(preamble.id)
                    .or_insert_with(|| fragment::FragmentAssembly::new(now));
                asm.add_head(data.to_vec());
                let done = asm.try_complete();
                if done.is_some() {
                    defrag.remove(&preamble.id);
                }
                done
            };
            if let Some(whole) = complete {
                self.handle_packet(ctx, tptr, now, local_socket, remote, &whole);
            }
            return;
        }

        self.handle_packet(ctx, tptr, now, local_socket, remote, data);
    }

    fn handle_inbound_fragment(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        local_socket: i64,
        remote: Endpoint,
        data: &[u8],
    ) {
        let Ok(frag) = Fragment::parse(data) else {
            ctx.trace.incoming_packet_dropped(Address::default(), Some(remote), DropReason::Malformed);
            return;
        };

        if frag.dest != ctx.identity.address() {
            // Continuations relay exactly like head packets, hop-limited.
            if ctx.topology.am_root() {
                let mut forward = data.to_vec();
                let hops = forward[15] & 0x07;
                if hops < 0x07 {
                    forward[15] = hops + 1;
                    if let Some(path) = self.relay_path_for(ctx, tptr, now, frag.dest) {
                        path.send(ctx, tptr, &forward, now);
                    }
                }
            } else {
                ctx.trace.incoming_packet_dropped(Address::default(), Some(remote), DropReason::Unroutable);
            }
            return;
        }

        let packet_id = frag.packet_id;
        let complete = {
            let mut defrag = self.defrag.lock();
            let asm = defrag
                .entry(packet_id)
                .or_insert_with(|| fragment::FragmentAssembly::new(now));
            if asm.add_fragment(frag).is_err() {
                ctx.trace.incoming_packet_dropped(Address::default(), Some(remote), DropReason::Malformed);
                return;
            }
            let done = asm.try_complete();
            if done.is_some() {
                defrag.remove(&packet_id);
            }
            done
        };
        if let Some(whole) = complete {
            self.handle_packet(ctx, tptr, now, local_socket, remote, &whole);
        }
    }

    /// Forward a packet not addressed to us; only roots relay. When both
    /// parties are our direct peers, also try to introduce them.
    fn relay(&self, ctx: &Context, tptr: HostThread, now: i64, preamble: Preamble, data: &[u8]) {
        if !ctx.topology.am_root() {
            ctx.trace.incoming_packet_dropped(preamble.source, None, DropReason::Unroutable);
            return;
        }
        let mut forward = data.to_vec();
        if !Preamble::increment_hops(&mut forward) {
            ctx.trace.incoming_packet_dropped(preamble.source, None, DropReason::Unroutable);
            return;
        }
        if let Some(path) = self.relay_path_for(ctx, tptr, now, preamble.dest) {
            path.send(ctx, tptr, &forward, now);
            self.unite(ctx, tptr, now, preamble.source, preamble.dest);
        } else {
            ctx.trace.incoming_packet_dropped(preamble.source, None, DropReason::Unroutable);
        }
    }

    fn relay_path_for(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        dest: Address,
    ) -> Option<Arc<Path>> {
        if let Some(peer) = ctx.topology.get_peer(ctx, tptr, dest) {
            if let Some(path) = peer.get_best_path(now, false, None) {
                return Some(path);
            }
        }
        ctx.topology
            .get_upstream_peer(now)
            .filter(|up| up.address() != dest)
            .and_then(|up| up.get_best_path(now, false, None))
    }

    /// NAT hole punch: tell each side the other's observed endpoint.
    fn unite(&self, ctx: &Context, tptr: HostThread, now: i64, a: Address, b: Address) {
        if a == b {
            return;
        }
        let key = if a < b { (a, b) } else { (b, a) };
        {
            let mut unite = self.last_unite.lock();
            match unite.get(&key) {
                Some(last) if now - *last < UNITE_INTERVAL => return,
                _ => {
                    unite.insert(key, now);
                }
            }
        }

        let (Some(peer_a), Some(peer_b)) =
            (ctx.topology.get_peer_in_memory(a), ctx.topology.get_peer_in_memory(b))
        else {
            return;
        };
        let (Some(path_a), Some(path_b)) =
            (peer_a.get_best_path(now, false, None), peer_b.get_best_path(now, false, None))
        else {
            return;
        };

        tracing::debug!(%a, %b, "rendezvous introduction");
        for (to, other_addr, other_ep) in [
            (&peer_a, b, path_b.endpoint()),
            (&peer_b, a, path_a.endpoint()),
        ] {
            let mut packet =
                Packet::new(to.address(), ctx.identity.address(), Verb::Rendezvous, 0);
            let mut body = Vec::with_capacity(25);
            body.push(0u8); // flags
            other_addr.append_to(&mut body);
            other_ep.append_to(&mut body);
            packet.payload = body;
            self.send(ctx, tptr, now, packet, true);
        }
    }

    /// Authenticate and dispatch one whole (reassembled) packet addressed
    /// to us.
    fn handle_packet(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        local_socket: i64,
        remote: Endpoint,
        data: &[u8],
    ) {
        let Ok(preamble) = Preamble::parse(data) else {
            ctx.trace.incoming_packet_dropped(Address::default(), Some(remote), DropReason::Malformed);
            return;
        };
        let source = preamble.source;
        if source == ctx.identity.address() {
            // Traffic claiming to be us: almost always spoofed, but a
            // HELLO gets a look so a real address collision can surface.
            if let Ok(hello) = Packet::decode_unauthenticated(data) {
                if hello.verb == Verb::Hello {
                    self.handle_hello(ctx, tptr, now, local_socket, remote, data);
                    return;
                }
            }
            ctx.trace.incoming_packet_dropped(source, Some(remote), DropReason::InvalidIdentity);
            return;
        }

        let peer = ctx.topology.get_peer(ctx, tptr, source);

        if preamble.cipher == CipherSuite::TrustedPath {
            let trust_id = ctx.topology.get_outbound_path_trust(remote);
            if trust_id == 0 {
                ctx.trace.incoming_packet_dropped(source, Some(remote), DropReason::MacFailed);
                return;
            }
            let Some(peer) = peer else {
                self.enqueue_rx(ctx, tptr, now, local_socket, remote, source, data);
                return;
            };
            match Packet::decode_trusted(data, trust_id) {
                Ok(packet) => self.accept_packet(ctx, tptr, now, local_socket, remote, &peer, packet),
                Err(_) => {
                    ctx.trace.incoming_packet_dropped(source, Some(remote), DropReason::MacFailed)
                }
            }
            return;
        }

        match peer {
            Some(peer) => match Packet::decode(data, peer.key()) {
                Ok(packet) => {
                    self.accept_packet(ctx, tptr, now, local_socket, remote, &peer, packet)
                }
                Err(wire::WireError::MacFailed) => {
                    // A peer that regenerated its identity fails the old
                    // key; its HELLO carries the new identity in clear.
                    if let Ok(hello) = Packet::decode_unauthenticated(data) {
                        if hello.verb == Verb::Hello {
                            self.handle_hello(ctx, tptr, now, local_socket, remote, data);
                            return;
                        }
                    }
                    ctx.trace.incoming_packet_dropped(source, Some(remote), DropReason::MacFailed);
                }
                Err(_) => {
                    ctx.trace.incoming_packet_dropped(source, Some(remote), DropReason::Malformed)
                }
            },
            None => {
                if let Ok(hello) = Packet::decode_unauthenticated(data) {
                    if hello.verb == Verb::Hello {
                        self.handle_hello(ctx, tptr, now, local_socket, remote, data);
                        return;
                    }
                }
                self.enqueue_rx(ctx, tptr, now, local_socket, remote, source, data);
            }
        }
    }

    fn enqueue_rx(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        local_socket: i64,
        remote: Endpoint,
        source: Address,
        data: &[u8],
    ) {
        {
            let mut rx = self.rx_queue.lock();
            if rx.len() >= RX_QUEUE_CAP {
                rx.pop_front();
                ctx.trace.incoming_packet_dropped(source, Some(remote), DropReason::QueueOverflow);
            }
            rx.push_back(RxQueueEntry {
                arrived: now,
                local_socket,
                remote,
                source,
                raw: data.to_vec(),
            });
        }
        self.request_whois(ctx, tptr, now, source);
    }

    /// Post-authentication path learning and verb dispatch.
    fn accept_packet(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        local_socket: i64,
        remote: Endpoint,
        peer: &Arc<Peer>,
        packet: Packet,
    ) {
        let path = self.resolve_path(ctx, tptr, now, local_socket, remote, peer, packet.hops);
        path.received(now);
        peer.note_receive(now);
        self.dispatch(ctx, tptr, now, peer, &path, packet);
    }

    fn resolve_path(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        local_socket: i64,
        remote: Endpoint,
        peer: &Arc<Peer>,
        hops: u8,
    ) -> Arc<Path> {
        if let Some(path) = peer.find_path(local_socket, remote) {
            return path;
        }
        let trust = ctx.topology.get_outbound_path_trust(remote);
        let path = Arc::new(Path::new(local_socket, remote, trust));
        // Only direct (zero-hop) traffic may establish a path, and only if
        // neither the topology nor the host vetoes the endpoint.
        if hops == 0 && ctx.should_use_path(tptr, peer.address(), local_socket, remote) {
            peer.learn_path(path.clone());
            peer.push_direct_paths(ctx, tptr, &path, now);
        }
        path
    }

    // ==================================================================
    // Verb dispatch
    // ==================================================================

    fn dispatch(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        peer: &Arc<Peer>,
        path: &Arc<Path>,
        packet: Packet,
    ) {
        match packet.verb {
            Verb::Nop => {}
            Verb::Hello => {
                // Authenticated HELLO from a known peer: handled on the
                // raw-bytes side for the unknown case; here the payload is
                // already decoded.
                self.handle_hello_payload(ctx, tptr, now, path, peer, &packet, true);
            }
            Verb::Ok => self.handle_ok(ctx, tptr, now, peer, path, &packet),
            Verb::Error => self.handle_error(ctx, tptr, now, peer, &packet),
            Verb::Whois => self.handle_whois(ctx, tptr, now, peer, &packet),
            Verb::Rendezvous => self.handle_rendezvous(ctx, tptr, now, peer, &packet),
            Verb::Frame => self.handle_frame(ctx, tptr, now, peer, &packet),
            Verb::ExtFrame => self.handle_ext_frame(ctx, tptr, now, peer, &packet),
            Verb::Echo => self.handle_echo(ctx, tptr, now, peer, path, &packet),
            Verb::MulticastLike => self.handle_multicast_like(ctx, tptr, now, peer, &packet),
            Verb::MulticastGather => self.handle_multicast_gather(ctx, tptr, now, peer, &packet),
            Verb::MulticastFrame => self.handle_multicast_frame(ctx, tptr, now, peer, &packet),
            Verb::NetworkConfigRequest => {
                // No embedded controller: refuse politely.
                if packet.payload.len() >= 8 {
                    let nwid = u64::from_be_bytes(packet.payload[0..8].try_into().unwrap());
                    self.send_error(
                        ctx,
                        tptr,
                        now,
                        peer.address(),
                        Verb::NetworkConfigRequest,
                        packet.id,
                        ErrorCode::UnsupportedOperation,
                        &nwid.to_be_bytes(),
                    );
                }
            }
            Verb::NetworkConfig => {
                if packet.payload.len() >= 8 {
                    let nwid = u64::from_be_bytes(packet.payload[0..8].try_into().unwrap());
                    if let Some(network) = ctx.network(nwid) {
                        network.handle_config_chunk(ctx, tptr, now, peer.address(), &packet.payload);
                    }
                }
            }
            Verb::NetworkCredentials => self.handle_network_credentials(ctx, tptr, now, peer, &packet),
            Verb::PushDirectPaths => self.handle_push_direct_paths(ctx, tptr, now, peer, &packet),
            Verb::UserMessage => {
                if packet.payload.len() >= 8 {
                    let type_id = u64::from_be_bytes(packet.payload[0..8].try_into().unwrap());
                    ctx.post_event(
                        tptr,
                        Event::UserMessage {
                            source: peer.address(),
                            type_id,
                            data: packet.payload[8..].to_vec(),
                        },
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // HELLO / OK / ERROR
    // ------------------------------------------------------------------

    /// HELLO from raw bytes: the sender may be unknown, so the identity is
    /// pulled from the cleartext body and the MAC re-checked with the
    /// agreed key before anything is believed.
    pub(crate) fn handle_hello(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        local_socket: i64,
        remote: Endpoint,
        data: &[u8],
    ) {
        let Ok(unverified) = Packet::decode_unauthenticated(data) else {
            return;
        };
        let Some(claimed) = parse_hello_identity(&unverified.payload) else {
            ctx.trace.incoming_packet_dropped(unverified.source, Some(remote), DropReason::Malformed);
            return;
        };

        if claimed.address() != unverified.source {
            ctx.trace.incoming_packet_dropped(unverified.source, Some(remote), DropReason::InvalidIdentity);
            return;
        }
        if claimed.address() == ctx.identity.address() {
            // Someone presents our address with a different key: either an
            // attack or a genuine derivation collision. Surface it if the
            // key differs and the proof of work holds.
            if claimed.public_key_bytes() != ctx.identity.public_key_bytes()
                && claimed.locally_validate()
            {
                ctx.post_event(tptr, Event::FatalErrorIdentityCollision);
            }
            return;
        }
        if !claimed.locally_validate() {
            ctx.trace.incoming_packet_dropped(unverified.source, Some(remote), DropReason::InvalidIdentity);
            return;
        }

        let Ok(candidate) = Peer::new(&ctx.identity, claimed) else {
            ctx.trace.incoming_packet_dropped(unverified.source, Some(remote), DropReason::InvalidIdentity);
            return;
        };
        // Now that we can key the sender, demand a valid MAC.
        let Ok(packet) = Packet::decode(data, candidate.key()) else {
            ctx.trace.incoming_packet_dropped(unverified.source, Some(remote), DropReason::MacFailed);
            return;
        };

        let peer = ctx.topology.add_peer(Arc::new(candidate));
        let path = self.resolve_path(ctx, tptr, now, local_socket, remote, &peer, packet.hops);
        path.received(now);
        peer.note_receive(now);

        self.handle_hello_payload(ctx, tptr, now, &path, &peer, &packet, false);
        self.retry_pending(ctx, tptr, now, peer.address());
    }

    /// Shared HELLO semantics once the sender is authenticated: version
    /// bookkeeping, reflexive address echo, world update, OK reply.
    fn handle_hello_payload(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        packet: &Packet,
        _already_known: bool,
    ) {
        let payload = &packet.payload;
        if payload.len() < 13 {
            return;
        }
        if payload[0] > wire::PROTO_VERSION {
            // Future protocol; we still answer so they can see our version.
            tracing::debug!(peer = %peer.address(), version = payload[0], "HELLO from newer protocol");
        }
        let (vmaj, vmin) = (payload[1], payload[2]);
        let vrev = u16::from_be_bytes([payload[3], payload[4]]);
        peer.set_remote_version(vmaj, vmin, vrev);
        let their_timestamp = i64::from_be_bytes(payload[5..13].try_into().unwrap());

        let mut p = 13;
        let Ok((_identity, used)) = Identity::read_from(&payload[p..]) else {
            return;
        };
        p += used;
        let Ok((reflexive, used)) = Endpoint::read_from(&payload[p..]) else {
            return;
        };
        p += used;

        // The endpoint they addressed is our reflexive external address.
        if let Some(reflexive) = reflexive {
            ctx.self_awareness.iam(
                ctx,
                tptr,
                peer.address(),
                path.local_socket(),
                reflexive,
                ctx.topology.is_upstream(peer.address()),
                now,
            );
        }

        let mut their_planet_id = 0u64;
        let mut their_planet_ts = 0i64;
        if payload.len() >= p + 16 {
            their_planet_id = u64::from_be_bytes(payload[p..p + 8].try_into().unwrap());
            their_planet_ts = i64::from_be_bytes(payload[p + 8..p + 16].try_into().unwrap());
        }

        // OK(HELLO): timestamp echo, our version and identity, their
        // reflexive address, and a planet update if ours is newer.
        let mut body = Vec::with_capacity(128);
        body.push(Verb::Hello.as_u8());
        body.extend_from_slice(&packet.id.to_be_bytes());
        body.extend_from_slice(&their_timestamp.to_be_bytes());
        body.push(wire::PROTO_VERSION);
        body.push(crate::VERSION_MAJOR);
        body.push(crate::VERSION_MINOR);
        body.extend_from_slice(&crate::VERSION_REVISION.to_be_bytes());
        ctx.identity.append_to(&mut body);
        path.endpoint().append_to(&mut body);

        let (planet_id, planet_ts) = ctx.topology.planet_summary();
        if planet_id != 0 && planet_id == their_planet_id && planet_ts > their_planet_ts {
            let planet = ctx.topology.planet().serialize();
            body.extend_from_slice(&(planet.len() as u16).to_be_bytes());
            body.extend_from_slice(&planet);
        } else {
            body.extend_from_slice(&0u16.to_be_bytes());
        }

        let mut ok = Packet::new(peer.address(), ctx.identity.address(), Verb::Ok, peer.next_packet_id());
        ok.payload = body;
        if let Ok(wire_bytes) = ok.encode(peer.key()) {
            path.send(ctx, tptr, &wire_bytes, now);
        }
    }

    fn handle_ok(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        peer: &Arc<Peer>,
        path: &Arc<Path>,
        packet: &Packet,
    ) {
        let payload = &packet.payload;
        if payload.len() < 9 {
            return;
        }
        let Ok(in_re) = Verb::from_u8(payload[0]) else {
            return;
        };
        let _in_re_id = u64::from_be_bytes(payload[1..9].try_into().unwrap());
        let body = &payload[9..];

        match in_re {
            Verb::Hello => {
                if body.len() < 13 {
                    return;
                }
                let echoed = i64::from_be_bytes(body[0..8].try_into().unwrap());
                peer.record_latency(now - echoed);
                let (vmaj, vmin) = (body[9], body[10]);
                let vrev = u16::from_be_bytes([body[11], body[12]]);
                peer.set_remote_version(vmaj, vmin, vrev);

                let mut p = 13;
                let Ok((_identity, used)) = Identity::read_from(&body[p..]) else {
                    return;
                };
                p += used;
                let Ok((reflexive, used)) = Endpoint::read_from(&body[p..]) else {
                    return;
                };
                p += used;
                if let Some(reflexive) = reflexive {
                    ctx.self_awareness.iam(
                        ctx,
                        tptr,
                        peer.address(),
                        path.local_socket(),
                        reflexive,
                        ctx.topology.is_upstream(peer.address()),
                        now,
                    );
                }

                if body.len() >= p + 2 {
                    let world_len = u16::from_be_bytes(body[p..p + 2].try_into().unwrap()) as usize;
                    p += 2;
                    if world_len > 0 && body.len() >= p + world_len {
                        if let Ok((world, _)) = World::deserialize(&body[p..p + world_len]) {
                            ctx.topology.accept_world_update(ctx, tptr, world);
                        }
                    }
                }
            }
            Verb::Whois => {
                let mut p = 0;
                while body.len() >= p + Identity::MARSHALED_LEN {
                    let Ok((identity, used)) = Identity::read_from(&body[p..]) else {
                        break;
                    };
                    p += used;
                    self.handle_identity_arrival(ctx, tptr, now, identity);
                }
            }
            Verb::MulticastGather => {
                // [8 nwid][group][4 total][2 count][count * 5 addresses]
                if body.len() < 8 + MulticastGroup::MARSHALED_LEN + 6 {
                    return;
                }
                let nwid = u64::from_be_bytes(body[0..8].try_into().unwrap());
                let Ok((group, used)) = MulticastGroup::read_from(&body[8..]) else {
                    return;
                };
                let mut p = 8 + used + 4;
                if body.len() < p + 2 {
                    return;
                }
                let count = u16::from_be_bytes(body[p..p + 2].try_into().unwrap()) as usize;
                p += 2;
                for _ in 0..count {
                    if body.len() < p + Address::LENGTH {
                        break;
                    }
                    let Ok(addr) = Address::read_from(&body[p..]) else {
                        break;
                    };
                    p += Address::LENGTH;
                    ctx.multicaster.add(ctx, tptr, nwid, group, addr, now);
                }
            }
            Verb::NetworkConfigRequest => {
                if body.len() >= 8 {
                    let nwid = u64::from_be_bytes(body[0..8].try_into().unwrap());
                    if let Some(network) = ctx.network(nwid) {
                        network.handle_config_chunk(ctx, tptr, now, peer.address(), body);
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_error(&self, ctx: &Context, tptr: HostThread, now: i64, peer: &Arc<Peer>, packet: &Packet) {
        let payload = &packet.payload;
        if payload.len() < 10 {
            return;
        }
        let Ok(in_re) = Verb::from_u8(payload[0]) else {
            return;
        };
        let Some(code) = ErrorCode::from_u8(payload[9]) else {
            return;
        };
        let body = &payload[10..];

        match (in_re, code) {
            (Verb::NetworkConfigRequest, ErrorCode::ObjNotFound)
            | (Verb::NetworkConfigRequest, ErrorCode::UnsupportedOperation) => {
                if body.len() >= 8 {
                    let nwid = u64::from_be_bytes(body[0..8].try_into().unwrap());
                    if let Some(network) = ctx.network(nwid) {
                        if peer.address() == network.controller() {
                            network.set_not_found(ctx, tptr, now);
                        }
                    }
                }
            }
            (Verb::NetworkConfigRequest, ErrorCode::NetworkAccessDenied) => {
                if body.len() >= 8 {
                    let nwid = u64::from_be_bytes(body[0..8].try_into().unwrap());
                    if let Some(network) = ctx.network(nwid) {
                        if peer.address() == network.controller() {
                            network.set_access_denied(ctx, tptr, now);
                        }
                    }
                }
            }
            (_, ErrorCode::NeedMembershipCertificate) => {
                if body.len() >= 8 {
                    let nwid = u64::from_be_bytes(body[0..8].try_into().unwrap());
                    if let Some(network) = ctx.network(nwid) {
                        if let Some(com) = network.our_com() {
                            network.push_credentials(ctx, tptr, now, peer.address(), &com);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // WHOIS / RENDEZVOUS
    // ------------------------------------------------------------------

    fn handle_whois(&self, ctx: &Context, tptr: HostThread, now: i64, peer: &Arc<Peer>, packet: &Packet) {
        let mut p = 0;
        while packet.payload.len() >= p + Address::LENGTH {
            let Ok(addr) = Address::read_from(&packet.payload[p..]) else {
                return;
            };
            p += Address::LENGTH;

            if addr == ctx.identity.address() {
                self.send_ok_whois(ctx, tptr, now, peer, packet.id, &ctx.identity);
            } else if let Some(known) = ctx.topology.get_peer_in_memory(addr) {
                self.send_ok_whois(ctx, tptr, now, peer, packet.id, known.identity());
            } else {
                self.send_error(
                    ctx,
                    tptr,
                    now,
                    peer.address(),
                    Verb::Whois,
                    packet.id,
                    ErrorCode::ObjNotFound,
                    &addr.to_bytes(),
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send_error(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        dest: Address,
        in_re_verb: Verb,
        in_re_id: u64,
        code: ErrorCode,
        extra: &[u8],
    ) {
        let mut body = Vec::with_capacity(10 + extra.len());
        body.push(in_re_verb.as_u8());
        body.extend_from_slice(&in_re_id.to_be_bytes());
        body.push(code.as_u8());
        body.extend_from_slice(extra);
        let mut packet = Packet::new(dest, ctx.identity.address(), Verb::Error, 0);
        packet.payload = body;
        self.send(ctx, tptr, now, packet, true);
    }

    fn send_ok_whois(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        peer: &Arc<Peer>,
        in_re_id: u64,
        identity: &Identity,
    ) {
        let mut body = Vec::with_capacity(9 + Identity::MARSHALED_LEN);
        body.push(Verb::Whois.as_u8());
        body.extend_from_slice(&in_re_id.to_be_bytes());
        identity.append_to(&mut body);
        let mut ok = Packet::new(peer.address(), ctx.identity.address(), Verb::Ok, 0);
        ok.payload = body;
        self.send(ctx, tptr, now, ok, true);
    }

    /// An upstream introduces us to a NAT sibling: HELLO their endpoint.
    fn handle_rendezvous(&self, ctx: &Context, tptr: HostThread, now: i64, peer: &Arc<Peer>, packet: &Packet) {
        if !ctx.topology.is_upstream(peer.address()) {
            return;
        }
        let payload = &packet.payload;
        if payload.len() < 6 {
            return;
        }
        let Ok(with) = Address::read_from(&payload[1..]) else {
            return;
        };
        let Ok((Some(endpoint), _)) = Endpoint::read_from(&payload[6..]) else {
            return;
        };
        if !endpoint.is_valid_for_path() {
            return;
        }
        let Some(other) = ctx.topology.get_peer_in_memory(with) else {
            return;
        };
        if ctx.should_use_path(tptr, with, -1, endpoint) {
            tracing::debug!(%with, %endpoint, "rendezvous: punching");
            other.send_hello(ctx, tptr, -1, endpoint, now);
        }
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    fn handle_frame(&self, ctx: &Context, tptr: HostThread, now: i64, peer: &Arc<Peer>, packet: &Packet) {
        let payload = &packet.payload;
        if payload.len() < 10 {
            return;
        }
        let nwid = u64::from_be_bytes(payload[0..8].try_into().unwrap());
        let ethertype = u16::from_be_bytes(payload[8..10].try_into().unwrap());
        let frame = &payload[10..];

        let Some(network) = ctx.network(nwid) else {
            ctx.trace.incoming_frame_dropped(nwid, peer.address(), DropReason::Unroutable);
            return;
        };
        network.member_activity(peer.address(), now);

        let src_mac = Mac::from_address(peer.address(), nwid);
        let dest_mac = Mac::from_address(ctx.identity.address(), nwid);
        if !network.gate_incoming_frame(ctx, peer.address(), src_mac, dest_mac, ethertype, now) {
            ctx.trace.incoming_frame_dropped(nwid, peer.address(), DropReason::RuleRejected);
            self.request_credentials_if_private(ctx, tptr, now, &network, peer.address(), packet.id);
            return;
        }

        ctx.host.virtual_network_frame(
            tptr,
            nwid,
            network.user_ptr(),
            src_mac,
            dest_mac,
            ethertype,
            0,
            frame,
        );
    }

    fn handle_ext_frame(&self, ctx: &Context, tptr: HostThread, now: i64, peer: &Arc<Peer>, packet: &Packet) {
        // [8 nwid][1 flags][6 dest mac][6 src mac][2 ethertype][frame]
        let payload = &packet.payload;
        if payload.len() < 23 {
            return;
        }
        let nwid = u64::from_be_bytes(payload[0..8].try_into().unwrap());
        let dest_mac = Mac::from_bytes(payload[9..15].try_into().unwrap());
        let src_mac = Mac::from_bytes(payload[15..21].try_into().unwrap());
        let ethertype = u16::from_be_bytes(payload[21..23].try_into().unwrap());
        let frame = &payload[23..];

        let Some(network) = ctx.network(nwid) else {
            ctx.trace.incoming_frame_dropped(nwid, peer.address(), DropReason::Unroutable);
            return;
        };
        network.member_activity(peer.address(), now);

        if !network.gate_incoming_frame(ctx, peer.address(), src_mac, dest_mac, ethertype, now) {
            ctx.trace.incoming_frame_dropped(nwid, peer.address(), DropReason::RuleRejected);
            self.request_credentials_if_private(ctx, tptr, now, &network, peer.address(), packet.id);
            return;
        }

        ctx.host.virtual_network_frame(
            tptr,
            nwid,
            network.user_ptr(),
            src_mac,
            dest_mac,
            ethertype,
            0,
            frame,
        );
    }

    /// A private-network frame that failed the gate usually means the
    /// sender never saw our COM (or we never saw theirs): nudge them.
    fn request_credentials_if_private(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        network: &Arc<crate::network::Network>,
        from: Address,
        in_re_id: u64,
    ) {
        if let Some(com) = network.our_com() {
            network.push_credentials(ctx, tptr, now, from, &com);
        }
        self.send_error(
            ctx,
            tptr,
            now,
            from,
            Verb::Frame,
            in_re_id,
            ErrorCode::NeedMembershipCertificate,
            &network.id().to_be_bytes(),
        );
    }

    fn handle_echo(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        peer: &Arc<Peer>,
        path: &Arc<Path>,
        packet: &Packet,
    ) {
        let mut body = Vec::with_capacity(9 + packet.payload.len());
        body.push(Verb::Echo.as_u8());
        body.extend_from_slice(&packet.id.to_be_bytes());
        body.extend_from_slice(&packet.payload);
        let mut ok = Packet::new(peer.address(), ctx.identity.address(), Verb::Ok, peer.next_packet_id());
        ok.payload = body;
        if let Ok(wire_bytes) = ok.encode(peer.key()) {
            path.send(ctx, tptr, &wire_bytes, now);
        }
    }

    // ------------------------------------------------------------------
    // Multicast
    // ------------------------------------------------------------------

    fn handle_multicast_like(&self, ctx: &Context, tptr: HostThread, now: i64, peer: &Arc<Peer>, packet: &Packet) {
        let stride = 8 + MulticastGroup::MARSHALED_LEN;
        let mut p = 0;
        while packet.payload.len() >= p + stride {
            let nwid = u64::from_be_bytes(packet.payload[p..p + 8].try_into().unwrap());
            let Ok((group, _)) = MulticastGroup::read_from(&packet.payload[p + 8..]) else {
                return;
            };
            p += stride;
            ctx.multicaster.add(ctx, tptr, nwid, group, peer.address(), now);
            if let Some(network) = ctx.network(nwid) {
                network.member_activity(peer.address(), now);
            }
        }
    }

    fn handle_multicast_gather(&self, ctx: &Context, tptr: HostThread, now: i64, peer: &Arc<Peer>, packet: &Packet) {
        let payload = &packet.payload;
        if payload.len() < 8 + MulticastGroup::MARSHALED_LEN + 4 {
            return;
        }
        let nwid = u64::from_be_bytes(payload[0..8].try_into().unwrap());
        let Ok((group, used)) = MulticastGroup::read_from(&payload[8..]) else {
            return;
        };
        let limit = u32::from_be_bytes(payload[8 + used..8 + used + 4].try_into().unwrap()) as usize;
        let gathered = ctx.multicaster.gather(nwid, group, limit.clamp(1, 255), now);
        let total = ctx.multicaster.subscriber_count(nwid, group, now);

        let mut body = Vec::with_capacity(9 + 8 + MulticastGroup::MARSHALED_LEN + 6 + gathered.len() * 5);
        body.push(Verb::MulticastGather.as_u8());
        body.extend_from_slice(&packet.id.to_be_bytes());
        body.extend_from_slice(&nwid.to_be_bytes());
        group.append_to(&mut body);
        body.extend_from_slice(&(total as u32).to_be_bytes());
        body.extend_from_slice(&(gathered.len() as u16).to_be_bytes());
        for addr in &gathered {
            addr.append_to(&mut body);
        }
        let mut ok = Packet::new(peer.address(), ctx.identity.address(), Verb::Ok, 0);
        ok.payload = body;
        self.send(ctx, tptr, now, ok, true);
    }

    fn handle_multicast_frame(&self, ctx: &Context, tptr: HostThread, now: i64, peer: &Arc<Peer>, packet: &Packet) {
        // [8 nwid][6 src mac][group][2 ethertype][frame]
        let payload = &packet.payload;
        let fixed = 8 + 6 + MulticastGroup::MARSHALED_LEN + 2;
        if payload.len() < fixed {
            return;
        }
        let nwid = u64::from_be_bytes(payload[0..8].try_into().unwrap());
        let src_mac = Mac::from_bytes(payload[8..14].try_into().unwrap());
        let Ok((group, _)) = MulticastGroup::read_from(&payload[14..]) else {
            return;
        };
        let ethertype = u16::from_be_bytes(payload[fixed - 2..fixed].try_into().unwrap());
        let frame = &payload[fixed..];

        let Some(network) = ctx.network(nwid) else {
            ctx.trace.incoming_frame_dropped(nwid, peer.address(), DropReason::Unroutable);
            return;
        };
        network.member_activity(peer.address(), now);

        if !network.subscriptions().contains(&group) {
            ctx.trace.incoming_frame_dropped(nwid, peer.address(), DropReason::Unroutable);
            return;
        }
        if !network.gate_incoming_frame(ctx, peer.address(), src_mac, group.mac, ethertype, now) {
            ctx.trace.incoming_frame_dropped(nwid, peer.address(), DropReason::RuleRejected);
            return;
        }

        ctx.host.virtual_network_frame(
            tptr,
            nwid,
            network.user_ptr(),
            src_mac,
            group.mac,
            ethertype,
            0,
            frame,
        );
    }

    // ------------------------------------------------------------------
    // Direct paths / credentials
    // ------------------------------------------------------------------

    fn handle_push_direct_paths(&self, ctx: &Context, tptr: HostThread, now: i64, peer: &Arc<Peer>, packet: &Packet) {
        const MAX_CONTACTED: usize = 8;
        let payload = &packet.payload;
        if payload.len() < 2 {
            return;
        }
        let count = u16::from_be_bytes(payload[0..2].try_into().unwrap()) as usize;
        let mut p = 2;
        let mut contacted = 0usize;
        for _ in 0..count {
            let Ok((Some(endpoint), used)) = Endpoint::read_from(&payload[p..]) else {
                return;
            };
            p += used;
            if contacted >= MAX_CONTACTED {
                continue;
            }
            if !endpoint.is_valid_for_path()
                || peer.find_path(-1, endpoint).is_some()
                || !ctx.should_use_path(tptr, peer.address(), -1, endpoint)
            {
                continue;
            }
            peer.send_hello(ctx, tptr, -1, endpoint, now);
            contacted += 1;
        }
    }

    fn handle_network_credentials(&self, ctx: &Context, tptr: HostThread, now: i64, peer: &Arc<Peer>, packet: &Packet) {
        use crate::credentials::{Capability, CertificateOfMembership, Revocation, Tag};

        let payload = &packet.payload;
        if payload.is_empty() {
            return;
        }
        let mut p = 0;

        let com_count = payload[p] as usize;
        p += 1;
        for _ in 0..com_count {
            let Ok((com, used)) = CertificateOfMembership::deserialize(&payload[p..]) else {
                return;
            };
            p += used;
            if let Some(network) = ctx.network(com.network_id()) {
                network.member_activity(peer.address(), now);
                network.add_credential_com(ctx, tptr, now, com);
            }
        }

        let Some(counts) = payload.get(p..p + 2) else { return };
        let cap_count = u16::from_be_bytes(counts.try_into().unwrap()) as usize;
        p += 2;
        for _ in 0..cap_count {
            let Ok((cap, used)) = Capability::deserialize(&payload[p..]) else {
                return;
            };
            p += used;
            if let Some(network) = ctx.network(cap.network_id) {
                network.add_credential_capability(ctx, tptr, now, cap);
            }
        }

        let Some(counts) = payload.get(p..p + 2) else { return };
        let tag_count = u16::from_be_bytes(counts.try_into().unwrap()) as usize;
        p += 2;
        for _ in 0..tag_count {
            let Ok((tag, used)) = Tag::deserialize(&payload[p..]) else {
                return;
            };
            p += used;
            if let Some(network) = ctx.network(tag.network_id) {
                network.add_credential_tag(ctx, tptr, now, tag);
            }
        }

        let Some(counts) = payload.get(p..p + 2) else { return };
        let rev_count = u16::from_be_bytes(counts.try_into().unwrap()) as usize;
        p += 2;
        for _ in 0..rev_count {
            let Ok((rev, used)) = Revocation::deserialize(&payload[p..]) else {
                return;
            };
            p += used;
            if let Some(network) = ctx.network(rev.network_id) {
                network.add_credential_revocation(ctx, tptr, now, rev);
            }
        }
    }

    // ==================================================================
    // Outbound
    // ==================================================================

    /// Entry point for frames leaving the host tap: screen against the
    /// network's egress rules, then encapsulate as FRAME/MULTICAST_FRAME.
    #[allow(clippy::too_many_arguments)]
    pub fn on_local_ethernet(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        network: &Arc<crate::network::Network>,
        src_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        _vlan: u16,
        data: &[u8],
    ) {
        let nwid = network.id();
        let our_mac = Mac::from_address(ctx.identity.address(), nwid);
        if src_mac != our_mac && !network.view(ctx.identity.address()).bridging_allowed {
            ctx.trace.outgoing_frame_dropped(nwid, DropReason::RuleRejected);
            return;
        }

        if dest_mac.is_multicast() {
            let group = MulticastGroup::new(dest_mac, 0);
            if !network.gate_outgoing_frame(ctx, ctx.identity.address(), ethertype) {
                ctx.trace.outgoing_frame_dropped(nwid, DropReason::RuleRejected);
                return;
            }
            ctx.multicaster.send(
                ctx,
                tptr,
                now,
                nwid,
                group,
                network.multicast_limit(),
                src_mac,
                ethertype,
                data,
            );
            return;
        }

        let dest = dest_mac.to_address(nwid);
        if dest == ctx.identity.address() || dest.is_reserved() {
            ctx.trace.outgoing_frame_dropped(nwid, DropReason::Unroutable);
            return;
        }
        if !network.gate_outgoing_frame(ctx, dest, ethertype) {
            ctx.trace.outgoing_frame_dropped(nwid, DropReason::RuleRejected);
            return;
        }

        let mut packet = Packet::new(dest, ctx.identity.address(), Verb::Frame, 0);
        let mut body = Vec::with_capacity(10 + data.len());
        body.extend_from_slice(&nwid.to_be_bytes());
        body.extend_from_slice(&ethertype.to_be_bytes());
        body.extend_from_slice(data);
        packet.payload = body;
        packet.compress_payload();
        self.send(ctx, tptr, now, packet, true);
    }

    /// Encrypt, fragment and transmit to the packet's destination, going
    /// through an upstream relay when no direct path works. Unknown
    /// destinations park the packet behind a WHOIS.
    pub fn send(&self, ctx: &Context, tptr: HostThread, now: i64, packet: Packet, encrypt: bool) {
        if packet.dest == ctx.identity.address() || packet.dest.is_reserved() {
            return;
        }
        match ctx.topology.get_peer(ctx, tptr, packet.dest) {
            Some(peer) => {
                if !self.try_send(ctx, tptr, now, &peer, packet, encrypt) {
                    // Peer known but currently unreachable; there is no
                    // queue that will help, the background HELLOs will.
                }
            }
            None => {
                let dest = packet.dest;
                {
                    let mut tx = self.tx_queue.lock();
                    if tx.len() >= TX_QUEUE_CAP {
                        tx.pop_front();
                        ctx.trace.outgoing_frame_dropped(0, DropReason::QueueOverflow);
                    }
                    tx.push_back(TxQueueEntry { created: now, packet, encrypt });
                }
                self.request_whois(ctx, tptr, now, dest);
            }
        }
    }

    fn try_send(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        peer: &Arc<Peer>,
        mut packet: Packet,
        encrypt: bool,
    ) -> bool {
        let via = match peer.get_best_path(now, false, None) {
            Some(path) => path,
            None => match self.relay_path_for(ctx, tptr, now, peer.address()) {
                Some(path) => path,
                None => return false,
            },
        };

        if packet.id == 0 {
            packet.id = peer.next_packet_id();
        }
        packet.cipher = if encrypt { CipherSuite::Encrypted } else { CipherSuite::AuthOnly };
        packet.fragmented = packet.wire_len() > UDP_DEFAULT_PAYLOAD_MTU;

        // A configured trusted physical network skips armor entirely.
        let trust_id = via.trusted_path_id();
        let encoded = if trust_id != 0 {
            packet.encode_trusted(trust_id)
        } else {
            packet.encode(peer.key())
        };
        let Ok(wire_bytes) = encoded else {
            return false;
        };

        match fragment::split(&wire_bytes) {
            Ok(pieces) => {
                for piece in pieces {
                    via.send(ctx, tptr, &piece, now);
                }
                true
            }
            Err(_) => false,
        }
    }

    // ------------------------------------------------------------------
    // WHOIS machinery
    // ------------------------------------------------------------------

    /// Ask an upstream who an address is, bounded in flight and retried
    /// by the timer task.
    pub fn request_whois(&self, ctx: &Context, tptr: HostThread, now: i64, address: Address) {
        if address == ctx.identity.address() || address.is_reserved() {
            return;
        }
        {
            let mut whois = self.whois.lock();
            if whois.contains_key(&address) {
                return;
            }
            if whois.len() >= WHOIS_MAX_OUTSTANDING {
                return;
            }
            whois.insert(address, WhoisRequest { last_sent: now, retries: 0 });
        }
        self.send_whois_query(ctx, tptr, now, address);
    }

    fn send_whois_query(&self, ctx: &Context, tptr: HostThread, now: i64, address: Address) {
        let Some(upstream) = ctx.topology.get_upstream_peer(now) else {
            return;
        };
        let mut packet =
            Packet::new(upstream.address(), ctx.identity.address(), Verb::Whois, upstream.next_packet_id());
        packet.payload = address.to_bytes().to_vec();
        let _ = self.try_send(ctx, tptr, now, &upstream, packet, true);
    }

    /// A fresh identity from OK(WHOIS) or HELLO: validate, admit, and
    /// release anything parked behind it.
    pub(crate) fn handle_identity_arrival(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        identity: Identity,
    ) {
        if identity.address() == ctx.identity.address() {
            return;
        }
        if ctx.topology.get_peer_in_memory(identity.address()).is_some() {
            self.retry_pending(ctx, tptr, now, identity.address());
            return;
        }
        if !identity.locally_validate() {
            ctx.trace.incoming_packet_dropped(identity.address(), None, DropReason::InvalidIdentity);
            return;
        }
        let Ok(peer) = Peer::new(&ctx.identity, identity) else {
            return;
        };
        let address = peer.address();
        ctx.topology.add_peer(Arc::new(peer));
        self.retry_pending(ctx, tptr, now, address);
    }

    /// Resolution succeeded: replay parked receive packets and flush
    /// parked transmissions for this address.
    fn retry_pending(&self, ctx: &Context, tptr: HostThread, now: i64, address: Address) {
        self.whois.lock().remove(&address);

        let rx: Vec<RxQueueEntry> = {
            let mut queue = self.rx_queue.lock();
            let (hit, miss): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|e| e.source == address);
            *queue = miss;
            hit.into()
        };
        for entry in rx {
            self.handle_packet(ctx, tptr, now, entry.local_socket, entry.remote, &entry.raw);
        }

        let tx: Vec<TxQueueEntry> = {
            let mut queue = self.tx_queue.lock();
            let (hit, miss): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|e| e.packet.dest == address);
            *queue = miss;
            hit.into()
        };
        if !tx.is_empty() {
            if let Some(peer) = ctx.topology.get_peer_in_memory(address) {
                for entry in tx {
                    self.try_send(ctx, tptr, now, &peer, entry.packet, entry.encrypt);
                }
            }
        }
    }

    // ==================================================================
    // Timer task
    // ==================================================================

    /// Expire and retry time-bounded state. Returns the suggested delay
    /// until the next call.
    pub fn do_timer_tasks(&self, ctx: &Context, tptr: HostThread, now: i64) -> i64 {
        let mut next_delay: i64 = FRAGMENT_TTL;

        // WHOIS retries and abandonment.
        let (resend, abandoned): (Vec<Address>, Vec<Address>) = {
            let mut whois = self.whois.lock();
            let mut resend = Vec::new();
            let mut dead = Vec::new();
            for (addr, req) in whois.iter_mut() {
                if now - req.last_sent >= WHOIS_RETRY_INTERVAL {
                    if req.retries >= WHOIS_RETRY_COUNT {
                        dead.push(*addr);
                    } else {
                        req.retries += 1;
                        req.last_sent = now;
                        resend.push(*addr);
                    }
                }
                next_delay = next_delay.min(WHOIS_RETRY_INTERVAL);
            }
            for addr in &dead {
                whois.remove(addr);
            }
            (resend, dead)
        };
        for addr in resend {
            self.send_whois_query(ctx, tptr, now, addr);
        }
        for addr in abandoned {
            ctx.trace.whois_abandoned(addr);
            // Everything parked behind the lookup dies with it.
            self.rx_queue.lock().retain(|e| e.source != addr);
            self.tx_queue.lock().retain(|e| e.packet.dest != addr);
        }

        // Queued packets expire with their WHOIS window.
        let queue_ttl = WHOIS_RETRY_INTERVAL * (WHOIS_RETRY_COUNT as i64 + 1);
        self.rx_queue.lock().retain(|e| now - e.arrived <= queue_ttl);
        self.tx_queue.lock().retain(|e| now - e.created <= queue_ttl);

        // Fragment reassembly expiry.
        self.defrag.lock().retain(|_, asm| now - asm.arrived_at <= FRAGMENT_TTL);

        // Rendezvous pair memory.
        self.last_unite.lock().retain(|_, last| now - *last <= UNITE_INTERVAL * 4);

        next_delay
    }

    #[cfg(test)]
    pub(crate) fn queued_tx(&self) -> usize {
        self.tx_queue.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn whois_outstanding(&self) -> usize {
        self.whois.lock().len()
    }
}

/// Pull the identity out of a HELLO body without trusting anything else.
fn parse_hello_identity(payload: &[u8]) -> Option<Identity> {
    if payload.len() < 13 {
        return None;
    }
    Identity::read_from(&payload[13..]).ok().map(|(id, _)| id)
}
