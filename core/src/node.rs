//! The Node: composition root, public API surface, and the background
//! scheduler.
//!
//! The core owns no threads and opens no sockets. The host drives every
//! entry point with `now` and an opaque [`HostThread`] token, and supplies
//! the outside world as the [`NodeHost`] callbacks. Callbacks are always
//! invoked with no core lock held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::crypto::Prng;
use crate::endpoint::{AddressFamily, Endpoint};
use crate::identity::{Address, Identity};
use crate::mac::Mac;
use crate::multicaster::{Multicaster, MulticastGroup};
use crate::network::{
    Network, VirtualNetworkConfigOperation, VirtualNetworkView, NETWORK_AUTOCONF_DELAY,
};
use crate::peer::PEER_ACTIVITY_TIMEOUT;
use crate::self_awareness::SelfAwareness;
use crate::switch::Switch;
use crate::topology::{Role, Topology};
use crate::trace::Trace;
use crate::wire::{Packet, Verb};
use crate::{Error, Result};

/// Ping/config-refresh cadence of the background pass.
pub const PING_CHECK_INTERVAL: i64 = 5_000;

/// Housekeeping cadence (peer eviction, table cleaning).
pub const HOUSEKEEPING_PERIOD: i64 = 30_000;

/// Floor on the deadline handed back to the host.
pub const CORE_TIMER_TASK_GRANULARITY: i64 = 500;

/// Opaque host-thread token, threaded through every callback unchanged.
/// The core never interprets it; it exists so the host can identify the
/// calling thread on the far side of a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostThread(pub u64);

/// Key kinds for the host's blob store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateObjectKind {
    IdentityPublic,
    IdentitySecret,
    Planet,
    Moon,
    Peer,
    NetworkConfig,
}

/// Events surfaced through the host's `event` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Up,
    Online,
    Offline,
    Down,
    Trace(String),
    UserMessage { source: Address, type_id: u64, data: Vec<u8> },
    FatalErrorIdentityCollision,
}

/// Everything the host must supply. Implementations must be callable from
/// any thread the host uses to drive the node.
pub trait NodeHost: Send + Sync {
    /// Put a datagram on the wire. MUST NOT block for long.
    fn wire_packet_send(
        &self,
        tptr: HostThread,
        local_socket: i64,
        remote: Endpoint,
        data: &[u8],
    ) -> bool;

    /// Deliver a decrypted Ethernet frame to the host tap.
    #[allow(clippy::too_many_arguments)]
    fn virtual_network_frame(
        &self,
        tptr: HostThread,
        nwid: u64,
        user_ptr: u64,
        src_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        vlan: u16,
        data: &[u8],
    );

    /// Notify the host of a network lifecycle change.
    fn virtual_network_config(
        &self,
        tptr: HostThread,
        nwid: u64,
        user_ptr: u64,
        op: VirtualNetworkConfigOperation,
        config: &VirtualNetworkView,
    );

    fn event(&self, tptr: HostThread, event: Event);

    fn state_put(&self, tptr: HostThread, kind: StateObjectKind, id: [u64; 2], data: &[u8]) -> bool;
    fn state_get(&self, tptr: HostThread, kind: StateObjectKind, id: [u64; 2]) -> Option<Vec<u8>>;
    fn state_delete(&self, tptr: HostThread, kind: StateObjectKind, id: [u64; 2]);

    /// Optional policy hook to veto a physical path.
    fn path_check(
        &self,
        _tptr: HostThread,
        _address: Address,
        _local_socket: i64,
        _remote: Endpoint,
    ) -> bool {
        true
    }

    /// Optional bootstrap hint: a known physical address for an overlay
    /// address in a given family.
    fn path_lookup(
        &self,
        _tptr: HostThread,
        _address: Address,
        _family: AddressFamily,
    ) -> Option<Endpoint> {
        None
    }
}

/// Construction options. `version` must be zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeOptions {
    pub version: u32,
}

/// Shared context every subsystem hangs off of. There are no globals:
/// subsystems are plain structs with interior locks, cross-calling each
/// other through `&Context` parameters.
pub(crate) struct Context {
    pub host: Arc<dyn NodeHost>,
    pub identity: Identity,
    pub trace: Trace,
    pub switch: Switch,
    pub multicaster: Multicaster,
    pub topology: Topology,
    pub self_awareness: SelfAwareness,
    pub networks: RwLock<HashMap<u64, Arc<Network>>>,
    pub direct_paths: Mutex<Vec<Endpoint>>,
    prng: Mutex<Prng>,
}

impl Context {
    pub fn network(&self, nwid: u64) -> Option<Arc<Network>> {
        self.networks.read().get(&nwid).cloned()
    }

    /// Non-cryptographic randomness for jitter and tie-breaks.
    pub fn next_prng(&self) -> u64 {
        self.prng.lock().next_u64()
    }

    pub fn post_event(&self, tptr: HostThread, event: Event) {
        self.host.event(tptr, event);
    }

    /// May overlay traffic for `address` use this physical path?
    pub fn should_use_path(
        &self,
        tptr: HostThread,
        address: Address,
        local_socket: i64,
        remote: Endpoint,
    ) -> bool {
        if !remote.is_valid_for_path() {
            return false;
        }
        if self.topology.is_prohibited_endpoint(address, remote) {
            return false;
        }
        self.host.path_check(tptr, address, local_socket, remote)
    }
}

struct BackgroundState {
    last_ping_check: i64,
    last_housekeeping: i64,
}

/// Snapshot of one peer for `peers()`.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub address: Address,
    pub version: Option<(u8, u8, u16)>,
    pub latency: u32,
    pub role: Role,
    pub paths: Vec<PathView>,
}

#[derive(Debug, Clone)]
pub struct PathView {
    pub endpoint: Endpoint,
    pub local_socket: i64,
    pub last_send: i64,
    pub last_receive: i64,
    pub trusted_path_id: u64,
    pub link_quality: u8,
    pub preferred: bool,
}

/// Node status snapshot.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub address: Address,
    pub public_identity: String,
    pub online: bool,
}

pub struct Node {
    ctx: Arc<Context>,
    background: Mutex<BackgroundState>,
    online: AtomicBool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("online", &self.online.load(Ordering::Relaxed)).finish()
    }
}

impl Node {
    /// Load or generate the identity, bring up the subsystems, emit
    /// `Event::Up`.
    pub fn new(host: Arc<dyn NodeHost>, options: NodeOptions, tptr: HostThread, now: i64) -> Result<Node> {
        if options.version != 0 {
            return Err(Error::InvalidArgument("options version"));
        }

        let identity = Self::load_or_generate_identity(&*host, tptr)?;
        let address = identity.address();
        tracing::info!(%address, "node identity ready");

        let ctx = Arc::new(Context {
            trace: Trace::new(),
            switch: Switch::new(),
            multicaster: Multicaster::new(),
            topology: Topology::new(&*host, tptr, &identity),
            self_awareness: SelfAwareness::new(),
            networks: RwLock::new(HashMap::new()),
            direct_paths: Mutex::new(Vec::new()),
            prng: Mutex::new(Prng::new_seeded()),
            host,
            identity,
        });

        ctx.post_event(tptr, Event::Up);

        Ok(Node {
            ctx,
            background: Mutex::new(BackgroundState { last_ping_check: 0, last_housekeeping: 0 }),
            online: AtomicBool::new(false),
        })
    }

    fn load_or_generate_identity(host: &dyn NodeHost, tptr: HostThread) -> Result<Identity> {
        if let Some(blob) = host.state_get(tptr, StateObjectKind::IdentitySecret, [0, 0]) {
            if let Ok(text) = std::str::from_utf8(&blob) {
                if let Some(identity) = Identity::from_text(text) {
                    if identity.has_secret() {
                        // Re-assert the public half if the stored copy
                        // disagrees (or is missing).
                        let public = identity.to_text(false);
                        let stored =
                            host.state_get(tptr, StateObjectKind::IdentityPublic, [identity.address().to_u64(), 0]);
                        if stored.as_deref() != Some(public.as_bytes()) {
                            host.state_put(
                                tptr,
                                StateObjectKind::IdentityPublic,
                                [identity.address().to_u64(), 0],
                                public.as_bytes(),
                            );
                        }
                        return Ok(identity);
                    }
                }
            }
            tracing::warn!("stored identity unreadable; generating a new one");
        }

        let identity = Identity::generate();
        let id = [identity.address().to_u64(), 0];
        let secret_ok = host.state_put(
            tptr,
            StateObjectKind::IdentitySecret,
            id,
            identity.to_text(true).as_bytes(),
        );
        let public_ok = host.state_put(
            tptr,
            StateObjectKind::IdentityPublic,
            id,
            identity.to_text(false).as_bytes(),
        );
        if !secret_ok || !public_ok {
            return Err(Error::DataStoreFailed);
        }
        Ok(identity)
    }

    pub fn address(&self) -> Address {
        self.ctx.identity.address()
    }

    pub fn identity(&self) -> Identity {
        self.ctx.identity.public_only()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            address: self.ctx.identity.address(),
            public_identity: self.ctx.identity.to_text(false).to_string(),
            online: self.online.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------
    // Datapath entry points
    // ------------------------------------------------------------------

    /// Feed one received datagram into the engine. Malformed or
    /// unauthenticated packets are counted and dropped, never errors.
    pub fn process_wire_packet(
        &self,
        tptr: HostThread,
        now: i64,
        local_socket: i64,
        remote: Endpoint,
        data: &[u8],
    ) -> Result<()> {
        self.ctx.switch.on_remote_packet(&self.ctx, tptr, now, local_socket, remote, data);
        Ok(())
    }

    /// Feed one frame from the host tap toward the overlay.
    #[allow(clippy::too_many_arguments)]
    pub fn process_virtual_network_frame(
        &self,
        tptr: HostThread,
        now: i64,
        nwid: u64,
        src_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        vlan: u16,
        data: &[u8],
    ) -> Result<()> {
        let Some(network) = self.ctx.network(nwid) else {
            return Err(Error::NetworkNotFound);
        };
        self.ctx.switch.on_local_ethernet(
            &self.ctx, tptr, now, &network, src_mac, dest_mac, ethertype, vlan, data,
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Background scheduler
    // ------------------------------------------------------------------

    /// Run due periodic work. Returns the suggested absolute deadline for
    /// the next call. Holding a single coarse lock guarantees at most one
    /// pass runs at a time.
    pub fn process_background_tasks(&self, tptr: HostThread, now: i64) -> Result<i64> {
        let ctx = &self.ctx;
        let mut background = self.background.lock();

        let mut time_until_ping = PING_CHECK_INTERVAL;
        let since_ping = now - background.last_ping_check;
        if since_ping >= PING_CHECK_INTERVAL {
            background.last_ping_check = now;
            self.do_ping_check(tptr, now);
        } else {
            time_until_ping -= since_ping;
        }

        if now - background.last_housekeeping >= HOUSEKEEPING_PERIOD {
            background.last_housekeeping = now;
            ctx.topology.do_periodic_tasks(ctx, tptr, now);
            ctx.self_awareness.clean(now);
            ctx.multicaster.clean(now);
            let networks: Vec<Arc<Network>> = ctx.networks.read().values().cloned().collect();
            for network in networks {
                network.clean(now);
            }
        }

        let switch_delay = ctx.switch.do_timer_tasks(ctx, tptr, now);
        Ok(now + time_until_ping.min(switch_delay).max(CORE_TIMER_TASK_GRANULARITY))
    }

    /// The 5-second pass: config refreshes, member updates, upstream
    /// pings, keepalives, and the online/offline flip.
    fn do_ping_check(&self, tptr: HostThread, now: i64) {
        let ctx = &self.ctx;

        // Networks needing configuration, then member credential pushes.
        let networks: Vec<Arc<Network>> = ctx.networks.read().values().cloned().collect();
        for network in &networks {
            if !network.has_config() || network.config_age(now) >= NETWORK_AUTOCONF_DELAY {
                network.request_configuration(ctx, tptr, now);
            }
            network.send_updates_to_members(ctx, tptr, now);
        }

        // Ping upstreams on both families (roots introduce dual-stack
        // pairs, so they must see us on each), keepalive active peers.
        let mut to_contact: HashMap<Address, Vec<Endpoint>> =
            ctx.topology.upstreams_to_contact().into_iter().collect();
        let mut last_upstream_receive = 0i64;

        ctx.topology.each_peer(|peer| {
            if let Some(stable_endpoints) = to_contact.remove(&peer.address()) {
                for family in [AddressFamily::V4, AddressFamily::V6] {
                    if !peer.do_ping_and_keepalive(ctx, tptr, now, Some(family)) {
                        // No live path in this family: try a stable
                        // endpoint, starting at a random offset.
                        let candidates: Vec<&Endpoint> = stable_endpoints
                            .iter()
                            .filter(|ep| ep.family() == family)
                            .collect();
                        if !candidates.is_empty() {
                            let pick = (ctx.next_prng() as usize) % candidates.len();
                            peer.send_hello(ctx, tptr, -1, *candidates[pick], now);
                        } else if let Some(hint) =
                            ctx.host.path_lookup(tptr, peer.address(), family)
                        {
                            peer.send_hello(ctx, tptr, -1, hint, now);
                        }
                    }
                }
                last_upstream_receive = last_upstream_receive.max(peer.last_receive());
            } else if peer.is_alive(now) {
                peer.do_ping_and_keepalive(ctx, tptr, now, None);
            }
        });

        // Upstreams with no Peer yet resolve via WHOIS (or a stable
        // endpoint HELLO once their identity arrives).
        let unresolved: Vec<Address> = to_contact.into_keys().collect();
        for address in unresolved {
            ctx.switch.request_whois(ctx, tptr, now, address);
        }

        // Online = heard from an upstream recently, or we are a root.
        let online =
            (now - last_upstream_receive < PEER_ACTIVITY_TIMEOUT && last_upstream_receive != 0)
                || ctx.topology.am_root();
        let was_online = self.online.swap(online, Ordering::Relaxed);
        if was_online != online {
            ctx.post_event(tptr, if online { Event::Online } else { Event::Offline });
        }
    }

    // ------------------------------------------------------------------
    // Network membership
    // ------------------------------------------------------------------

    /// Join a virtual network. Idempotent; when two joins race, the first
    /// writer wins and the loser's `user_ptr` is ignored.
    pub fn join(&self, tptr: HostThread, now: i64, nwid: u64, user_ptr: u64) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.networks.read().contains_key(&nwid) {
            return Ok(());
        }
        let network = Arc::new(Network::new(nwid, user_ptr));
        let winner = {
            let mut networks = ctx.networks.write();
            match networks.entry(nwid) {
                std::collections::hash_map::Entry::Occupied(_) => None,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(network.clone());
                    Some(network)
                }
            }
        };
        if let Some(network) = winner {
            tracing::info!(nwid = format_args!("{:016x}", nwid), "joined network");
            network.restore_cached_config(ctx, tptr, now);
            network.request_configuration(ctx, tptr, now);
        }
        Ok(())
    }

    /// Leave a virtual network: DESTROY callback, then forget the
    /// persisted config. Idempotent.
    pub fn leave(&self, tptr: HostThread, _now: i64, nwid: u64) -> Result<()> {
        let ctx = &self.ctx;
        let Some(network) = ctx.networks.write().remove(&nwid) else {
            return Ok(());
        };
        network.destroy();
        tracing::info!(nwid = format_args!("{:016x}", nwid), "left network");

        ctx.host.virtual_network_config(
            tptr,
            nwid,
            network.user_ptr(),
            VirtualNetworkConfigOperation::Destroy,
            &network.view(ctx.identity.address()),
        );
        ctx.host.state_delete(tptr, StateObjectKind::NetworkConfig, [nwid, 0]);
        Ok(())
    }

    pub fn multicast_subscribe(
        &self,
        tptr: HostThread,
        now: i64,
        nwid: u64,
        mac: Mac,
        adi: u32,
    ) -> Result<()> {
        let Some(network) = self.ctx.network(nwid) else {
            return Err(Error::NetworkNotFound);
        };
        network.multicast_subscribe(&self.ctx, tptr, MulticastGroup::new(mac, adi), now);
        Ok(())
    }

    pub fn multicast_unsubscribe(&self, nwid: u64, mac: Mac, adi: u32) -> Result<()> {
        let Some(network) = self.ctx.network(nwid) else {
            return Err(Error::NetworkNotFound);
        };
        network.multicast_unsubscribe(MulticastGroup::new(mac, adi));
        Ok(())
    }

    /// Add a moon (supplemental root set).
    pub fn orbit(&self, tptr: HostThread, now: i64, moon_world_id: u64, seed: Address) -> Result<()> {
        self.ctx.topology.add_moon(&self.ctx, tptr, moon_world_id, seed);
        if !seed.is_nil() {
            self.ctx.switch.request_whois(&self.ctx, tptr, now, seed);
        }
        Ok(())
    }

    pub fn deorbit(&self, tptr: HostThread, _now: i64, moon_world_id: u64) -> Result<()> {
        self.ctx.topology.remove_moon(&self.ctx, tptr, moon_world_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn peers(&self) -> Vec<PeerView> {
        let now = 0; // snapshots do not advance liveness
        let mut views: Vec<PeerView> = self
            .ctx
            .topology
            .all_peers()
            .iter()
            .map(|peer| {
                let best = peer.get_best_path(now, true, None);
                PeerView {
                    address: peer.address(),
                    version: peer.remote_version(),
                    latency: peer.latency(),
                    role: self.ctx.topology.role(peer.address()),
                    paths: peer
                        .paths_snapshot()
                        .iter()
                        .map(|p| PathView {
                            endpoint: p.endpoint(),
                            local_socket: p.local_socket(),
                            last_send: p.last_out(),
                            last_receive: p.last_in(),
                            trusted_path_id: p.trusted_path_id(),
                            link_quality: p.link_quality(),
                            preferred: best
                                .as_ref()
                                .map(|b| b.matches(p.local_socket(), p.endpoint()))
                                .unwrap_or(false),
                        })
                        .collect(),
                }
            })
            .collect();
        views.sort_by_key(|v| v.address);
        views
    }

    pub fn networks(&self) -> Vec<VirtualNetworkView> {
        let us = self.ctx.identity.address();
        let mut views: Vec<VirtualNetworkView> =
            self.ctx.networks.read().values().map(|n| n.view(us)).collect();
        views.sort_by_key(|v| v.nwid);
        views
    }

    pub fn network_config(&self, nwid: u64) -> Option<VirtualNetworkView> {
        self.ctx.network(nwid).map(|n| n.view(self.ctx.identity.address()))
    }

    // ------------------------------------------------------------------
    // Direct paths and user messages
    // ------------------------------------------------------------------

    /// Advertise a local interface address to peers. Returns false for
    /// addresses that can never carry a path.
    pub fn add_local_interface_address(&self, endpoint: Endpoint) -> bool {
        if !endpoint.is_valid_for_path() {
            return false;
        }
        let mut paths = self.ctx.direct_paths.lock();
        if paths.contains(&endpoint) {
            return false;
        }
        paths.push(endpoint);
        true
    }

    pub fn clear_local_interface_addresses(&self) {
        self.ctx.direct_paths.lock().clear();
    }

    /// Send an in-band user-defined message; delivered at the far end as
    /// `Event::UserMessage`.
    pub fn send_user_message(
        &self,
        tptr: HostThread,
        now: i64,
        dest: Address,
        type_id: u64,
        data: &[u8],
    ) -> bool {
        if dest == self.ctx.identity.address() || dest.is_reserved() {
            return false;
        }
        let mut packet = Packet::new(dest, self.ctx.identity.address(), Verb::UserMessage, 0);
        let mut body = Vec::with_capacity(8 + data.len());
        body.extend_from_slice(&type_id.to_be_bytes());
        body.extend_from_slice(data);
        packet.payload = body;
        packet.compress_payload();
        self.ctx.switch.send(&self.ctx, tptr, now, packet, true);
        true
    }

    pub fn set_trusted_paths(&self, paths: Vec<crate::topology::TrustedPath>) {
        self.ctx.topology.set_trusted_paths(paths);
    }

}
