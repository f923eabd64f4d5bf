//! Per-virtual-network state: lifecycle, configuration, credentials, and
//! the frame admission rule engine.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::credentials::{
    Capability, CertificateOfMembership, CredentialAcceptance, CredentialType, Revocation, Tag,
};
use crate::identity::Address;
use crate::mac::Mac;
use crate::multicaster::MulticastGroup;
use crate::node::{Context, HostThread, StateObjectKind};
use crate::wire::{Packet, Verb};

/// A config older than this is re-requested by the background pass.
pub const NETWORK_AUTOCONF_DELAY: i64 = 60_000;

/// How often we push our COM to members we are talking to.
pub const COM_SEND_INTERVAL: i64 = 60_000;

/// Members silent for this long drop out of the membership table.
const MEMBERSHIP_EXPIRE: i64 = 600_000;

/// Partial config-chunk assemblies are abandoned after this.
const CONFIG_CHUNK_TTL: i64 = 30_000;

/// A member considered "recently talked to" for credential pushes.
const MEMBER_RECENT: i64 = 120_000;

/// How often multicast subscriptions are re-LIKEd (they expire at ten
/// minutes on the receiving side).
const MULTICAST_ANNOUNCE_PERIOD: i64 = 60_000;

/// Largest accepted serialized network config.
const CONFIG_MAX_SIZE: usize = 1 << 20;

/// Lifecycle state reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    RequestingConfiguration,
    Ok,
    AccessDenied,
    NotFound,
    Destroyed,
}

/// Operation selector for the `virtual_network_config` host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualNetworkConfigOperation {
    Up,
    ConfigUpdate,
    Down,
    Destroy,
}

/// Read-only snapshot of a network for `networks()`/callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualNetworkView {
    pub nwid: u64,
    pub name: String,
    pub status: NetworkStatus,
    pub mac: Mac,
    pub mtu: u32,
    pub multicast_limit: u32,
    pub private: bool,
    pub revision: u64,
    pub bridging_allowed: bool,
}

// ============================================================================
// Rules
// ============================================================================

/// One entry in a network's rule list. Match rules AND together until an
/// action rule consumes them; an empty rule list accepts everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rule {
    ActionAccept,
    ActionDrop,
    MatchSourceAddress { not: bool, address: Address },
    MatchDestAddress { not: bool, address: Address },
    MatchEthertype { not: bool, ethertype: u16 },
    /// The counterparty's tag `id` must equal `value`.
    MatchTagEquals { not: bool, id: u32, value: u32 },
}

/// What a rule evaluation sees. `tag` resolves the counterparty member's
/// tag values; absent tags never match.
pub struct RuleEnv<'a> {
    pub src: Address,
    pub dest: Address,
    pub ethertype: u16,
    pub tag: &'a dyn Fn(u32) -> Option<u32>,
}

pub fn evaluate_rules(rules: &[Rule], env: &RuleEnv<'_>) -> bool {
    if rules.is_empty() {
        return true;
    }
    let mut matching = true;
    for rule in rules {
        match rule {
            Rule::ActionAccept => {
                if matching {
                    return true;
                }
                matching = true;
            }
            Rule::ActionDrop => {
                if matching {
                    return false;
                }
                matching = true;
            }
            Rule::MatchSourceAddress { not, address } => {
                matching &= (env.src == *address) != *not;
            }
            Rule::MatchDestAddress { not, address } => {
                matching &= (env.dest == *address) != *not;
            }
            Rule::MatchEthertype { not, ethertype } => {
                matching &= (env.ethertype == *ethertype) != *not;
            }
            Rule::MatchTagEquals { not, id, value } => {
                matching &= ((env.tag)(*id) == Some(*value)) != *not;
            }
        }
    }
    // Rules that end without an action reject by default.
    false
}

// ============================================================================
// NetworkConfig
// ============================================================================

/// A controller-issued configuration. Carried on the wire as signed
/// bincode chunks and cached via the host's state callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_id: u64,
    pub timestamp: i64,
    pub revision: u64,
    pub issued_to: Address,
    pub name: String,
    pub private: bool,
    pub mtu: u32,
    pub multicast_limit: u32,
    pub bridging_allowed: bool,
    pub com: CertificateOfMembership,
    pub capabilities: Vec<Capability>,
    pub tags: Vec<Tag>,
    pub rules: Vec<Rule>,
}

impl NetworkConfig {
    pub fn valid_for(&self, nwid: u64, us: Address) -> bool {
        self.network_id == nwid
            && self.issued_to == us
            && self.mtu >= 1280
            && self.multicast_limit > 0
    }
}

// ============================================================================
// Membership
// ============================================================================

/// Everything we know about one fellow member.
#[derive(Default)]
struct Membership {
    com: CertificateOfMembership,
    tags: HashMap<u32, Tag>,
    capabilities: HashMap<u32, Capability>,
    last_activity: i64,
    last_pushed_credentials: i64,
}

struct ChunkAssembly {
    arrived: i64,
    total_len: u32,
    chunks: HashMap<u32, Vec<u8>>,
}

struct NetworkInner {
    config: Option<NetworkConfig>,
    last_config_update: i64,
    last_config_request: i64,
    access_denied: bool,
    not_found: bool,
    destroyed: bool,
    memberships: HashMap<Address, Membership>,
    /// Revocations keyed by (issuer, revocation id).
    revocations: HashMap<(Address, u32), Revocation>,
    subscriptions: Vec<MulticastGroup>,
    last_announce: i64,
    assemblies: HashMap<u64, ChunkAssembly>,
}

pub struct Network {
    nwid: u64,
    user_ptr: u64,
    inner: Mutex<NetworkInner>,
}

impl Network {
    /// Create on `join` with no configuration yet. The winner of the
    /// networks-map insertion race calls [`Network::restore_cached_config`]
    /// afterwards, outside the map lock.
    pub fn new(nwid: u64, user_ptr: u64) -> Self {
        Self {
            nwid,
            user_ptr,
            inner: Mutex::new(NetworkInner {
                config: None,
                last_config_update: 0,
                last_config_request: 0,
                access_denied: false,
                not_found: false,
                destroyed: false,
                memberships: HashMap::new(),
                revocations: HashMap::new(),
                subscriptions: vec![
                    // Every member implicitly subscribes to broadcast.
                    MulticastGroup::new(Mac::from_u64(0xffff_ffff_ffff), 0),
                ],
                last_announce: 0,
                assemblies: HashMap::new(),
            }),
        }
    }

    /// Apply the host's cached config blob, if any survives its checksum.
    pub fn restore_cached_config(&self, ctx: &Context, tptr: HostThread, now: i64) {
        if let Some(blob) = ctx.host.state_get(tptr, StateObjectKind::NetworkConfig, [self.nwid, 0]) {
            if let Some(config) = decode_cached_config(&blob) {
                if config.valid_for(self.nwid, ctx.identity.address()) {
                    tracing::info!(
                        nwid = format_args!("{:016x}", self.nwid),
                        "restored cached network config"
                    );
                    self.set_configuration(ctx, tptr, config, false, now);
                }
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.nwid
    }

    pub fn user_ptr(&self) -> u64 {
        self.user_ptr
    }

    /// The controller is named by the upper 40 bits of the network id.
    pub fn controller(&self) -> Address {
        Address::from_u64(self.nwid >> 24)
    }

    pub fn status(&self) -> NetworkStatus {
        let inner = self.inner.lock();
        if inner.destroyed {
            NetworkStatus::Destroyed
        } else if inner.not_found {
            NetworkStatus::NotFound
        } else if inner.access_denied {
            NetworkStatus::AccessDenied
        } else if inner.config.is_some() {
            NetworkStatus::Ok
        } else {
            NetworkStatus::RequestingConfiguration
        }
    }

    pub fn has_config(&self) -> bool {
        self.inner.lock().config.is_some()
    }

    pub fn config_age(&self, now: i64) -> i64 {
        let inner = self.inner.lock();
        if inner.last_config_update == 0 { i64::MAX } else { now - inner.last_config_update }
    }

    pub fn multicast_limit(&self) -> u32 {
        self.inner.lock().config.as_ref().map(|c| c.multicast_limit).unwrap_or(32)
    }

    pub fn our_com(&self) -> Option<CertificateOfMembership> {
        self.inner.lock().config.as_ref().map(|c| c.com.clone()).filter(|c| c.is_set())
    }

    pub fn view(&self, us: Address) -> VirtualNetworkView {
        let status = self.status();
        let inner = self.inner.lock();
        let config = inner.config.as_ref();
        VirtualNetworkView {
            nwid: self.nwid,
            name: config.map(|c| c.name.clone()).unwrap_or_default(),
            status,
            mac: Mac::from_address(us, self.nwid),
            mtu: config.map(|c| c.mtu).unwrap_or(2800),
            multicast_limit: config.map(|c| c.multicast_limit).unwrap_or(32),
            private: config.map(|c| c.private).unwrap_or(true),
            revision: config.map(|c| c.revision).unwrap_or(0),
            bridging_allowed: config.map(|c| c.bridging_allowed).unwrap_or(false),
        }
    }

    // ------------------------------------------------------------------
    // Configuration lifecycle
    // ------------------------------------------------------------------

    /// Ask the controller for a (fresh) config.
    pub fn request_configuration(&self, ctx: &Context, tptr: HostThread, now: i64) {
        if self.inner.lock().destroyed {
            return;
        }
        let controller = self.controller();
        if controller == ctx.identity.address() {
            // We would be our own controller and no controller is embedded.
            self.set_not_found(ctx, tptr, now);
            return;
        }
        {
            let mut inner = self.inner.lock();
            if now - inner.last_config_request < 2_500 {
                return;
            }
            inner.last_config_request = now;
        }

        tracing::debug!(nwid = format_args!("{:016x}", self.nwid), %controller, "requesting network config");
        let mut packet = Packet::new(controller, ctx.identity.address(), Verb::NetworkConfigRequest, 0);
        let mut body = Vec::with_capacity(10);
        body.extend_from_slice(&self.nwid.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes()); // no request metadata
        packet.payload = body;
        ctx.switch.send(ctx, tptr, now, packet, true);
    }

    /// Ingest one signed config chunk (NETWORK_CONFIG or the OK form).
    ///
    /// Chunks ride packets already authenticated with the controller's
    /// pairwise key, and must additionally verify against the controller
    /// identity when we have it.
    pub fn handle_config_chunk(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        source: Address,
        payload: &[u8],
    ) {
        if source != self.controller() {
            return;
        }
        // [8 nwid][2 chunk_len][chunk][1 flags][8 update_id][4 total][4 index][sig tag 1,len][64 sig]
        if payload.len() < 10 {
            return;
        }
        let nwid = u64::from_be_bytes(payload[0..8].try_into().unwrap());
        if nwid != self.nwid {
            return;
        }
        let chunk_len = u16::from_be_bytes(payload[8..10].try_into().unwrap()) as usize;
        let mut p = 10;
        if payload.len() < p + chunk_len + 1 + 8 + 4 + 4 + 3 + 64 {
            return;
        }
        let chunk = &payload[p..p + chunk_len];
        p += chunk_len;
        let _flags = payload[p];
        p += 1;
        let update_id = u64::from_be_bytes(payload[p..p + 8].try_into().unwrap());
        p += 8;
        let total_len = u32::from_be_bytes(payload[p..p + 4].try_into().unwrap());
        p += 4;
        let chunk_index = u32::from_be_bytes(payload[p..p + 4].try_into().unwrap());
        p += 4;
        let signed_portion = &payload[..p];
        if payload[p] != 1 {
            return;
        }
        let sig_len = u16::from_be_bytes(payload[p + 1..p + 3].try_into().unwrap()) as usize;
        if sig_len != 64 || payload.len() < p + 3 + 64 {
            return;
        }
        let signature = &payload[p + 3..p + 3 + 64];

        if total_len as usize > CONFIG_MAX_SIZE
            || chunk_index as usize + chunk.len() > total_len as usize
        {
            return;
        }

        // Verify against the controller identity when resolvable.
        if let Some(controller_peer) = ctx.topology.get_peer_in_memory(source) {
            if !controller_peer.identity().verify_raw(signed_portion, signature) {
                ctx.trace.credential_rejected(self.nwid, source);
                return;
            }
        }

        let complete: Option<Vec<u8>> = {
            let mut inner = self.inner.lock();
            let assembly = inner.assemblies.entry(update_id).or_insert_with(|| ChunkAssembly {
                arrived: now,
                total_len,
                chunks: HashMap::new(),
            });
            if assembly.total_len != total_len {
                return;
            }
            assembly.chunks.insert(chunk_index, chunk.to_vec());

            let have: usize = assembly.chunks.values().map(|c| c.len()).sum();
            if have >= total_len as usize {
                let mut whole = vec![0u8; total_len as usize];
                let mut filled = 0usize;
                for (offset, bytes) in &assembly.chunks {
                    let start = *offset as usize;
                    whole[start..start + bytes.len()].copy_from_slice(bytes);
                    filled += bytes.len();
                }
                inner.assemblies.remove(&update_id);
                if filled == total_len as usize {
                    Some(whole)
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some(raw) = complete {
            if let Ok(config) = bincode::deserialize::<NetworkConfig>(&raw) {
                if config.valid_for(self.nwid, ctx.identity.address()) {
                    self.set_configuration(ctx, tptr, config, true, now);
                }
            }
        }
    }

    /// Apply a configuration. Stale revisions are dropped; acceptance
    /// clears error states and notifies the host.
    pub fn set_configuration(
        &self,
        ctx: &Context,
        tptr: HostThread,
        config: NetworkConfig,
        save: bool,
        now: i64,
    ) {
        let op = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            if let Some(existing) = &inner.config {
                if existing.revision >= config.revision {
                    return;
                }
            }
            let first = inner.config.is_none();
            inner.config = Some(config.clone());
            inner.last_config_update = now;
            inner.access_denied = false;
            inner.not_found = false;
            if first { VirtualNetworkConfigOperation::Up } else { VirtualNetworkConfigOperation::ConfigUpdate }
        };

        tracing::info!(
            nwid = format_args!("{:016x}", self.nwid),
            revision = config.revision,
            "network config applied"
        );
        if save {
            ctx.host.state_put(
                tptr,
                StateObjectKind::NetworkConfig,
                [self.nwid, 0],
                &encode_cached_config(&config),
            );
        }
        ctx.host.virtual_network_config(tptr, self.nwid, self.user_ptr, op, &self.view(ctx.identity.address()));
        // Subscriptions predate the config; advertise them now that we
        // know who to talk to.
        self.announce_multicast_groups(ctx, tptr, now);
    }

    pub fn set_access_denied(&self, ctx: &Context, tptr: HostThread, _now: i64) {
        {
            let mut inner = self.inner.lock();
            if inner.destroyed || inner.access_denied {
                return;
            }
            inner.access_denied = true;
        }
        tracing::warn!(nwid = format_args!("{:016x}", self.nwid), "network access denied");
        ctx.host.virtual_network_config(
            tptr,
            self.nwid,
            self.user_ptr,
            VirtualNetworkConfigOperation::Down,
            &self.view(ctx.identity.address()),
        );
    }

    pub fn set_not_found(&self, ctx: &Context, tptr: HostThread, _now: i64) {
        {
            let mut inner = self.inner.lock();
            if inner.destroyed || inner.not_found {
                return;
            }
            inner.not_found = true;
        }
        tracing::warn!(nwid = format_args!("{:016x}", self.nwid), "network not found");
        ctx.host.virtual_network_config(
            tptr,
            self.nwid,
            self.user_ptr,
            VirtualNetworkConfigOperation::Down,
            &self.view(ctx.identity.address()),
        );
    }

    /// Mark destroyed on `leave`; the Node drives the callback and state
    /// deletion after dropping its networks lock.
    pub fn destroy(&self) {
        self.inner.lock().destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    // ------------------------------------------------------------------
    // Frame admission
    // ------------------------------------------------------------------

    /// May a frame from `source` enter the host tap?
    pub fn gate_incoming_frame(
        &self,
        ctx: &Context,
        source: Address,
        _src_mac: Mac,
        _dest_mac: Mac,
        ethertype: u16,
        now: i64,
    ) -> bool {
        let inner = self.inner.lock();
        if inner.destroyed || inner.access_denied || inner.not_found {
            return false;
        }
        let Some(config) = &inner.config else {
            return false;
        };

        if config.private {
            let Some(membership) = inner.memberships.get(&source) else {
                return false;
            };
            if !Self::com_agrees(&inner, config, &membership.com, now) {
                return false;
            }
        }

        let member_tags = inner.memberships.get(&source);
        let tag_lookup = |id: u32| member_tags.and_then(|m| m.tags.get(&id)).map(|t| t.value);
        let env = RuleEnv {
            src: source,
            dest: ctx.identity.address(),
            ethertype,
            tag: &tag_lookup,
        };
        evaluate_rules(&config.rules, &env)
    }

    /// May a local frame leave toward `dest`? Mirrors the ingress gate.
    pub fn gate_outgoing_frame(&self, ctx: &Context, dest: Address, ethertype: u16) -> bool {
        let inner = self.inner.lock();
        if inner.destroyed || inner.access_denied || inner.not_found {
            return false;
        }
        let Some(config) = &inner.config else {
            return false;
        };
        let member_tags = inner.memberships.get(&dest);
        let tag_lookup = |id: u32| member_tags.and_then(|m| m.tags.get(&id)).map(|t| t.value);
        let env =
            RuleEnv { src: ctx.identity.address(), dest, ethertype, tag: &tag_lookup };
        evaluate_rules(&config.rules, &env)
    }

    fn com_agrees(
        inner: &NetworkInner,
        config: &NetworkConfig,
        their_com: &CertificateOfMembership,
        _now: i64,
    ) -> bool {
        if !their_com.is_set() || !config.com.is_set() {
            return false;
        }
        // Revocation fence applies before agreement.
        for rev in inner.revocations.values() {
            if rev.revokes(
                CredentialType::Com,
                0,
                their_com.issued_to(),
                their_com.timestamp(),
            ) {
                return false;
            }
        }
        config.com.agrees_with(their_com)
    }

    /// Note traffic from a member (drives credential pushes and cleanup).
    pub fn member_activity(&self, member: Address, now: i64) {
        let mut inner = self.inner.lock();
        let m = inner.memberships.entry(member).or_default();
        m.last_activity = m.last_activity.max(now);
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    /// Validate and store a COM. Tri-state: the signer (the controller)
    /// may not be resolvable yet, in which case a WHOIS is launched and
    /// the COM is held as pending by the caller re-sending it later.
    pub fn add_credential_com(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        com: CertificateOfMembership,
    ) -> CredentialAcceptance {
        if com.network_id() != self.nwid || com.signed_by() != self.controller() {
            ctx.trace.credential_rejected(self.nwid, com.issued_to());
            return CredentialAcceptance::Rejected;
        }
        let Some(signer) = ctx.topology.get_peer(ctx, tptr, com.signed_by()) else {
            ctx.switch.request_whois(ctx, tptr, now, com.signed_by());
            return CredentialAcceptance::Pending;
        };
        if !com.verify_signature(signer.identity()) {
            ctx.trace.credential_rejected(self.nwid, com.issued_to());
            return CredentialAcceptance::Rejected;
        }

        let mut inner = self.inner.lock();
        for rev in inner.revocations.values() {
            if rev.revokes(CredentialType::Com, 0, com.issued_to(), com.timestamp()) {
                return CredentialAcceptance::Rejected;
            }
        }
        let member = inner.memberships.entry(com.issued_to()).or_default();
        if com.timestamp() >= member.com.timestamp() {
            member.com = com;
        }
        CredentialAcceptance::Accepted
    }

    pub fn add_credential_tag(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        tag: Tag,
    ) -> CredentialAcceptance {
        if tag.network_id != self.nwid || tag.signed_by != self.controller() {
            ctx.trace.credential_rejected(self.nwid, tag.issued_to);
            return CredentialAcceptance::Rejected;
        }
        let Some(signer) = ctx.topology.get_peer(ctx, tptr, tag.signed_by) else {
            ctx.switch.request_whois(ctx, tptr, now, tag.signed_by);
            return CredentialAcceptance::Pending;
        };
        if !tag.verify_signature(signer.identity()) {
            ctx.trace.credential_rejected(self.nwid, tag.issued_to);
            return CredentialAcceptance::Rejected;
        }

        let mut inner = self.inner.lock();
        for rev in inner.revocations.values() {
            if rev.revokes(CredentialType::Tag, tag.id, tag.issued_to, tag.timestamp) {
                return CredentialAcceptance::Rejected;
            }
        }
        let member = inner.memberships.entry(tag.issued_to).or_default();
        let fresher = member.tags.get(&tag.id).map(|t| tag.timestamp >= t.timestamp).unwrap_or(true);
        if fresher {
            member.tags.insert(tag.id, tag);
        }
        CredentialAcceptance::Accepted
    }

    pub fn add_credential_capability(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        cap: Capability,
    ) -> CredentialAcceptance {
        if cap.network_id != self.nwid || cap.signed_by != self.controller() {
            ctx.trace.credential_rejected(self.nwid, cap.issued_to);
            return CredentialAcceptance::Rejected;
        }
        let Some(signer) = ctx.topology.get_peer(ctx, tptr, cap.signed_by) else {
            ctx.switch.request_whois(ctx, tptr, now, cap.signed_by);
            return CredentialAcceptance::Pending;
        };
        if !cap.verify_signature(signer.identity()) {
            ctx.trace.credential_rejected(self.nwid, cap.issued_to);
            return CredentialAcceptance::Rejected;
        }

        let mut inner = self.inner.lock();
        for rev in inner.revocations.values() {
            if rev.revokes(CredentialType::Capability, cap.id, cap.issued_to, cap.timestamp) {
                return CredentialAcceptance::Rejected;
            }
        }
        let member = inner.memberships.entry(cap.issued_to).or_default();
        member.capabilities.insert(cap.id, cap);
        CredentialAcceptance::Accepted
    }

    /// Apply a revocation: store the fence and void anything behind it.
    pub fn add_credential_revocation(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        rev: Revocation,
    ) -> CredentialAcceptance {
        if rev.network_id != self.nwid || rev.signed_by != self.controller() {
            return CredentialAcceptance::Rejected;
        }
        let Some(signer) = ctx.topology.get_peer(ctx, tptr, rev.signed_by) else {
            ctx.switch.request_whois(ctx, tptr, now, rev.signed_by);
            return CredentialAcceptance::Pending;
        };
        if !rev.verify_signature(signer.identity()) {
            return CredentialAcceptance::Rejected;
        }

        let mut inner = self.inner.lock();
        inner.revocations.insert((rev.signed_by, rev.id), rev.clone());
        for member in inner.memberships.values_mut() {
            if rev.revokes(CredentialType::Com, 0, member.com.issued_to(), member.com.timestamp()) {
                member.com = CertificateOfMembership::default();
            }
            member
                .tags
                .retain(|id, t| !rev.revokes(CredentialType::Tag, *id, t.issued_to, t.timestamp));
            member.capabilities.retain(|id, c| {
                !rev.revokes(CredentialType::Capability, *id, c.issued_to, c.timestamp)
            });
        }
        CredentialAcceptance::Accepted
    }

    /// Push COM + relevant credentials to recently-active members, and
    /// refresh our multicast LIKEs before they expire remotely.
    pub fn send_updates_to_members(&self, ctx: &Context, tptr: HostThread, now: i64) {
        let announce_due = {
            let inner = self.inner.lock();
            inner.config.is_some()
                && !inner.destroyed
                && now - inner.last_announce >= MULTICAST_ANNOUNCE_PERIOD
        };
        if announce_due {
            self.announce_multicast_groups(ctx, tptr, now);
        }

        let Some(com) = self.our_com() else {
            return;
        };
        let due: Vec<Address> = {
            let mut inner = self.inner.lock();
            let due: Vec<Address> = inner
                .memberships
                .iter()
                .filter(|(_, m)| {
                    now - m.last_activity < MEMBER_RECENT
                        && now - m.last_pushed_credentials >= COM_SEND_INTERVAL
                })
                .map(|(a, _)| *a)
                .collect();
            for addr in &due {
                if let Some(m) = inner.memberships.get_mut(addr) {
                    m.last_pushed_credentials = now;
                }
            }
            due
        };

        for member in due {
            self.push_credentials(ctx, tptr, now, member, &com);
        }
    }

    /// One credential push to one member (also used on first contact).
    pub fn push_credentials(
        &self,
        ctx: &Context,
        tptr: HostThread,
        now: i64,
        member: Address,
        com: &CertificateOfMembership,
    ) {
        let mut packet = Packet::new(member, ctx.identity.address(), Verb::NetworkCredentials, 0);
        let mut body = Vec::new();
        body.push(1u8); // COM count
        body.extend_from_slice(&com.serialize());
        body.extend_from_slice(&0u16.to_be_bytes()); // capabilities
        body.extend_from_slice(&0u16.to_be_bytes()); // tags
        body.extend_from_slice(&0u16.to_be_bytes()); // revocations
        packet.payload = body;
        packet.compress_payload();
        ctx.switch.send(ctx, tptr, now, packet, true);
    }

    // ------------------------------------------------------------------
    // Multicast
    // ------------------------------------------------------------------

    pub fn multicast_subscribe(&self, ctx: &Context, tptr: HostThread, group: MulticastGroup, now: i64) {
        {
            let mut inner = self.inner.lock();
            if inner.subscriptions.contains(&group) {
                return;
            }
            inner.subscriptions.push(group);
        }
        self.announce_multicast_groups(ctx, tptr, now);
    }

    pub fn multicast_unsubscribe(&self, group: MulticastGroup) {
        self.inner.lock().subscriptions.retain(|g| *g != group);
    }

    pub fn subscriptions(&self) -> Vec<MulticastGroup> {
        self.inner.lock().subscriptions.clone()
    }

    /// LIKE all our groups to upstreams, the controller, and members we
    /// have talked to recently.
    pub fn announce_multicast_groups(&self, ctx: &Context, tptr: HostThread, now: i64) {
        let groups = self.subscriptions();
        if groups.is_empty() {
            return;
        }
        self.inner.lock().last_announce = now;

        let mut targets: Vec<Address> = Vec::new();
        for (addr, _) in ctx.topology.upstreams_to_contact() {
            if !targets.contains(&addr) {
                targets.push(addr);
            }
        }
        let controller = self.controller();
        if controller != ctx.identity.address() && !targets.contains(&controller) {
            targets.push(controller);
        }
        {
            let inner = self.inner.lock();
            for (addr, m) in &inner.memberships {
                if now - m.last_activity < MEMBER_RECENT && !targets.contains(addr) {
                    targets.push(*addr);
                }
            }
        }

        let mut body = Vec::with_capacity(groups.len() * 18);
        for group in &groups {
            body.extend_from_slice(&self.nwid.to_be_bytes());
            group.append_to(&mut body);
        }

        for target in targets {
            let mut packet =
                Packet::new(target, ctx.identity.address(), Verb::MulticastLike, 0);
            packet.payload = body.clone();
            ctx.switch.send(ctx, tptr, now, packet, true);
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    pub fn clean(&self, now: i64) {
        let mut inner = self.inner.lock();
        inner.memberships.retain(|_, m| now - m.last_activity < MEMBERSHIP_EXPIRE);
        inner.assemblies.retain(|_, a| now - a.arrived < CONFIG_CHUNK_TTL);
    }
}

fn encode_cached_config(config: &NetworkConfig) -> Vec<u8> {
    let body = bincode::serialize(config).unwrap_or_default();
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

fn decode_cached_config(blob: &[u8]) -> Option<NetworkConfig> {
    if blob.len() < 4 {
        return None;
    }
    let stored = u32::from_le_bytes(blob[..4].try_into().unwrap());
    if crc32fast::hash(&blob[4..]) != stored {
        return None;
    }
    bincode::deserialize(&blob[4..]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_none(_: u32) -> Option<u32> {
        None
    }

    #[test]
    fn test_empty_rules_accept() {
        let env = RuleEnv {
            src: Address::from_u64(1),
            dest: Address::from_u64(2),
            ethertype: 0x0800,
            tag: &tag_none,
        };
        assert!(evaluate_rules(&[], &env));
    }

    #[test]
    fn test_match_then_action() {
        let rules = vec![
            Rule::MatchEthertype { not: false, ethertype: 0x0806 },
            Rule::ActionDrop,
            Rule::ActionAccept,
        ];
        let arp = RuleEnv {
            src: Address::from_u64(1),
            dest: Address::from_u64(2),
            ethertype: 0x0806,
            tag: &tag_none,
        };
        let ip = RuleEnv {
            src: Address::from_u64(1),
            dest: Address::from_u64(2),
            ethertype: 0x0800,
            tag: &tag_none,
        };
        assert!(!evaluate_rules(&rules, &arp), "ARP matches the drop");
        assert!(evaluate_rules(&rules, &ip), "IP falls through to accept");
    }

    #[test]
    fn test_negated_match() {
        let rules = vec![
            Rule::MatchSourceAddress { not: true, address: Address::from_u64(0xaaa) },
            Rule::ActionDrop,
            Rule::ActionAccept,
        ];
        let from_friend = RuleEnv {
            src: Address::from_u64(0xaaa),
            dest: Address::from_u64(2),
            ethertype: 0x0800,
            tag: &tag_none,
        };
        let from_other = RuleEnv {
            src: Address::from_u64(0xbbb),
            dest: Address::from_u64(2),
            ethertype: 0x0800,
            tag: &tag_none,
        };
        assert!(evaluate_rules(&rules, &from_friend));
        assert!(!evaluate_rules(&rules, &from_other));
    }

    #[test]
    fn test_tag_match() {
        let rules = vec![
            Rule::MatchTagEquals { not: false, id: 7, value: 42 },
            Rule::ActionAccept,
        ];
        let tagged = |id: u32| if id == 7 { Some(42) } else { None };
        let untagged = |_: u32| None;
        fn mk<'a>(tag: &'a dyn Fn(u32) -> Option<u32>) -> RuleEnv<'a> {
            RuleEnv {
                src: Address::from_u64(1),
                dest: Address::from_u64(2),
                ethertype: 0x0800,
                tag,
            }
        }
        assert!(evaluate_rules(&rules, &mk(&tagged)));
        // No action fires, so the trailing default (drop) applies.
        assert!(!evaluate_rules(&rules, &mk(&untagged)));
    }

    #[test]
    fn test_rules_without_action_default_drop() {
        let rules = vec![Rule::MatchEthertype { not: false, ethertype: 0x0800 }];
        let env = RuleEnv {
            src: Address::from_u64(1),
            dest: Address::from_u64(2),
            ethertype: 0x0800,
            tag: &tag_none,
        };
        assert!(!evaluate_rules(&rules, &env));
    }

    #[test]
    fn test_cached_config_checksum() {
        let config = NetworkConfig {
            network_id: 0x8056c2e21c000001,
            timestamp: 1000,
            revision: 3,
            issued_to: Address::from_u64(0xabc),
            name: "mesh0".into(),
            private: true,
            mtu: 2800,
            multicast_limit: 32,
            bridging_allowed: false,
            com: CertificateOfMembership::default(),
            capabilities: vec![],
            tags: vec![],
            rules: vec![Rule::ActionAccept],
        };
        let blob = encode_cached_config(&config);
        assert_eq!(decode_cached_config(&blob).unwrap(), config);

        let mut corrupted = blob;
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;
        assert!(decode_cached_config(&corrupted).is_none());
    }

    #[test]
    fn test_controller_address_is_upper_40_bits() {
        // Cannot build a Network without a Context; the address math is a
        // pure function of the id.
        let nwid = 0x1122334455_000001u64;
        assert_eq!(Address::from_u64(nwid >> 24), Address::from_u64(0x1122334455));
    }

    #[test]
    fn test_config_validity() {
        let mut config = NetworkConfig {
            network_id: 1,
            timestamp: 0,
            revision: 1,
            issued_to: Address::from_u64(0xabc),
            name: String::new(),
            private: true,
            mtu: 2800,
            multicast_limit: 32,
            bridging_allowed: false,
            com: CertificateOfMembership::default(),
            capabilities: vec![],
            tags: vec![],
            rules: vec![],
        };
        assert!(config.valid_for(1, Address::from_u64(0xabc)));
        assert!(!config.valid_for(2, Address::from_u64(0xabc)));
        assert!(!config.valid_for(1, Address::from_u64(0xdef)));
        config.mtu = 100;
        assert!(!config.valid_for(1, Address::from_u64(0xabc)));
    }
}
