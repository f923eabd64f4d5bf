//! Shared test rig: an in-memory host and a little packet bus that wires
//! several nodes together by endpoint.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use weft_core::credentials::CertificateOfMembership;
use weft_core::network::{NetworkConfig, VirtualNetworkConfigOperation, VirtualNetworkView};
use weft_core::wire::{CipherSuite, Packet, Verb};
use weft_core::world::{Root, World, WorldType};
use weft_core::{
    Endpoint, Event, HostThread, Identity, Mac, Node, NodeHost, NodeOptions, StateObjectKind,
};

pub fn tptr() -> HostThread {
    HostThread(0)
}

pub fn ep(s: &str) -> Endpoint {
    Endpoint(s.parse().unwrap())
}

#[derive(Debug, Clone)]
pub struct SentPacket {
    pub local_socket: i64,
    pub remote: Endpoint,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DeliveredFrame {
    pub nwid: u64,
    pub src_mac: Mac,
    pub dest_mac: Mac,
    pub ethertype: u16,
    pub data: Vec<u8>,
}

/// In-memory host: records everything the node hands back, stores state
/// blobs in a map.
#[derive(Default)]
pub struct TestHost {
    pub outbox: Mutex<VecDeque<SentPacket>>,
    pub frames: Mutex<Vec<DeliveredFrame>>,
    pub events: Mutex<Vec<Event>>,
    pub config_ops: Mutex<Vec<(u64, VirtualNetworkConfigOperation)>>,
    pub store: Mutex<HashMap<(StateObjectKind, u64, u64), Vec<u8>>>,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pre-provision an identity so the node under test has a known key.
    pub fn seed_identity(&self, identity: &Identity) {
        self.store.lock().unwrap().insert(
            (StateObjectKind::IdentitySecret, 0, 0),
            identity.to_text(true).as_bytes().to_vec(),
        );
    }

    pub fn seed_planet(&self, planet: &World) {
        self.store
            .lock()
            .unwrap()
            .insert((StateObjectKind::Planet, 0, 0), planet.serialize());
    }

    pub fn drain_outbox(&self) -> Vec<SentPacket> {
        self.outbox.lock().unwrap().drain(..).collect()
    }

    /// Peek without consuming (the bus can still deliver these).
    pub fn outbox_snapshot(&self) -> Vec<SentPacket> {
        self.outbox.lock().unwrap().iter().cloned().collect()
    }

    pub fn events_snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn frames_snapshot(&self) -> Vec<DeliveredFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn config_ops_snapshot(&self) -> Vec<(u64, VirtualNetworkConfigOperation)> {
        self.config_ops.lock().unwrap().clone()
    }

    pub fn has_state(&self, kind: StateObjectKind, id: [u64; 2]) -> bool {
        self.store.lock().unwrap().contains_key(&(kind, id[0], id[1]))
    }
}

impl NodeHost for TestHost {
    fn wire_packet_send(
        &self,
        _tptr: HostThread,
        local_socket: i64,
        remote: Endpoint,
        data: &[u8],
    ) -> bool {
        self.outbox
            .lock()
            .unwrap()
            .push_back(SentPacket { local_socket, remote, data: data.to_vec() });
        true
    }

    fn virtual_network_frame(
        &self,
        _tptr: HostThread,
        nwid: u64,
        _user_ptr: u64,
        src_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        _vlan: u16,
        data: &[u8],
    ) {
        self.frames
            .lock()
            .unwrap()
            .push(DeliveredFrame { nwid, src_mac, dest_mac, ethertype, data: data.to_vec() });
    }

    fn virtual_network_config(
        &self,
        _tptr: HostThread,
        nwid: u64,
        _user_ptr: u64,
        op: VirtualNetworkConfigOperation,
        _config: &VirtualNetworkView,
    ) {
        self.config_ops.lock().unwrap().push((nwid, op));
    }

    fn event(&self, _tptr: HostThread, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn state_put(&self, _tptr: HostThread, kind: StateObjectKind, id: [u64; 2], data: &[u8]) -> bool {
        self.store.lock().unwrap().insert((kind, id[0], id[1]), data.to_vec());
        true
    }

    fn state_get(&self, _tptr: HostThread, kind: StateObjectKind, id: [u64; 2]) -> Option<Vec<u8>> {
        self.store.lock().unwrap().get(&(kind, id[0], id[1])).cloned()
    }

    fn state_delete(&self, _tptr: HostThread, kind: StateObjectKind, id: [u64; 2]) {
        self.store.lock().unwrap().remove(&(kind, id[0], id[1]));
    }
}

/// One node on the bus.
pub struct NetMember {
    pub endpoint: Endpoint,
    pub host: Arc<TestHost>,
    pub node: Node,
    pub identity: Identity,
}

/// A handful of nodes wired together by endpoint. Datagrams addressed to
/// an endpoint nobody owns vanish, like the real internet.
pub struct TestNet {
    pub members: Vec<NetMember>,
}

impl TestNet {
    /// Build a net whose first member is the planet root.
    pub fn new(endpoints: &[&str]) -> Self {
        let identities: Vec<Identity> = endpoints.iter().map(|_| Identity::generate()).collect();
        let root_endpoint = ep(endpoints[0]);

        let planet_key = {
            use rand::RngCore;
            let mut seed = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut seed);
            ed25519_dalek::SigningKey::from_bytes(&seed)
        };
        let planet = World::create(
            WorldType::Planet,
            0x6057,
            1,
            vec![Root {
                identity: identities[0].public_only(),
                stable_endpoints: vec![root_endpoint],
            }],
            &planet_key,
            None,
        );

        let members = endpoints
            .iter()
            .zip(identities)
            .map(|(endpoint, identity)| {
                let host = TestHost::new();
                host.seed_identity(&identity);
                host.seed_planet(&planet);
                let node = Node::new(host.clone(), NodeOptions::default(), tptr(), 1_000).unwrap();
                NetMember { endpoint: ep(endpoint), host, node, identity }
            })
            .collect();

        Self { members }
    }

    pub fn member(&self, index: usize) -> &NetMember {
        &self.members[index]
    }

    /// Deliver queued datagrams until the bus goes quiet.
    pub fn pump(&self, now: i64) {
        for _ in 0..64 {
            let mut moved = false;
            for sender in &self.members {
                let pending = sender.host.drain_outbox();
                for packet in pending {
                    if let Some(receiver) =
                        self.members.iter().find(|m| m.endpoint == packet.remote)
                    {
                        moved = true;
                        receiver
                            .node
                            .process_wire_packet(tptr(), now, 1, sender.endpoint, &packet.data)
                            .unwrap();
                    }
                }
            }
            if !moved {
                return;
            }
        }
        panic!("bus never went quiet");
    }

    pub fn tick_all(&self, now: i64) {
        for member in &self.members {
            member.node.process_background_tasks(tptr(), now).unwrap();
        }
    }

    /// Tick + pump until everyone has exchanged HELLOs with the root.
    pub fn converge(&self, now: i64) {
        for round in 0..4 {
            self.tick_all(now + round);
            self.pump(now + round);
        }
    }

    /// Inject a raw datagram into member `index` from an arbitrary source
    /// endpoint (something not on the bus).
    pub fn inject(&self, index: usize, now: i64, from: Endpoint, data: &[u8]) {
        self.members[index].node.process_wire_packet(tptr(), now, 1, from, data).unwrap();
    }
}

// ============================================================================
// Packet crafting (the tests play the part of remote implementations)
// ============================================================================

pub fn agreed_key(a: &Identity, b: &Identity) -> [u8; 32] {
    *a.agree(&b.public_only()).expect("agreement")
}

/// A HELLO as a remote node would emit it.
pub fn craft_hello(from: &Identity, to: &Identity, to_endpoint: Endpoint, now: i64) -> Vec<u8> {
    let mut packet = Packet::new(to.address(), from.address(), Verb::Hello, 0x4242_0001);
    packet.cipher = CipherSuite::AuthOnly;

    let mut payload = Vec::new();
    payload.push(1u8); // proto version
    payload.push(0u8);
    payload.push(0u8);
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&now.to_be_bytes());
    from.append_to(&mut payload);
    to_endpoint.append_to(&mut payload);
    payload.extend_from_slice(&0u64.to_be_bytes()); // no planet claim
    payload.extend_from_slice(&0i64.to_be_bytes());
    packet.payload = payload;

    packet.encode(&agreed_key(from, to)).unwrap()
}

/// A minimal, valid network config issued to `member`.
pub fn make_config(ctrl: &Identity, nwid: u64, member: &Identity, revision: u64) -> NetworkConfig {
    let mut com = CertificateOfMembership::new(1_000, 60_000, nwid, member.address());
    com.sign(ctrl);
    NetworkConfig {
        network_id: nwid,
        timestamp: 1_000,
        revision,
        issued_to: member.address(),
        name: "weft-test".into(),
        private: false,
        mtu: 2800,
        multicast_limit: 32,
        bridging_allowed: false,
        com,
        capabilities: vec![],
        tags: vec![],
        rules: vec![],
    }
}

/// The controller's OK(NETWORK_CONFIG_REQUEST) carrying a whole config as
/// a single signed chunk.
pub fn craft_config_ok(ctrl: &Identity, to: &Identity, config: &NetworkConfig) -> Vec<u8> {
    let raw = bincode::serialize(config).unwrap();
    let nwid = config.network_id;

    let mut chunk_payload = Vec::new();
    chunk_payload.extend_from_slice(&nwid.to_be_bytes());
    chunk_payload.extend_from_slice(&(raw.len() as u16).to_be_bytes());
    chunk_payload.extend_from_slice(&raw);
    chunk_payload.push(0u8); // flags
    chunk_payload.extend_from_slice(&0x1111_2222_3333_4444u64.to_be_bytes()); // update id
    chunk_payload.extend_from_slice(&(raw.len() as u32).to_be_bytes()); // total
    chunk_payload.extend_from_slice(&0u32.to_be_bytes()); // index

    let signature = ctrl.sign_raw(&chunk_payload).unwrap();
    chunk_payload.push(1u8);
    chunk_payload.extend_from_slice(&64u16.to_be_bytes());
    chunk_payload.extend_from_slice(&signature);

    let mut body = Vec::new();
    body.push(Verb::NetworkConfigRequest.as_u8());
    body.extend_from_slice(&0x9999u64.to_be_bytes()); // in-re packet id
    body.extend_from_slice(&chunk_payload);

    let mut packet = Packet::new(to.address(), ctrl.address(), Verb::Ok, 0x4242_0002);
    packet.payload = body;
    packet.encode(&agreed_key(ctrl, to)).unwrap()
}

/// A controller ERROR in response to a config request.
pub fn craft_config_error(ctrl: &Identity, to: &Identity, nwid: u64, code: u8) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(Verb::NetworkConfigRequest.as_u8());
    body.extend_from_slice(&0x9999u64.to_be_bytes());
    body.push(code);
    body.extend_from_slice(&nwid.to_be_bytes());

    let mut packet = Packet::new(to.address(), ctrl.address(), Verb::Error, 0x4242_0003);
    packet.payload = body;
    packet.encode(&agreed_key(ctrl, to)).unwrap()
}

/// Decode a captured outbound datagram with the pairwise key of its two
/// parties (panics on fragments; pick whole packets).
pub fn decode_captured(packet: &SentPacket, a: &Identity, b: &Identity) -> Packet {
    Packet::decode(&packet.data, &agreed_key(a, b)).unwrap()
}
