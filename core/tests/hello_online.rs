//! The HELLO handshake and the online/offline flip, driven through two
//! real nodes and a root.

mod common;

use common::{decode_captured, tptr, TestNet};
use weft_core::peer::PEER_ACTIVITY_TIMEOUT;
use weft_core::{Event, Verb};

#[test]
fn test_hello_handshake_builds_peer_and_path() {
    let net = TestNet::new(&["198.51.100.1:9993", "198.51.100.2:9993"]);
    let (a, b) = (net.member(0), net.member(1));

    // First background pass: B (a leaf) HELLOs the root's stable endpoint.
    b.node.process_background_tasks(tptr(), 10_000).unwrap();
    let sent = b.host.drain_outbox();
    let hello = sent
        .iter()
        .find(|p| p.remote == a.endpoint)
        .expect("background pass should HELLO the root");
    let decoded = decode_captured(hello, &b.identity, &a.identity);
    assert_eq!(decoded.verb, Verb::Hello);
    assert_eq!(decoded.dest, a.identity.address());
    assert_eq!(decoded.source, b.identity.address());

    // Deliver the HELLO: A builds Peer(B) with one path at B's endpoint.
    a.node.process_wire_packet(tptr(), 10_050, 1, b.endpoint, &hello.data).unwrap();
    let a_peers = a.node.peers();
    let peer_b = a_peers.iter().find(|p| p.address == b.identity.address()).expect("peer created");
    assert_eq!(peer_b.paths.len(), 1);
    assert_eq!(peer_b.paths[0].endpoint, b.endpoint);
    assert!(peer_b.paths[0].preferred);

    // A replied OK(HELLO) over the same path.
    let replies = a.host.drain_outbox();
    let ok = replies.iter().find(|p| p.remote == b.endpoint).expect("OK reply");
    let decoded = decode_captured(ok, &a.identity, &b.identity);
    assert_eq!(decoded.verb, Verb::Ok);
    assert_eq!(decoded.payload[0], Verb::Hello.as_u8());

    // B ingests the OK: latency learned, version learned.
    b.node.process_wire_packet(tptr(), 10_100, 1, a.endpoint, &ok.data).unwrap();
    let b_peers = b.node.peers();
    let peer_a = b_peers.iter().find(|p| p.address == a.identity.address()).unwrap();
    assert!(peer_a.latency > 0, "OK echo should establish a latency sample");
    assert!(peer_a.version.is_some());
    assert_eq!(peer_a.role, weft_core::Role::Planet);

    // A's next outbound to B goes straight out the learned path.
    assert!(a.node.send_user_message(tptr(), 10_200, b.identity.address(), 7, b"direct"));
    let direct = a.host.drain_outbox();
    assert!(direct.iter().any(|p| p.remote == b.endpoint));
}

#[test]
fn test_online_then_offline_flip() {
    let net = TestNet::new(&["198.51.100.1:9993", "198.51.100.2:9993"]);
    let b = net.member(1);

    // Converge: HELLO out, OK back.
    net.tick_all(10_000);
    net.pump(10_050);
    assert!(!b.host.events_snapshot().contains(&Event::Online), "not online before a ping pass sees the reply");

    // The next ping pass observes recent upstream traffic.
    b.node.process_background_tasks(tptr(), 16_000).unwrap();
    assert!(b.host.events_snapshot().contains(&Event::Online));
    assert!(b.node.status().online);

    // Upstream silence beyond the activity timeout flips it back.
    let later = 16_000 + PEER_ACTIVITY_TIMEOUT + 5_000;
    b.node.process_background_tasks(tptr(), later).unwrap();
    let events = b.host.events_snapshot();
    assert!(events.contains(&Event::Offline));
    assert!(!b.node.status().online);
}

#[test]
fn test_deadline_is_bounded() {
    let net = TestNet::new(&["198.51.100.1:9993"]);
    let a = net.member(0);
    let deadline = a.node.process_background_tasks(tptr(), 10_000).unwrap();
    assert!(deadline > 10_000);
    assert!(deadline <= 10_000 + weft_core::node::PING_CHECK_INTERVAL);
}
