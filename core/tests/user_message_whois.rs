//! WHOIS resolution with buffering, relaying through the root, and
//! fragmented delivery of large payloads.

mod common;

use common::{decode_captured, tptr, TestNet};
use weft_core::{Event, Verb};

/// Establish A(root)/B/C adjacency via background passes.
fn converged_net() -> TestNet {
    let net = TestNet::new(&[
        "198.51.100.1:9993",
        "198.51.100.2:9993",
        "198.51.100.3:9993",
    ]);
    net.converge(10_000);
    net
}

#[test]
fn test_user_message_to_unknown_peer_goes_via_whois() {
    let net = converged_net();
    let (a, b, c) = (net.member(0), net.member(1), net.member(2));
    b.host.drain_outbox();

    // B has never talked to C: the message parks behind a WHOIS.
    assert!(b.node.send_user_message(tptr(), 20_000, c.identity.address(), 7, b"hi"));

    let sent = b.host.outbox_snapshot();
    let whois = sent
        .iter()
        .map(|p| decode_captured(p, &b.identity, &a.identity))
        .find(|p| p.verb == Verb::Whois)
        .expect("WHOIS to the upstream");
    assert_eq!(whois.dest, a.identity.address());
    assert_eq!(whois.payload, c.identity.address().to_bytes());

    // Let the bus carry WHOIS → identity → buffered message.
    net.pump(20_002);

    let delivered = c.host.events_snapshot();
    let message = delivered
        .iter()
        .find_map(|e| match e {
            Event::UserMessage { source, type_id, data } => Some((*source, *type_id, data.clone())),
            _ => None,
        })
        .expect("user message delivered after WHOIS resolution");
    assert_eq!(message, (b.identity.address(), 7, b"hi".to_vec()));
}

#[test]
fn test_large_user_message_survives_fragmentation() {
    let net = converged_net();
    let (_, b, c) = (net.member(0), net.member(1), net.member(2));

    // Incompressible payload three MTUs long.
    use rand::RngCore;
    let mut payload = vec![0u8; 3_200];
    rand::rngs::OsRng.fill_bytes(&mut payload);

    assert!(b.node.send_user_message(tptr(), 21_000, c.identity.address(), 9, &payload));
    net.pump(21_001);

    let received = c
        .host
        .events_snapshot()
        .into_iter()
        .find_map(|e| match e {
            Event::UserMessage { type_id: 9, data, .. } => Some(data),
            _ => None,
        })
        .expect("fragmented message reassembled");
    assert_eq!(received, payload);
}

#[test]
fn test_whois_for_nonexistent_address_is_abandoned() {
    let net = converged_net();
    let b = net.member(1);
    b.host.drain_outbox();

    let ghost = weft_core::Address::from_u64(0x0102030405);
    assert!(b.node.send_user_message(tptr(), 30_000, ghost, 7, b"hello?"));
    net.pump(30_001); // root answers ERROR(ObjNotFound)

    // Walk time past the retry budget; the request dies quietly.
    let mut now = 30_002;
    for _ in 0..8 {
        now += 600;
        b.node.process_background_tasks(tptr(), now).unwrap();
        net.pump(now);
    }
    // No delivery anywhere, and B is still healthy.
    assert!(b.node.status().address == b.identity.address());
    assert!(!b
        .host
        .events_snapshot()
        .iter()
        .any(|e| matches!(e, Event::UserMessage { .. })));
}
