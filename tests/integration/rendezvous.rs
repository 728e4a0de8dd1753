use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use overmesh_core::config::RendezvousConfig;
use overmesh_core::{Encoding, RendezvousMessage, WireMessage};
use overmesh_services::{
    ConnectionState, Destination, MemoryNetwork, RendezvousEvent, RendezvousEventKind, Transport,
};

use crate::*;

/// Two seeds, target of one: the first offer wins, the second is ignored,
/// and a zero-lease renewal from the winner ends the connection.
#[test]
fn first_offer_wins_and_zero_lease_disconnects() {
    let net = MemoryNetwork::new();
    let a = spawn_node(&net, "rdv-a", rendezvous_config(), &[]);
    let b = spawn_node(&net, "rdv-b", rendezvous_config(), &[]);
    let edge = spawn_node(&net, "edge", edge_config(), &["mem://rdv-a", "mem://rdv-b"]);
    let mut events = edge.rendezvous.subscribe();

    let result = (|| -> Result<()> {
        let report = edge.rendezvous.tick();
        assert_eq!(report.lease_requests, 2);
        net.run_until_idle();

        assert!(edge.rendezvous.is_connected(&a.peer));
        assert!(!edge.rendezvous.is_connected(&b.peer));
        assert_eq!(edge.rendezvous.connection_count(), 1);
        assert_eq!(
            events.try_recv()?,
            RendezvousEvent {
                kind: RendezvousEventKind::Connected,
                peer: a.peer,
            }
        );
        assert!(events.try_recv().is_err(), "second offer must not raise an event");

        send_rendezvous(
            &a,
            &edge.peer,
            &RendezvousMessage::LeaseReply {
                descriptor: a.rendezvous.local_descriptor().clone(),
                lease_ms: 0,
            },
        )?;
        net.run_until_idle();

        assert_eq!(edge.rendezvous.connection_count(), 0);
        assert_eq!(
            events.try_recv()?,
            RendezvousEvent {
                kind: RendezvousEventKind::DisconnectedByPeer,
                peer: a.peer,
            }
        );
        Ok(())
    })();

    if let Err(e) = result {
        panic!("first_offer_wins_and_zero_lease_disconnects: {e}");
    }
}

/// A 300 s lease with a 60 s margin is renewed 240 s in, not before.
#[test]
fn renewal_fires_at_lease_minus_margin() {
    let net = MemoryNetwork::new();
    let rdv = spawn_node(
        &net,
        "rdv",
        RendezvousConfig {
            granted_lease_ms: 300_000,
            ..rendezvous_config()
        },
        &[],
    );
    let edge = spawn_node(
        &net,
        "edge",
        RendezvousConfig {
            renewal_margin_ms: 60_000,
            ..edge_config()
        },
        &[],
    );
    lease(&net, &edge, &rdv);

    let snap = edge.rendezvous.connection(&rdv.peer).unwrap();
    assert_eq!(snap.renewal_margin_ms, 60_000);
    assert_eq!(snap.renew_at(), snap.lease_start + Duration::from_secs(240));

    let early = edge
        .rendezvous
        .tick_at(snap.renew_at() - Duration::from_millis(1));
    assert_eq!(early.renewals, 0);
    assert_eq!(net.pending(), 0);

    let mut events = edge.rendezvous.subscribe();
    let due = edge.rendezvous.tick_at(snap.renew_at());
    assert_eq!(due.renewals, 1);
    assert_eq!(
        edge.rendezvous.connection(&rdv.peer).unwrap().state,
        ConnectionState::RenewalPending
    );

    net.run_until_idle();
    assert_eq!(
        events.try_recv().unwrap().kind,
        RendezvousEventKind::Reconnected
    );
    let renewed = edge.rendezvous.connection(&rdv.peer).unwrap();
    assert_eq!(renewed.state, ConnectionState::Leased);
    assert!(renewed.lease_start >= snap.lease_start);
}

/// An elapsed lease is reported once, even when the rendezvous' disconnect
/// notice arrives afterwards.
#[test]
fn elapsed_lease_is_removed_once() {
    let net = MemoryNetwork::new();
    let rdv = spawn_node(&net, "rdv", rendezvous_config(), &[]);
    let edge = spawn_node(&net, "edge", edge_config(), &[]);
    lease(&net, &edge, &rdv);
    let snap = edge.rendezvous.connection(&rdv.peer).unwrap();
    let mut events = edge.rendezvous.subscribe();

    let report = edge.rendezvous.tick_at(snap.lease_end);
    assert_eq!(report.expired, 1);

    send_rendezvous(&rdv, &edge.peer, &RendezvousMessage::Disconnect { peer: rdv.peer }).unwrap();
    net.run_until_idle();

    assert_eq!(
        events.try_recv().unwrap(),
        RendezvousEvent {
            kind: RendezvousEventKind::DisconnectedByTimeout,
            peer: rdv.peer,
        }
    );
    assert!(events.try_recv().is_err());
    assert_eq!(edge.rendezvous.tick_at(snap.lease_end).expired, 0);
}

/// Disconnecting releases the client entry on the rendezvous side.
#[test]
fn disconnect_releases_client() {
    let net = MemoryNetwork::new();
    let rdv = spawn_node(&net, "rdv", rendezvous_config(), &[]);
    let edge = spawn_node(&net, "edge", edge_config(), &[]);
    lease(&net, &edge, &rdv);
    assert_eq!(rdv.rendezvous.clients().len(), 1);
    let mut rdv_events = rdv.rendezvous.subscribe();

    assert!(edge.rendezvous.disconnect(&rdv.peer));
    net.run_until_idle();

    assert!(rdv.rendezvous.clients().is_empty());
    assert_eq!(
        rdv_events.try_recv().unwrap().kind,
        RendezvousEventKind::ClientDisconnected
    );
}

/// A propagated message reaches every node's listener exactly once, even
/// when the rendezvous mesh offers it more than one path.
#[test]
fn propagation_is_deduplicated_across_rendezvous() {
    let net = MemoryNetwork::new();
    let r1 = spawn_node(&net, "r1", rendezvous_config(), &[]);
    let r2 = spawn_node(&net, "r2", rendezvous_config(), &[]);
    let sender = spawn_node(
        &net,
        "sender",
        RendezvousConfig {
            target_connections: 2,
            ..edge_config()
        },
        &[],
    );
    let receiver = spawn_node(&net, "receiver", edge_config(), &[]);

    lease(&net, &r2, &r1);
    lease(&net, &sender, &r1);
    lease(&net, &sender, &r2);
    lease(&net, &receiver, &r2);

    let collectors: Vec<Arc<Collector>> = [&r1, &r2, &receiver]
        .iter()
        .map(|node| {
            let c = Arc::new(Collector::default());
            node.rendezvous
                .register_propagate_listener("beacon", "p", c.clone());
            c
        })
        .collect();

    let message =
        WireMessage::encode("beacon", "p", &serde_json::json!({ "n": 1 }), Encoding::Json).unwrap();
    let sent = sender.rendezvous.propagate(message, "beacon", "p", 5);
    assert_eq!(sent, 2);
    net.run_until_idle();

    for c in &collectors {
        assert_eq!(c.origins(), vec![sender.peer]);
    }
}

/// An edge hands propagated traffic to its listener but never forwards it.
#[test]
fn edges_do_not_forward() {
    let net = MemoryNetwork::new();
    let rdv = spawn_node(&net, "rdv", rendezvous_config(), &[]);
    let edge = spawn_node(&net, "edge", edge_config(), &[]);
    lease(&net, &edge, &rdv);
    net.clear_records();

    let message =
        WireMessage::encode("beacon", "p", &serde_json::json!(null), Encoding::Json).unwrap();
    assert_eq!(rdv.rendezvous.propagate(message, "beacon", "p", 3), 1);
    net.run_until_idle();

    let records = net.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].from, rdv.peer);
}

/// With only seeds acceptable, an offer from anyone else creates no
/// connection and raises no event. A disconnect notice goes back to the
/// offerer only when refusal is configured. The seed's own offer still lands.
#[test]
fn non_seed_offer_is_dropped() {
    for refuse in [false, true] {
        let net = MemoryNetwork::new();
        let seed = spawn_node(&net, "seed", rendezvous_config(), &[]);
        let rogue = spawn_node(&net, "rogue", rendezvous_config(), &[]);
        let edge = spawn_node(
            &net,
            "edge",
            RendezvousConfig {
                only_seeds: true,
                refuse_unacceptable: refuse,
                ..edge_config()
            },
            &["mem://seed"],
        );
        let mut events = edge.rendezvous.subscribe();
        let edge_route = edge.rendezvous.local_descriptor().route();
        rogue.transport.add_route(&edge_route);
        seed.transport.add_route(&edge_route);

        let offer = |from: &Node| RendezvousMessage::LeaseReply {
            descriptor: from.rendezvous.local_descriptor().clone(),
            lease_ms: 60_000,
        };
        send_rendezvous(&rogue, &edge.peer, &offer(&rogue)).unwrap();
        net.clear_records();
        net.run_until_idle();

        assert_eq!(edge.rendezvous.connection_count(), 0, "refuse = {refuse}");
        assert!(events.try_recv().is_err(), "refuse = {refuse}");
        let notices = net
            .records()
            .iter()
            .filter(|r| r.from == edge.peer && r.to == Destination::Peer(rogue.peer))
            .filter(|r| {
                matches!(
                    rendezvous_message(&r.message),
                    Some(RendezvousMessage::Disconnect { peer }) if peer == edge.peer
                )
            })
            .count();
        assert_eq!(notices, usize::from(refuse), "refuse = {refuse}");

        send_rendezvous(&seed, &edge.peer, &offer(&seed)).unwrap();
        net.run_until_idle();
        assert!(edge.rendezvous.is_connected(&seed.peer));
        assert!(!edge.rendezvous.is_connected(&rogue.peer));
    }
}
