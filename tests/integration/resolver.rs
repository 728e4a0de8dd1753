use std::sync::Arc;

use serde_json::json;

use overmesh_core::config::ResolverConfig;
use overmesh_core::message::RESOLVER_SERVICE;
use overmesh_core::{
    Encoding, MessageKind, RendezvousMessage, ResolverQuery, RouteDescriptor, SrdiMessage,
    WireMessage,
};
use overmesh_services::{
    Destination, Disposition, DropReason, MemoryNetwork, QueryHandler, Transport, WireRecord,
};

use crate::*;

/// The `Propagate` envelope `from` handed to `to`, if any.
fn propagated(records: &[WireRecord], from: &Node, to: &Node) -> Option<WireMessage> {
    records
        .iter()
        .filter(|r| r.from == from.peer && r.to == Destination::Peer(to.peer))
        .find_map(|r| match rendezvous_message(&r.message) {
            Some(RendezvousMessage::Propagate { message, .. }) => Some(message),
            _ => None,
        })
}

/// Edge → rendezvous → edge: the query reaches the answerer once, one hop
/// further than it started, and exactly one response is unicast straight
/// back to the asker.
#[test]
fn query_through_rendezvous_is_answered() {
    let net = MemoryNetwork::new();
    let rdv = spawn_node(&net, "rdv", rendezvous_config(), &[]);
    let asker = spawn_node(&net, "asker", edge_config(), &[]);
    let answerer = spawn_node(&net, "answerer", edge_config(), &[]);
    lease(&net, &asker, &rdv);
    lease(&net, &answerer, &rdv);

    let answers = Arc::new(Recorder::replying());
    let inbox = Arc::new(Recorder::default());
    answerer.resolver.register_handler("search", answers.clone());
    asker.resolver.register_handler("search", inbox.clone());

    let id = asker.resolver.next_query_id();
    let query = ResolverQuery::new("search", id, json!({ "term": "overlay" }));
    asker.resolver.send_query(None, query).unwrap();
    net.run_until_idle();

    assert_eq!(answers.query_count(), 1);
    {
        let queries = answers.queries.lock().unwrap();
        let (_, q) = &queries[0];
        assert_eq!(q.hop_count, 1);
        assert_eq!(q.origin, Some(asker.peer));
        assert_eq!(
            q.source_route.as_ref().map(|r| r.peer),
            Some(asker.peer)
        );
    }

    let responses = inbox.responses.lock().unwrap();
    assert_eq!(responses.len(), 1);
    let (src, r) = &responses[0];
    assert_eq!(*src, answerer.peer);
    assert_eq!(r.query_id, id);
    assert_eq!(r.payload, json!({ "term": "overlay" }));
    // The asker never hands its own query to its own handler.
    assert_eq!(inbox.query_count(), 0);
}

/// SRDI goes out gzip-compressed inside the propagate envelope; queries
/// stay plain JSON.
#[test]
fn srdi_is_compressed_and_queries_are_not() {
    let net = MemoryNetwork::new();
    let rdv = spawn_node(&net, "rdv", rendezvous_config(), &[]);
    let edge = spawn_node(&net, "edge", edge_config(), &[]);
    lease(&net, &edge, &rdv);

    let index = Arc::new(Recorder::default());
    rdv.resolver.register_srdi_handler("index", index.clone());
    net.clear_records();

    edge.resolver
        .send_srdi(None, SrdiMessage::new("index", json!({ "keys": ["a", "b"] })))
        .unwrap();
    edge.resolver
        .send_query(None, ResolverQuery::new("index", 1, json!(null)))
        .unwrap();
    let records = net.records();
    net.run_until_idle();

    let envelopes: Vec<WireMessage> = records
        .iter()
        .filter(|r| r.from == edge.peer)
        .filter_map(|r| match rendezvous_message(&r.message) {
            Some(RendezvousMessage::Propagate { message, .. }) => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(envelopes.len(), 2);

    let srdi = &envelopes[0];
    assert_eq!(srdi.encoding, Encoding::Gzip);
    assert_eq!(srdi.param, MessageKind::Srdi.param(edge.rendezvous.group()));
    let query = &envelopes[1];
    assert_eq!(query.encoding, Encoding::Json);
    assert_eq!(query.param, MessageKind::Query.param(edge.rendezvous.group()));

    let got = index.srdi.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, edge.peer);
    assert_eq!(got[0].1.payload, json!({ "keys": ["a", "b"] }));
}

/// A rendezvous with no handler re-propagates with one more hop; a query
/// that arrives already over the limit goes nowhere.
#[test]
fn rendezvous_repropagates_within_hop_limits() {
    let net = MemoryNetwork::new();
    let rdv = spawn_node_with(
        &net,
        "rdv",
        rendezvous_config(),
        ResolverConfig {
            max_initial_hops: 2,
            max_repropagate_hops: 3,
            ..ResolverConfig::default()
        },
        &[],
    );
    let edge = spawn_node(&net, "edge", edge_config(), &[]);
    lease(&net, &edge, &rdv);
    net.clear_records();

    let query_message = |hops: u32| {
        let mut q = ResolverQuery::new("unknown", 9, json!(null));
        q.hop_count = hops;
        q.origin = Some(edge.peer);
        WireMessage::encode(
            RESOLVER_SERVICE,
            MessageKind::Query.param(rdv.rendezvous.group()),
            &q,
            Encoding::Json,
        )
        .unwrap()
    };

    let d = rdv
        .resolver
        .process_inbound(MessageKind::Query, edge.peer, &query_message(2));
    assert_eq!(d, Disposition::Repropagated { hop_count: 3 });
    let forwarded = propagated(&net.records(), &rdv, &edge).expect("re-propagated to client");
    let q: ResolverQuery = forwarded.decode().unwrap();
    assert_eq!(q.hop_count, 3);

    net.clear_records();
    let d = rdv
        .resolver
        .process_inbound(MessageKind::Query, edge.peer, &query_message(3));
    assert_eq!(d, Disposition::Dropped(DropReason::HopLimit));
    assert!(net.records().is_empty());
}

/// Registering twice hands back the first handler; once unregistered,
/// queries for that name are dropped.
#[test]
fn handler_replacement_and_removal() {
    let net = MemoryNetwork::new();
    let a = spawn_node(&net, "a", edge_config(), &[]);
    let b = spawn_node(&net, "b", edge_config(), &[]);

    let first: Arc<dyn QueryHandler> = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let second_dyn: Arc<dyn QueryHandler> = second.clone();

    assert!(b.resolver.register_handler("h", first.clone()).is_none());
    let replaced = b.resolver.register_handler("h", second_dyn.clone()).unwrap();
    assert!(Arc::ptr_eq(&replaced, &first));
    let removed = b.resolver.unregister_handler("h").unwrap();
    assert!(Arc::ptr_eq(&removed, &second_dyn));
    assert!(b.resolver.handler_names().is_empty());

    a.transport.add_route(&RouteDescriptor {
        peer: b.peer,
        endpoints: vec![b.transport.address().to_string()],
    });
    let message = WireMessage::encode(
        RESOLVER_SERVICE,
        MessageKind::Query.param(b.rendezvous.group()),
        &ResolverQuery::new("h", 1, json!(null)),
        Encoding::Json,
    )
    .unwrap();
    assert_eq!(
        b.resolver.process_inbound(MessageKind::Query, a.peer, &message),
        Disposition::Dropped(DropReason::NoHandler)
    );
    a.resolver
        .send_query(Some(&b.peer), ResolverQuery::new("h", 2, json!(null)))
        .unwrap();
    net.run_until_idle();
    assert_eq!(second.query_count(), 0);
}
