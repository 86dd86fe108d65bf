use super::*;
use bytes::Bytes;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 0, last)), port)
}

fn id_with_prefix(first: u8, second: u8) -> NodeId {
    let mut id = [0u8; 20];
    id[0] = first;
    id[1] = second;
    NodeId(id)
}

fn info(first: u8, second: u8) -> NodeInfo {
    NodeInfo::new(id_with_prefix(first, second), addr(second, 6881))
}

fn test_config() -> DhtConfig {
    DhtConfig::default()
        .with_query_timeout(Duration::from_millis(500))
        .with_bootstrap_nodes(Vec::<String>::new())
}

struct FixedProbe(bool);

impl LivenessProbe for FixedProbe {
    fn probe(&self, _node: NodeInfo) -> impl Future<Output = bool> + Send {
        let alive = self.0;
        async move { alive }
    }
}

/// A transport on `network` whose receive loop is already running.
fn spawn_transport<H>(
    network: &MemoryNetwork,
    id: NodeId,
    config: DhtConfig,
    handler: H,
) -> Arc<Transport>
where
    H: QueryHandler + 'static,
{
    let socket = network.bind_any();
    let context = Arc::new(DhtContext::with_id(id, config));
    let transport = Arc::new(Transport::new(Arc::new(socket), context));

    let running = Arc::clone(&transport);
    tokio::spawn(async move {
        let _ = running.run(&handler).await;
    });
    transport
}

fn ping_responder(id: NodeId) -> impl QueryHandler + 'static {
    move |_from: SocketAddr, _sender: NodeId, _query: Query| -> Result<Response, KrpcError> {
        Ok(Response::Ping { id })
    }
}

fn node_info(transport: &Transport) -> NodeInfo {
    NodeInfo::new(*transport.local_id(), transport.local_addr().unwrap())
}

// Identifiers

#[test]
fn test_node_id_from_bytes() {
    let bytes = [1u8; 20];
    let id = NodeId::from_bytes(&bytes).unwrap();
    assert_eq!(id.0, bytes);
    assert!(matches!(
        NodeId::from_bytes(&[1u8; 10]),
        Err(DhtError::InvalidNodeId)
    ));
}

#[test]
fn test_distance_symmetric_and_zero_to_self() {
    for _ in 0..32 {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&a).is_zero());
        assert_eq!(a.distance(&a), Distance::ZERO);
    }
}

#[test]
fn test_distance_ordering() {
    let target = NodeId([0u8; 20]);
    let near = id_with_prefix(0x00, 0x01);
    let far = id_with_prefix(0x80, 0x00);
    assert!(near.distance(&target) < far.distance(&target));
    assert_eq!(far.distance(&target).leading_zeros(), 0);
    assert_eq!(near.distance(&target).leading_zeros(), 15);
}

#[test]
fn test_prefix_random_id() {
    let id = NodeId::generate();
    for len in [0, 1, 7, 8, 13, 100, 159, 160] {
        let prefix = id.prefix(len);
        assert_eq!(prefix.len(), len);
        let random = prefix.random_id();
        assert!(prefix.contains(&random));
        assert!(random.shared_prefix_bits(&id) >= len);
    }
}

#[test]
fn test_bucket_prefix_matches_bucket_index() {
    let table = RoutingTable::new(NodeId::generate());
    for index in [0, 1, 42, 100, 159] {
        let id = table.bucket_prefix(index).random_id();
        assert_eq!(table.bucket_index(&id), Some(index));
    }
    assert_eq!(table.bucket_index(table.our_id()), None);
}

// Node liveness

#[test]
fn test_node_state_transitions() {
    let mut node = Node::new(info(0x80, 1));
    assert_eq!(node.state(), NodeState::Good);

    let later = Instant::now() + Duration::from_secs(16 * 60);
    assert_eq!(node.state_at(later), NodeState::Questionable);

    node.fail();
    assert_eq!(node.state(), NodeState::Questionable);
    node.fail();
    assert_eq!(node.state(), NodeState::Bad);

    node.touch();
    assert_eq!(node.state(), NodeState::Good);
}

#[test]
fn test_discovered_node_is_questionable() {
    let node = Node::discovered(info(0x80, 1));
    assert_eq!(node.state(), NodeState::Questionable);
    assert!(!node.is_good());
    assert!(!node.is_bad());
}

// Routing table

#[test]
fn test_bucket_never_exceeds_capacity() {
    let table = RoutingTable::new(NodeId([0u8; 20]));
    for i in 0..40u8 {
        table.observe(Node::new(info(0x80 | (i & 0x7f), i)));
        assert!(table.bucket_len(0) <= 8);
    }
    assert_eq!(table.bucket_len(0), 8);
}

#[test]
fn test_full_bucket_of_good_nodes_rejects() {
    let table = RoutingTable::new(NodeId([0u8; 20]));
    for i in 0..8 {
        assert_eq!(table.observe(Node::new(info(0x80, i))), InsertOutcome::Added);
    }

    let before: Vec<NodeId> = table.all_nodes().iter().map(|n| n.id).collect();
    assert_eq!(table.observe(Node::new(info(0x80, 100))), InsertOutcome::Rejected);
    let after: Vec<NodeId> = table.all_nodes().iter().map(|n| n.id).collect();

    assert_eq!(before, after);
    assert!(table.get(&id_with_prefix(0x80, 100)).is_none());
}

#[tokio::test]
async fn test_insert_into_good_bucket_does_not_probe() {
    let table = RoutingTable::new(NodeId([0u8; 20]));
    for i in 0..8 {
        table.observe(Node::new(info(0x80, i)));
    }
    let outcome = table
        .insert(Node::new(info(0x80, 100)), &FixedProbe(false))
        .await;
    assert_eq!(outcome, InsertOutcome::Rejected);
    assert_eq!(table.node_count(), 8);
}

#[test]
fn test_bad_node_is_evicted() {
    let table = RoutingTable::new(NodeId([0u8; 20]));
    for i in 0..8 {
        table.observe(Node::new(info(0x80, i)));
    }

    let victim = id_with_prefix(0x80, 3);
    table.mark_failed(&victim);
    table.mark_failed(&victim);
    assert!(table.get(&victim).unwrap().is_bad());

    let newcomer = info(0x80, 100);
    assert_eq!(
        table.observe(Node::new(newcomer)),
        InsertOutcome::Replaced(victim)
    );
    assert!(table.get(&victim).is_none());
    assert!(table.get(&newcomer.id).is_some());
    assert_eq!(table.bucket_len(0), 8);
}

#[tokio::test]
async fn test_questionable_node_evicted_after_failed_probe() {
    let table = RoutingTable::new(NodeId([0u8; 20]));
    for i in 0..8 {
        table.observe(Node::discovered(info(0x80, i)));
    }

    let newcomer = info(0x80, 100);
    assert_eq!(table.observe(Node::new(newcomer)), InsertOutcome::Rejected);

    let outcome = table.insert(Node::new(newcomer), &FixedProbe(false)).await;
    assert_eq!(outcome, InsertOutcome::Replaced(id_with_prefix(0x80, 0)));
    assert!(table.get(&newcomer.id).is_some());
    assert_eq!(table.bucket_len(0), 8);
}

#[tokio::test]
async fn test_questionable_node_kept_when_probe_answers() {
    let table = RoutingTable::new(NodeId([0u8; 20]));
    for i in 0..8 {
        table.observe(Node::discovered(info(0x80, i)));
    }

    let outcome = table
        .insert(Node::new(info(0x80, 100)), &FixedProbe(true))
        .await;
    assert_eq!(outcome, InsertOutcome::Rejected);
    assert!(table.all_nodes().iter().all(|n| n.is_good()));
}

#[test]
fn test_own_id_is_ignored() {
    let our_id = NodeId::generate();
    let table = RoutingTable::new(our_id);
    let outcome = table.observe(Node::new(NodeInfo::new(our_id, addr(1, 1))));
    assert_eq!(outcome, InsertOutcome::Ignored);
    assert!(table.is_empty());
}

#[test]
fn test_existing_node_is_refreshed() {
    let table = RoutingTable::new(NodeId([0u8; 20]));
    let node = info(0x80, 1);
    table.observe(Node::discovered(node));
    assert!(!table.get(&node.id).unwrap().is_good());

    let moved = NodeInfo::new(node.id, addr(200, 7000));
    assert_eq!(table.observe(Node::new(moved)), InsertOutcome::Refreshed);

    let stored = table.get(&node.id).unwrap();
    assert_eq!(stored.addr, moved.addr);
    assert!(stored.is_good());
    assert_eq!(table.node_count(), 1);
}

#[test]
fn test_closest_nodes_ordering() {
    let table = RoutingTable::new(NodeId::generate());
    for i in 0..200u32 {
        let ip = Ipv4Addr::from(0x0a00_0000 + i);
        table.observe(Node::new(NodeInfo::new(
            NodeId::generate(),
            SocketAddr::new(IpAddr::V4(ip), 6881),
        )));
    }

    let target = NodeId::generate();
    let closest = table.closest_nodes(&target, 8);
    assert_eq!(closest.len(), table.node_count().min(8));

    for pair in closest.windows(2) {
        assert!(pair[0].id.distance(&target) < pair[1].id.distance(&target));
    }

    let best = table
        .all_nodes()
        .iter()
        .map(|n| n.id.distance(&target))
        .min()
        .unwrap();
    assert_eq!(closest[0].id.distance(&target), best);
}

#[test]
fn test_closest_nodes_fewer_than_limit() {
    let table = RoutingTable::new(NodeId([0u8; 20]));
    table.observe(Node::new(info(0x80, 1)));
    table.observe(Node::new(info(0x40, 2)));
    table.observe(Node::new(info(0x20, 3)));

    let closest = table.closest_nodes(&NodeId([0u8; 20]), 8);
    let ids: Vec<NodeId> = closest.iter().map(|n| n.id).collect();
    assert_eq!(
        ids,
        vec![
            id_with_prefix(0x20, 3),
            id_with_prefix(0x40, 2),
            id_with_prefix(0x80, 1)
        ]
    );
}

#[test]
fn test_closest_nodes_includes_bad() {
    let table = RoutingTable::new(NodeId([0u8; 20]));
    for i in 0..5 {
        table.observe(Node::new(info(0x80, i)));
    }
    let bad = id_with_prefix(0x80, 2);
    table.mark_failed(&bad);
    table.mark_failed(&bad);

    let zero = NodeId([0u8; 20]);
    let closest = table.closest_nodes(&zero, 8);
    assert_eq!(closest.len(), 8.min(table.node_count()));
    assert!(closest.iter().any(|n| n.id == bad));
    assert_eq!(table.closest_nodes(&zero, 3).len(), 3);

    let live = table.closest_live_nodes(&zero, 8);
    assert_eq!(live.len(), 4);
    assert!(live.iter().all(|n| n.id != bad));
}

#[test]
fn test_server_does_not_hand_out_bad_nodes() {
    let context = Arc::new(DhtContext::new(test_config()));
    let routing = Arc::new(RoutingTable::new(context.local_id));
    let server = QueryServer::new(Arc::clone(&context), Arc::clone(&routing));

    let bad = NodeInfo::new(NodeId::generate(), addr(9, 6881));
    routing.observe(Node::new(bad));
    routing.mark_failed(&bad.id);
    routing.mark_failed(&bad.id);

    let sender = NodeId::generate();
    let response = server
        .handle(addr(1, 6881), sender, Query::FindNode { target: bad.id })
        .unwrap();
    match response {
        Response::FindNode { nodes, .. } => {
            assert!(!nodes.contains(&bad));
            assert_eq!(nodes, vec![NodeInfo::new(sender, addr(1, 6881))]);
        }
        other => panic!("unexpected response {:?}", other),
    }
}

#[test]
fn test_empty_buckets_farther_than_non_empty() {
    let table = RoutingTable::new(NodeId([0u8; 20]));
    assert!(table.empty_buckets_farther_than_non_empty().is_empty());

    // Shares exactly 3 bits with our id.
    table.observe(Node::new(info(0x10, 1)));
    table.observe(Node::new(info(0x80, 2)));

    let expected: Vec<usize> = (4..160).rev().collect();
    assert_eq!(table.empty_buckets_farther_than_non_empty(), expected);
}

#[test]
fn test_stale_buckets() {
    let table = RoutingTable::new(NodeId([0u8; 20]));
    table.observe(Node::new(info(0x80, 1)));

    assert!(table.stale_buckets(Duration::from_secs(60)).is_empty());
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(table.stale_buckets(Duration::from_millis(1)), vec![0]);
}

// Compact encodings

#[test]
fn test_compact_nodes_roundtrip() {
    let data: Vec<u8> = (0..52u8).collect();
    let nodes = unpack_nodes(&data).unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(pack_nodes(&nodes).as_ref(), data.as_slice());

    assert!(unpack_nodes(&[]).unwrap().is_empty());
    assert!(unpack_nodes(&data[..25]).is_err());
    assert!(unpack_nodes(&data[..27]).is_err());
}

#[test]
fn test_compact_node_layout() {
    let node = NodeInfo::new(NodeId([1u8; 20]), addr(7, 6881));
    let packed = pack_nodes(&[node]);
    assert_eq!(packed.len(), 26);
    assert_eq!(&packed[20..24], &[10, 1, 0, 7]);
    assert_eq!(&packed[24..], &6881u16.to_be_bytes());
}

#[test]
fn test_compact_peer_roundtrip() {
    let peer = addr(2, 51413);
    let packed = compact::pack_peer(&peer).unwrap();
    assert_eq!(packed.as_ref(), &[10, 1, 0, 2, 0xc8, 0xd5]);
    assert_eq!(compact::unpack_peer(&packed).unwrap(), peer);
    assert!(compact::unpack_peer(&packed[..5]).is_err());
    assert!(compact::pack_peer(&"[::1]:6881".parse().unwrap()).is_none());
}

#[test]
fn test_compact_skips_ipv6() {
    let v6 = NodeInfo::new(NodeId([1u8; 20]), "[::1]:6881".parse().unwrap());
    assert!(pack_nodes(&[v6]).is_empty());
}

// KRPC messages

fn tid() -> TransactionId {
    Bytes::from_static(b"aa")
}

fn roundtrip_query(query: Query) {
    let sender = NodeId::generate();
    let message = KrpcMessage::query(tid(), sender, query);
    let decoded = KrpcMessage::decode(&message.encode(), |_| None).unwrap();
    assert_eq!(decoded, message);
}

fn roundtrip_response(response: Response) {
    let method = response.method();
    let message = KrpcMessage::response(tid(), response);
    let decoded = KrpcMessage::decode(&message.encode(), |t| {
        assert_eq!(t, b"aa");
        Some(method)
    })
    .unwrap();
    assert_eq!(decoded, message);
}

#[test]
fn test_query_roundtrips() {
    roundtrip_query(Query::Ping);
    roundtrip_query(Query::FindNode {
        target: NodeId::generate(),
    });
    roundtrip_query(Query::GetPeers {
        info_hash: [7u8; 20],
    });
    roundtrip_query(Query::AnnouncePeer {
        info_hash: [7u8; 20],
        port: 6881,
        token: Bytes::from_static(b"token"),
        implied_port: false,
    });
    roundtrip_query(Query::AnnouncePeer {
        info_hash: [7u8; 20],
        port: 0,
        token: Bytes::from_static(b"token"),
        implied_port: true,
    });
}

#[test]
fn test_response_roundtrips() {
    let id = NodeId::generate();
    let nodes = vec![info(0x80, 1), info(0x40, 2)];

    roundtrip_response(Response::Ping { id });
    roundtrip_response(Response::FindNode {
        id,
        nodes: nodes.clone(),
    });
    roundtrip_response(Response::GetPeers {
        id,
        token: Bytes::from_static(b"tok"),
        nodes: Some(nodes),
        peers: None,
    });
    roundtrip_response(Response::GetPeers {
        id,
        token: Bytes::from_static(b"tok"),
        nodes: None,
        peers: Some(vec![addr(1, 6881), addr(2, 6882)]),
    });
    roundtrip_response(Response::AnnouncePeer { id });
}

#[test]
fn test_error_roundtrip() {
    let message = KrpcMessage::error(tid(), KrpcError::protocol("bad token"));
    let decoded = KrpcMessage::decode(&message.encode(), |_| None).unwrap();
    assert_eq!(decoded, message);
    match decoded.body {
        Body::Error(error) => assert_eq!(error.code, KrpcError::PROTOCOL),
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn test_query_wire_format() {
    let sender = NodeId([b'a'; 20]);
    let encoded = KrpcMessage::query(tid(), sender, Query::Ping).encode();
    assert_eq!(
        encoded,
        b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:ping1:t2:aa1:y1:qe".to_vec()
    );
}

#[test]
fn test_response_without_pending_transaction() {
    let message = KrpcMessage::response(tid(), Response::Ping { id: NodeId::generate() });
    assert!(matches!(
        KrpcMessage::decode(&message.encode(), |_| None),
        Err(DhtError::TransactionMismatch)
    ));
}

#[test]
fn test_decode_rejects_malformed() {
    // unknown method
    assert!(matches!(
        KrpcMessage::decode(b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:vote1:t2:aa1:y1:qe", |_| None),
        Err(DhtError::Decoding(_))
    ));
    // short id
    assert!(matches!(
        KrpcMessage::decode(b"d1:ad2:id3:abce1:q4:ping1:t2:aa1:y1:qe", |_| None),
        Err(DhtError::Decoding(_))
    ));
    // missing arguments
    assert!(matches!(
        KrpcMessage::decode(b"d1:q4:ping1:t2:aa1:y1:qe", |_| None),
        Err(DhtError::Decoding(_))
    ));
    // get_peers response without a token
    assert!(matches!(
        KrpcMessage::decode(
            b"d1:rd2:id20:aaaaaaaaaaaaaaaaaaaa5:nodes0:e1:t2:aa1:y1:re",
            |_| Some(Method::GetPeers)
        ),
        Err(DhtError::Decoding(_))
    ));
    // not bencode at all
    assert!(KrpcMessage::decode(b"hello", |_| None).is_err());
}

#[test]
fn test_method_names() {
    for method in [
        Method::Ping,
        Method::FindNode,
        Method::GetPeers,
        Method::AnnouncePeer,
    ] {
        assert_eq!(Method::from_name(method.name().as_bytes()), Some(method));
    }
    assert_eq!(Method::from_name(b"vote"), None);
}

// Query server

fn query_server() -> QueryServer {
    let context = Arc::new(DhtContext::new(test_config()));
    let routing = Arc::new(RoutingTable::new(context.local_id));
    QueryServer::new(context, routing)
}

#[test]
fn test_token_validation() {
    let server = query_server();
    let peer = addr(1, 6881);
    let token = server.token_for(&peer);

    assert_eq!(token.len(), 8);
    assert!(server.validate_token(&peer, &token));
    // the port does not matter, the ip does
    assert!(server.validate_token(&addr(1, 9999), &token));
    assert!(!server.validate_token(&addr(2, 6881), &token));

    server.rotate_token_secret();
    assert!(server.validate_token(&peer, &token));
    server.rotate_token_secret();
    assert!(!server.validate_token(&peer, &token));
}

#[test]
fn test_announce_requires_valid_token() {
    let server = query_server();
    let from = addr(1, 6881);
    let announce = |token: Bytes| Query::AnnouncePeer {
        info_hash: [9u8; 20],
        port: 7000,
        token,
        implied_port: false,
    };

    let err = server
        .handle(from, NodeId::generate(), announce(Bytes::from_static(b"forged")))
        .unwrap_err();
    assert_eq!(err.code, KrpcError::PROTOCOL);
    assert!(server.stored_peers(&[9u8; 20]).is_empty());

    let token = server.token_for(&from);
    let response = server.handle(from, NodeId::generate(), announce(token)).unwrap();
    assert_eq!(response.method(), Method::AnnouncePeer);
    assert_eq!(server.stored_peers(&[9u8; 20]), vec![addr(1, 7000)]);
}

#[test]
fn test_announce_implied_port() {
    let server = query_server();
    let from = addr(1, 51413);
    let query = Query::AnnouncePeer {
        info_hash: [9u8; 20],
        port: 7000,
        token: server.token_for(&from),
        implied_port: true,
    };

    server.handle(from, NodeId::generate(), query).unwrap();
    assert_eq!(server.stored_peers(&[9u8; 20]), vec![from]);
}

fn limited_server(max_info_hashes: usize, lifetime: Duration) -> QueryServer {
    let config = test_config().with_peer_store_limits(max_info_hashes, lifetime);
    let context = Arc::new(DhtContext::new(config));
    let routing = Arc::new(RoutingTable::new(context.local_id));
    QueryServer::new(context, routing)
}

fn announce_hash(server: &QueryServer, from: SocketAddr, info_hash: InfoHash) {
    let query = Query::AnnouncePeer {
        info_hash,
        port: 7000,
        token: server.token_for(&from),
        implied_port: false,
    };
    server.handle(from, NodeId::generate(), query).unwrap();
}

#[test]
fn test_peer_store_caps_info_hashes() {
    let server = limited_server(16, Duration::from_secs(60));
    let from = addr(1, 6881);

    for i in 0..500u32 {
        let mut info_hash = [0u8; 20];
        info_hash[..4].copy_from_slice(&i.to_be_bytes());
        announce_hash(&server, from, info_hash);
        assert!(server.stored_info_hash_count() <= 16);
    }
    assert_eq!(server.stored_info_hash_count(), 16);

    // the most recent announce survives, the first one was dropped
    let mut last = [0u8; 20];
    last[..4].copy_from_slice(&499u32.to_be_bytes());
    assert_eq!(server.stored_peers(&last), vec![addr(1, 7000)]);
    assert!(server.stored_peers(&[0u8; 20]).is_empty());
}

#[test]
fn test_expire_peers_sweeps_every_info_hash() {
    let server = limited_server(16, Duration::from_millis(1));
    let from = addr(1, 6881);
    for i in 0..5u8 {
        announce_hash(&server, from, [i; 20]);
    }
    assert_eq!(server.stored_info_hash_count(), 5);

    std::thread::sleep(Duration::from_millis(5));
    server.expire_peers();
    assert_eq!(server.stored_info_hash_count(), 0);
}

#[test]
fn test_server_answers_and_observes_sender() {
    let server = query_server();
    let context = Arc::new(DhtContext::new(test_config()));
    let routing = Arc::new(RoutingTable::new(context.local_id));
    let server_with_table = QueryServer::new(Arc::clone(&context), Arc::clone(&routing));

    let sender = NodeId::generate();
    let from = addr(1, 6881);
    let response = server_with_table.handle(from, sender, Query::Ping).unwrap();
    assert_eq!(response, Response::Ping { id: context.local_id });
    assert_eq!(routing.get(&sender).unwrap().addr, from);

    let response = server_with_table
        .handle(from, sender, Query::FindNode { target: sender })
        .unwrap();
    match response {
        Response::FindNode { nodes, .. } => assert_eq!(nodes, vec![NodeInfo::new(sender, from)]),
        other => panic!("unexpected response {:?}", other),
    }

    let response = server.handle(from, sender, Query::GetPeers { info_hash: [3u8; 20] }).unwrap();
    match response {
        Response::GetPeers {
            token,
            nodes,
            peers,
            ..
        } => {
            assert!(server.validate_token(&from, &token));
            assert!(nodes.is_some());
            assert!(peers.is_none());
        }
        other => panic!("unexpected response {:?}", other),
    }
}

// Transport

#[tokio::test]
async fn test_ping_between_transports() {
    let network = MemoryNetwork::new();
    let a_id = NodeId::generate();
    let b_id = NodeId::generate();
    let a = spawn_transport(&network, a_id, test_config(), ping_responder(a_id));
    let b = spawn_transport(&network, b_id, test_config(), ping_responder(b_id));

    let answered = a.ping(b.local_addr().unwrap()).await.unwrap();
    assert_eq!(answered, b_id);
    assert_eq!(a.pending_count(), 0);
}

#[tokio::test]
async fn test_remote_error_surfaces_as_protocol() {
    let network = MemoryNetwork::new();
    let a = spawn_transport(&network, NodeId::generate(), test_config(), ping_responder(NodeId::generate()));
    let b = spawn_transport(
        &network,
        NodeId::generate(),
        test_config(),
        |_from: SocketAddr, _sender: NodeId, _query: Query| -> Result<Response, KrpcError> {
            Err(KrpcError::new(KrpcError::SERVER, "overloaded"))
        },
    );

    let err = a.ping(b.local_addr().unwrap()).await.unwrap_err();
    match err {
        DhtError::Protocol { code, message } => {
            assert_eq!(code, KrpcError::SERVER);
            assert_eq!(message, "overloaded");
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
    assert_eq!(a.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_query_times_out() {
    let network = MemoryNetwork::new();
    let config = DhtConfig::default().with_bootstrap_nodes(Vec::<String>::new());
    let a = spawn_transport(&network, NodeId::generate(), config, ping_responder(NodeId::generate()));
    let silent = network.bind_any();

    let started = tokio::time::Instant::now();
    let err = a.ping(silent.local_addr().unwrap()).await.unwrap_err();

    assert!(matches!(err, DhtError::Timeout));
    assert!(started.elapsed() >= a.context().config.query_timeout);
    assert_eq!(a.pending_count(), 0);
}

#[tokio::test]
async fn test_close_fails_pending_queries() {
    let network = MemoryNetwork::new();
    let a = spawn_transport(&network, NodeId::generate(), test_config(), ping_responder(NodeId::generate()));
    let silent = network.bind_any();
    let target = silent.local_addr().unwrap();

    let querying = Arc::clone(&a);
    let query = tokio::spawn(async move { querying.ping(target).await });
    while a.pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    a.close();
    assert!(matches!(query.await.unwrap(), Err(DhtError::Shutdown)));
    assert_eq!(a.pending_count(), 0);
    assert!(matches!(a.ping(target).await, Err(DhtError::Shutdown)));
}

#[tokio::test]
async fn test_reply_from_wrong_address_is_ignored() {
    let network = MemoryNetwork::new();
    let a = spawn_transport(&network, NodeId::generate(), test_config(), ping_responder(NodeId::generate()));
    let silent = network.bind_any();
    let impostor = network.bind_any();
    let target = silent.local_addr().unwrap();
    let a_addr = a.local_addr().unwrap();

    let querying = Arc::clone(&a);
    let query = tokio::spawn(async move { querying.ping(target).await });

    let mut buf = vec![0u8; 1500];
    let (n, _) = silent.recv_from(&mut buf).await.unwrap();
    let tid = KrpcMessage::decode(&buf[..n], |_| None).unwrap().transaction_id;

    let forged = KrpcMessage::response(tid, Response::Ping { id: NodeId::generate() });
    impostor.send_to(&forged.encode(), a_addr).await.unwrap();

    assert!(matches!(query.await.unwrap(), Err(DhtError::Timeout)));
}

#[tokio::test]
async fn test_rate_limited_when_pending_table_full() {
    let network = MemoryNetwork::new();
    let mut config = test_config();
    config.max_pending = 1;
    let a = spawn_transport(&network, NodeId::generate(), config, ping_responder(NodeId::generate()));
    let silent = network.bind_any();
    let target = silent.local_addr().unwrap();

    let querying = Arc::clone(&a);
    let first = tokio::spawn(async move { querying.ping(target).await });
    while a.pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    assert!(matches!(a.ping(target).await, Err(DhtError::RateLimited)));
    assert!(matches!(first.await.unwrap(), Err(DhtError::Timeout)));
}

// Lookups

/// A node that answers find_node with a fixed node list.
fn spawn_fixed_node(network: &MemoryNetwork, id: NodeId, nodes: Vec<NodeInfo>) -> Arc<Transport> {
    spawn_transport(
        network,
        id,
        test_config(),
        move |_from: SocketAddr, _sender: NodeId, query: Query| -> Result<Response, KrpcError> {
            match query {
                Query::FindNode { .. } => Ok(Response::FindNode {
                    id,
                    nodes: nodes.clone(),
                }),
                Query::Ping => Ok(Response::Ping { id }),
                _ => Err(KrpcError::new(KrpcError::METHOD_UNKNOWN, "unsupported")),
            }
        },
    )
}

#[tokio::test]
async fn test_find_node_lookup_converges() {
    let network = MemoryNetwork::new();
    let local_id = NodeId([0xff; 20]);
    let local = spawn_transport(&network, local_id, test_config(), ping_responder(local_id));
    let routing = RoutingTable::new(local_id);

    let target = NodeId([0u8; 20]);
    let closer: Vec<NodeInfo> = (1..=3)
        .map(|i| node_info(&spawn_fixed_node(&network, id_with_prefix(0x00, i), Vec::new())))
        .collect();
    let seed = spawn_fixed_node(&network, id_with_prefix(0x40, 0), closer.clone());

    let outcome = Lookup::new(target, FindNode::new(target), &routing, &local)
        .with_seeds([node_info(&seed)])
        .run()
        .await;

    assert!(outcome.rounds <= 2, "took {} rounds", outcome.rounds);
    for node in &closer {
        assert!(outcome.result.contains(node));
    }
    assert_eq!(outcome.result[0].id, id_with_prefix(0x00, 1));
    assert_eq!(outcome.result.len(), 4);

    // responders are now in the routing table
    for node in &closer {
        assert!(routing.get(&node.id).is_some());
    }
}

#[tokio::test]
async fn test_find_node_lookup_tolerates_dead_nodes() {
    let network = MemoryNetwork::new();
    let local_id = NodeId([0xff; 20]);
    let local = spawn_transport(
        &network,
        local_id,
        test_config().with_query_timeout(Duration::from_millis(100)),
        ping_responder(local_id),
    );
    let routing = RoutingTable::new(local_id);

    let live = spawn_fixed_node(&network, id_with_prefix(0x00, 2), Vec::new());
    let dead_socket = network.bind_any();
    let dead = NodeInfo::new(id_with_prefix(0x00, 1), dead_socket.local_addr().unwrap());
    let seed = spawn_fixed_node(&network, id_with_prefix(0x40, 0), vec![dead, node_info(&live)]);

    let target = NodeId([0u8; 20]);
    let result = Lookup::new(target, FindNode::new(target), &routing, &local)
        .with_seeds([node_info(&seed)])
        .run()
        .await
        .result;

    assert!(result.contains(&node_info(&live)));
    assert!(!result.contains(&dead));
}

#[tokio::test]
async fn test_get_peers_lookup_collects_peers_and_token() {
    let network = MemoryNetwork::new();
    let local_id = NodeId([0xff; 20]);
    let local = spawn_transport(&network, local_id, test_config(), ping_responder(local_id));
    let routing = RoutingTable::new(local_id);

    let peer = addr(77, 51413);
    let remote_id = id_with_prefix(0x01, 0);
    let remote = spawn_transport(
        &network,
        remote_id,
        test_config(),
        move |_from: SocketAddr, _sender: NodeId, query: Query| -> Result<Response, KrpcError> {
            match query {
                Query::GetPeers { .. } => Ok(Response::GetPeers {
                    id: remote_id,
                    token: Bytes::from_static(b"secret"),
                    nodes: None,
                    peers: Some(vec![peer]),
                }),
                _ => Ok(Response::Ping { id: remote_id }),
            }
        },
    );
    let remote_info = node_info(&remote);

    let info_hash = [0u8; 20];
    let outcome = Lookup::new(NodeId(info_hash), GetPeers::new(info_hash), &routing, &local)
        .with_seeds([remote_info])
        .run()
        .await
        .result;

    assert_eq!(outcome.peers, vec![peer]);
    assert_eq!(outcome.tokens.len(), 1);
    assert_eq!(outcome.tokens[&remote_info], Bytes::from_static(b"secret"));
    assert_eq!(outcome.closest, vec![remote_info]);
}

#[tokio::test]
async fn test_lookup_without_seeds_finishes_empty() {
    let network = MemoryNetwork::new();
    let local_id = NodeId::generate();
    let local = spawn_transport(&network, local_id, test_config(), ping_responder(local_id));
    let routing = RoutingTable::new(local_id);

    let target = NodeId::generate();
    let outcome = Lookup::new(target, FindNode::new(target), &routing, &local)
        .seeded_from_table()
        .run()
        .await;
    assert!(outcome.result.is_empty());
    assert_eq!(outcome.rounds, 0);
}

#[tokio::test]
async fn test_close_interrupts_lookup_with_partial_result() {
    let network = MemoryNetwork::new();
    let local_id = NodeId([0xff; 20]);
    let config = test_config().with_query_timeout(Duration::from_secs(60));
    let local = spawn_transport(&network, local_id, config, ping_responder(local_id));
    let routing = RoutingTable::new(local_id);

    let live = node_info(&spawn_fixed_node(&network, id_with_prefix(0x00, 3), Vec::new()));
    let silent: Vec<MemorySocket> = (0..2).map(|_| network.bind_any()).collect();
    let mut seeds = vec![live];
    for (i, socket) in silent.iter().enumerate() {
        seeds.push(NodeInfo::new(
            id_with_prefix(0x00, i as u8 + 1),
            socket.local_addr().unwrap(),
        ));
    }

    let target = NodeId([0u8; 20]);
    let lookup = Lookup::new(target, FindNode::new(target), &routing, &local)
        .with_seeds(seeds)
        .run();
    let closing = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        local.close();
    };

    let (outcome, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(lookup, closing)
    })
    .await
    .unwrap();

    assert_eq!(outcome.result, vec![live]);
    assert_eq!(outcome.responded, 1);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(local.pending_count(), 0);
}

#[tokio::test]
async fn test_lookup_ignores_responses_with_our_id() {
    let network = MemoryNetwork::new();
    let local_id = NodeId([0xff; 20]);
    let local = spawn_transport(&network, local_id, test_config(), ping_responder(local_id));
    let routing = RoutingTable::new(local_id);

    let mirror = spawn_transport(
        &network,
        id_with_prefix(0x00, 1),
        test_config(),
        move |_from: SocketAddr, _sender: NodeId, _query: Query| -> Result<Response, KrpcError> {
            Ok(Response::FindNode {
                id: local_id,
                nodes: Vec::new(),
            })
        },
    );

    let target = NodeId([0u8; 20]);
    let outcome = Lookup::new(target, FindNode::new(target), &routing, &local)
        .with_seeds([node_info(&mirror)])
        .run()
        .await;

    assert!(outcome.result.is_empty());
    assert_eq!(outcome.responded, 0);
    assert!(routing.is_empty());
}

#[tokio::test]
async fn test_lookup_does_not_requery_under_real_id() {
    let network = MemoryNetwork::new();
    let local_id = NodeId([0xff; 20]);
    let local = spawn_transport(&network, local_id, test_config(), ping_responder(local_id));
    let routing = RoutingTable::new(local_id);

    // We know this node under a stale id; it answers with its real one,
    // under which another node also lists it.
    let real_id = id_with_prefix(0x00, 1);
    let real_info = node_info(&spawn_fixed_node(&network, real_id, Vec::new()));
    let listing = spawn_fixed_node(&network, id_with_prefix(0x00, 9), vec![real_info]);

    let stale = NodeInfo::new(id_with_prefix(0x40, 0), real_info.addr);
    let target = NodeId([0u8; 20]);
    let outcome = Lookup::new(target, FindNode::new(target), &routing, &local)
        .with_seeds([stale, node_info(&listing)])
        .run()
        .await;

    assert!(outcome.result.contains(&real_info));
    assert_eq!(outcome.responded, 2);
    assert_eq!(outcome.rounds, 1);
}

// Maintenance

#[tokio::test(start_paused = true)]
async fn test_bootstrap_against_silent_node_fails() {
    let network = MemoryNetwork::new();
    let local_id = NodeId::generate();
    let config = DhtConfig::default().with_bootstrap_nodes(Vec::<String>::new());
    let local = spawn_transport(&network, local_id, config, ping_responder(local_id));
    let routing = RoutingTable::new(local_id);

    let silent = network.bind_any();
    let bootstrap = NodeInfo::new(NodeId::generate(), silent.local_addr().unwrap());

    let result = Maintenance::new(&routing, &local).bootstrap(bootstrap).await;
    assert!(matches!(result, Err(DhtError::BootstrapFailed)));
    assert!(routing.is_empty());
}

#[tokio::test]
async fn test_bootstrap_fills_routing_table() {
    let network = MemoryNetwork::new();
    let local_id = NodeId::generate();
    let local = spawn_transport(&network, local_id, test_config(), ping_responder(local_id));
    let routing = RoutingTable::new(local_id);

    let others: Vec<NodeInfo> = (0..5)
        .map(|_| node_info(&spawn_fixed_node(&network, NodeId::generate(), Vec::new())))
        .collect();
    let seed = spawn_fixed_node(&network, NodeId::generate(), others.clone());

    Maintenance::new(&routing, &local)
        .bootstrap(node_info(&seed))
        .await
        .unwrap();

    assert!(routing.get(seed.local_id()).is_some());
    for node in &others {
        assert!(routing.get(&node.id).is_some());
    }
}

/// A node that only knows `nodes`, and only tells about them when asked for
/// a target starting with `region`.
fn spawn_region_node(
    network: &MemoryNetwork,
    id: NodeId,
    region: u8,
    nodes: Vec<NodeInfo>,
) -> Arc<Transport> {
    spawn_transport(
        network,
        id,
        test_config(),
        move |_from: SocketAddr, _sender: NodeId, query: Query| -> Result<Response, KrpcError> {
            match query {
                Query::FindNode { target } => {
                    let nodes = if target.0[0] & 0xf0 == region {
                        nodes.clone()
                    } else {
                        Vec::new()
                    };
                    Ok(Response::FindNode { id, nodes })
                }
                _ => Ok(Response::Ping { id }),
            }
        },
    )
}

#[tokio::test]
async fn test_refresh_bucket_fills_gap() {
    let network = MemoryNetwork::new();
    let local_id = NodeId([0u8; 20]);
    let local = spawn_transport(&network, local_id, test_config(), ping_responder(local_id));
    let routing = RoutingTable::new(local_id);

    // Bucket 3 holds ids starting 0b0001.
    let deep: Vec<NodeInfo> = (1..=2)
        .map(|i| node_info(&spawn_fixed_node(&network, id_with_prefix(0x10, i), Vec::new())))
        .collect();
    let helper = spawn_region_node(&network, id_with_prefix(0x80, 0), 0x10, deep.clone());
    routing.observe(Node::new(node_info(&helper)));
    assert_eq!(routing.bucket_len(3), 0);

    let stored = Maintenance::new(&routing, &local).refresh_bucket(3).await;

    assert!(stored >= 2);
    assert_eq!(routing.bucket_len(3), 2);
    for node in &deep {
        assert!(routing.get(&node.id).is_some());
    }
}

#[tokio::test]
async fn test_bootstrap_refreshes_unreachable_buckets() {
    let network = MemoryNetwork::new();
    let local_id = NodeId([0u8; 20]);
    let local = spawn_transport(&network, local_id, test_config(), ping_responder(local_id));
    let routing = RoutingTable::new(local_id);

    let deep: Vec<NodeInfo> = (1..=2)
        .map(|i| node_info(&spawn_fixed_node(&network, id_with_prefix(0x10, i), Vec::new())))
        .collect();
    let seed = spawn_region_node(&network, id_with_prefix(0x80, 0), 0x10, deep.clone());

    Maintenance::new(&routing, &local)
        .bootstrap(node_info(&seed))
        .await
        .unwrap();

    // the lookup for our own id never hears of bucket 3; only the gap
    // refresh does
    assert_eq!(routing.bucket_len(3), 2);
    for node in &deep {
        assert!(routing.get(&node.id).is_some());
    }
}

// Dht facade

fn memory_dht(network: &MemoryNetwork) -> Dht {
    memory_dht_with(network, NodeId::generate(), test_config())
}

fn memory_dht_with(network: &MemoryNetwork, id: NodeId, config: DhtConfig) -> Dht {
    Dht::with_socket(
        Arc::new(network.bind_any()),
        DhtContext::with_id(id, config),
    )
}

fn dht_info(dht: &Dht) -> NodeInfo {
    NodeInfo::new(*dht.local_id(), dht.local_addr().unwrap())
}

#[tokio::test]
async fn test_bootstrap_without_nodes() {
    let network = MemoryNetwork::new();
    let dht = memory_dht(&network);
    dht.start().unwrap();

    assert!(matches!(dht.bootstrap().await, Err(DhtError::NoBootstrapNodes)));
    dht.stop().await;
}

#[tokio::test]
async fn test_dht_start_and_stop() {
    let network = MemoryNetwork::new();
    let dht = memory_dht(&network);
    assert!(!dht.is_running());

    dht.start().unwrap();
    assert!(dht.is_running());

    dht.stop().await;
    assert!(!dht.is_running());
    assert!(matches!(dht.start(), Err(DhtError::Shutdown)));
    assert!(matches!(
        dht.find_node(NodeId::generate()).await,
        Err(DhtError::Shutdown)
    ));
}

#[tokio::test]
async fn test_announce_and_discover_peers() {
    let network = MemoryNetwork::new();
    let hub = memory_dht(&network);
    let seeder = memory_dht(&network);
    let leecher = memory_dht(&network);

    hub.start().unwrap();
    let hub_addr = hub.local_addr().unwrap();

    for dht in [&seeder, &leecher] {
        dht.add_bootstrap_node_address(hub_addr);
        dht.start().unwrap();
        dht.bootstrap().await.unwrap();
        assert!(dht.routing_table().get(hub.local_id()).is_some());
    }

    let info_hash = [42u8; 20];
    let accepted = seeder.announce(info_hash, 7000).await.unwrap();
    assert!(accepted >= 1);

    let expected = SocketAddr::new(seeder.local_addr().unwrap().ip(), 7000);
    assert!(hub.server().stored_peers(&info_hash).contains(&expected));

    let (tx, mut rx) = mpsc::unbounded_channel();
    leecher.set_peer_listener(move |hash: InfoHash, peers: &[SocketAddr]| {
        let _ = tx.send((hash, peers.to_vec()));
    });
    leecher.register_info_hash(info_hash);
    assert_eq!(leecher.registered_info_hashes(), vec![info_hash]);

    let (hash, peers) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hash, info_hash);
    assert!(peers.contains(&expected));

    let outcome = leecher.get_peers(info_hash).await.unwrap();
    assert!(outcome.peers.contains(&expected));

    leecher.deregister_info_hash(&info_hash);
    assert!(leecher.registered_info_hashes().is_empty());

    for dht in [&hub, &seeder, &leecher] {
        dht.stop().await;
    }
}

#[tokio::test]
async fn test_announce_goes_to_closest_nodes_only() {
    let network = MemoryNetwork::new();
    let info_hash = [0x40u8; 20];

    // `near` is the closest node to the info hash; we only learn about it
    // through `far`, which also hands out a token.
    let near = memory_dht_with(&network, id_with_prefix(0x40, 0x40), test_config());
    let far = memory_dht_with(&network, id_with_prefix(0x40, 0x00), test_config());
    let local = memory_dht_with(&network, NodeId([0u8; 20]), test_config().with_k(1));
    for dht in [&near, &far, &local] {
        dht.start().unwrap();
    }

    far.routing_table().observe(Node::new(dht_info(&near)));
    local.routing_table().observe(Node::new(dht_info(&far)));

    let accepted = local.announce(info_hash, 7000).await.unwrap();
    assert_eq!(accepted, 1);

    let expected = SocketAddr::new(local.local_addr().unwrap().ip(), 7000);
    assert_eq!(near.server().stored_peers(&info_hash), vec![expected]);
    assert!(far.server().stored_peers(&info_hash).is_empty());

    for dht in [&near, &far, &local] {
        dht.stop().await;
    }
}
