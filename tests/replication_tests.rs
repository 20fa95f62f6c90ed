//! End-to-end tests wiring multiple loaders over the in-memory network.

use replication_loader::config::{Destination, ReplicationConfig, TopologySnapshot};
use replication_loader::storage::InMemoryStorage;
use replication_loader::transport::{
    HandshakeReply, HandshakeRequest, HandshakeStatus, InMemoryNetwork, ReplicationMessage,
    ReplicationTransport, TransportConnector,
};
use replication_loader::ReplicationLoader;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

/// One database node: storage + loader + accept loop on its url.
struct Node {
    config: ReplicationConfig,
    storage: Arc<InMemoryStorage>,
    loader: Arc<ReplicationLoader<InMemoryStorage>>,
    topology_tx: watch::Sender<TopologySnapshot>,
    accept_task: JoinHandle<()>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

impl Node {
    async fn start(
        database: &str,
        url: &str,
        network: &Arc<InMemoryNetwork>,
        destinations: Vec<Destination>,
    ) -> Node {
        init_tracing();
        let config = ReplicationConfig::for_testing(database, Uuid::new_v4());
        let storage = Arc::new(InMemoryStorage::new(config.database_id));
        let loader = ReplicationLoader::new(
            config.clone(),
            Arc::clone(&storage),
            network.clone() as Arc<dyn TransportConnector>,
        );

        let mut accepted = network.listen(url);
        let accept_loader = Arc::clone(&loader);
        let accept_task = tokio::spawn(async move {
            while let Some(transport) = accepted.recv().await {
                let _ = accept_loader.accept_incoming(Box::new(transport)).await;
            }
        });

        let (topology_tx, topology_rx) = watch::channel(TopologySnapshot {
            database_name: database.to_string(),
            destinations,
            resolver: None,
        });
        loader.initialize(topology_rx).await.unwrap();

        Node {
            config,
            storage,
            loader,
            topology_tx,
            accept_task,
        }
    }

    async fn stop(self) {
        self.loader.dispose().await.unwrap();
        self.accept_task.abort();
    }
}

async fn wait_until(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "condition not met within {timeout:?}: {what}"
        );
        time::sleep(Duration::from_millis(10)).await;
    }
}

fn handshake(database_id: &str, database: &str, url: &str) -> ReplicationMessage {
    ReplicationMessage::Handshake(HandshakeRequest {
        source_machine_name: "test".to_string(),
        source_database_name: database.to_string(),
        source_database_id: database_id.to_string(),
        source_url: url.to_string(),
        api_key: None,
    })
}

#[tokio::test]
async fn test_documents_flow_between_two_nodes() {
    let network = InMemoryNetwork::new();
    let node_b = Node::start("db", "node-b:10200", &network, vec![]).await;
    let node_a = Node::start(
        "db",
        "node-a:10200",
        &network,
        vec![Destination::for_testing("db", "node-b:10200")],
    )
    .await;

    node_a.storage.put("users/1", "users", json!({"name": "a"}));
    node_a.storage.put("users/2", "users", json!({"name": "b"}));
    let etag = node_a.storage.put("users/3", "users", json!({"name": "c"}));

    let confirmed = node_a
        .loader
        .wait_for_replication(1, Duration::from_secs(5), etag)
        .await;
    assert_eq!(confirmed, 1);
    assert_eq!(node_b.storage.document_count(), 3);
    assert_eq!(node_b.storage.get("users/2"), Some(json!({"name": "b"})));

    // Destination progress survives on the loader side too
    let key = Destination::for_testing("db", "node-b:10200").key();
    assert!(node_a.loader.confirmed_etag_for(&key).unwrap() >= etag);

    // The receiving side registered the source
    let sources = node_b.loader.incoming_sources();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].source_database_id, node_a.config.database_id);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn test_deletes_replicate_as_tombstones() {
    let network = InMemoryNetwork::new();
    let node_b = Node::start("db", "node-b:10200", &network, vec![]).await;
    let node_a = Node::start(
        "db",
        "node-a:10200",
        &network,
        vec![Destination::for_testing("db", "node-b:10200")],
    )
    .await;

    node_a.storage.put("users/1", "users", json!({"v": 1}));
    let etag = node_a.storage.delete("users/1", "users");
    node_a
        .loader
        .wait_for_replication(1, Duration::from_secs(5), etag)
        .await;

    assert_eq!(node_b.storage.document_count(), 0);
    assert_eq!(node_b.storage.get("users/1"), None);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn test_wait_with_no_destinations_returns_requested() {
    let network = InMemoryNetwork::new();
    let node = Node::start("db", "node-a:10200", &network, vec![]).await;

    // Nobody to wait for: the local write is the whole story
    let started = Instant::now();
    let confirmed = node
        .loader
        .wait_for_replication(3, Duration::from_secs(30), 100)
        .await;
    assert_eq!(confirmed, 3);
    assert!(started.elapsed() < Duration::from_secs(1));

    node.stop().await;
}

#[tokio::test]
async fn test_wait_clamps_to_sibling_count() {
    let network = InMemoryNetwork::new();
    let node_b = Node::start("db", "node-b:10200", &network, vec![]).await;
    let node_a = Node::start(
        "db",
        "node-a:10200",
        &network,
        vec![Destination::for_testing("db", "node-b:10200")],
    )
    .await;

    let etag = node_a.storage.put("users/1", "users", json!({}));
    // Asking for 5 confirmations with one destination can never complete
    // as requested; it is clamped and returns once the one destination
    // confirmed.
    let confirmed = node_a
        .loader
        .wait_for_replication(5, Duration::from_secs(5), etag)
        .await;
    assert_eq!(confirmed, 1);
    assert_eq!(node_a.loader.get_quorum_size(), 1);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn test_wait_times_out_with_unreachable_destination() {
    let network = InMemoryNetwork::new();
    // Destination is configured but nothing listens there
    let node = Node::start(
        "db",
        "node-a:10200",
        &network,
        vec![Destination::for_testing("db", "node-b:10200")],
    )
    .await;

    node.storage.put("users/1", "users", json!({}));
    let confirmed = node
        .loader
        .wait_for_replication(1, Duration::from_millis(200), 1)
        .await;
    assert_eq!(confirmed, 0);

    node.stop().await;
}

#[tokio::test]
async fn test_failed_destination_lands_in_reconnect_queue() {
    let network = InMemoryNetwork::new();
    let destination = Destination::for_testing("db", "node-b:10200");
    let node = Node::start("db", "node-a:10200", &network, vec![destination.clone()]).await;

    wait_until(Duration::from_secs(5), "destination queued for reconnect", || {
        !node.loader.reconnect_queue_snapshot().is_empty()
    })
    .await;

    // Queued destinations have no live connection: the two rosters are
    // mutually exclusive.
    assert!(node.loader.outgoing_destinations().is_empty());
    let failures = node.loader.outgoing_failure_snapshot();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error_count >= 1);
    assert!(failures[0].last_error.is_some());

    node.stop().await;
}

#[tokio::test]
async fn test_misconfigured_destination_stays_on_retry_schedule() {
    let network = InMemoryNetwork::new();
    let destination = Destination::for_testing("db", "node-b:10200");
    let node = Node::start("db", "node-a:10200", &network, vec![destination]).await;

    // The destination answers the handshake claiming our own database id
    let own_id = node.config.database_id;
    let mut accepted = network.listen("node-b:10200");
    let server = tokio::spawn(async move {
        while let Some(transport) = accepted.recv().await {
            let _ = transport.recv().await;
            let _ = transport
                .send(ReplicationMessage::HandshakeReply(HandshakeReply {
                    status: HandshakeStatus::Ok,
                    last_accepted_document_etag: 0,
                    last_accepted_index_transformer_etag: 0,
                    document_change_vector: vec![],
                    index_transformer_change_vector: vec![],
                    resolver_id: None,
                    resolver_version: None,
                    database_id: own_id,
                }))
                .await;
        }
    });

    wait_until(Duration::from_secs(5), "identity mismatch recorded", || {
        node.loader
            .outgoing_failure_snapshot()
            .iter()
            .any(|f| f.last_error.as_deref().is_some_and(|e| e.contains("database id")))
    })
    .await;

    // Even a failure that cannot succeed on its own keeps the destination
    // scheduled: queued XOR live, never dropped from both.
    assert_eq!(node.loader.reconnect_queue_snapshot().len(), 1);
    assert!(node.loader.outgoing_destinations().is_empty());

    server.abort();
    node.stop().await;
}

#[tokio::test]
async fn test_destination_recovers_after_coming_online() {
    let network = InMemoryNetwork::new();
    let destination = Destination::for_testing("db", "node-b:10200");
    let node_a = Node::start("db", "node-a:10200", &network, vec![destination]).await;

    node_a.storage.put("users/1", "users", json!({"v": 1}));
    wait_until(Duration::from_secs(5), "first connect attempt failed", || {
        !node_a.loader.outgoing_failure_snapshot().is_empty()
            && node_a.loader.outgoing_failure_snapshot()[0].error_count >= 1
    })
    .await;

    // Destination comes online; a backoff retry should find it
    let node_b = Node::start("db", "node-b:10200", &network, vec![]).await;
    wait_until(Duration::from_secs(10), "document replicated after recovery", || {
        node_b.storage.document_count() == 1
    })
    .await;

    // Success resets the failure record
    wait_until(Duration::from_secs(5), "failure record reset", || {
        node_a
            .loader
            .outgoing_failure_snapshot()
            .iter()
            .all(|f| f.error_count == 0)
    })
    .await;

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn test_topology_change_rebuilds_connections() {
    let network = InMemoryNetwork::new();
    let node_b = Node::start("db", "node-b:10200", &network, vec![]).await;
    let node_c = Node::start("db", "node-c:10200", &network, vec![]).await;
    let node_a = Node::start(
        "db",
        "node-a:10200",
        &network,
        vec![Destination::for_testing("db", "node-b:10200")],
    )
    .await;

    let etag = node_a.storage.put("users/1", "users", json!({}));
    node_a
        .loader
        .wait_for_replication(1, Duration::from_secs(5), etag)
        .await;
    assert_eq!(node_b.storage.document_count(), 1);

    // Swap the destination set: b out, c in
    node_a
        .topology_tx
        .send(TopologySnapshot {
            database_name: "db".to_string(),
            destinations: vec![Destination::for_testing("db", "node-c:10200")],
            resolver: None,
        })
        .unwrap();

    wait_until(Duration::from_secs(5), "roster matches new topology", || {
        let destinations = node_a.loader.outgoing_destinations();
        destinations.len() == 1 && destinations[0].url == "node-c:10200"
    })
    .await;
    wait_until(Duration::from_secs(5), "existing documents reach new node", || {
        node_c.storage.document_count() == 1
    })
    .await;

    node_a.stop().await;
    node_b.stop().await;
    node_c.stop().await;
}

#[tokio::test]
async fn test_topology_for_other_database_ignored() {
    let network = InMemoryNetwork::new();
    let node_b = Node::start("db", "node-b:10200", &network, vec![]).await;
    let node_a = Node::start(
        "db",
        "node-a:10200",
        &network,
        vec![Destination::for_testing("db", "node-b:10200")],
    )
    .await;

    wait_until(Duration::from_secs(5), "outgoing connection live", || {
        node_a.loader.outgoing_destinations().len() == 1
    })
    .await;

    node_a
        .topology_tx
        .send(TopologySnapshot::empty("some-other-db"))
        .unwrap();
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node_a.loader.outgoing_destinations().len(), 1);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn test_newer_connection_from_same_source_supersedes() {
    let network = InMemoryNetwork::new();
    let node = Node::start("db", "node-b:10200", &network, vec![]).await;
    let source_id = Uuid::new_v4();
    let destination = Destination::for_testing("db", "node-b:10200");

    let first = network.connect(&destination).await.unwrap();
    first
        .send(handshake(&source_id.to_string(), "db", "node-x:1"))
        .await
        .unwrap();
    let ReplicationMessage::HandshakeReply(reply) = first.recv().await.unwrap() else {
        panic!("expected handshake reply");
    };
    assert_eq!(reply.status, HandshakeStatus::Ok);
    wait_until(Duration::from_secs(5), "first connection registered", || {
        node.loader.incoming_sources().len() == 1
    })
    .await;
    let first_activity = node.loader.incoming_activity();
    assert_eq!(first_activity.len(), 1);

    let second = network.connect(&destination).await.unwrap();
    second
        .send(handshake(&source_id.to_string(), "db", "node-x:1"))
        .await
        .unwrap();
    let ReplicationMessage::HandshakeReply(reply) = second.recv().await.unwrap() else {
        panic!("expected handshake reply");
    };
    assert_eq!(reply.status, HandshakeStatus::Ok);

    // Still exactly one connection per source database id
    let sources = node.loader.incoming_sources();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].source_database_id, source_id);

    node.stop().await;
}

#[tokio::test]
async fn test_self_replication_rejected_and_recorded() {
    let network = InMemoryNetwork::new();
    let node = Node::start("db", "node-b:10200", &network, vec![]).await;
    let destination = Destination::for_testing("db", "node-b:10200");

    let client = network.connect(&destination).await.unwrap();
    client
        .send(handshake(
            &node.config.database_id.to_string(),
            "db",
            "node-b:10200",
        ))
        .await
        .unwrap();
    match client.recv().await.unwrap() {
        ReplicationMessage::HandshakeReply(reply) => {
            let HandshakeStatus::Error { message } = reply.status else {
                panic!("self-replication handshake must be rejected");
            };
            assert!(message.contains("itself"), "unexpected reason: {message}");
        }
        other => panic!("unexpected message: {other:?}"),
    }

    wait_until(Duration::from_secs(5), "rejection recorded", || {
        !node.loader.rejection_history().is_empty()
    })
    .await;
    assert!(node.loader.incoming_sources().is_empty());

    node.stop().await;
}

#[tokio::test]
async fn test_rejection_history_is_bounded() {
    let network = InMemoryNetwork::new();
    let node = Node::start("db", "node-b:10200", &network, vec![]).await;
    let destination = Destination::for_testing("db", "node-b:10200");
    let limit = node.config.rejection_history;

    for _ in 0..limit + 5 {
        let client = network.connect(&destination).await.unwrap();
        client
            .send(handshake("definitely-not-a-uuid", "bad-db", "node-x:1"))
            .await
            .unwrap();
        // Wait for the error reply so the rejections are recorded in order
        let _ = client.recv().await;
    }

    let history = node.loader.rejection_history();
    assert_eq!(history.len(), 1, "all rejections share one source label");
    assert_eq!(history[0].1.len(), limit);

    node.stop().await;
}

#[tokio::test]
async fn test_minimal_etag_without_destinations_is_unbounded() {
    let network = InMemoryNetwork::new();
    let node = Node::start("db", "node-a:10200", &network, vec![]).await;
    assert_eq!(node.loader.minimal_etag_for_replication(), Some(u64::MAX));

    let frontier = node.loader.tombstone_cleanup_frontier().await.unwrap();
    assert_eq!(
        frontier.get(replication_loader::loader::ALL_DOCUMENTS_COLLECTION),
        Some(&u64::MAX)
    );
    node.stop().await;
}

#[tokio::test]
async fn test_minimal_etag_blocked_by_disabled_destination() {
    let network = InMemoryNetwork::new();
    let mut disabled = Destination::for_testing("db", "node-b:10200");
    disabled.disabled = true;
    let node = Node::start("db", "node-a:10200", &network, vec![disabled]).await;

    // The disabled destination never connects, so nothing is known about its
    // progress: cleanup must be blocked entirely.
    assert_eq!(node.loader.minimal_etag_for_replication(), None);
    let frontier = node.loader.tombstone_cleanup_frontier().await.unwrap();
    assert_eq!(
        frontier.get(replication_loader::loader::ALL_DOCUMENTS_COLLECTION),
        Some(&0)
    );
    node.stop().await;
}

#[tokio::test]
async fn test_minimal_etag_tracks_slowest_destination() {
    let network = InMemoryNetwork::new();
    let node_b = Node::start("db", "node-b:10200", &network, vec![]).await;
    let node_a = Node::start(
        "db",
        "node-a:10200",
        &network,
        vec![Destination::for_testing("db", "node-b:10200")],
    )
    .await;

    let etag = node_a.storage.put("users/1", "users", json!({}));
    node_a
        .loader
        .wait_for_replication(1, Duration::from_secs(5), etag)
        .await;
    assert!(node_a.loader.minimal_etag_for_replication().unwrap() >= etag);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn test_failure_subscription_sees_outgoing_failures() {
    let network = InMemoryNetwork::new();
    let node = Node::start(
        "db",
        "node-a:10200",
        &network,
        vec![Destination::for_testing("db", "node-b:10200")],
    )
    .await;
    let mut failures = node.loader.subscribe_failures();

    let failure = time::timeout(Duration::from_secs(5), failures.recv())
        .await
        .expect("no failure published")
        .unwrap();
    assert!(failure.peer.contains("node-b:10200"));
    assert!(!failure.error.is_empty());

    node.stop().await;
}

#[tokio::test]
async fn test_dispose_is_idempotent_and_stops_replication() {
    let network = InMemoryNetwork::new();
    let node_b = Node::start("db", "node-b:10200", &network, vec![]).await;
    let node_a = Node::start(
        "db",
        "node-a:10200",
        &network,
        vec![Destination::for_testing("db", "node-b:10200")],
    )
    .await;

    let etag = node_a.storage.put("users/1", "users", json!({}));
    node_a
        .loader
        .wait_for_replication(1, Duration::from_secs(5), etag)
        .await;

    node_a.loader.dispose().await.unwrap();
    node_a.loader.dispose().await.unwrap();
    assert!(node_a.loader.outgoing_destinations().is_empty());

    // Writes after dispose stay local
    node_a.storage.put("users/2", "users", json!({}));
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node_b.storage.document_count(), 1);

    node_a.accept_task.abort();
    node_b.stop().await;
}

#[tokio::test]
async fn test_stats_record_outcomes() {
    let network = InMemoryNetwork::new();
    let node_b = Node::start("db", "node-b:10200", &network, vec![]).await;
    let node_a = Node::start(
        "db",
        "node-a:10200",
        &network,
        vec![Destination::for_testing("db", "node-b:10200")],
    )
    .await;

    let etag = node_a.storage.put("users/1", "users", json!({}));
    node_a
        .loader
        .wait_for_replication(1, Duration::from_secs(5), etag)
        .await;

    wait_until(Duration::from_secs(5), "outgoing stats recorded", || {
        !node_a.loader.outgoing_stats().is_empty()
    })
    .await;
    wait_until(Duration::from_secs(5), "incoming stats recorded", || {
        !node_b.loader.incoming_stats().is_empty()
    })
    .await;

    node_a.stop().await;
    node_b.stop().await;
}
