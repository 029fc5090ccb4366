//! End-to-end protocol scenarios over in-memory transport pairs: one pair
//! end attaches to the router, the other either drives a real client engine
//! or stays raw so the test can forge frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbar_core::{Envelope, Message, MsgId, ProtocolConfig, Verb};
use crossbar_router::{AllowAll, BroadcastValidator, RouteHandler, RouteRequest, Router};
use crossbar_runtime::{Connection, ConnectionEvents, NoopEvents, RouteFailure, RouteMessage, RouteResult};
use crossbar_transport::{PairTransport, Transport, TransportEvent};
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Liveness timers long enough to stay out of the way.
fn quiet_config() -> ProtocolConfig {
    ProtocolConfig {
        ping_timeout_ms: 60_000,
        close_grace_ms: 60_000,
        ..ProtocolConfig::default()
    }
}

/// Attach one pair end to the router and a real client engine to the other.
async fn connect_client(router: &Router, events: Arc<dyn ConnectionEvents>) -> Connection {
    let (server_end, client_end) = PairTransport::pair();
    router
        .add_socket(Arc::new(server_end), None)
        .await
        .expect("attach server end");
    let client = Connection::client(quiet_config(), events);
    client
        .set_transport(Arc::new(client_end))
        .await
        .expect("attach client end");
    client
}

/// Wait until the router has registered `count` identified connections.
async fn wait_for_directory(router: &Router, count: usize) {
    for _ in 0..100 {
        if router.connection_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "directory never reached {count} connections (has {})",
        router.connection_count().await
    );
}

struct EchoId;

#[async_trait]
impl RouteHandler for EchoId {
    async fn handle(&self, request: RouteRequest) -> Result<Value, RouteFailure> {
        Ok(json!({ "ok": request.param("id").unwrap_or_default() }))
    }
}

struct Counting {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl RouteHandler for Counting {
    async fn handle(&self, request: RouteRequest) -> Result<Value, RouteFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(request.data)
    }
}

/// Client-side hook set that records inbound route messages (broadcast
/// deliveries).
#[derive(Default)]
struct BroadcastSink {
    received: Mutex<Vec<RouteMessage>>,
}

#[async_trait]
impl ConnectionEvents for BroadcastSink {
    async fn on_route_message(
        &self,
        _sender: Connection,
        _id: MsgId,
        message: RouteMessage,
    ) -> Option<RouteResult> {
        self.received.lock().push(message);
        None
    }
}

// ── Request/response scenarios ──────────────────────────────────────

#[tokio::test]
async fn happy_path_route_with_params() {
    let router = Router::new(quiet_config());
    router.on_post("/x/:id", EchoId).await.unwrap();

    let client = connect_client(&router, Arc::new(NoopEvents)).await;
    let handle = client
        .send_to_route("/x/7", Verb::Post, json!({}), None)
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("reply in time")
        .expect("reply present");
    assert!(!reply.is_err());
    assert_eq!(reply.data, json!({ "ok": "7" }));
}

#[tokio::test]
async fn verb_mismatch_surfaces_the_documented_error() {
    let router = Router::new(quiet_config());
    router.on_get("/a", EchoId).await.unwrap();

    let client = connect_client(&router, Arc::new(NoopEvents)).await;
    let handle = client
        .send_to_route("/a", Verb::Post, json!({}), None)
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        reply.error.as_deref(),
        Some("Route \"/a\" does not support verb \"POST\"")
    );
    assert_eq!(reply.data, json!(""));
}

#[tokio::test]
async fn unknown_route_surfaces_not_found() {
    let router = Router::new(quiet_config());
    let client = connect_client(&router, Arc::new(NoopEvents)).await;

    let handle = client
        .send_to_route("/nowhere", Verb::Get, json!(null), None)
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.error.as_deref(), Some("Route \"/nowhere\" not found"));
}

#[tokio::test]
async fn request_headers_reach_the_handler() {
    struct HeaderEcho;

    #[async_trait]
    impl RouteHandler for HeaderEcho {
        async fn handle(&self, request: RouteRequest) -> Result<Value, RouteFailure> {
            Ok(json!(request.headers.get("x-tag").cloned()))
        }
    }

    let router = Router::new(quiet_config());
    router.on_get("/tagged", HeaderEcho).await.unwrap();
    let client = connect_client(&router, Arc::new(NoopEvents)).await;

    let mut headers = HashMap::new();
    headers.insert("x-tag".to_owned(), "hello".to_owned());
    let handle = client
        .send_to_route("/tagged", Verb::Get, json!(null), Some(headers))
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.data, json!("hello"));
}

// ── Duplicate delivery through the router ───────────────────────────

#[tokio::test]
async fn duplicate_delivery_invokes_handler_once() {
    struct Slow {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RouteHandler for Slow {
        async fn handle(&self, _request: RouteRequest) -> Result<Value, RouteFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!("done"))
        }
    }

    let calls = Arc::new(AtomicU32::new(0));
    let router = Router::new(quiet_config());
    router
        .on_post("/slow", Slow { calls: calls.clone() })
        .await
        .unwrap();

    // raw client side: forge the duplicate frames ourselves
    let (server_end, client_end) = PairTransport::pair();
    router.add_socket(Arc::new(server_end), None).await.unwrap();
    client_end.connect().await.unwrap();
    let mut events = client_end.take_events().unwrap();
    assert_eq!(events.recv().await, Some(TransportEvent::Opened));

    let request = Envelope::new(
        MsgId::new(42),
        Message::Route {
            verb: Verb::Post,
            route: "/slow".into(),
            data: json!({}),
            headers: None,
        },
    );
    client_end.send(&request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client_end.send(&request).await.unwrap();

    let mut statuses = Vec::new();
    while statuses.len() < 2 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("response in time")
            .expect("stream open")
        {
            TransportEvent::Frame(Envelope {
                msg:
                    Message::Res {
                        target, status, ..
                    },
                ..
            }) if target == MsgId::new(42) => statuses.push(status),
            TransportEvent::Frame(Envelope {
                msg: Message::Ping, ..
            }) => {}
            _ => {}
        }
    }
    assert_eq!(statuses, vec![202, 200]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ── Reconnect resumption ────────────────────────────────────────────

#[tokio::test]
async fn buffered_requests_survive_a_transport_swap() {
    let calls = Arc::new(AtomicU32::new(0));
    let router = Router::new(quiet_config());
    router
        .on_post("/q", Counting { calls: calls.clone() })
        .await
        .unwrap();

    let client = connect_client(&router, Arc::new(NoopEvents)).await;
    wait_for_directory(&router, 1).await;
    let secret = client.secret().unwrap();

    client.close().await;

    let mut handles = Vec::new();
    for n in 1..=3 {
        handles.push(
            client
                .send_to_route("/q", Verb::Post, json!(n), None)
                .await
                .unwrap(),
        );
    }
    assert_eq!(client.queued_for_reconnect(), 3);

    // fresh pair: the server side resumes identity via the secret
    let (server_end, client_end) = PairTransport::pair();
    let resumed = router
        .add_socket(Arc::new(server_end), Some(secret.clone()))
        .await
        .unwrap();
    assert_eq!(resumed.secret(), Some(secret));
    client.set_transport(Arc::new(client_end)).await.unwrap();

    for (n, handle) in handles.into_iter().enumerate() {
        let reply = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("reply in time")
            .expect("reply present");
        assert!(!reply.is_err());
        assert_eq!(reply.data, json!(n as u32 + 1));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(router.connection_count().await, 1, "no duplicate entry");
}

// ── Broadcasts ──────────────────────────────────────────────────────

struct RejectAll;

#[async_trait]
impl BroadcastValidator for RejectAll {
    async fn validate(&self, _conn: &Connection, _params: &HashMap<String, String>) -> bool {
        false
    }
}

#[tokio::test]
async fn broadcast_reaches_only_matching_subscribers() {
    let router = Router::new(quiet_config());
    router
        .on_validate_broadcast("/t/:id", AllowAll)
        .await
        .unwrap();

    let sink_a = Arc::new(BroadcastSink::default());
    let sink_b = Arc::new(BroadcastSink::default());
    let client_a = connect_client(&router, sink_a.clone()).await;
    let client_b = connect_client(&router, sink_b.clone()).await;
    wait_for_directory(&router, 2).await;

    client_a
        .post(Message::On { route: "/t/1".into() })
        .await
        .unwrap()
        .wait()
        .await
        .expect("subscribe ack");
    client_b
        .post(Message::On { route: "/t/2".into() })
        .await
        .unwrap()
        .wait()
        .await
        .expect("subscribe ack");

    router.broadcast_post("/t/1", json!({"n": 1}), None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let received_a = sink_a.received.lock().clone();
    assert_eq!(received_a.len(), 1);
    assert_eq!(received_a[0].route, "/t/1");
    assert_eq!(received_a[0].verb, Verb::Post);
    assert_eq!(received_a[0].data, json!({"n": 1}));
    assert!(sink_b.received.lock().is_empty());
}

#[tokio::test]
async fn rejected_validator_blocks_delivery() {
    let router = Router::new(quiet_config());
    router
        .on_validate_broadcast("/t/:id", RejectAll)
        .await
        .unwrap();

    let sink = Arc::new(BroadcastSink::default());
    let client = connect_client(&router, sink.clone()).await;
    wait_for_directory(&router, 1).await;

    client
        .post(Message::On { route: "/t/1".into() })
        .await
        .unwrap()
        .wait()
        .await
        .expect("subscribe ack");

    router.broadcast_post("/t/1", json!("blocked"), None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sink.received.lock().is_empty());
}

#[tokio::test]
async fn except_connection_is_skipped() {
    let router = Router::new(quiet_config());
    router
        .on_validate_broadcast("/room/:id", AllowAll)
        .await
        .unwrap();

    let sink_a = Arc::new(BroadcastSink::default());
    let sink_b = Arc::new(BroadcastSink::default());
    let client_a = connect_client(&router, sink_a.clone()).await;
    let client_b = connect_client(&router, sink_b.clone()).await;
    wait_for_directory(&router, 2).await;

    for client in [&client_a, &client_b] {
        client
            .post(Message::On { route: "/room/9".into() })
            .await
            .unwrap()
            .wait()
            .await
            .expect("subscribe ack");
    }

    // skip A, as if A itself caused the update
    let conn_a = router.connection(&client_a.secret().unwrap()).await.unwrap();
    router
        .broadcast_update("/room/9", json!("news"), Some(&conn_a))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(sink_a.received.lock().is_empty());
    let received_b = sink_b.received.lock().clone();
    assert_eq!(received_b.len(), 1);
    assert_eq!(received_b[0].verb, Verb::Any);
}

#[tokio::test]
async fn unsubscribe_stops_deliveries() {
    let router = Router::new(quiet_config());
    router
        .on_validate_broadcast("/t/:id", AllowAll)
        .await
        .unwrap();

    let sink = Arc::new(BroadcastSink::default());
    let client = connect_client(&router, sink.clone()).await;
    wait_for_directory(&router, 1).await;

    client
        .post(Message::On { route: "/t/5".into() })
        .await
        .unwrap()
        .wait()
        .await
        .expect("subscribe ack");
    assert_eq!(router.subscriber_count("/t/5").await, 1);

    client
        .post(Message::Off { route: "/t/5".into() })
        .await
        .unwrap()
        .wait()
        .await
        .expect("unsubscribe ack");
    assert_eq!(router.subscriber_count("/t/5").await, 0);

    router.broadcast_post("/t/5", json!(1), None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sink.received.lock().is_empty());
}

// ── Disconnect cleanup ──────────────────────────────────────────────

#[tokio::test]
async fn closed_connections_leave_directory_and_listener_lists() {
    let config = ProtocolConfig {
        close_grace_ms: 50,
        ping_timeout_ms: 60_000,
        ..ProtocolConfig::default()
    };
    let router = Router::new(config.clone());
    router
        .on_validate_broadcast("/t/:id", AllowAll)
        .await
        .unwrap();

    let client = {
        let (server_end, client_end) = PairTransport::pair();
        router.add_socket(Arc::new(server_end), None).await.unwrap();
        let client = Connection::client(config, Arc::new(NoopEvents));
        client.set_transport(Arc::new(client_end)).await.unwrap();
        client
    };
    wait_for_directory(&router, 1).await;

    client
        .post(Message::On { route: "/t/3".into() })
        .await
        .unwrap()
        .wait()
        .await
        .expect("subscribe ack");
    assert_eq!(router.subscriber_count("/t/3").await, 1);

    // drop the link; after the grace window the server connection must be
    // purged from the directory and from every outbound layer
    client.close().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(router.connection_count().await, 0);
    assert_eq!(router.subscriber_count("/t/3").await, 0);
}

// ── Directory hooks ─────────────────────────────────────────────────

#[tokio::test]
async fn client_connect_hook_fires_once_per_identity() {
    let router = Router::new(quiet_config());
    let seen = Arc::new(AtomicU32::new(0));
    let hook_seen = seen.clone();
    router.on_client_connect(move |_conn| {
        hook_seen.fetch_add(1, Ordering::SeqCst);
    });

    let _client = connect_client(&router, Arc::new(NoopEvents)).await;
    wait_for_directory(&router, 1).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
