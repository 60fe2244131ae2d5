//! End-to-end tests: managers served by axum on loopback, dialing each other
//! with the WebSocket dialer

use super::*;
use bytes::Bytes;
use grid_auth::PeerAuthenticator;
use grid_proto::HandlerId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const ECHO: HandlerId = HandlerId::from_raw(10);
const FAIL: HandlerId = HandlerId::from_raw(11);
const BLOCK: HandlerId = HandlerId::from_raw(12);
const BIDI: HandlerId = HandlerId::from_raw(13);
const WAIT_CANCEL: HandlerId = HandlerId::from_raw(14);
const TICKS: HandlerId = HandlerId::from_raw(15);
const FLOOD: HandlerId = HandlerId::from_raw(16);

const FLOOD_SIZE: usize = 200;

const SECRET: &[u8] = b"grid-test-secret";
const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Counters {
    stream_started: AtomicUsize,
    stream_cancelled: AtomicUsize,
    blocked_dropped: AtomicUsize,
    flood_done: AtomicUsize,
}

/// Counts the drop of the future holding it
struct DropCounter(Arc<Counters>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.blocked_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

fn register_test_handlers(builder: &mut ManagerBuilder, counters: &Arc<Counters>) {
    builder
        .register_single_handler(ECHO, |payload| async move { Ok(payload) })
        .unwrap();

    builder
        .register_single_handler(FAIL, |_| async move { Err(RemoteErr::new("bucket not found")) })
        .unwrap();

    let c = counters.clone();
    builder
        .register_single_handler(BLOCK, move |_| {
            let guard = DropCounter(c.clone());
            async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Bytes::new())
            }
        })
        .unwrap();

    builder
        .register_streaming_handler(
            BIDI,
            StatefulHandler::new(|_cancel, prefix, mut requests, out| async move {
                while let Some(req) = requests.recv().await {
                    let mut resp = prefix.to_vec();
                    resp.extend_from_slice(&req);
                    if out.send(Ok(Bytes::from(resp))).await.is_err() {
                        break;
                    }
                }
                Ok(())
            })
            .with_in_capacity(1)
            .with_out_capacity(1),
        )
        .unwrap();

    let c = counters.clone();
    builder
        .register_streaming_handler(
            WAIT_CANCEL,
            StatefulHandler::new(move |cancel, _, _requests, _out| {
                let counters = c.clone();
                async move {
                    counters.stream_started.fetch_add(1, Ordering::SeqCst);
                    cancel.cancelled().await;
                    counters.stream_cancelled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

    builder
        .register_streaming_handler(
            TICKS,
            StatelessHandler::new(|_cancel, _, out| async move {
                for i in 0..5 {
                    out.send(Ok(Bytes::from(format!("tick-{}", i))))
                        .await
                        .map_err(|_| RemoteErr::new("caller gone"))?;
                }
                Ok(())
            })
            .with_out_capacity(8),
        )
        .unwrap();

    let c = counters.clone();
    builder
        .register_streaming_handler(
            FLOOD,
            StatelessHandler::new(move |_cancel, _, out| {
                let counters = c.clone();
                async move {
                    for i in 0..FLOOD_SIZE {
                        out.send(Ok(Bytes::from(format!("flood-{}", i))))
                            .await
                            .map_err(|_| RemoteErr::new("caller gone"))?;
                    }
                    counters.flood_done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .with_out_capacity(2),
        )
        .unwrap();
}

fn test_config() -> GridConfig {
    GridConfig::default()
        .with_handshake_timeout(Duration::from_secs(2))
        .with_reconnect(ReconnectConfig {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
            multiplier: 2.0,
        })
}

struct Node {
    host: String,
    manager: Arc<Manager>,
    server: JoinHandle<()>,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Start `n` nodes on loopback. `options` may adjust the options of node `i`.
async fn cluster<F>(n: usize, counters: &Arc<Counters>, options: F) -> Vec<Node>
where
    F: Fn(usize, ManagerOptions) -> ManagerOptions,
{
    init_tracing();

    let mut listeners = Vec::new();
    let mut hosts = Vec::new();
    for _ in 0..n {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        hosts.push(format!("http://{}", listener.local_addr().unwrap()));
        listeners.push(listener);
    }

    let mut nodes = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let base = ManagerOptions::new(hosts[i].clone(), hosts.clone()).with_config(test_config());
        let mut builder = Manager::builder(options(i, base));
        register_test_handlers(&mut builder, counters);
        let manager = builder.start().unwrap();

        let router = manager.handler();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        nodes.push(Node {
            host: hosts[i].clone(),
            manager,
            server,
        });
    }
    nodes
}

fn authenticated(_: usize, options: ManagerOptions) -> ManagerOptions {
    options.with_peer_authenticator(PeerAuthenticator::new(SECRET))
}

async fn connected(from: &Node, to: &Node) -> Arc<Connection> {
    let conn = from.manager.connection(&to.host).unwrap();
    let cancel = CancellationToken::new();
    timeout(WAIT, conn.wait_for_connect(&cancel))
        .await
        .expect("connect timed out")
        .unwrap();
    conn
}

/// Echo through `conn`, retrying while a replacement link comes up
async fn echo_eventually(conn: &Connection, payload: &'static [u8]) -> Bytes {
    let cancel = CancellationToken::new();
    timeout(WAIT, async {
        loop {
            if conn.wait_for_connect(&cancel).await.is_ok() {
                match conn.request(&cancel, ECHO, Bytes::from_static(payload)).await {
                    Ok(reply) => return reply,
                    Err(GridError::Disconnected) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no reply after reconnect")
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test]
async fn test_single_request_both_directions() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, authenticated).await;
    let cancel = CancellationToken::new();

    let a_to_b = connected(&nodes[0], &nodes[1]).await;
    let b_to_a = connected(&nodes[1], &nodes[0]).await;
    assert_ne!(a_to_b.is_initiator(), b_to_a.is_initiator());

    let reply = a_to_b
        .request(&cancel, ECHO, Bytes::from_static(b"hello"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"hello"));

    let reply = b_to_a
        .request(&cancel, ECHO, Bytes::from_static(b"back"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"back"));
}

#[tokio::test]
async fn test_concurrent_requests() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;
    let cancel = CancellationToken::new();

    let requests = (0..64).map(|i| {
        let conn = conn.clone();
        let cancel = cancel.clone();
        async move {
            let payload = Bytes::from(format!("req-{}", i));
            let reply = conn.request(&cancel, ECHO, payload.clone()).await.unwrap();
            assert_eq!(reply, payload);
        }
    });
    futures::future::join_all(requests).await;
}

#[tokio::test]
async fn test_three_nodes_fully_connected() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(3, &counters, authenticated).await;

    for from in &nodes {
        for to in &nodes {
            if from.host == to.host {
                continue;
            }
            let conn = connected(from, to).await;
            assert_eq!(echo_eventually(&conn, b"mesh").await, Bytes::from_static(b"mesh"));
        }
    }
}

#[tokio::test]
async fn test_remote_error_keeps_link() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;
    let cancel = CancellationToken::new();

    let err = conn
        .request(&cancel, FAIL, Bytes::new())
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.remote_message(), Some("bucket not found"));

    assert_eq!(conn.state(), ConnState::Connected);
    let reply = conn
        .request(&cancel, ECHO, Bytes::from_static(b"still up"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"still up"));
}

#[tokio::test]
async fn test_unknown_handler() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;
    let cancel = CancellationToken::new();
    let unknown = HandlerId::from_raw(99);

    let err = conn
        .request(&cancel, unknown, Bytes::new())
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert!(err.remote_message().unwrap().contains("not found"));

    let err = conn
        .new_stream(&cancel, unknown, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::MuxConnect(msg) if msg.contains("not found")));
}

#[tokio::test]
async fn test_kill_inbound_unblocks_pending_request_and_reconnects() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;

    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            conn.request(&cancel, BLOCK, Bytes::new()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    conn.inject_fault(Fault::KillInbound).await.unwrap();

    let result = timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(GridError::Disconnected)));

    // The remote dropped the abandoned work with the link
    eventually("blocked handler dropped", || {
        counters.blocked_dropped.load(Ordering::SeqCst) == 1
    })
    .await;

    assert_eq!(echo_eventually(&conn, b"again").await, Bytes::from_static(b"again"));
}

#[tokio::test]
async fn test_kill_outbound_cancels_stream_handler_once() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;
    let cancel = CancellationToken::new();

    let stream = conn
        .new_stream(&cancel, WAIT_CANCEL, Bytes::new())
        .await
        .unwrap();
    eventually("handler started", || {
        counters.stream_started.load(Ordering::SeqCst) == 1
    })
    .await;

    conn.inject_fault(Fault::KillOutbound).await.unwrap();

    let end = timeout(WAIT, stream.recv()).await.unwrap();
    assert!(matches!(end, Some(Err(GridError::Disconnected))));
    assert!(stream.recv().await.is_none());

    eventually("handler cancelled", || {
        counters.stream_cancelled.load(Ordering::SeqCst) == 1
    })
    .await;

    // Reconnecting does not run the handler again
    echo_eventually(&conn, b"after").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counters.stream_started.load(Ordering::SeqCst), 1);
    assert_eq!(counters.stream_cancelled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bidirectional_stream_with_backpressure() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;
    let cancel = CancellationToken::new();

    let stream = Arc::new(
        conn.new_stream(&cancel, BIDI, Bytes::from_static(b"re:"))
            .await
            .unwrap(),
    );
    assert!(!stream.is_stateless());

    const COUNT: usize = 200;
    let sender = {
        let stream = stream.clone();
        tokio::spawn(async move {
            for i in 0..COUNT {
                stream.send(Bytes::from(i.to_string())).await.unwrap();
            }
            stream.close_send().await.unwrap();
        })
    };

    for i in 0..COUNT {
        let resp = timeout(WAIT, stream.recv())
            .await
            .unwrap()
            .expect("stream ended early")
            .unwrap();
        assert_eq!(resp, Bytes::from(format!("re:{}", i)));
    }

    // Handler returns once the request side is closed
    assert!(timeout(WAIT, stream.recv()).await.unwrap().is_none());
    sender.await.unwrap();
}

#[tokio::test]
async fn test_stateless_stream() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;
    let cancel = CancellationToken::new();

    let stream = conn.new_stream(&cancel, TICKS, Bytes::new()).await.unwrap();
    assert!(stream.is_stateless());
    assert!(matches!(
        stream.send(Bytes::from_static(b"x")).await,
        Err(GridError::FlowControl(_))
    ));

    let mut ticks = Vec::new();
    stream
        .results(|tick| {
            ticks.push(tick);
            Ok(())
        })
        .await
        .unwrap();

    let expected: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("tick-{}", i))).collect();
    assert_eq!(ticks, expected);
}

#[tokio::test]
async fn test_stateless_stream_drops_for_slow_consumer() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;
    let cancel = CancellationToken::new();

    let stream = conn.new_stream(&cancel, FLOOD, Bytes::new()).await.unwrap();
    assert!(stream.is_stateless());

    // Nothing is read until the handler has sent everything
    eventually("flood handler finished", || {
        counters.flood_done.load(Ordering::SeqCst) == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut received = Vec::new();
    loop {
        match timeout(WAIT, stream.recv()).await.unwrap() {
            Some(Ok(msg)) => received.push(msg),
            Some(Err(e)) => panic!("stream failed: {}", e),
            None => break,
        }
    }

    assert!(!received.is_empty());
    assert!(received.len() < FLOOD_SIZE);
    assert_eq!(received[0], Bytes::from_static(b"flood-0"));
    assert_eq!(conn.state(), ConnState::Connected);
}

#[tokio::test]
async fn test_stream_cancelled_by_token() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;

    let cancel = CancellationToken::new();
    let stream = conn
        .new_stream(&cancel, WAIT_CANCEL, Bytes::new())
        .await
        .unwrap();
    eventually("stream handler started", || {
        counters.stream_started.load(Ordering::SeqCst) == 1
    })
    .await;

    cancel.cancel();

    let end = timeout(WAIT, stream.recv()).await.expect("recv stayed blocked");
    assert!(matches!(end, Some(Err(GridError::Cancelled))));
    assert!(stream.recv().await.is_none());
    assert!(matches!(
        stream.send(Bytes::from_static(b"late")).await,
        Err(GridError::Cancelled)
    ));

    // The remote handler saw its own token cancelled
    eventually("stream handler cancelled", || {
        counters.stream_cancelled.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(conn.state(), ConnState::Connected);
    assert_eq!(echo_eventually(&conn, b"still up").await, Bytes::from_static(b"still up"));
}

#[tokio::test]
async fn test_ping() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;
    let cancel = CancellationToken::new();

    let rtt = conn.ping(&cancel).await.unwrap();
    assert!(rtt < WAIT);

    let stream = conn
        .new_stream(&cancel, BIDI, Bytes::new())
        .await
        .unwrap();
    stream.ping(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_request_cancelled_by_token() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    let result = conn.request(&cancel, BLOCK, Bytes::new()).await;
    assert!(matches!(result, Err(GridError::Cancelled)));
    canceller.await.unwrap();

    // The remote was told to drop the work
    eventually("blocked handler dropped", || {
        counters.blocked_dropped.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(conn.state(), ConnState::Connected);
}

#[tokio::test]
async fn test_blocked_inbound_request_cancelled() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let conn = connected(&nodes[0], &nodes[1]).await;

    let release = CancellationToken::new();
    conn.inject_fault(Fault::BlockInbound(release.clone()))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let result = timeout(WAIT, async {
        tokio::select! {
            result = conn.request(&cancel, ECHO, Bytes::from_static(b"held")) => result,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                cancel.cancel();
                Err(GridError::Cancelled)
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(result, Err(GridError::Cancelled)));

    release.cancel();
    assert_eq!(echo_eventually(&conn, b"flowing").await, Bytes::from_static(b"flowing"));
}

#[tokio::test]
async fn test_auth_rejection() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |i, o| {
        let secret = if i == 0 { b"secret-a".to_vec() } else { b"secret-b".to_vec() };
        o.with_peer_authenticator(PeerAuthenticator::new(secret))
    })
    .await;

    let conn = nodes[0].manager.connection(&nodes[1].host).unwrap();
    let cancel = CancellationToken::new();
    let result = timeout(Duration::from_millis(500), conn.wait_for_connect(&cancel)).await;
    assert!(result.is_err(), "connected despite mismatched secrets");
    assert_ne!(conn.state(), ConnState::Connected);
    assert!(matches!(
        conn.request(&cancel, ECHO, Bytes::new()).await,
        Err(GridError::Disconnected)
    ));
}

#[tokio::test]
async fn test_connect_gate_defers_dialing() {
    let counters = Arc::new(Counters::default());
    let (gate, opener) = ConnectGate::new();
    let nodes = cluster(2, &counters, |_, o| o.with_connect_gate(gate.clone())).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    for node in &nodes {
        for conn in node.manager.connections() {
            assert_ne!(conn.state(), ConnState::Connected);
        }
    }

    opener.open();
    connected(&nodes[0], &nodes[1]).await;
    connected(&nodes[1], &nodes[0]).await;
}

#[tokio::test]
async fn test_shutdown_disconnects_peers() {
    let counters = Arc::new(Counters::default());
    let nodes = cluster(2, &counters, |_, o| o).await;
    let a_to_b = connected(&nodes[0], &nodes[1]).await;
    let b_to_a = connected(&nodes[1], &nodes[0]).await;

    nodes[0].manager.shutdown().await;
    timeout(WAIT, nodes[0].manager.wait_for_exit()).await.unwrap();

    assert_eq!(a_to_b.state(), ConnState::Shutdown);
    let cancel = CancellationToken::new();
    assert!(matches!(
        a_to_b.request(&cancel, ECHO, Bytes::new()).await,
        Err(GridError::Shutdown)
    ));

    eventually("peer noticed disconnect", || {
        b_to_a.state() != ConnState::Connected
    })
    .await;
}
