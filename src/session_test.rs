use std::collections::HashSet;

use frames::Body;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use super::*;
use crate::wire::test_helpers::{RawPeer, memory_pair, quiet_config, raw_transport};

const WAIT: Duration = Duration::from_secs(5);

/// Server and agent sessions joined by an in-memory transport.
fn pair(config: TunnelConfig) -> (Session, Session, mpsc::Receiver<VirtualConn>, CancellationToken) {
    let ctx = CancellationToken::new();
    let (a, b) = memory_pair();
    let server = Session::server("agent-1", a, config, &ctx);
    let (agent, incoming) = Session::agent("agent-1", b, config, &ctx);
    (server, agent, incoming, ctx)
}

/// Accept every incoming connection and echo its bytes back.
fn spawn_echo_agent(mut incoming: mpsc::Receiver<VirtualConn>) {
    tokio::spawn(async move {
        while let Some(mut conn) = incoming.recv().await {
            tokio::spawn(async move {
                conn.accept().await.expect("accept");
                let mut buf = vec![0u8; 4096];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                conn.close().await;
            });
        }
    });
}

// =============================================================================
// DIAL
// =============================================================================

#[tokio::test]
async fn dial_round_trips_bytes_through_agent() {
    let (server, _agent, incoming, ctx) = pair(quiet_config());
    spawn_echo_agent(incoming);

    let mut conn = timeout(WAIT, server.dial(&ctx, "tcp", "127.0.0.1:8080"))
        .await
        .expect("dial within timeout")
        .expect("dial ok");
    assert_eq!(conn.state(), ConnState::Open);
    assert_eq!(conn.address(), "127.0.0.1:8080");

    conn.write_all(b"hello").await.expect("write");
    let mut buf = [0u8; 5];
    timeout(WAIT, conn.read_exact(&mut buf)).await.expect("echo within timeout").expect("read");
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn conn_ids_are_unique_within_a_session() {
    let (server, _agent, incoming, ctx) = pair(quiet_config());
    spawn_echo_agent(incoming);

    let mut ids = HashSet::new();
    let mut conns = Vec::new();
    for _ in 0..32 {
        let conn = timeout(WAIT, server.dial(&ctx, "tcp", "svc:1")).await.expect("dial in time").expect("dial ok");
        assert!(ids.insert(conn.id()), "duplicate id {}", conn.id());
        conns.push(conn);
    }
    assert_eq!(server.conn_count().await, 32);
}

#[tokio::test]
async fn concurrent_dials_keep_interleaved_streams_separate() {
    let (server, _agent, incoming, ctx) = pair(quiet_config());
    spawn_echo_agent(incoming);

    let mut rng = rand::rng();
    let payloads: Vec<(Vec<u8>, Vec<usize>)> = (0..16)
        .map(|_| {
            let len = rng.random_range(1..40_000);
            let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            let mut chunks = Vec::new();
            let mut left = len;
            while left > 0 {
                let chunk = rng.random_range(1..=left.min(10_000));
                chunks.push(chunk);
                left -= chunk;
            }
            (payload, chunks)
        })
        .collect();

    let mut tasks = Vec::new();
    for (payload, chunks) in payloads {
        let server = server.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            let conn = server.dial(&ctx, "tcp", "svc:2").await.expect("dial");
            let (mut reader, mut writer) = tokio::io::split(conn);
            let expected = payload.clone();
            let write = tokio::spawn(async move {
                let mut offset = 0;
                for chunk in chunks {
                    writer.write_all(&payload[offset..offset + chunk]).await.expect("write chunk");
                    offset += chunk;
                    tokio::task::yield_now().await;
                }
                writer
            });
            let mut echoed = vec![0u8; expected.len()];
            reader.read_exact(&mut echoed).await.expect("read echo");
            let _writer = write.await.expect("writer task");
            assert_eq!(echoed, expected);
        }));
    }

    for task in tasks {
        timeout(Duration::from_secs(20), task).await.expect("stream finished").expect("stream task");
    }
}

#[tokio::test]
async fn rejected_dial_reports_the_agent_error() {
    let (server, _agent, mut incoming, ctx) = pair(quiet_config());
    tokio::spawn(async move {
        let conn = incoming.recv().await.expect("connect request");
        conn.reject(TunnelError::Dial("connection refused".into())).await;
    });

    let err = timeout(WAIT, server.dial(&ctx, "tcp", "127.0.0.1:1"))
        .await
        .expect("dial resolves")
        .expect_err("dial must fail");
    match err {
        TunnelError::Dial(msg) => assert!(msg.contains("connection refused"), "{msg}"),
        other => panic!("expected dial error, got {other:?}"),
    }
}

#[tokio::test]
async fn oversized_dial_target_fails_only_that_dial() {
    let (server, agent, incoming, ctx) = pair(quiet_config());
    spawn_echo_agent(incoming);
    let max = server.config().max_read;

    let err = timeout(WAIT, server.dial(&ctx, "tcp", &"a".repeat(max + 1)))
        .await
        .expect("dial resolves")
        .expect_err("address too long");
    assert!(matches!(err, TunnelError::Dial(_)), "{err:?}");
    let err = timeout(WAIT, server.dial(&ctx, &"p".repeat(max + 1), "svc:1"))
        .await
        .expect("dial resolves")
        .expect_err("proto too long");
    assert!(matches!(err, TunnelError::Dial(_)), "{err:?}");
    assert_eq!(server.conn_count().await, 0);

    // An address right at the limit still goes through.
    let mut conn = timeout(WAIT, server.dial(&ctx, "tcp", &"a".repeat(max)))
        .await
        .expect("dial resolves")
        .expect("dial ok");
    conn.write_all(b"ok").await.expect("write");
    let mut buf = [0u8; 2];
    timeout(WAIT, conn.read_exact(&mut buf)).await.expect("echo in time").expect("read");
    assert_eq!(&buf, b"ok");
    assert!(!server.is_closed());
    assert!(!agent.is_closed());
}

#[tokio::test]
async fn long_rejection_message_fails_only_that_dial() {
    let (server, agent, mut incoming, ctx) = pair(quiet_config());
    let max = server.config().max_read;
    tokio::spawn(async move {
        let conn = incoming.recv().await.expect("connect request");
        let reason = format!("{} {} is not allowed", conn.proto(), conn.address());
        conn.reject(TunnelError::Dial(reason)).await;
    });

    let address = "b".repeat(max - 12);
    let err = timeout(WAIT, server.dial(&ctx, "tcp", &address))
        .await
        .expect("dial resolves")
        .expect_err("rejected");
    match err {
        TunnelError::Dial(msg) => {
            assert!(msg.len() <= max, "message cut to the frame limit: {}", msg.len());
            assert!(msg.contains("bbbb"), "keeps the start of the reason");
        }
        other => panic!("expected dial error, got {other:?}"),
    }
    assert!(!server.is_closed());
    assert!(!agent.is_closed());
}

#[tokio::test]
async fn unacknowledged_dial_times_out_and_tells_the_peer() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let server = Session::server("agent-1", transport, quiet_config(), &ctx);

    let dial = tokio::spawn({
        let server = server.clone();
        let ctx = ctx.clone();
        async move { server.dial_with_timeout(&ctx, "tcp", "10.0.0.1:22", Duration::from_millis(50)).await }
    });

    let connect = timeout(WAIT, peer.next_frame()).await.expect("connect frame");
    let Body::Connect(req) = &connect.body else { panic!("expected connect, got {connect:?}") };
    assert_eq!(req.address, "10.0.0.1:22");
    assert_eq!(req.deadline_ms, 50);

    let err = timeout(WAIT, dial).await.expect("dial resolves").expect("task").expect_err("timeout");
    assert!(matches!(err, TunnelError::Timeout(_)), "{err:?}");

    let abort = timeout(WAIT, peer.next_frame()).await.expect("error frame");
    assert_eq!(abort.conn_id, connect.conn_id);
    assert!(matches!(abort.body, Body::Error(_)), "{abort:?}");
    assert!(!server.is_closed(), "a dial timeout is connection scoped");
}

#[tokio::test]
async fn cancelled_dial_returns_cancelled() {
    let (transport, mut peer) = raw_transport();
    let session_ctx = CancellationToken::new();
    let server = Session::server("agent-1", transport, quiet_config(), &session_ctx);

    let dial_ctx = CancellationToken::new();
    let dial = tokio::spawn({
        let server = server.clone();
        let dial_ctx = dial_ctx.clone();
        async move { server.dial(&dial_ctx, "tcp", "db:5432").await }
    });
    timeout(WAIT, peer.next_frame()).await.expect("connect frame");
    dial_ctx.cancel();

    let err = timeout(WAIT, dial).await.expect("dial resolves").expect("task").expect_err("cancelled");
    assert!(matches!(err, TunnelError::Cancelled), "{err:?}");
    assert!(!server.is_closed());
}

#[tokio::test]
async fn data_before_connect_echo_counts_as_acknowledgment() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let server = Session::server("agent-1", transport, quiet_config(), &ctx);

    let dial = tokio::spawn({
        let server = server.clone();
        let ctx = ctx.clone();
        async move { server.dial(&ctx, "tcp", "svc:3").await }
    });
    let connect = timeout(WAIT, peer.next_frame()).await.expect("connect frame");
    peer.send_frame(&Frame::data(connect.conn_id, Bytes::from_static(b"early"))).await;

    let mut conn = timeout(WAIT, dial).await.expect("dial resolves").expect("task").expect("dial ok");
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"early");
}

// =============================================================================
// TEARDOWN
// =============================================================================

#[tokio::test]
async fn close_fans_out_to_every_connection_once() {
    let (server, _agent, incoming, ctx) = pair(quiet_config());
    spawn_echo_agent(incoming);

    let mut conns = Vec::new();
    for _ in 0..3 {
        conns.push(server.dial(&ctx, "tcp", "svc:4").await.expect("dial"));
    }

    server.close();
    server.close_with(TunnelError::Protocol("late".into()));
    let reason = timeout(WAIT, server.closed()).await.expect("teardown finished");
    assert!(matches!(reason, TunnelError::SessionClosed(_)), "first reason wins: {reason:?}");
    assert_eq!(server.state(), SessionState::Closed);

    for conn in &mut conns {
        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.expect_err("conn sees the session error");
        assert!(matches!(err, TunnelError::SessionClosed(_)), "{err:?}");
        assert_eq!(conn.state(), ConnState::Closed);
    }
    assert_eq!(server.conn_count().await, 0);

    let err = server.dial(&ctx, "tcp", "svc:4").await.expect_err("dial on closed session");
    assert!(matches!(err, TunnelError::SessionClosed(_)), "{err:?}");
}

#[tokio::test]
async fn peer_going_away_closes_both_sides() {
    let (server, agent, incoming, ctx) = pair(quiet_config());
    spawn_echo_agent(incoming);
    let _conn = server.dial(&ctx, "tcp", "svc:5").await.expect("dial");

    agent.close();
    let reason = timeout(WAIT, server.closed()).await.expect("server noticed");
    assert!(reason.is_session_fatal(), "{reason:?}");
    timeout(WAIT, agent.closed()).await.expect("agent closed");
}

#[tokio::test]
async fn parent_cancellation_closes_session() {
    let (server, _agent, _incoming, ctx) = pair(quiet_config());
    ctx.cancel();
    let reason = timeout(WAIT, server.closed()).await.expect("closed");
    assert!(matches!(reason, TunnelError::Cancelled), "{reason:?}");
}

#[tokio::test]
async fn missed_pongs_time_out_every_connection() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let config = TunnelConfig {
        ping_write_interval: Duration::from_millis(20),
        ping_wait_duration: Duration::from_millis(100),
        ..quiet_config()
    };
    let server = Session::server("agent-1", transport, config, &ctx);

    let dial = tokio::spawn({
        let server = server.clone();
        let ctx = ctx.clone();
        async move { server.dial(&ctx, "tcp", "svc:6").await }
    });
    let connect = timeout(WAIT, peer.next_frame()).await.expect("connect frame");
    peer.send_frame(&Frame::connect(connect.conn_id, "tcp", "svc:6", 0)).await;
    let mut conn = timeout(WAIT, dial).await.expect("dial resolves").expect("task").expect("dial ok");

    // The peer never answers pings.
    let reason = timeout(WAIT, server.closed()).await.expect("liveness failure");
    assert!(matches!(reason, TunnelError::Timeout(_)), "{reason:?}");

    let mut buf = [0u8; 1];
    let err = conn.read(&mut buf).await.expect_err("conn inherits the timeout");
    assert!(matches!(err, TunnelError::Timeout(_)), "{err:?}");
}

#[tokio::test]
async fn malformed_frame_is_a_protocol_error() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let server = Session::server("agent-1", transport, quiet_config(), &ctx);

    peer.tx.send(WireMessage::Binary(Bytes::from_static(&[0, 1, 2]))).await.expect("send");
    let reason = timeout(WAIT, server.closed()).await.expect("closed");
    assert!(matches!(reason, TunnelError::Protocol(_)), "{reason:?}");
}

#[tokio::test]
async fn duplicate_connect_is_a_protocol_error() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let (agent, mut incoming) = Session::agent("agent-1", transport, quiet_config(), &ctx);

    peer.send_frame(&Frame::connect(9, "tcp", "svc:7", 0)).await;
    let _conn = timeout(WAIT, incoming.recv()).await.expect("accept queue").expect("conn");
    peer.send_frame(&Frame::connect(9, "tcp", "svc:7", 0)).await;

    let reason = timeout(WAIT, agent.closed()).await.expect("closed");
    assert!(matches!(reason, TunnelError::Protocol(_)), "{reason:?}");
}

// =============================================================================
// ROUTING EDGE CASES
// =============================================================================

#[tokio::test]
async fn frames_for_unknown_connections_are_dropped() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let server = Session::server("agent-1", transport, quiet_config(), &ctx);

    peer.send_frame(&Frame::data(404, Bytes::from_static(b"stray"))).await;
    peer.send_frame(&Frame::close(405)).await;
    peer.send_frame(&Frame::error(406, "gone")).await;
    peer.tx.send(WireMessage::Text("hi".into())).await.expect("send text");

    // The pong proves everything before it was routed.
    peer.tx.send(WireMessage::Ping(Bytes::new())).await.expect("send ping");
    timeout(WAIT, async {
        while !matches!(peer.rx.next().await, Some(WireMessage::Pong(_))) {}
    })
    .await
    .expect("pong");

    assert_eq!(server.conn_count().await, 0);
    assert!(!server.is_closed());
}

#[tokio::test]
async fn server_closes_connect_for_unknown_id() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let _server = Session::server("agent-1", transport, quiet_config(), &ctx);

    peer.send_frame(&Frame::connect(77, "tcp", "svc:8", 0)).await;
    let reply = timeout(WAIT, peer.next_frame()).await.expect("reply");
    assert_eq!(reply.conn_id, 77);
    assert!(matches!(reply.body, Body::Close(_)), "{reply:?}");
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let _server = Session::server("agent-1", transport, quiet_config(), &ctx);

    peer.tx.send(WireMessage::Ping(Bytes::from_static(b"beat"))).await.expect("send ping");
    let pong = timeout(WAIT, async {
        loop {
            if let WireMessage::Pong(data) = peer.rx.next().await.expect("sink open") {
                break data;
            }
        }
    })
    .await
    .expect("pong");
    assert_eq!(pong.as_ref(), b"beat");
}

#[tokio::test]
async fn full_accept_queue_rejects_new_connects() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let config = TunnelConfig { accept_queue_capacity: 1, ..quiet_config() };
    let (_agent, _incoming) = Session::agent("agent-1", transport, config, &ctx);

    peer.send_frame(&Frame::connect(1, "tcp", "svc:9", 0)).await;
    peer.send_frame(&Frame::connect(2, "tcp", "svc:9", 0)).await;

    let reply = timeout(WAIT, peer.next_frame()).await.expect("rejection");
    assert_eq!(reply.conn_id, 2);
    assert!(matches!(reply.body, Body::Error(_)), "{reply:?}");
}

#[tokio::test]
async fn stalled_reader_only_loses_its_own_connection() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let config = TunnelConfig {
        read_queue_capacity: 1,
        read_buffer_wait: Duration::from_millis(50),
        ..quiet_config()
    };
    let server = Session::server("agent-1", transport, config, &ctx);

    let dial = tokio::spawn({
        let server = server.clone();
        let ctx = ctx.clone();
        async move { server.dial(&ctx, "tcp", "svc:10").await }
    });
    let connect = timeout(WAIT, peer.next_frame()).await.expect("connect frame");
    peer.send_frame(&Frame::connect(connect.conn_id, "tcp", "svc:10", 0)).await;
    let mut conn = timeout(WAIT, dial).await.expect("dial resolves").expect("task").expect("dial ok");

    for _ in 0..3 {
        peer.send_frame(&Frame::data(connect.conn_id, Bytes::from_static(b"xx"))).await;
    }

    let abort = timeout(WAIT, peer.next_frame()).await.expect("error frame");
    assert_eq!(abort.conn_id, connect.conn_id);
    assert!(matches!(abort.body, Body::Error(_)), "{abort:?}");
    assert!(!server.is_closed());

    let mut buf = [0u8; 2];
    assert_eq!(conn.read(&mut buf).await.expect("buffered data survives"), 2);
    let err = conn.read(&mut buf).await.expect_err("then the timeout");
    assert!(matches!(err, TunnelError::Timeout(_)), "{err:?}");
}

/// Dial from `server` and acknowledge from the raw peer.
async fn open_raw(server: &Session, ctx: &CancellationToken, peer: &mut RawPeer, address: &str) -> VirtualConn {
    let dial = tokio::spawn({
        let server = server.clone();
        let ctx = ctx.clone();
        let address = address.to_owned();
        async move { server.dial(&ctx, "tcp", &address).await }
    });
    let connect = timeout(WAIT, peer.next_frame()).await.expect("connect frame");
    peer.send_frame(&Frame::connect(connect.conn_id, "tcp", address, 0)).await;
    timeout(WAIT, dial).await.expect("dial resolves").expect("task").expect("dial ok")
}

#[tokio::test]
async fn stalled_reader_does_not_hold_up_other_connections() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let config = TunnelConfig {
        read_queue_capacity: 2,
        read_buffer_wait: Duration::from_secs(30),
        ..quiet_config()
    };
    let server = Session::server("agent-1", transport, config, &ctx);

    let mut slow = open_raw(&server, &ctx, &mut peer, "svc:11").await;
    let mut fast = open_raw(&server, &ctx, &mut peer, "svc:12").await;

    // Fill the slow connection's buffer and park a chunk behind it.
    for chunk in [&b"s1"[..], b"s2", b"s3"] {
        peer.send_frame(&Frame::data(slow.id(), Bytes::copy_from_slice(chunk))).await;
    }
    peer.send_frame(&Frame::data(fast.id(), Bytes::from_static(b"quick"))).await;

    let mut buf = [0u8; 5];
    timeout(Duration::from_millis(500), fast.read_exact(&mut buf))
        .await
        .expect("sibling data is routed while the slow reader stalls")
        .expect("read");
    assert_eq!(&buf, b"quick");

    // The parked chunks arrive in order, followed by EOF after the remote close.
    peer.send_frame(&Frame::close(slow.id())).await;
    let mut received = Vec::new();
    timeout(WAIT, slow.read_to_end(&mut received)).await.expect("drained in time").expect("read to end");
    assert_eq!(received, b"s1s2s3");
    assert!(!server.is_closed());
}

#[tokio::test]
async fn spill_overflow_closes_only_the_flooded_connection() {
    let (transport, mut peer) = raw_transport();
    let ctx = CancellationToken::new();
    let config = TunnelConfig {
        read_queue_capacity: 1,
        read_buffer_wait: Duration::from_secs(30),
        ..quiet_config()
    };
    let server = Session::server("agent-1", transport, config, &ctx);
    let flooded = open_raw(&server, &ctx, &mut peer, "svc:13").await;

    for _ in 0..8 {
        peer.send_frame(&Frame::data(flooded.id(), Bytes::from_static(b"zz"))).await;
    }

    let abort = timeout(WAIT, peer.next_frame()).await.expect("error frame");
    assert_eq!(abort.conn_id, flooded.id());
    assert!(matches!(abort.body, Body::Error(_)), "{abort:?}");
    assert!(!server.is_closed());
}
