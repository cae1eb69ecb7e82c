use std::time::Duration;

use futures::StreamExt;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use super::test_helpers::{spawn_server, wait_for_peer};
use super::*;
use crate::wire::test_helpers::quiet_config;

fn handshake(addr: std::net::SocketAddr, headers: &[(&'static str, &str)]) -> tungstenite::handshake::client::Request {
    let mut request = format!("ws://{addr}/connect").into_client_request().expect("request");
    for (name, value) in headers {
        request.headers_mut().insert(*name, value.parse().expect("header value"));
    }
    request
}

fn status_of(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(response) => response.status().as_u16(),
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[test]
fn hash_token_is_hex_sha256() {
    assert_eq!(hash_token("abc"), "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
}

#[tokio::test]
async fn header_authorizer_checks_token_digests() {
    let auth = HeaderAuthorizer::with_tokens(["s3cret", " "]);
    assert!(auth.requires_token());

    let mut headers = HeaderMap::new();
    assert!(matches!(auth.authorize("foo", &headers).await, Err(TunnelError::Auth(_))));

    headers.insert(TOKEN_HEADER, "wrong".parse().expect("value"));
    assert!(matches!(auth.authorize("foo", &headers).await, Err(TunnelError::Auth(_))));

    headers.insert(TOKEN_HEADER, "s3cret".parse().expect("value"));
    assert_eq!(auth.authorize("foo", &headers).await.expect("authorized"), "foo");

    let open = HeaderAuthorizer::allow_all();
    assert_eq!(open.authorize("bar", &HeaderMap::new()).await.expect("open"), "bar");
}

#[tokio::test]
async fn missing_peer_key_is_a_bad_request() {
    let server = TunnelServer::new(HeaderAuthorizer::allow_all(), quiet_config());
    let addr = spawn_server(&server).await;

    let err = tokio_tungstenite::connect_async(handshake(addr, &[])).await.expect_err("rejected");
    assert_eq!(status_of(err), 400);
}

#[tokio::test]
async fn bad_token_is_unauthorized() {
    let server = TunnelServer::new(HeaderAuthorizer::with_tokens(["s3cret"]), quiet_config());
    let addr = spawn_server(&server).await;

    let request = handshake(addr, &[("x-tunnel-id", "foo"), ("x-api-tunnel-token", "nope")]);
    let err = tokio_tungstenite::connect_async(request).await.expect_err("rejected");
    assert_eq!(status_of(err), 401);
    assert!(server.registry().is_empty().await);
}

#[tokio::test]
async fn accepted_agent_is_registered_until_it_leaves() {
    let server = TunnelServer::new(HeaderAuthorizer::with_tokens(["s3cret"]), quiet_config());
    let addr = spawn_server(&server).await;

    let request = handshake(addr, &[("x-tunnel-id", "foo"), ("x-api-tunnel-token", "s3cret")]);
    let (socket, _) = tokio_tungstenite::connect_async(request).await.expect("upgrade");
    let session = wait_for_peer(&server, "foo").await;
    assert_eq!(session.peer_key(), "foo");

    let peers: serde_json::Value = reqwest::get(format!("http://{addr}/peers"))
        .await
        .expect("peers request")
        .json()
        .await
        .expect("peers json");
    assert_eq!(peers, serde_json::json!({ "peers": ["foo"] }));

    drop(socket);
    tokio::time::timeout(Duration::from_secs(5), session.closed()).await.expect("session ends with the socket");
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.registry().has_session("foo").await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("unregistered");
}

#[tokio::test]
async fn text_frames_do_not_break_the_session() {
    use futures::SinkExt;

    let server = TunnelServer::new(HeaderAuthorizer::allow_all(), quiet_config());
    let addr = spawn_server(&server).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(handshake(addr, &[("x-tunnel-id", "foo")]))
        .await
        .expect("upgrade");
    let session = wait_for_peer(&server, "foo").await;

    socket.send(tungstenite::Message::Text("hello".into())).await.expect("send text");
    socket.send(tungstenite::Message::Ping(Vec::new().into())).await.expect("send ping");
    let pong = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Ok(tungstenite::Message::Pong(_))) = socket.next().await {
                break;
            }
        }
    })
    .await;
    assert!(pong.is_ok(), "session answered the ping");
    assert!(!session.is_closed());
}

#[tokio::test]
async fn healthz_is_ok() {
    let server = TunnelServer::new(HeaderAuthorizer::allow_all(), quiet_config());
    let addr = spawn_server(&server).await;

    let response = reqwest::get(format!("http://{addr}/healthz")).await.expect("healthz");
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let server = TunnelServer::new(HeaderAuthorizer::allow_all(), quiet_config());
    let addr = spawn_server(&server).await;

    let (_socket, _) = tokio_tungstenite::connect_async(handshake(addr, &[("x-tunnel-id", "foo")]))
        .await
        .expect("upgrade");
    let session = wait_for_peer(&server, "foo").await;

    tokio::time::timeout(Duration::from_secs(5), server.shutdown()).await.expect("shutdown");
    assert!(session.is_closed());
    assert!(server.registry().is_empty().await);
}
