//! End-to-end gateway tests over real TCP sockets: handshake, login gate,
//! duplicate-login kick, disconnect + reconnect flush.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use hivecore_gate::codec::{GameCodec, GameMessage};
use hivecore_gate::dispatcher::{Dispatcher, FnHandler, Registration};
use hivecore_gate::protocol;
use hivecore_gate::server::GateServer;
use hivecore_gate::session::{Session, SessionRegistry};
use hivecore_shared::config::{GatewayConfig, SessionConfig};
use hivecore_shared::error::{BusinessError, ErrorCode};
use hivecore_shared::ids::RoleId;

type Client = Framed<TcpStream, GameCodec>;

struct Harness {
    #[allow(dead_code)]
    server: GateServer,
    registry: Arc<SessionRegistry>,
    addr: std::net::SocketAddr,
}

/// Test "enter game": binds role from the payload after a fake credential
/// check.
fn enter_game_registration(registry: Arc<SessionRegistry>) -> Registration {
    Registration::new(
        protocol::ENTER_GAME,
        "enter game",
        FnHandler(move |session: Arc<Session>, payload: Value| {
            let registry = Arc::clone(&registry);
            async move {
                let role_id = payload["role_id"].as_u64().ok_or_else(|| {
                    BusinessError::new(ErrorCode::ValidationFailed, "role_id required")
                })?;
                session.set_account(role_id + 10_000, 1);
                registry.bind_role(&session, RoleId::from_u64(role_id), "hero");
                Ok(json!({ "role_id": role_id }))
            }
        }),
    )
    .public()
}

async fn start_gate(grace_ms: u64) -> Harness {
    let registry = Arc::new(SessionRegistry::new(
        &SessionConfig {
            reconnect_grace_ms: grace_ms,
        },
        0,
    ));
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register(enter_game_registration(Arc::clone(&registry)));
    let server = GateServer::bind(
        "127.0.0.1:0",
        Arc::clone(&registry),
        dispatcher,
        &GatewayConfig::default(),
    )
    .await
    .unwrap();
    let addr = server.local_addr();
    Harness {
        server,
        registry,
        addr,
    }
}

async fn connect(harness: &Harness) -> Client {
    let stream = TcpStream::connect(harness.addr).await.unwrap();
    Framed::new(stream, GameCodec::default())
}

async fn call(client: &mut Client, protocol_id: u16, seq: u32, body: Value) -> GameMessage {
    client
        .send(GameMessage::request(
            protocol_id,
            seq,
            body.to_string().into_bytes(),
        ))
        .await
        .unwrap();
    loop {
        let message = client.next().await.unwrap().unwrap();
        if matches!(&message, GameMessage::Response { seq_id, .. } if *seq_id == seq) {
            return message;
        }
    }
}

fn response_body(message: &GameMessage) -> Value {
    let GameMessage::Response { payload, .. } = message else {
        unreachable!("expected a response");
    };
    serde_json::from_slice(payload).unwrap()
}

#[tokio::test]
async fn handshake_issues_session_key_and_server_time() {
    let harness = start_gate(300_000).await;
    let mut client = connect(&harness).await;

    let response = call(
        &mut client,
        protocol::HANDSHAKE,
        1,
        json!({"client_version": "1.0.0", "platform": "web", "device_id": "d-1"}),
    )
    .await;

    let GameMessage::Response {
        seq_id, error_code, ..
    } = &response
    else {
        unreachable!()
    };
    assert_eq!(*seq_id, 1);
    assert_eq!(*error_code, ErrorCode::Success);

    let body = response_body(&response);
    assert_eq!(body["session_key"].as_str().unwrap().len(), 64);
    let server_time = body["server_time"].as_i64().unwrap();
    let now = chrono::Utc::now().timestamp_millis();
    assert!((now - server_time).abs() < 5_000);
    assert_eq!(body["need_update"], false);
}

#[tokio::test]
async fn heartbeat_echoes_client_time() {
    let harness = start_gate(300_000).await;
    let mut client = connect(&harness).await;

    let response = call(
        &mut client,
        protocol::HEARTBEAT,
        2,
        json!({"client_time": 123456}),
    )
    .await;
    let body = response_body(&response);
    assert_eq!(body["client_time"], 123456);
    assert!(body["server_time"].as_i64().is_some());
}

#[tokio::test]
async fn unknown_protocol_gets_illegal_operation() {
    let harness = start_gate(300_000).await;
    let mut client = connect(&harness).await;
    let response = call(&mut client, 0x0999, 3, json!({})).await;
    let GameMessage::Response { error_code, .. } = response else {
        unreachable!()
    };
    assert_eq!(error_code, ErrorCode::IllegalOperation);
}

#[tokio::test]
async fn duplicate_login_kicks_first_session() {
    let harness = start_gate(300_000).await;

    let mut first = connect(&harness).await;
    call(&mut first, protocol::HANDSHAKE, 1, json!({})).await;
    call(&mut first, protocol::ENTER_GAME, 2, json!({"role_id": 42})).await;

    let mut second = connect(&harness).await;
    call(&mut second, protocol::HANDSHAKE, 1, json!({})).await;
    call(&mut second, protocol::ENTER_GAME, 2, json!({"role_id": 42})).await;

    // The role resolves to the second session.
    let live = harness.registry.lookup_by_role(RoleId::from_u64(42)).unwrap();
    assert!(live.is_connected());

    // The first client receives the KICK push.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        tokio::select! {
            frame = first.next() => {
                let message = frame.unwrap().unwrap();
                if let GameMessage::Push { push_type, .. } = message {
                    assert_eq!(push_type, protocol::PUSH_KICK);
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => panic!("kick push never arrived"),
        }
    }
}

#[tokio::test]
async fn disconnect_then_reconnect_flushes_pushes_in_order() {
    let harness = start_gate(300_000).await;

    let mut client = connect(&harness).await;
    let handshake = call(&mut client, protocol::HANDSHAKE, 1, json!({})).await;
    let session_key = response_body(&handshake)["session_key"]
        .as_str()
        .unwrap()
        .to_string();
    call(&mut client, protocol::ENTER_GAME, 2, json!({"role_id": 7})).await;

    // Hard drop of the socket.
    drop(client);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let session = loop {
        let session = harness.registry.lookup_by_role(RoleId::from_u64(7)).unwrap();
        if !session.is_connected() {
            break session;
        }
        assert!(tokio::time::Instant::now() < deadline, "disconnect unseen");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    // Three pushes land while the session is offline.
    for i in 1..=3u8 {
        session.send(GameMessage::push(0xF010, vec![i]));
    }

    // Reconnect with the stored key: the pushes arrive first, in order.
    let mut resumed = connect(&harness).await;
    resumed
        .send(GameMessage::request(
            protocol::RECONNECT,
            9,
            json!({"session_key": session_key}).to_string().into_bytes(),
        ))
        .await
        .unwrap();

    for i in 1..=3u8 {
        let frame = resumed.next().await.unwrap().unwrap();
        assert_eq!(frame, GameMessage::push(0xF010, vec![i]), "push {i} out of order");
    }
    let response = resumed.next().await.unwrap().unwrap();
    let GameMessage::Response {
        protocol_id,
        error_code,
        ..
    } = response
    else {
        unreachable!()
    };
    assert_eq!(protocol_id, protocol::RECONNECT);
    assert_eq!(error_code, ErrorCode::Success);
}

#[tokio::test]
async fn malformed_reconnect_payload_closes_the_connection() {
    let harness = start_gate(300_000).await;
    let mut client = connect(&harness).await;
    call(&mut client, protocol::HANDSHAKE, 1, json!({})).await;

    // Not JSON at all: a ParseError response, then the link drops.
    client
        .send(GameMessage::request(
            protocol::RECONNECT,
            2,
            b"{not json".to_vec(),
        ))
        .await
        .unwrap();

    let mut saw_parse_error = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        tokio::select! {
            frame = client.next() => match frame {
                Some(Ok(GameMessage::Response {
                    protocol_id,
                    error_code,
                    ..
                })) => {
                    assert_eq!(protocol_id, protocol::RECONNECT);
                    assert_eq!(error_code, ErrorCode::ParseError);
                    saw_parse_error = true;
                }
                Some(Ok(_)) => continue,
                None | Some(Err(_)) => break,
            },
            _ = tokio::time::sleep_until(deadline) => panic!("connection not closed"),
        }
    }
    assert!(saw_parse_error, "ParseError response never arrived");
}

#[tokio::test]
async fn reconnect_missing_session_key_closes_the_connection() {
    let harness = start_gate(300_000).await;
    let mut client = connect(&harness).await;
    call(&mut client, protocol::HANDSHAKE, 1, json!({})).await;

    // Valid JSON but no session_key field: same protocol-class failure.
    client
        .send(GameMessage::request(
            protocol::RECONNECT,
            2,
            json!({"wrong_field": true}).to_string().into_bytes(),
        ))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        tokio::select! {
            frame = client.next() => match frame {
                Some(Ok(_)) => continue,
                None | Some(Err(_)) => break,
            },
            _ = tokio::time::sleep_until(deadline) => panic!("connection not closed"),
        }
    }
}

#[tokio::test]
async fn reconnect_after_grace_is_rejected() {
    let harness = start_gate(40).await;

    let mut client = connect(&harness).await;
    let handshake = call(&mut client, protocol::HANDSHAKE, 1, json!({})).await;
    let session_key = response_body(&handshake)["session_key"]
        .as_str()
        .unwrap()
        .to_string();
    drop(client);

    tokio::time::sleep(Duration::from_millis(120)).await;

    let mut retry = connect(&harness).await;
    let response = call(
        &mut retry,
        protocol::RECONNECT,
        1,
        json!({"session_key": session_key}),
    )
    .await;
    let GameMessage::Response { error_code, .. } = response else {
        unreachable!()
    };
    assert_eq!(error_code, ErrorCode::TokenInvalid);
}

#[tokio::test]
async fn oversized_frame_closes_the_connection() {
    let harness = start_gate(300_000).await;
    let mut client = connect(&harness).await;
    call(&mut client, protocol::HANDSHAKE, 1, json!({})).await;

    // Encode an over-cap frame by hand with a permissive client codec.
    let stream = client.into_inner();
    let mut huge = Framed::new(
        stream,
        GameCodec::new(8 * 1024 * 1024),
    );
    // The server may slam the door mid-write; either way the send must
    // not be acknowledged with a response.
    let _ = huge
        .send(GameMessage::request(0x0201, 2, vec![0u8; 2 * 1024 * 1024]))
        .await;

    // The server drops the link without a response.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        tokio::select! {
            frame = huge.next() => {
                match frame {
                    None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
            _ = tokio::time::sleep_until(deadline) => panic!("connection not closed"),
        }
    }
}
