//! Wire-level frame vectors for the client protocol.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use serde_json::json;
use websocketd_core::protocol::{client::ClientMessage, decode, server};

#[test]
fn init_is_the_negotiated_greeting() {
    let frame: serde_json::Value = serde_json::from_str(&server::encode_init(2)).unwrap();
    assert_eq!(frame, json!({"op": "init", "code": 0, "data": {"version": 2}}));
}

#[test]
fn ping_pong_echoes_the_payload() {
    let msg = decode(r#"{"op": "ping", "data": {"payload": "abc"}}"#).unwrap();
    let payload = match msg {
        ClientMessage::Ping { payload } => payload,
        other => panic!("expected ping, got {other:?}"),
    };

    let frame: serde_json::Value = serde_json::from_str(&server::encode_pong(&payload)).unwrap();
    assert_eq!(frame, json!({"op": "pong", "code": 0, "data": {"payload": "abc"}}));
}

#[test]
fn a_full_client_exchange_decodes() {
    assert_eq!(
        decode(r#"{"op": "subscribe", "data": {"event_name": "call_created"}}"#).unwrap(),
        ClientMessage::Subscribe {
            event_name: "call_created".into()
        }
    );
    assert_eq!(decode(r#"{"op": "start"}"#).unwrap(), ClientMessage::Start);
    assert_eq!(
        decode(r#"{"op": "token", "data": {"token": "new-token-id"}}"#).unwrap(),
        ClientMessage::Token {
            token: "new-token-id".into()
        }
    );
}
