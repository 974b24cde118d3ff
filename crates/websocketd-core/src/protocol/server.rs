//! Encoder for server response frames.
//!
//! Every response is `{"op": <operation>, "code": 0, "data": <data>}`; the
//! only failure code ever emitted on the wire is a close frame, so `code`
//! stays 0.

use serde_json::{json, Value};

const CODE_SUCCESS: u32 = 0;

pub fn encode_init(version: u32) -> String {
    encode("init", json!({ "version": version }))
}

pub fn encode_subscribe() -> String {
    encode("subscribe", Value::Null)
}

pub fn encode_start() -> String {
    encode("start", Value::Null)
}

pub fn encode_token() -> String {
    encode("token", Value::Null)
}

pub fn encode_event(event: &Value) -> String {
    encode("event", event.clone())
}

pub fn encode_pong(payload: &str) -> String {
    encode("pong", json!({ "payload": payload }))
}

fn encode(operation: &str, data: Value) -> String {
    json!({ "op": operation, "code": CODE_SUCCESS, "data": data }).to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(frame: String) -> Value {
        serde_json::from_str(&frame).unwrap()
    }

    #[test]
    fn init_carries_version() {
        assert_eq!(
            parse(encode_init(2)),
            json!({"op": "init", "code": 0, "data": {"version": 2}})
        );
    }

    #[test]
    fn subscribe_has_null_data() {
        assert_eq!(
            parse(encode_subscribe()),
            json!({"op": "subscribe", "code": 0, "data": null})
        );
    }

    #[test]
    fn start_has_null_data() {
        assert_eq!(
            parse(encode_start()),
            json!({"op": "start", "code": 0, "data": null})
        );
    }

    #[test]
    fn token_has_null_data() {
        assert_eq!(
            parse(encode_token()),
            json!({"op": "token", "code": 0, "data": null})
        );
    }

    #[test]
    fn event_wraps_the_payload() {
        let event = json!({
            "name": "auth_session_created",
            "origin_uuid": "2170f276-9344-44e8-aad7-dd98bb849b8f",
            "required_acl": "events.auth.sessions.a725625b-01d0-4afb-a2de-dcbaa19031e5.created",
            "data": {
                "uuid": "a725625b-01d0-4afb-a2de-dcbaa19031e5",
                "tenant_uuid": "47bfdafc-2897-4369-8fb3-153d41fb835d",
                "user_uuid": "73cfa622-6f5b-4a0d-9788-ddb72ab57836",
                "mobile": false,
            },
        });

        assert_eq!(
            parse(encode_event(&event)),
            json!({"op": "event", "code": 0, "data": event})
        );
    }

    #[test]
    fn pong_echoes_the_payload() {
        assert_eq!(
            parse(encode_pong("abcd")),
            json!({"op": "pong", "code": 0, "data": {"payload": "abcd"}})
        );
    }
}
