//! Decoder for client control frames.
//!
//! Unknown operations decode successfully; rejecting them is the session's
//! job so the error can name the operation.

use serde_json::Value;

use crate::error::{Result, WebsocketdError};

/// One decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Start,
    Subscribe { event_name: String },
    Token { token: String },
    Ping { payload: String },
    /// Operation this protocol does not define.
    Unknown { op: String },
}

/// Decode one text frame into a [`ClientMessage`].
pub fn decode(data: &str) -> Result<ClientMessage> {
    let root: Value = serde_json::from_str(data)
        .map_err(|_| WebsocketdError::Protocol("not a valid json document".into()))?;

    let object = root
        .as_object()
        .ok_or_else(|| WebsocketdError::Protocol("json document root is not an object".into()))?;

    let op = object
        .get("op")
        .ok_or_else(|| WebsocketdError::Protocol("object is missing required \"op\" key".into()))?
        .as_str()
        .ok_or_else(|| WebsocketdError::Protocol("object \"op\" value is not a string".into()))?;

    match op {
        "start" => Ok(ClientMessage::Start),
        "subscribe" => Ok(ClientMessage::Subscribe {
            event_name: required_data_string(object, "event_name")?,
        }),
        "token" => Ok(ClientMessage::Token {
            token: required_data_string(object, "token")?,
        }),
        "ping" => Ok(ClientMessage::Ping {
            payload: required_data_string(object, "payload")?,
        }),
        other => Ok(ClientMessage::Unknown {
            op: other.to_string(),
        }),
    }
}

fn required_data_string(object: &serde_json::Map<String, Value>, key: &str) -> Result<String> {
    let data = object
        .get("data")
        .ok_or_else(|| WebsocketdError::Protocol("object is missing required \"data\" key".into()))?
        .as_object()
        .ok_or_else(|| WebsocketdError::Protocol("object \"data\" value is not an object".into()))?;

    data.get(key)
        .ok_or_else(|| {
            WebsocketdError::Protocol(format!("object \"data\" is missing required \"{key}\" key"))
        })?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| WebsocketdError::Protocol(format!("object data \"{key}\" value is not a string")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn decode_err(data: &str) -> WebsocketdError {
        match decode(data) {
            Err(err) => err,
            Ok(msg) => panic!("expected protocol error, got {msg:?}"),
        }
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(matches!(decode_err("{invalid"), WebsocketdError::Protocol(_)));
    }

    #[test]
    fn non_object_root_is_rejected() {
        assert!(matches!(decode_err("1"), WebsocketdError::Protocol(_)));
    }

    #[test]
    fn missing_op_is_rejected() {
        assert!(matches!(decode_err("{}"), WebsocketdError::Protocol(_)));
    }

    #[test]
    fn non_string_op_is_rejected() {
        assert!(matches!(decode_err(r#"{"op": 2}"#), WebsocketdError::Protocol(_)));
    }

    #[test]
    fn unknown_op_decodes() {
        let msg = decode(r#"{"op": "foo"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown { op: "foo".into() });
    }

    #[test]
    fn subscribe_decodes() {
        let msg = decode(r#"{"op": "subscribe", "data": {"event_name": "foo"}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                event_name: "foo".into()
            }
        );
    }

    #[test]
    fn subscribe_missing_data_is_rejected() {
        assert!(matches!(
            decode_err(r#"{"op": "subscribe"}"#),
            WebsocketdError::Protocol(_)
        ));
    }

    #[test]
    fn subscribe_non_object_data_is_rejected() {
        assert!(matches!(
            decode_err(r#"{"op": "subscribe", "data": 2}"#),
            WebsocketdError::Protocol(_)
        ));
    }

    #[test]
    fn subscribe_missing_event_name_is_rejected() {
        assert!(matches!(
            decode_err(r#"{"op": "subscribe", "data": {}}"#),
            WebsocketdError::Protocol(_)
        ));
    }

    #[test]
    fn subscribe_non_string_event_name_is_rejected() {
        assert!(matches!(
            decode_err(r#"{"op": "subscribe", "data": {"event_name": 1}}"#),
            WebsocketdError::Protocol(_)
        ));
    }

    #[test]
    fn start_decodes() {
        assert_eq!(decode(r#"{"op": "start"}"#).unwrap(), ClientMessage::Start);
    }

    #[test]
    fn token_decodes() {
        let token = "bc9571dd-bc62-4044-b78f-0bfb8a1481e4";
        let msg = decode(&format!(r#"{{"op": "token", "data": {{"token": "{token}"}}}}"#)).unwrap();
        assert_eq!(msg, ClientMessage::Token { token: token.into() });
    }

    #[test]
    fn ping_decodes() {
        let msg = decode(r#"{"op": "ping", "data": {"payload": "abcd"}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { payload: "abcd".into() });
    }
}
