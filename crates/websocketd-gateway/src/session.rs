//! Session state machine.
//!
//! One session owns one WebSocket, one bus consumer, one token-expiry watch
//! and one keep-alive pinger. The four run concurrently; the first to finish
//! wins and the others are cancelled at their next suspension point. The
//! terminating error drives the close code sent to the client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::http::HeaderMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use websocketd_core::error::{Result, WebsocketdError};
use websocketd_core::protocol::{self, client::ClientMessage, server, SUPPORTED_VERSIONS};

use crate::app_state::AppState;
use crate::bus::{BusConsumer, BusEvent, EventReceiver};

const OUTBOUND_QUEUE: usize = 1024;

/// Accept-side glue: logs the peer and runs one session to completion.
pub struct SessionFactory {
    state: AppState,
}

impl SessionFactory {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn run_session(
        &self,
        socket: WebSocket,
        query: HashMap<String, String>,
        headers: HeaderMap,
        remote: SocketAddr,
    ) {
        let remote_address = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| remote.to_string());

        tracing::info!("websocket connection accepted from \"{remote_address}\"");
        Session::new(self.state.clone(), query, headers)
            .run(socket)
            .await;
        tracing::info!("websocket session terminated {remote_address}");
    }
}

pub struct Session {
    state: AppState,
    query: HashMap<String, String>,
    headers: HeaderMap,
    started: AtomicBool,
}

impl Session {
    pub fn new(state: AppState, query: HashMap<String, String>, headers: HeaderMap) -> Self {
        Self {
            state,
            query,
            headers,
            started: AtomicBool::new(false),
        }
    }

    /// Run the session and translate its outcome into a close frame.
    pub async fn run(self, socket: WebSocket) {
        let (ws_tx, ws_rx) = socket.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_outbound(ws_tx, out_rx));

        match self.run_inner(ws_rx, &out_tx).await {
            Ok(()) => {
                tracing::info!("websocket connection closed by client");
            }
            Err(WebsocketdError::ConnectionClosed) => {
                tracing::info!("websocket connection closed");
            }
            Err(e) => {
                match &e {
                    WebsocketdError::Internal(_) => {
                        tracing::error!("unexpected error during websocket session: {e}")
                    }
                    _ => tracing::info!("closing websocket connection: {e}"),
                }
                let frame = CloseFrame {
                    code: e.close_code(),
                    reason: e.close_reason().into(),
                };
                let _ = out_tx.send(Message::Close(Some(frame))).await;
            }
        }

        drop(out_tx);
        let _ = writer.await;
    }

    async fn run_inner(
        &self,
        ws_rx: SplitStream<WebSocket>,
        out_tx: &mpsc::Sender<Message>,
    ) -> Result<()> {
        if !self.state.master_tenant().has_master_tenant() {
            return Err(WebsocketdError::AuthenticationFailed(
                "unable to determine master tenant".into(),
            ));
        }

        let version = extract_version(&self.query)?;
        let token_id = extract_token_id(&self.query, &self.headers)?;
        let token = self.state.authenticator().get_token(&token_id).await?;

        let consumer = self.state.bus().create_consumer(token).await?;
        let result = self.drive(ws_rx, out_tx, &consumer, version).await;
        consumer.detach().await;
        result
    }

    async fn drive(
        &self,
        mut ws_rx: SplitStream<WebSocket>,
        out_tx: &mpsc::Sender<Message>,
        consumer: &BusConsumer,
        version: u32,
    ) -> Result<()> {
        let mut events = consumer
            .take_events()
            .await
            .ok_or_else(|| WebsocketdError::Internal("event stream already taken".into()))?;

        send(out_tx, Message::Text(server::encode_init(version))).await?;

        let ping_interval = Duration::from_secs(self.state.config().websocket.ping_interval);

        // First completed wins; the other tasks are dropped at their next
        // suspension point.
        tokio::select! {
            result = self.task_send_ping(out_tx, ping_interval) => result,
            result = self.task_receive_command(&mut ws_rx, out_tx, consumer, version) => result,
            result = self.task_transmit_event(&mut events, out_tx, version) => result,
            result = self.task_authentication(consumer) => result,
        }
    }

    async fn task_send_ping(
        &self,
        out_tx: &mpsc::Sender<Message>,
        interval: Duration,
    ) -> Result<()> {
        loop {
            tokio::time::sleep(interval).await;
            tracing::debug!("sending websocket ping");
            send(out_tx, Message::Ping(Vec::new())).await?;
        }
    }

    async fn task_receive_command(
        &self,
        ws_rx: &mut SplitStream<WebSocket>,
        out_tx: &mpsc::Sender<Message>,
        consumer: &BusConsumer,
        version: u32,
    ) -> Result<()> {
        loop {
            let data = match ws_rx.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Ok(Message::Text(data))) => data,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Binary(_))) => {
                    return Err(WebsocketdError::Protocol(
                        "expected text frame: got binary data".into(),
                    ))
                }
            };
            let message = protocol::decode(&data)?;
            self.dispatch(message, out_tx, consumer, version).await?;
        }
    }

    async fn dispatch(
        &self,
        message: ClientMessage,
        out_tx: &mpsc::Sender<Message>,
        consumer: &BusConsumer,
        version: u32,
    ) -> Result<()> {
        match message {
            ClientMessage::Subscribe { event_name } => {
                tracing::debug!("subscribing to event \"{event_name}\"");
                consumer.bind(&event_name).await?;
                if !self.started.load(Ordering::SeqCst) || version == 2 {
                    send(out_tx, Message::Text(server::encode_subscribe())).await?;
                }
            }
            ClientMessage::Start => {
                // Repeated start re-acknowledges in v2 only.
                let already_started = self.started.swap(true, Ordering::SeqCst);
                if !already_started || version == 2 {
                    send(out_tx, Message::Text(server::encode_start())).await?;
                }
            }
            ClientMessage::Token { token } => {
                let token = self.state.authenticator().get_token(&token).await?;
                consumer.set_token(token)?;
                if !self.started.load(Ordering::SeqCst) || version == 2 {
                    send(out_tx, Message::Text(server::encode_token())).await?;
                }
            }
            ClientMessage::Ping { payload } => {
                if version == 2 {
                    tracing::debug!("received client ping, sending pong");
                    send(out_tx, Message::Text(server::encode_pong(&payload))).await?;
                } else {
                    tracing::debug!("received client ping, only supported in version 2");
                }
            }
            ClientMessage::Unknown { op } => {
                return Err(WebsocketdError::Protocol(format!(
                    "unknown operation \"{op}\""
                )))
            }
        }
        Ok(())
    }

    async fn task_transmit_event(
        &self,
        events: &mut EventReceiver,
        out_tx: &mpsc::Sender<Message>,
        version: u32,
    ) -> Result<()> {
        while let Some(event) = events.recv().await {
            let event = event?;
            if !self.started.load(Ordering::SeqCst) {
                tracing::debug!("unable to push event to websocket as session hasn't started yet");
                continue;
            }
            send(out_tx, Message::Text(encode_outbound(&event, version))).await?;
        }
        Err(WebsocketdError::BusConnectionLost)
    }

    async fn task_authentication(&self, consumer: &BusConsumer) -> Result<()> {
        self.state
            .authenticator()
            .run_check(consumer.token_getter())
            .await?;
        // The watch only completes by failing; expiry is the only outcome.
        Err(WebsocketdError::AuthenticationExpired)
    }
}

/// Wire format of one delivered event: version 1 passes the broker body
/// through verbatim, version 2 re-wraps it as an `event` frame.
fn encode_outbound(event: &BusEvent, version: u32) -> String {
    if version == 1 {
        event.raw.clone()
    } else {
        server::encode_event(&event.content)
    }
}

async fn send(out_tx: &mpsc::Sender<Message>, message: Message) -> Result<()> {
    out_tx
        .send(message)
        .await
        .map_err(|_| WebsocketdError::ConnectionClosed)
}

async fn write_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = out_rx.recv().await {
        if ws_tx.send(message).await.is_err() {
            break;
        }
    }
}

/// `?version=1|2`, default 1.
fn extract_version(query: &HashMap<String, String>) -> Result<u32> {
    let raw = match query.get("version") {
        None => return Ok(1),
        Some(raw) => raw,
    };
    match raw.parse::<u32>() {
        Ok(version) if SUPPORTED_VERSIONS.contains(&version) => Ok(version),
        _ => Err(WebsocketdError::UnsupportedVersion),
    }
}

/// `?token=<id>` first, `X-Auth-Token` header second.
fn extract_token_id(query: &HashMap<String, String>, headers: &HeaderMap) -> Result<String> {
    if let Some(token) = query.get("token") {
        return Ok(token.clone());
    }
    headers
        .get("x-auth-token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or(WebsocketdError::NoToken)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use lapin::types::FieldTable;
    use serde_json::json;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn version_defaults_to_1() {
        assert_eq!(extract_version(&query(&[])).unwrap(), 1);
    }

    #[test]
    fn versions_1_and_2_are_supported() {
        assert_eq!(extract_version(&query(&[("version", "1")])).unwrap(), 1);
        assert_eq!(extract_version(&query(&[("version", "2")])).unwrap(), 2);
    }

    #[test]
    fn other_versions_are_rejected() {
        for raw in ["3", "0", "two", ""] {
            assert!(matches!(
                extract_version(&query(&[("version", raw)])),
                Err(WebsocketdError::UnsupportedVersion)
            ));
        }
    }

    #[test]
    fn token_comes_from_the_query_first() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Auth-Token", "from-header".parse().unwrap());

        let token = extract_token_id(&query(&[("token", "from-query")]), &headers).unwrap();
        assert_eq!(token, "from-query");
    }

    #[test]
    fn token_falls_back_to_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Auth-Token", "from-header".parse().unwrap());

        let token = extract_token_id(&query(&[]), &headers).unwrap();
        assert_eq!(token, "from-header");
    }

    #[test]
    fn missing_token_is_an_error() {
        assert!(matches!(
            extract_token_id(&query(&[]), &HeaderMap::new()),
            Err(WebsocketdError::NoToken)
        ));
    }

    #[test]
    fn v1_transmits_the_raw_body() {
        let event = BusEvent {
            name: "foo".into(),
            headers: FieldTable::default(),
            acl: Some("event.foo".into()),
            content: json!({"name": "foo", "data": 1}),
            raw: "{\"name\": \"foo\", \"data\": 1}".into(),
        };

        assert_eq!(encode_outbound(&event, 1), event.raw);
    }

    #[test]
    fn v2_transmits_a_wrapped_event_frame() {
        let content = json!({"name": "foo", "data": 1});
        let event = BusEvent {
            name: "foo".into(),
            headers: FieldTable::default(),
            acl: Some("event.foo".into()),
            content: content.clone(),
            raw: content.to_string(),
        };

        let frame: serde_json::Value = serde_json::from_str(&encode_outbound(&event, 2)).unwrap();
        assert_eq!(frame, json!({"op": "event", "code": 0, "data": content}));
    }

    #[test]
    fn close_codes_follow_the_error_taxonomy() {
        assert_eq!(WebsocketdError::NoToken.close_code(), 4001);
        assert_eq!(
            WebsocketdError::AuthenticationFailed("nope".into()).close_code(),
            4002
        );
        assert_eq!(WebsocketdError::AuthenticationExpired.close_code(), 4003);
        assert_eq!(WebsocketdError::Protocol("bad".into()).close_code(), 4004);
        assert_eq!(WebsocketdError::UnsupportedVersion.close_code(), 4004);
        assert_eq!(WebsocketdError::BusConnectionLost.close_code(), 1011);
        assert_eq!(WebsocketdError::Internal("boom".into()).close_code(), 1011);
    }
}
