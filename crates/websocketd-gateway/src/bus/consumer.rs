//! Per-session AMQP consumer.
//!
//! Each session gets its own channel and exclusive queue. Non-master-tenant
//! users consume through a tenant-scoped headers sub-exchange that enforces
//! `origin_uuid` and `tenant_uuid`; bindings are then added per event name.
//! Deliveries are decoded, ACL-filtered and pushed onto the session's event
//! stream; everything is acked, including drops, to prevent redelivery.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
    ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use websocketd_core::acl::AccessCheck;
use websocketd_core::error::{Result, WebsocketdError};

use crate::auth::watch::{CurrentToken, TokenGetter};
use crate::auth::{MasterTenantCell, Token, TokenMetadata};

use super::connection::BusConnection;
use super::{BusSettings, SERVICE_NAME};

static CONSUMER_IDS: AtomicU64 = AtomicU64::new(1);

/// One decoded, ACL-cleared bus event.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub name: String,
    pub headers: FieldTable,
    pub acl: Option<String>,
    pub content: serde_json::Value,
    /// Original UTF-8 body, passed through verbatim in protocol version 1.
    pub raw: String,
}

pub type EventSender = mpsc::UnboundedSender<Result<BusEvent>>;
pub type EventReceiver = mpsc::UnboundedReceiver<Result<BusEvent>>;

/// Validated view of a token, with its compiled access check.
pub(crate) struct UserContext {
    token_id: String,
    utc_expires_at: String,
    metadata: TokenMetadata,
    access: AccessCheck,
}

impl UserContext {
    pub(crate) fn from_token(token: Token) -> Result<Self> {
        let metadata = token.metadata()?.clone();
        let access = AccessCheck::new(&metadata.uuid, &token.session_uuid, &token.acl);
        Ok(Self {
            token_id: token.token,
            utc_expires_at: token.utc_expires_at,
            metadata,
            access,
        })
    }

    pub(crate) fn user_uuid(&self) -> &str {
        &self.metadata.uuid
    }

    pub(crate) fn tenant_uuid(&self) -> &str {
        &self.metadata.tenant_uuid
    }

    fn is_master_tenant(&self, master_tenant: &MasterTenantCell) -> bool {
        master_tenant.get_master_tenant().as_deref() == Some(self.tenant_uuid())
    }

    fn is_admin(&self, master_tenant: &MasterTenantCell) -> bool {
        let purpose = self.metadata.purpose.as_deref();
        self.is_master_tenant(master_tenant)
            || self.metadata.admin
            || matches!(purpose, Some("external_api") | Some("internal"))
    }
}

pub struct BusConsumer {
    id: u64,
    connection: Arc<BusConnection>,
    channel: Channel,
    queue_name: String,
    bound_exchange: String,
    consumer_tag: String,
    origin_uuid: String,
    master_tenant: Arc<MasterTenantCell>,
    user: Arc<RwLock<UserContext>>,
    bound_events: Mutex<BTreeSet<String>>,
    events: tokio::sync::Mutex<Option<EventReceiver>>,
    reader: JoinHandle<()>,
}

impl BusConsumer {
    pub(crate) async fn attach(
        connection: Arc<BusConnection>,
        settings: &BusSettings,
        master_tenant: Arc<MasterTenantCell>,
        token: Token,
    ) -> Result<Self> {
        let user = UserContext::from_token(token)?;
        let channel = connection.get_channel(false).await?;

        let bound_exchange = if user.is_master_tenant(&master_tenant) {
            settings.exchange_name.clone()
        } else {
            create_tenant_exchange(
                &channel,
                &settings.exchange_name,
                &settings.origin_uuid,
                user.tenant_uuid(),
            )
            .await?
        };

        channel
            .basic_qos(settings.consumer_prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|e| WebsocketdError::Bus(format!("unable to set channel qos: {e}")))?;

        let queue_name = format!(
            "{SERVICE_NAME}.user-{}.{}",
            user.user_uuid(),
            random_suffix()
        );
        let queue = channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WebsocketdError::Bus(format!("unable to declare queue: {e}")))?;
        let queue_name = queue.name().as_str().to_string();

        let consumer = channel
            .basic_consume(
                &queue_name,
                "",
                BasicConsumeOptions {
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WebsocketdError::Bus(format!("unable to start consuming: {e}")))?;
        let consumer_tag = consumer.tag().to_string();

        if user.is_master_tenant(&master_tenant) {
            tracing::debug!("user `{}` connected as global admin", user.user_uuid());
        } else if user.is_admin(&master_tenant) {
            tracing::debug!("user `{}` connected as tenant's admin", user.user_uuid());
        } else {
            tracing::debug!("user `{}` connected as user", user.user_uuid());
        }

        let id = CONSUMER_IDS.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        connection.register_consumer(id, events_tx.clone());

        let user = Arc::new(RwLock::new(user));
        let reader = tokio::spawn(read_deliveries(consumer, user.clone(), events_tx));

        Ok(Self {
            id,
            connection,
            channel,
            queue_name,
            bound_exchange,
            consumer_tag,
            origin_uuid: settings.origin_uuid.clone(),
            master_tenant,
            user,
            bound_events: Mutex::new(BTreeSet::new()),
            events: tokio::sync::Mutex::new(Some(events_rx)),
            reader,
        })
    }

    /// The session's end of the event stream; taken once.
    pub async fn take_events(&self) -> Option<EventReceiver> {
        self.events.lock().await.take()
    }

    pub async fn bind(&self, event_name: &str) -> Result<()> {
        for arguments in self.generate_bindings(event_name) {
            self.channel
                .queue_bind(
                    &self.queue_name,
                    &self.bound_exchange,
                    "",
                    QueueBindOptions::default(),
                    arguments,
                )
                .await
                .map_err(|e| WebsocketdError::Bus(format!("unable to bind queue: {e}")))?;
        }
        if let Ok(mut bound) = self.bound_events.lock() {
            bound.insert(event_name.to_string());
        }
        Ok(())
    }

    pub async fn unbind(&self, event_name: &str) -> Result<()> {
        for arguments in self.generate_bindings(event_name) {
            self.channel
                .queue_unbind(&self.queue_name, &self.bound_exchange, "", arguments)
                .await
                .map_err(|e| WebsocketdError::Bus(format!("unable to unbind queue: {e}")))?;
        }
        if let Ok(mut bound) = self.bound_events.lock() {
            bound.remove(event_name);
        }
        Ok(())
    }

    pub fn bound_events(&self) -> Vec<String> {
        self.bound_events
            .lock()
            .map(|bound| bound.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the token mid-session; already-bound queues are kept.
    pub fn set_token(&self, token: Token) -> Result<()> {
        let user = UserContext::from_token(token)?;
        if let Ok(mut guard) = self.user.write() {
            *guard = user;
        }
        Ok(())
    }

    /// Closure handed to the expiry watcher; sees renewals.
    pub fn token_getter(&self) -> TokenGetter {
        let user = self.user.clone();
        Box::new(move || {
            user.read()
                .map(|user| CurrentToken {
                    token_id: user.token_id.clone(),
                    utc_expires_at: user.utc_expires_at.clone(),
                })
                .unwrap_or_else(|_| CurrentToken {
                    token_id: String::new(),
                    utc_expires_at: String::new(),
                })
        })
    }

    /// Cancel the AMQP consumer and close the channel; the underlying
    /// connection stays up for other sessions.
    pub async fn detach(&self) {
        if self.channel.status().connected() {
            let _ = self
                .channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await;
            let _ = self.channel.close(200, "session closed").await;
        }
        self.connection.remove_consumer(self.id);
        self.reader.abort();
    }

    fn generate_bindings(&self, event_name: &str) -> Vec<FieldTable> {
        match self.user.read() {
            Ok(user) => {
                generate_bindings(&user, &self.master_tenant, &self.origin_uuid, event_name)
            }
            Err(_) => Vec::new(),
        }
    }
}

/// Binding arguments for one event name.
///
/// Admin-equivalent users get a single binding scoped by `origin_uuid`;
/// regular users get one binding for their own events and one for
/// broadcasts, both already tenant-scoped by the sub-exchange.
fn generate_bindings(
    user: &UserContext,
    master_tenant: &MasterTenantCell,
    origin_uuid: &str,
    event_name: &str,
) -> Vec<FieldTable> {
    let mut binding = FieldTable::default();
    if event_name != "*" {
        binding.insert(
            "name".into(),
            AMQPValue::LongString(event_name.to_string().into()),
        );
    }

    if user.is_admin(master_tenant) {
        binding.insert(
            "origin_uuid".into(),
            AMQPValue::LongString(origin_uuid.to_string().into()),
        );
        return vec![binding];
    }

    // Users don't need origin_uuid because the tenant exchange takes care
    // of it.
    let mut own_events = binding.clone();
    own_events.insert(
        format!("user_uuid:{}", user.user_uuid()).as_str().into(),
        AMQPValue::Boolean(true),
    );
    let mut broadcast_events = binding;
    broadcast_events.insert("user_uuid:*".into(), AMQPValue::Boolean(true));

    vec![own_events, broadcast_events]
}

async fn read_deliveries(
    mut consumer: lapin::Consumer,
    user: Arc<RwLock<UserContext>>,
    events: EventSender,
) {
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => handle_delivery(delivery, &user, &events).await,
            Err(e) => {
                tracing::debug!("consumer stream ended: {e}");
                break;
            }
        }
    }
}

async fn handle_delivery(delivery: Delivery, user: &RwLock<UserContext>, events: &EventSender) {
    match decode_content(&delivery.data, delivery.properties.headers().as_ref(), user) {
        Ok(event) => {
            let _ = events.send(Ok(event));
        }
        Err(WebsocketdError::InvalidEvent(reason)) => {
            tracing::error!("error during message decoding (reason: {reason})");
        }
        Err(WebsocketdError::EventPermission(reason)) => {
            tracing::debug!("discarding event (reason: {reason})");
        }
        Err(e) => {
            tracing::error!("unexpected error while handling event: {e}");
        }
    }

    // Ack even dropped events so the broker never redelivers them.
    if let Err(e) = delivery.acker.ack(BasicAckOptions { multiple: true }).await {
        tracing::debug!("unable to ack delivery: {e}");
    }
}

fn decode_content(
    content: &[u8],
    headers: Option<&FieldTable>,
    user: &RwLock<UserContext>,
) -> Result<BusEvent> {
    let decoded = std::str::from_utf8(content)
        .map_err(|_| WebsocketdError::InvalidEvent("unable to decode message".into()))?;
    let message: serde_json::Value = serde_json::from_str(decoded)
        .map_err(|_| WebsocketdError::InvalidEvent("unable to decode message".into()))?;
    if !message.is_object() {
        return Err(WebsocketdError::InvalidEvent(
            "invalid message format (not an object)".into(),
        ));
    }

    let name = header_string(headers, "name")
        .or_else(|| message.get("name").and_then(|v| v.as_str()).map(str::to_string))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| WebsocketdError::InvalidEvent("event is missing `name` field".into()))?;

    let acl_value = headers
        .and_then(|headers| headers.inner().get("required_acl"))
        .ok_or_else(|| {
            WebsocketdError::EventPermission(format!("event `{name}` doesn't contain ACLs"))
        })?;
    let acl = match acl_value {
        AMQPValue::Void => None,
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).to_string()),
        AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
        _ => {
            return Err(WebsocketdError::InvalidEvent(
                "event ACL is not a string".into(),
            ))
        }
    };

    let user = user
        .read()
        .map_err(|_| WebsocketdError::Internal("user context lock poisoned".into()))?;
    if !user.access.matches_required_acl(acl.as_deref()) {
        return Err(WebsocketdError::EventPermission(format!(
            "user `{}` doesn't have the required ACL for event `{name}` (missing: {})",
            user.user_uuid(),
            acl.as_deref().unwrap_or("null"),
        )));
    }

    Ok(BusEvent {
        name,
        headers: headers.cloned().unwrap_or_default(),
        acl,
        content: message,
        raw: decoded.to_string(),
    })
}

fn header_string(headers: Option<&FieldTable>, key: &str) -> Option<String> {
    match headers?.inner().get(key)? {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).to_string()),
        AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
        _ => None,
    }
}

async fn create_tenant_exchange(
    channel: &Channel,
    upstream: &str,
    origin_uuid: &str,
    tenant_uuid: &str,
) -> Result<String> {
    let tenant_exchange = format!("{SERVICE_NAME}.tenant-{tenant_uuid}");

    channel
        .exchange_declare(
            &tenant_exchange,
            ExchangeKind::Headers,
            ExchangeDeclareOptions {
                durable: false,
                auto_delete: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| WebsocketdError::Bus(format!("unable to declare tenant exchange: {e}")))?;

    let mut arguments = FieldTable::default();
    arguments.insert(
        "origin_uuid".into(),
        AMQPValue::LongString(origin_uuid.to_string().into()),
    );
    arguments.insert(
        "tenant_uuid".into(),
        AMQPValue::LongString(tenant_uuid.to_string().into()),
    );
    channel
        .exchange_bind(
            &tenant_exchange,
            upstream,
            "",
            ExchangeBindOptions::default(),
            arguments,
        )
        .await
        .map_err(|e| WebsocketdError::Bus(format!("unable to bind tenant exchange: {e}")))?;

    Ok(tenant_exchange)
}

fn random_suffix() -> String {
    (0..3).map(|_| format!("{:02x}", rand::random::<u8>())).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MASTER_TENANT: &str = "master-tenant-uuid";
    const ORIGIN_UUID: &str = "origin-uuid";

    fn token(tenant_uuid: &str, purpose: &str, admin: bool, acl: &[&str]) -> Token {
        Token {
            token: "token-id".into(),
            session_uuid: "session-uuid".into(),
            acl: acl.iter().map(|s| s.to_string()).collect(),
            metadata: Some(TokenMetadata {
                uuid: "user-uuid".into(),
                tenant_uuid: tenant_uuid.into(),
                purpose: Some(purpose.into()),
                admin,
            }),
            utc_expires_at: "2030-01-01T00:00:00.000000".into(),
        }
    }

    fn master_tenant_cell() -> Arc<MasterTenantCell> {
        let dir = tempfile::tempdir().unwrap();
        let cell = MasterTenantCell::at(dir.path().join("master_tenant"));
        let mut token = token(MASTER_TENANT, "internal", false, &[]);
        token.metadata.as_mut().unwrap().tenant_uuid = MASTER_TENANT.into();
        cell.set_master_tenant(&token);
        // Value is cached, the tempdir may go away.
        assert!(cell.has_master_tenant());
        Arc::new(cell)
    }

    fn user_context(token: Token) -> RwLock<UserContext> {
        RwLock::new(UserContext::from_token(token).unwrap())
    }

    fn headers(pairs: &[(&str, AMQPValue)]) -> FieldTable {
        let mut table = FieldTable::default();
        for (key, value) in pairs {
            table.insert((*key).into(), value.clone());
        }
        table
    }

    fn long_string(value: &str) -> AMQPValue {
        AMQPValue::LongString(value.to_string().into())
    }

    #[test]
    fn user_context_requires_metadata() {
        let mut bad = token("tenant", "user", false, &[]);
        bad.metadata = None;
        assert!(matches!(
            UserContext::from_token(bad),
            Err(WebsocketdError::InvalidToken(_))
        ));
    }

    #[test]
    fn admin_roles_are_detected() {
        let cell = master_tenant_cell();

        let master = UserContext::from_token(token(MASTER_TENANT, "user", false, &[])).unwrap();
        assert!(master.is_master_tenant(&cell));
        assert!(master.is_admin(&cell));

        let tenant_admin = UserContext::from_token(token("tenant", "user", true, &[])).unwrap();
        assert!(!tenant_admin.is_master_tenant(&cell));
        assert!(tenant_admin.is_admin(&cell));

        let internal = UserContext::from_token(token("tenant", "internal", false, &[])).unwrap();
        assert!(internal.is_admin(&cell));

        let external = UserContext::from_token(token("tenant", "external_api", false, &[])).unwrap();
        assert!(external.is_admin(&cell));

        let user = UserContext::from_token(token("tenant", "user", false, &[])).unwrap();
        assert!(!user.is_admin(&cell));
    }

    #[test]
    fn admin_bindings_are_origin_scoped() {
        let cell = master_tenant_cell();
        let admin = UserContext::from_token(token("tenant", "user", true, &[])).unwrap();

        let bindings = generate_bindings(&admin, &cell, ORIGIN_UUID, "call_created");
        assert_eq!(bindings.len(), 1);
        assert_eq!(
            bindings[0].inner().get("name"),
            Some(&long_string("call_created"))
        );
        assert_eq!(
            bindings[0].inner().get("origin_uuid"),
            Some(&long_string(ORIGIN_UUID))
        );
    }

    #[test]
    fn admin_wildcard_binding_omits_the_name() {
        let cell = master_tenant_cell();
        let admin = UserContext::from_token(token(MASTER_TENANT, "user", false, &[])).unwrap();

        let bindings = generate_bindings(&admin, &cell, ORIGIN_UUID, "*");
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].inner().get("name").is_none());
    }

    #[test]
    fn user_bindings_pair_own_and_broadcast() {
        let cell = master_tenant_cell();
        let user = UserContext::from_token(token("tenant", "user", false, &[])).unwrap();

        let bindings = generate_bindings(&user, &cell, ORIGIN_UUID, "call_created");
        assert_eq!(bindings.len(), 2);
        for binding in &bindings {
            assert_eq!(
                binding.inner().get("name"),
                Some(&long_string("call_created"))
            );
            // Tenant scoping is the sub-exchange's job.
            assert!(binding.inner().get("origin_uuid").is_none());
        }
        assert_eq!(
            bindings[0].inner().get("user_uuid:user-uuid"),
            Some(&AMQPValue::Boolean(true))
        );
        assert_eq!(
            bindings[1].inner().get("user_uuid:*"),
            Some(&AMQPValue::Boolean(true))
        );
    }

    #[test]
    fn decode_rejects_non_json_and_non_object_bodies() {
        let user = user_context(token("tenant", "user", false, &["event.#"]));
        let table = headers(&[
            ("name", long_string("foo")),
            ("required_acl", long_string("event.foo")),
        ]);

        let err = decode_content(b"\xff\xfe", Some(&table), &user).unwrap_err();
        assert!(matches!(err, WebsocketdError::InvalidEvent(_)));

        let err = decode_content(b"{invalid", Some(&table), &user).unwrap_err();
        assert!(matches!(err, WebsocketdError::InvalidEvent(_)));

        let err = decode_content(b"[1, 2]", Some(&table), &user).unwrap_err();
        assert!(matches!(err, WebsocketdError::InvalidEvent(_)));
    }

    #[test]
    fn decode_requires_an_event_name() {
        let user = user_context(token("tenant", "user", false, &["event.#"]));
        let table = headers(&[("required_acl", long_string("event.foo"))]);

        let err = decode_content(br#"{"value": 1}"#, Some(&table), &user).unwrap_err();
        assert!(matches!(err, WebsocketdError::InvalidEvent(_)));

        // Name may come from the payload instead of the headers.
        let event =
            decode_content(br#"{"name": "foo"}"#, Some(&table), &user).unwrap();
        assert_eq!(event.name, "foo");
    }

    #[test]
    fn decode_requires_the_required_acl_header_key() {
        let user = user_context(token("tenant", "user", false, &["event.#"]));
        let table = headers(&[("name", long_string("foo"))]);

        let err = decode_content(br#"{"name": "foo"}"#, Some(&table), &user).unwrap_err();
        assert!(matches!(err, WebsocketdError::EventPermission(_)));
    }

    #[test]
    fn decode_rejects_non_string_acl_as_malformed() {
        let user = user_context(token("tenant", "user", false, &["event.#"]));
        let table = headers(&[
            ("name", long_string("foo")),
            ("required_acl", AMQPValue::Boolean(true)),
        ]);

        let err = decode_content(br#"{"name": "foo"}"#, Some(&table), &user).unwrap_err();
        assert!(matches!(err, WebsocketdError::InvalidEvent(_)));
    }

    #[test]
    fn decode_accepts_null_acl() {
        let user = user_context(token("tenant", "user", false, &[]));
        let table = headers(&[
            ("name", long_string("foo")),
            ("required_acl", AMQPValue::Void),
        ]);

        let event = decode_content(br#"{"name": "foo"}"#, Some(&table), &user).unwrap();
        assert_eq!(event.acl, None);
    }

    #[test]
    fn decode_filters_by_access_check() {
        let user = user_context(token("tenant", "user", false, &["event.foo"]));

        let allowed = headers(&[
            ("name", long_string("foo")),
            ("required_acl", long_string("event.foo")),
        ]);
        let event = decode_content(br#"{"name": "foo"}"#, Some(&allowed), &user).unwrap();
        assert_eq!(event.acl.as_deref(), Some("event.foo"));
        assert_eq!(event.raw, r#"{"name": "foo"}"#);

        let denied = headers(&[
            ("name", long_string("foo")),
            ("required_acl", long_string("something.else")),
        ]);
        let err = decode_content(br#"{"name": "foo"}"#, Some(&denied), &user).unwrap_err();
        assert!(matches!(err, WebsocketdError::EventPermission(_)));
    }

    #[test]
    fn decode_observes_token_renewal() {
        let user = user_context(token("tenant", "user", false, &["event.foo"]));
        let table = headers(&[
            ("name", long_string("bar")),
            ("required_acl", long_string("event.bar")),
        ]);

        let err = decode_content(br#"{"name": "bar"}"#, Some(&table), &user).unwrap_err();
        assert!(matches!(err, WebsocketdError::EventPermission(_)));

        *user.write().unwrap() =
            UserContext::from_token(token("tenant", "user", false, &["event.bar"])).unwrap();
        assert!(decode_content(br#"{"name": "bar"}"#, Some(&table), &user).is_ok());
    }
}
