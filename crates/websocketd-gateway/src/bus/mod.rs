//! AMQP plumbing: connection pool, per-session consumers and the service
//! facade that owns them.

pub mod connection;
pub mod consumer;

use std::sync::Arc;

use lapin::options::{ExchangeDeclareOptions, ExchangeDeleteOptions};
use lapin::types::FieldTable;
use lapin::ExchangeKind;

use websocketd_core::error::Result;

use crate::auth::{MasterTenantCell, Token};
use crate::config::Config;

pub use connection::{BusConnection, BusConnectionPool};
pub use consumer::{BusConsumer, BusEvent, EventReceiver};

/// Prefix for every AMQP name this service declares.
pub const SERVICE_NAME: &str = "wazo-websocketd";

/// Per-process bus parameters shared by every consumer.
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub exchange_name: String,
    pub exchange_type: String,
    pub consumer_prefetch: u16,
    pub origin_uuid: String,
}

impl BusSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            exchange_name: config.bus.exchange_name.clone(),
            exchange_type: config.bus.exchange_type.clone(),
            consumer_prefetch: config.bus.consumer_prefetch,
            origin_uuid: config.origin_uuid().to_string(),
        }
    }

    fn exchange_kind(&self) -> ExchangeKind {
        match self.exchange_type.as_str() {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "headers" => ExchangeKind::Headers,
            "topic" => ExchangeKind::Topic,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }
}

/// Owns the connection pool for one process and spawns consumers on it.
pub struct BusService {
    pool: BusConnectionPool,
    settings: BusSettings,
    master_tenant: Arc<MasterTenantCell>,
}

impl BusService {
    pub fn new(config: &Config, master_tenant: Arc<MasterTenantCell>) -> Self {
        Self {
            pool: BusConnectionPool::new(&config.bus.url(), config.worker_connections),
            settings: BusSettings::from_config(config),
            master_tenant,
        }
    }

    pub async fn start(&self) {
        self.pool.start().await;
    }

    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    /// Attach a consumer for one session, round-robin over the pool.
    pub async fn create_consumer(&self, token: Token) -> Result<BusConsumer> {
        let connection = self.pool.get_connection();
        BusConsumer::attach(connection, &self.settings, self.master_tenant.clone(), token).await
    }

    /// Declare the configured upstream exchange, and drop the legacy
    /// `wazo-websocketd` exchange when it is no longer in use. Skipped
    /// quietly when the broker is unreachable.
    pub async fn initialize_exchanges(&self) -> Result<()> {
        tracing::info!("configuring the broker for wazo-websocketd...");
        let connection = self.pool.get_connection();
        let channel = match connection.get_channel(true).await {
            Ok(channel) => channel,
            Err(_) => return Ok(()),
        };

        channel
            .exchange_declare(
                &self.settings.exchange_name,
                self.settings.exchange_kind(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                websocketd_core::WebsocketdError::Bus(format!("unable to declare exchange: {e}"))
            })?;
        tracing::info!("exchange `{}` initialized", self.settings.exchange_name);

        // Upgrades keep the old durable exchange around; delete it once
        // nothing is bound to it anymore.
        if self.settings.exchange_name != SERVICE_NAME {
            let deleted = channel
                .exchange_delete(
                    SERVICE_NAME,
                    ExchangeDeleteOptions {
                        if_unused: true,
                        ..Default::default()
                    },
                )
                .await;
            match deleted {
                Ok(()) => {
                    tracing::info!("migration: removed legacy `{SERVICE_NAME}` exchange...")
                }
                Err(e) => tracing::debug!("legacy `{SERVICE_NAME}` exchange kept: {e}"),
            }
        }

        if channel.status().connected() {
            let _ = channel.close(200, "initialization done").await;
        }
        Ok(())
    }
}
