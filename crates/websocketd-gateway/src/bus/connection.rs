//! One AMQP connection with auto-reconnect, shared by many consumers.
//!
//! A reconnect driver owns the connection lifecycle: connect with backoff,
//! wait for the link to die, push the disconnect sentinel to every consumer,
//! retry unless `closing` is set. Consumers register their event sender here
//! so the sentinel can reach their session.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use websocketd_core::error::{Result, WebsocketdError};

use crate::backoff::retry_delays;

use super::consumer::EventSender;

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

pub struct BusConnection {
    id: u64,
    url: String,
    connected: watch::Sender<bool>,
    closing: watch::Sender<bool>,
    handle: Mutex<Option<Connection>>,
    consumers: DashMap<u64, EventSender>,
}

impl BusConnection {
    pub fn new(url: String) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        let (closing, _) = watch::channel(false);
        Arc::new(Self {
            id: CONNECTION_IDS.fetch_add(1, Ordering::Relaxed),
            url,
            connected,
            closing,
            handle: Mutex::new(None),
            consumers: DashMap::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Reconnect driver; runs until `disconnect` is called.
    pub async fn run(self: Arc<Self>) {
        loop {
            let connection = match self.connect().await {
                Some(connection) => connection,
                None => return,
            };

            let errored = Arc::new(Notify::new());
            let notify = errored.clone();
            let id = self.id;
            connection.on_error(move |e| {
                tracing::warn!("[connection {id}] bus connection error: {e}");
                notify.notify_one();
            });

            *self.handle.lock().await = Some(connection);
            let _ = self.connected.send(true);
            tracing::info!("[connection {}] connected to bus", self.id);

            let mut closing = self.closing.subscribe();
            tokio::select! {
                _ = errored.notified() => {}
                _ = closing.wait_for(|closing| *closing) => {}
            }

            let _ = self.connected.send(false);
            if let Some(connection) = self.handle.lock().await.take() {
                let _ = connection.close(200, "normal shutdown").await;
            }

            // Drain every consumer with the sentinel; their sessions turn it
            // into a 1011 close.
            self.notify_closed();

            if self.is_closing() {
                tracing::info!("[connection {}] connection to bus closed", self.id);
                return;
            }
            tracing::info!(
                "[connection {}] unexpectedly lost connection to bus, attempting to reconnect...",
                self.id
            );
        }
    }

    async fn connect(&self) -> Option<Connection> {
        let mut delays = retry_delays();
        let mut closing = self.closing.subscribe();
        loop {
            match Connection::connect(&self.url, ConnectionProperties::default()).await {
                Ok(connection) => return Some(connection),
                Err(e) => {
                    let timeout = delays.next().unwrap_or(32);
                    tracing::debug!(
                        "[connection {}] unable to connect ({e}), retrying in {timeout} seconds",
                        self.id
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(timeout)) => {}
                        _ = closing.wait_for(|closing| *closing) => {
                            tracing::info!("[connection {}] cancelling connection...", self.id);
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Sticky; the driver observes it and exits.
    pub fn disconnect(&self) {
        let _ = self.closing.send(true);
    }

    /// Open a new channel. With `wait` false, fail fast when the link is not
    /// established yet.
    pub async fn get_channel(&self, wait: bool) -> Result<Channel> {
        if !self.is_connected() && !wait {
            return Err(WebsocketdError::Bus(format!(
                "[connection {}] connection isn't established yet",
                self.id
            )));
        }

        self.wait_for_connection().await?;

        let guard = self.handle.lock().await;
        let connection = guard.as_ref().ok_or_else(|| {
            WebsocketdError::Bus(format!("[connection {}] connection went away", self.id))
        })?;
        connection.create_channel().await.map_err(|_| {
            WebsocketdError::Bus(format!(
                "[connection {}] failed to create a new channel",
                self.id
            ))
        })
    }

    async fn wait_for_connection(&self) -> Result<()> {
        let mut connected = self.connected.subscribe();
        let mut closing = self.closing.subscribe();
        tokio::select! {
            _ = connected.wait_for(|connected| *connected) => Ok(()),
            _ = closing.wait_for(|closing| *closing) => Err(WebsocketdError::Bus(format!(
                "[connection {}] connection is closing",
                self.id
            ))),
        }
    }

    pub(crate) fn register_consumer(&self, consumer_id: u64, sender: EventSender) {
        self.consumers.insert(consumer_id, sender);
    }

    pub(crate) fn remove_consumer(&self, consumer_id: u64) {
        self.consumers.remove(&consumer_id);
    }

    fn notify_closed(&self) {
        for entry in self.consumers.iter() {
            let _ = entry.value().send(Err(WebsocketdError::BusConnectionLost));
        }
    }
}

/// Fixed set of connections, handed out round-robin.
pub struct BusConnectionPool {
    connections: Vec<Arc<BusConnection>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl BusConnectionPool {
    pub fn new(url: &str, pool_size: usize) -> Self {
        Self {
            connections: (0..pool_size.max(1))
                .map(|_| BusConnection::new(url.to_string()))
                .collect(),
            tasks: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        for connection in &self.connections {
            tasks.push(tokio::spawn(connection.clone().run()));
        }
        tracing::info!(
            "bus connection pool initialized with {} connections",
            self.len()
        );
    }

    /// Disconnect everything, wait up to 5 seconds, then force-cancel.
    pub async fn stop(&self) {
        for connection in &self.connections {
            connection.disconnect();
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut pending = Vec::new();
        for mut task in tasks.drain(..) {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                pending.push(task);
            }
        }
        if !pending.is_empty() {
            tracing::info!("some connections did not exit gracefully, forcing...");
            for task in pending {
                task.abort();
            }
        }

        tracing::info!("bus connection pool closed ({} connections)", self.len());
    }

    pub fn get_connection(&self) -> Arc<BusConnection> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index].clone()
    }
}
