//! Service-token renewal loop.
//!
//! Mints a service token at startup and refreshes it before expiry,
//! notifying subscribers of every new token. Mint failures are retried
//! forever and never fatal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use websocketd_core::error::Result;

use crate::backoff::retry_delays;
use crate::config::Config;

use super::{AuthClient, Token};

const DEFAULT_EXPIRATION: u64 = 21600; // 6h
const DEFAULT_LEEWAY_FACTOR: f64 = 0.85;

pub type TokenCallback = Box<dyn Fn(&Token) + Send + Sync>;

struct Subscriber {
    callback: TokenCallback,
    oneshot: bool,
}

pub struct ServiceTokenRenewer {
    client: Arc<AuthClient>,
    subscribers: Arc<std::sync::Mutex<Vec<Subscriber>>>,
    expiration: u64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceTokenRenewer {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Arc::new(AuthClient::new(&config.auth)),
            subscribers: Arc::new(std::sync::Mutex::new(Vec::new())),
            expiration: DEFAULT_EXPIRATION,
            task: Mutex::new(None),
        }
    }

    /// Register a callback for each new token; a `oneshot` subscriber is
    /// dropped after its first notification.
    pub fn subscribe(&self, callback: TokenCallback, oneshot: bool) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Subscriber { callback, oneshot });
        }
    }

    pub async fn start(&self) -> Result<()> {
        let client = self.client.clone();
        let subscribers = self.subscribers.clone();
        let expiration = self.expiration;

        let mut task = self.task.lock().await;
        *task = Some(tokio::spawn(async move {
            loop {
                let token = fetch_token(&client, expiration).await;
                notify(&subscribers, &token);
                let refresh_in = (expiration as f64 * DEFAULT_LEEWAY_FACTOR) as u64;
                tokio::time::sleep(Duration::from_secs(refresh_in)).await;
            }
        }));
        tracing::info!("service token renewer started");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        tracing::info!("service token renewer stopped");
    }
}

async fn fetch_token(client: &AuthClient, expiration: u64) -> Token {
    let mut delays = retry_delays();
    loop {
        match client.new_token(expiration).await {
            Ok(token) => return token,
            Err(e) => {
                let interval = delays.next().unwrap_or(32);
                tracing::error!(
                    "failed to create an access token, retrying in {interval} seconds: {e}"
                );
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        }
    }
}

fn notify(subscribers: &std::sync::Mutex<Vec<Subscriber>>, token: &Token) {
    let mut subscribers = match subscribers.lock() {
        Ok(subscribers) => subscribers,
        Err(_) => return,
    };
    for subscriber in subscribers.iter() {
        (subscriber.callback)(token);
    }
    subscribers.retain(|subscriber| !subscriber.oneshot);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn token() -> Token {
        Token {
            token: "service-token".into(),
            session_uuid: String::new(),
            acl: vec![],
            metadata: None,
            utc_expires_at: String::new(),
        }
    }

    #[test]
    fn oneshot_subscriber_fires_once() {
        let subscribers = std::sync::Mutex::new(Vec::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let count = fired.clone();
        subscribers.lock().unwrap().push(Subscriber {
            callback: Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
            oneshot: true,
        });

        notify(&subscribers, &token());
        notify(&subscribers, &token());

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recurring_subscriber_fires_every_time() {
        let subscribers = std::sync::Mutex::new(Vec::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let count = fired.clone();
        subscribers.lock().unwrap().push(Subscriber {
            callback: Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
            oneshot: false,
        });

        notify(&subscribers, &token());
        notify(&subscribers, &token());

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
