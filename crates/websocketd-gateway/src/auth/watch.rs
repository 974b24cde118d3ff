//! Token expiry watching.
//!
//! Two strategies, selected by `auth_check_strategy`:
//! - `static`: sleep a fixed interval, then check validity.
//! - `dynamic`: derive the next check from the token's remaining lifetime,
//!   then re-fetch the token so an in-session renewal pushes the horizon.
//!
//! Both run until the token expires and then fail with
//! `AuthenticationExpired`; the session treats that as terminal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};

use websocketd_core::error::{Result, WebsocketdError};

use super::{AuthClient, REQUIRED_ACL};

/// Snapshot of the session's current token, as seen by the watcher.
///
/// The getter is a closure so in-session renewals are observed on the next
/// iteration.
#[derive(Debug, Clone)]
pub struct CurrentToken {
    pub token_id: String,
    pub utc_expires_at: String,
}

pub type TokenGetter = Box<dyn Fn() -> CurrentToken + Send + Sync>;

#[async_trait]
pub trait TokenWatch: Send + Sync {
    async fn run(&self, token_getter: TokenGetter) -> Result<()>;
}

pub struct StaticWatch {
    client: Arc<AuthClient>,
    interval: Duration,
}

impl StaticWatch {
    pub fn new(client: Arc<AuthClient>, interval_secs: u64) -> Self {
        Self {
            client,
            interval: Duration::from_secs(interval_secs),
        }
    }
}

#[async_trait]
impl TokenWatch for StaticWatch {
    async fn run(&self, token_getter: TokenGetter) -> Result<()> {
        loop {
            tokio::time::sleep(self.interval).await;
            tracing::debug!("static auth check: testing token validity");
            let token_id = token_getter().token_id;
            if !self.client.is_valid_token(&token_id, REQUIRED_ACL).await? {
                return Err(WebsocketdError::AuthenticationExpired);
            }
        }
    }
}

pub struct DynamicWatch {
    client: Arc<AuthClient>,
}

impl DynamicWatch {
    pub fn new(client: Arc<AuthClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenWatch for DynamicWatch {
    async fn run(&self, token_getter: TokenGetter) -> Result<()> {
        loop {
            let current = token_getter();
            let expires_at = parse_utc_expires_at(&current.utc_expires_at)?;
            let next_check = next_check_delay(Utc::now(), expires_at);
            tokio::time::sleep(Duration::from_secs(next_check)).await;

            tracing::debug!("dynamic auth check: testing token validity");
            if self.client.get_token(&current.token_id).await.is_err() {
                return Err(WebsocketdError::AuthenticationExpired);
            }
        }
    }
}

/// `utc_expires_at` is UTC ISO-8601, with or without an explicit offset.
fn parse_utc_expires_at(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Ok(with_offset.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| {
            WebsocketdError::InvalidToken(format!("invalid utc_expires_at value: {raw}"))
        })
}

/// Seconds until the next validity check.
fn next_check_delay(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> u64 {
    let delta_seconds = (expires_at - now).num_seconds();
    if delta_seconds < 0 {
        15
    } else if delta_seconds <= 80 {
        60
    } else if delta_seconds <= 57600 {
        (0.75 * delta_seconds as f64) as u64
    } else {
        43200
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn delay_for(delta_seconds: i64) -> u64 {
        let now = Utc::now();
        next_check_delay(now, now + TimeDelta::seconds(delta_seconds))
    }

    #[test]
    fn expired_token_rechecks_in_15s() {
        assert_eq!(delay_for(-30), 15);
    }

    #[test]
    fn nearly_expired_token_rechecks_in_60s() {
        assert_eq!(delay_for(5), 60);
        assert_eq!(delay_for(80), 60);
    }

    #[test]
    fn mid_life_token_rechecks_at_three_quarters() {
        assert_eq!(delay_for(1000), 750);
        assert_eq!(delay_for(57600), 43200);
    }

    #[test]
    fn long_lived_token_rechecks_in_12h() {
        assert_eq!(delay_for(57601), 43200);
        assert_eq!(delay_for(1_000_000), 43200);
    }

    #[test]
    fn parses_naive_and_offset_timestamps() {
        assert!(parse_utc_expires_at("2026-08-01T12:00:00.000000").is_ok());
        assert!(parse_utc_expires_at("2026-08-01T12:00:00+00:00").is_ok());
        assert!(parse_utc_expires_at("not-a-date").is_err());
    }
}
