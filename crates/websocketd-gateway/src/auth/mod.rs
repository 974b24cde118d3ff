//! Identity-service client, token model and expiry watching.

pub mod master_tenant;
pub mod renewer;
pub mod watch;

use serde::Deserialize;

use websocketd_core::error::{Result, WebsocketdError};

use crate::config::{AuthCheckStrategy, AuthSection, Config};

pub use master_tenant::MasterTenantCell;
pub use renewer::ServiceTokenRenewer;
pub use watch::{CurrentToken, TokenGetter};

/// ACL required of every client token.
pub const REQUIRED_ACL: &str = "websocketd";

/// One token lookup result. Immutable; a renewal returns a new value.
#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    /// The token id itself.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub session_uuid: String,
    #[serde(default)]
    pub acl: Vec<String>,
    #[serde(default)]
    pub metadata: Option<TokenMetadata>,
    #[serde(default)]
    pub utc_expires_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenMetadata {
    /// User UUID.
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub tenant_uuid: String,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub admin: bool,
}

impl Token {
    /// Token details, present on every well-formed token.
    pub fn metadata(&self) -> Result<&TokenMetadata> {
        self.metadata.as_ref().ok_or_else(|| {
            WebsocketdError::InvalidToken("malformed token received, missing token details".into())
        })
    }
}

/// HTTP client for the identity service.
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl AuthClient {
    pub fn new(auth: &AuthSection) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: auth.base_url(),
            username: auth.username.clone(),
            password: auth.password.clone(),
        }
    }

    /// `GET /token/<id>?acl=websocketd`; any failure is an authentication
    /// failure as far as the session is concerned.
    pub async fn get_token(&self, token_id: &str) -> Result<Token> {
        tracing::debug!("getting token from the identity service");
        let url = format!("{}/token/{token_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("acl", REQUIRED_ACL)])
            .send()
            .await
            .map_err(|e| WebsocketdError::AuthenticationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WebsocketdError::AuthenticationFailed(format!(
                "identity service returned {}",
                response.status()
            )));
        }

        let mut token: Token = response
            .json()
            .await
            .map_err(|e| WebsocketdError::AuthenticationFailed(e.to_string()))?;
        if token.token.is_empty() {
            token.token = token_id.to_string();
        }
        Ok(token)
    }

    /// `HEAD /token/<id>` — 204 valid, 403/404 invalid, anything else is an
    /// identity-service failure.
    pub async fn is_valid_token(&self, token_id: &str, acl: &str) -> Result<bool> {
        tracing::debug!("checking token validity from the identity service");
        let url = format!("{}/token/{token_id}", self.base_url);
        let response = self
            .http
            .head(&url)
            .query(&[("acl", acl)])
            .send()
            .await
            .map_err(|e| WebsocketdError::AuthenticationFailed(e.to_string()))?;

        match response.status().as_u16() {
            204 => Ok(true),
            403 | 404 => Ok(false),
            status => Err(WebsocketdError::AuthenticationFailed(format!(
                "identity service returned {status}"
            ))),
        }
    }

    /// `POST /token` with the service credentials, minting a service token.
    pub async fn new_token(&self, expiration: u64) -> Result<Token> {
        let (username, password) = match (&self.username, &self.password) {
            (Some(username), Some(password)) => (username, password),
            _ => {
                return Err(WebsocketdError::AuthenticationFailed(
                    "service credentials are not configured".into(),
                ))
            }
        };

        let url = format!("{}/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .basic_auth(username, Some(password))
            .json(&serde_json::json!({ "expiration": expiration }))
            .send()
            .await
            .map_err(|e| WebsocketdError::AuthenticationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WebsocketdError::AuthenticationFailed(format!(
                "identity service returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| WebsocketdError::AuthenticationFailed(e.to_string()))
    }
}

/// Facade bundling the client with the configured expiry-watch strategy.
pub struct Authenticator {
    client: std::sync::Arc<AuthClient>,
    watch: Box<dyn watch::TokenWatch>,
}

impl Authenticator {
    pub fn new(config: &Config) -> Self {
        let client = std::sync::Arc::new(AuthClient::new(&config.auth));
        let watch: Box<dyn watch::TokenWatch> = match config.auth_check_strategy {
            AuthCheckStrategy::Static => Box::new(watch::StaticWatch::new(
                client.clone(),
                config.auth_check_static_interval,
            )),
            AuthCheckStrategy::Dynamic => Box::new(watch::DynamicWatch::new(client.clone())),
        };
        Self { client, watch }
    }

    pub async fn get_token(&self, token_id: &str) -> Result<Token> {
        self.client.get_token(token_id).await
    }

    pub async fn is_valid_token(&self, token_id: &str, acl: &str) -> Result<bool> {
        self.client.is_valid_token(token_id, acl).await
    }

    /// Run the expiry watch until the token expires. Only ever returns an
    /// error (`AuthenticationExpired` on expiry).
    pub async fn run_check(&self, token_getter: TokenGetter) -> Result<()> {
        self.watch.run(token_getter).await
    }
}
