//! Shared error type across websocketd crates.

use thiserror::Error;

/// WebSocket close code sent to the client when a session terminates.
pub const CLOSE_CODE_NO_TOKEN: u16 = 4001;
pub const CLOSE_CODE_AUTH_FAILED: u16 = 4002;
pub const CLOSE_CODE_AUTH_EXPIRED: u16 = 4003;
pub const CLOSE_CODE_PROTOCOL_ERROR: u16 = 4004;
pub const CLOSE_CODE_INTERNAL_ERROR: u16 = 1011;

/// Shared result type.
pub type Result<T> = std::result::Result<T, WebsocketdError>;

/// Unified error type used by core and gateway.
#[derive(Debug, Error)]
pub enum WebsocketdError {
    /// No credential could be extracted from the upgrade request.
    #[error("no token")]
    NoToken,
    /// The identity service rejected the token, or could not be reached.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    /// A once-valid token became invalid while the session was running.
    #[error("authentication expired")]
    AuthenticationExpired,
    /// The identity service returned a token missing required details.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Malformed or illegal client frame.
    #[error("session protocol error: {0}")]
    Protocol(String),
    /// The `version` query string is not a supported protocol version.
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    /// AMQP connection or channel failure.
    #[error("bus connection error: {0}")]
    Bus(String),
    /// The AMQP connection hosting this session's channel went away.
    #[error("bus connection lost")]
    BusConnectionLost,
    /// Malformed upstream event; dropped, never surfaced to the client.
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    /// Upstream event the user is not allowed to see; dropped silently.
    #[error("event permission error: {0}")]
    EventPermission(String),
    /// The peer closed the WebSocket (or the transport died underneath us).
    #[error("connection closed")]
    ConnectionClosed,
    #[error("internal: {0}")]
    Internal(String),
}

impl WebsocketdError {
    /// Close code for the session-terminating errors of the taxonomy.
    ///
    /// `InvalidEvent` and `EventPermission` never terminate a session; they
    /// are mapped to 1011 here only as a backstop should one ever escape the
    /// consumer.
    pub fn close_code(&self) -> u16 {
        match self {
            WebsocketdError::NoToken => CLOSE_CODE_NO_TOKEN,
            WebsocketdError::AuthenticationFailed(_) | WebsocketdError::InvalidToken(_) => {
                CLOSE_CODE_AUTH_FAILED
            }
            WebsocketdError::AuthenticationExpired => CLOSE_CODE_AUTH_EXPIRED,
            WebsocketdError::Protocol(_) | WebsocketdError::UnsupportedVersion => {
                CLOSE_CODE_PROTOCOL_ERROR
            }
            WebsocketdError::Bus(_)
            | WebsocketdError::BusConnectionLost
            | WebsocketdError::InvalidEvent(_)
            | WebsocketdError::EventPermission(_)
            | WebsocketdError::ConnectionClosed
            | WebsocketdError::Internal(_) => CLOSE_CODE_INTERNAL_ERROR,
        }
    }

    /// Human-readable close reason matching `close_code`.
    pub fn close_reason(&self) -> &'static str {
        match self {
            WebsocketdError::NoToken => "no token",
            WebsocketdError::AuthenticationFailed(_) | WebsocketdError::InvalidToken(_) => {
                "authentication failed"
            }
            WebsocketdError::AuthenticationExpired => "authentication expired",
            WebsocketdError::Protocol(_) | WebsocketdError::UnsupportedVersion => "",
            WebsocketdError::BusConnectionLost => "bus connection lost",
            WebsocketdError::Bus(_) => "bus connection error",
            _ => "",
        }
    }
}
