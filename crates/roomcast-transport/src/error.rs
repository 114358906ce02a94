//! Error types for the transport layer.

/// Errors from listening and upgrading connections.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding the listen address failed.
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// Accepting a TCP connection failed.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// The WebSocket handshake failed or was rejected.
    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] tokio_tungstenite::tungstenite::Error),

    /// The upgrade request was structurally invalid.
    #[error("invalid upgrade request: {0}")]
    BadUpgrade(String),
}

/// Turns an upgrade request into an HTTP error before the handshake
/// completes.
#[derive(Debug, Clone)]
pub struct UpgradeReject {
    pub status: u16,
    pub reason: String,
}

impl UpgradeReject {
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self {
            status: 404,
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self {
            status: 403,
            reason: reason.into(),
        }
    }
}
