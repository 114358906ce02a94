//! WebSocket listener using `tokio-tungstenite`.
//!
//! A relay attachment starts as an HTTP upgrade on `/room/{roomId}` with
//! three required headers carrying the client's identity and resume point.
//! The listener parses and validates those *before* completing the
//! handshake, so a bad request is answered with a plain HTTP error and
//! never becomes a socket.

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;

use crate::{TransportError, UpgradeReject};

/// Header carrying the application id.
pub const HDR_APP: &str = "x-roomcast-app";
/// Header carrying the client id (the reconnect identity).
pub const HDR_USER: &str = "x-roomcast-user";
/// Header carrying the last event seq the client processed (0 = fresh).
pub const HDR_LAST_EVENT_SEQ: &str = "x-roomcast-lasteventseq";

const ROOM_PATH_PREFIX: &str = "/room/";

/// A server-side WebSocket stream.
pub type WsStream = WebSocketStream<TcpStream>;

/// The parsed upgrade request for a room attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub room_id: String,
    pub app_id: String,
    pub client_id: String,
    pub last_event_seq: u32,
}

impl UpgradeRequest {
    fn parse(req: &Request) -> Result<Self, String> {
        let path = req.uri().path();
        let room_id = path
            .strip_prefix(ROOM_PATH_PREFIX)
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .ok_or_else(|| format!("invalid path: {path}"))?;

        let header = |name: &str| -> Result<String, String> {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| format!("missing or invalid header: {name}"))
        };

        let app_id = header(HDR_APP)?;
        let client_id = header(HDR_USER)?;
        let last_event_seq = header(HDR_LAST_EVENT_SEQ)?
            .parse::<u32>()
            .map_err(|_| format!("invalid {HDR_LAST_EVENT_SEQ}"))?;

        Ok(Self {
            room_id: room_id.to_string(),
            app_id,
            client_id,
            last_event_seq,
        })
    }
}

/// Listens for room attachments.
pub struct WsListener {
    listener: TcpListener,
}

impl WsListener {
    /// Binds to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(TransportError::Bind)?;
        tracing::info!(addr, "websocket listener bound");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one connection and completes the upgrade.
    ///
    /// `validate` runs after header parsing and before the handshake
    /// response; returning an `UpgradeReject` turns the request into the
    /// given HTTP error. A failed accept only concerns that one
    /// connection — callers log it and keep accepting.
    pub async fn accept<F>(
        &self,
        validate: F,
    ) -> Result<(WsStream, UpgradeRequest), TransportError>
    where
        F: FnOnce(&UpgradeRequest) -> Result<(), UpgradeReject> + Unpin,
    {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;

        let mut parsed: Option<UpgradeRequest> = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let upgrade = UpgradeRequest::parse(req)
                .map_err(|reason| reject_response(StatusCode::BAD_REQUEST, reason))?;
            validate(&upgrade).map_err(|r| {
                reject_response(
                    StatusCode::from_u16(r.status)
                        .unwrap_or(StatusCode::BAD_REQUEST),
                    r.reason,
                )
            })?;
            parsed = Some(upgrade);
            Ok(resp)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(TransportError::Handshake)?;

        // The callback ran to completion, so the request is present.
        let upgrade = parsed.ok_or_else(|| {
            TransportError::BadUpgrade("handshake completed without request".into())
        })?;

        tracing::debug!(
            %addr,
            room_id = %upgrade.room_id,
            client_id = %upgrade.client_id,
            last_event_seq = upgrade.last_event_seq,
            "accepted attachment"
        );
        Ok((ws, upgrade))
    }
}

fn reject_response(status: StatusCode, reason: String) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason));
    *resp.status_mut() = status;
    resp
}

// =========================================================================
// Tests
// =========================================================================
