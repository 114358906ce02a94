//! WebSocket transport for the Roomcast relay.
//!
//! Owns the TCP listener, the HTTP upgrade (path and identity headers),
//! and the close-frame conventions shared by every peer:
//!
//! - 1000 NormalClosure — clean leave or kick; the client must not
//!   reconnect.
//! - 1001 GoingAway — attach rejected, buffer too old, or superseded by a
//!   newer attachment; the client must not reconnect.
//! - 1007 InvalidFramePayloadData — undecodable frame or bad MAC.
//! - 1011 InternalServerErr — write failure; the client may reconnect.

mod error;
mod websocket;

pub use error::{TransportError, UpgradeReject};
pub use websocket::{
    UpgradeRequest, WsListener, WsStream, HDR_APP, HDR_LAST_EVENT_SEQ, HDR_USER,
};

pub use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// WebSocket close frames cap the reason text at 123 bytes.
pub const CLOSE_REASON_MAX: usize = 123;

/// Builds a close frame, truncating the reason to the frame limit on a
/// character boundary.
pub fn close_frame(code: CloseCode, reason: &str) -> CloseFrame {
    let mut end = reason.len().min(CLOSE_REASON_MAX);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    CloseFrame {
        code,
        reason: reason[..end].to_string().into(),
    }
}
