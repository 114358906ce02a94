//! Top-level error type.

use roomcast_room::RoomError;
use roomcast_transport::TransportError;

/// Anything the server surface can fail with.
#[derive(Debug, thiserror::Error)]
pub enum RoomcastError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("room error: {0}")]
    Room(#[from] RoomError),
}
