//! Roomcast: a realtime room relay for multiplayer games.
//!
//! Clients form rooms — one master, other players, passive watchers —
//! and exchange small binary messages through a per-room actor. The
//! relay buffers each client's outbound events so a dropped connection
//! can resume exactly where it left off.
//!
//! This crate ties the layers together: the wire codec
//! (`roomcast-protocol`), the room core (`roomcast-room`), and the
//! WebSocket transport (`roomcast-transport`), behind a
//! [`RelayServer`] you point a control plane at.

mod error;
mod handler;
mod server;

pub use error::RoomcastError;
pub use server::{RelayServer, RelayServerBuilder};

/// Common imports for embedding the relay.
pub mod prelude {
    pub use crate::{RelayServer, RelayServerBuilder, RoomcastError};
    pub use roomcast_protocol::{Dict, EvType, MsgType, Value};
    pub use roomcast_room::{
        ClientId, ClientInfo, JoinedRoomRes, MemoryRoomStore, RelayConfig,
        Repository, RoomError, RoomId, RoomInfo, RoomInfoStore, RoomOption,
        RoomSnapshot, StoreError,
    };
}
