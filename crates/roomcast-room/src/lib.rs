//! Core of the Roomcast relay: rooms, clients, peers, and the repository.
//!
//! Each room is an isolated actor task owning its membership and
//! properties; each member is a client task owning its outbound event
//! ring and current peer; each peer is one WebSocket attachment. The
//! [`Repository`] is the node-level registry the control plane and the
//! upgrade path go through.
//!
//! Layering: control plane → `Repository` → room channel; socket → peer →
//! client channel → room channel; room → client → peer → socket.

mod client;
mod config;
mod error;
mod evbuf;
mod peer;
mod repository;
mod room;
mod store;
mod types;

pub use client::Client;
pub use config::RelayConfig;
pub use error::RoomError;
pub use evbuf::{EventBuffer, TooOld};
pub use repository::Repository;
pub use store::{MemoryRoomStore, RoomInfoStore, StoreError};
pub use types::{
    ClientId, ClientInfo, JoinedRoomRes, RoomId, RoomInfo, RoomOption, RoomSnapshot,
};
