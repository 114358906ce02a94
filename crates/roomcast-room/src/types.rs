//! Identity and record types shared across the relay core.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Client;

/// A room's unique identifier within one relay node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A client's identity inside a room. The same id presented on a new
/// connection *is* the same participant — reconnects supersede, never
/// duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The mutable record describing one live room. A copy of the current
/// state is pushed to the room-info store on every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub app_id: String,
    pub host_id: u32,
    pub visible: bool,
    pub joinable: bool,
    pub watchable: bool,
    pub search_group: u32,
    pub max_players: u32,
    /// Current player count.
    pub players: u32,
    /// Sum of node counts across watchers (a hub counts its downstream).
    pub watchers: u32,
    /// Marshaled public property dict.
    pub public_props: Vec<u8>,
    /// Marshaled private property dict.
    pub private_props: Vec<u8>,
    /// Unix seconds at creation.
    pub created: u64,
}

/// A participant's identity and opaque properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: ClientId,
    /// Marshaled property dict.
    pub props: Vec<u8>,
    /// Whether this client is a fan-out hub carrying downstream watchers.
    pub is_hub: bool,
}

impl ClientInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ClientId(id.into()),
            props: Vec::new(),
            is_hub: false,
        }
    }

    pub fn with_props(mut self, props: Vec<u8>) -> Self {
        self.props = props;
        self
    }
}

/// Options for creating a room, supplied by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomOption {
    pub visible: bool,
    pub joinable: bool,
    pub watchable: bool,
    pub search_group: u32,
    pub max_players: u32,
    /// Idle deadline in seconds; 0 picks the node default.
    pub client_deadline: u32,
    pub public_props: Vec<u8>,
    pub private_props: Vec<u8>,
}

impl Default for RoomOption {
    fn default() -> Self {
        Self {
            visible: true,
            joinable: true,
            watchable: true,
            search_group: 0,
            max_players: 10,
            client_deadline: 0,
            public_props: Vec::new(),
            private_props: Vec::new(),
        }
    }
}

/// Internal reply to a successful create/join/watch, carrying the live
/// client handle for the repository to register.
#[derive(Debug, Clone)]
pub(crate) struct JoinedInfo {
    pub room_info: RoomInfo,
    pub players: Vec<ClientInfo>,
    pub client: Client,
    pub master_id: ClientId,
    pub deadline: Duration,
}

/// The control plane's view of a successful create/join/watch.
#[derive(Debug, Clone)]
pub struct JoinedRoomRes {
    pub room_info: RoomInfo,
    pub players: Vec<ClientInfo>,
    pub client_id: ClientId,
    pub master_id: ClientId,
    pub deadline: Duration,
    /// Secret for signing this client's message frames.
    pub mac_key: String,
}

/// Point-in-time answer to a room-info query.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room_info: RoomInfo,
    /// Player infos in master-election order.
    pub clients: Vec<ClientInfo>,
    pub master_id: ClientId,
    /// Player id → unix-millis of the last inbound message.
    pub last_msg_times: Vec<(ClientId, u64)>,
}
