//! Registry of the rooms hosted on this node.
//!
//! The control plane talks to rooms exclusively through here: each call
//! builds the corresponding room message, sends it into the room's
//! channel under a timeout, and awaits the reply channel. The repository
//! also keeps the (room, client) → handle/key registrations the
//! WebSocket upgrade path needs to route an attachment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::oneshot;

use roomcast_protocol::Dict;

use crate::client::Client;
use crate::room::{spawn_room, RoomHandle, RoomMsg};
use crate::store::RoomInfoStore;
use crate::types::{
    ClientId, ClientInfo, JoinedRoomRes, RoomId, RoomInfo, RoomOption, RoomSnapshot,
};
use crate::{RelayConfig, RoomError};

/// A client registered for attachment: the live handle plus the key its
/// message frames must be signed with.
pub(crate) struct ClientRegistration {
    pub client: Client,
    pub mac_key: String,
}

/// State shared between the repository front and the room actors (which
/// deregister themselves and their clients).
pub(crate) struct RepoShared {
    rooms: Mutex<HashMap<RoomId, RoomHandle>>,
    clients: Mutex<HashMap<(RoomId, ClientId), ClientRegistration>>,
}

impl RepoShared {
    pub(crate) fn remove_room(&self, room_id: &RoomId) {
        self.rooms.lock().expect("rooms lock").remove(room_id);
        self.clients
            .lock()
            .expect("clients lock")
            .retain(|(rid, _), _| rid != room_id);
        tracing::info!(%room_id, "room deregistered");
    }

    pub(crate) fn register_client(
        &self,
        room_id: &RoomId,
        client: Client,
        mac_key: String,
    ) {
        self.clients.lock().expect("clients lock").insert(
            (room_id.clone(), client.id().clone()),
            ClientRegistration { client, mac_key },
        );
    }

    /// Drops a registration, but only if it still belongs to the given
    /// incarnation — a rejoin's fresh registration must survive the
    /// removal of the old client.
    pub(crate) fn unregister_client(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
        instance: u64,
    ) {
        let mut clients = self.clients.lock().expect("clients lock");
        let key = (room_id.clone(), client_id.clone());
        if clients
            .get(&key)
            .is_some_and(|reg| reg.client.instance() == instance)
        {
            clients.remove(&key);
        }
    }
}

pub struct Repository {
    shared: Arc<RepoShared>,
    conf: RelayConfig,
    store: Arc<dyn RoomInfoStore>,
    app_id: String,
    host_id: u32,
}

impl Repository {
    pub fn new(
        app_id: impl Into<String>,
        host_id: u32,
        conf: RelayConfig,
        store: Arc<dyn RoomInfoStore>,
    ) -> Self {
        Self {
            shared: Arc::new(RepoShared {
                rooms: Mutex::new(HashMap::new()),
                clients: Mutex::new(HashMap::new()),
            }),
            conf,
            store,
            app_id: app_id.into(),
            host_id,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn room_count(&self) -> usize {
        self.shared.rooms.lock().expect("rooms lock").len()
    }

    /// Creates a room with the given master. The reply carries the MAC
    /// key the master must sign its frames with.
    pub async fn create(
        &self,
        option: RoomOption,
        master: ClientInfo,
    ) -> Result<JoinedRoomRes, RoomError> {
        let public_props = parse_props(&option.public_props, "public props")?;
        let private_props = parse_props(&option.private_props, "private props")?;

        let room_id = self.generate_room_id();
        let deadline = if option.client_deadline == 0 {
            self.conf.default_client_deadline
        } else {
            Duration::from_secs(option.client_deadline as u64)
        };
        let info = RoomInfo {
            id: room_id.clone(),
            app_id: self.app_id.clone(),
            host_id: self.host_id,
            visible: option.visible,
            joinable: option.joinable,
            watchable: option.watchable,
            search_group: option.search_group,
            max_players: option.max_players,
            players: 0,
            watchers: 0,
            public_props: public_props.marshal(),
            private_props: private_props.marshal(),
            created: now_unix_secs(),
        };

        let handle = spawn_room(
            self.shared.clone(),
            self.store.clone(),
            &self.conf,
            info,
            deadline,
            public_props,
            private_props,
        );

        let mac_key = generate_key();
        let result = self
            .call(&handle, |reply| RoomMsg::Create {
                info: master,
                mac_key: mac_key.clone(),
                reply,
            })
            .await;

        match result {
            Ok(Ok(joined)) => {
                self.shared
                    .rooms
                    .lock()
                    .expect("rooms lock")
                    .insert(room_id.clone(), handle);
                tracing::info!(%room_id, "room created");
                Ok(joined_res(joined, mac_key))
            }
            Ok(Err(e)) => {
                handle.done.cancel();
                Err(e)
            }
            Err(e) => {
                handle.done.cancel();
                Err(e)
            }
        }
    }

    /// Adds a player to an existing room (or re-admits one that dropped).
    pub async fn join(
        &self,
        room_id: &RoomId,
        info: ClientInfo,
    ) -> Result<JoinedRoomRes, RoomError> {
        let handle = self.room_handle(room_id)?;
        let mac_key = generate_key();
        let joined = self
            .call(&handle, |reply| RoomMsg::Join {
                info,
                mac_key: mac_key.clone(),
                reply,
            })
            .await??;
        Ok(joined_res(joined, mac_key))
    }

    /// Adds a watcher to an existing room.
    pub async fn watch(
        &self,
        room_id: &RoomId,
        info: ClientInfo,
    ) -> Result<JoinedRoomRes, RoomError> {
        let handle = self.room_handle(room_id)?;
        let mac_key = generate_key();
        let joined = self
            .call(&handle, |reply| RoomMsg::Watch {
                info,
                mac_key: mac_key.clone(),
                reply,
            })
            .await??;
        Ok(joined_res(joined, mac_key))
    }

    /// Pings a room on behalf of a registered client (hub keepalive). The
    /// pong flows to that client's attached peer.
    pub async fn ping(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
        timestamp: u64,
    ) -> Result<(), RoomError> {
        let handle = self.room_handle(room_id)?;
        let sender = self
            .get_client(room_id, client_id)
            .map(|(client, _)| client)
            .ok_or_else(|| {
                RoomError::NotFound(format!("client {client_id} not in room {room_id}"))
            })?;
        self.send(&handle, RoomMsg::Ping { sender, timestamp }).await
    }

    /// Removes a player on admin authority.
    pub async fn kick(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
    ) -> Result<(), RoomError> {
        let handle = self.room_handle(room_id)?;
        self.call(&handle, |reply| RoomMsg::AdminKick {
            target: client_id.clone(),
            reply,
        })
        .await?
    }

    /// Snapshot of a room's info, membership, and last-activity times.
    pub async fn get_room_info(
        &self,
        room_id: &RoomId,
    ) -> Result<RoomSnapshot, RoomError> {
        let handle = self.room_handle(room_id)?;
        self.call(&handle, |reply| RoomMsg::GetRoomInfo { reply })
            .await
    }

    /// Resolves an upgrade: the live client handle and its MAC key.
    pub fn get_client(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
    ) -> Option<(Client, String)> {
        self.shared
            .clients
            .lock()
            .expect("clients lock")
            .get(&(room_id.clone(), client_id.clone()))
            .map(|reg| (reg.client.clone(), reg.mac_key.clone()))
    }

    pub fn room_exists(&self, room_id: &RoomId) -> bool {
        self.shared
            .rooms
            .lock()
            .expect("rooms lock")
            .contains_key(room_id)
    }

    fn room_handle(&self, room_id: &RoomId) -> Result<RoomHandle, RoomError> {
        self.shared
            .rooms
            .lock()
            .expect("rooms lock")
            .get(room_id)
            .cloned()
            .ok_or_else(|| RoomError::NotFound(format!("room {room_id} not found")))
    }

    /// Sends a message and awaits its reply channel, both bounded by the
    /// control timeout.
    async fn call<T>(
        &self,
        handle: &RoomHandle,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMsg,
    ) -> Result<T, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(handle, build(reply_tx)).await?;
        match tokio::time::timeout(self.conf.control_timeout, reply_rx).await {
            Err(_) => Err(RoomError::DeadlineExceeded(format!(
                "room {} did not answer",
                handle.id
            ))),
            Ok(Err(_)) => Err(RoomError::Unavailable(format!(
                "room {} closed",
                handle.id
            ))),
            Ok(Ok(value)) => Ok(value),
        }
    }

    async fn send(&self, handle: &RoomHandle, msg: RoomMsg) -> Result<(), RoomError> {
        if handle.done.is_cancelled() {
            return Err(RoomError::Unavailable(format!(
                "room {} closed",
                handle.id
            )));
        }
        match tokio::time::timeout(self.conf.control_timeout, handle.tx.send(msg)).await
        {
            Err(_) => Err(RoomError::DeadlineExceeded(format!(
                "room {} message channel full",
                handle.id
            ))),
            Ok(Err(_)) => Err(RoomError::Unavailable(format!(
                "room {} closed",
                handle.id
            ))),
            Ok(Ok(())) => Ok(()),
        }
    }

    fn generate_room_id(&self) -> RoomId {
        let rooms = self.shared.rooms.lock().expect("rooms lock");
        loop {
            let id = RoomId(generate_hex(8));
            if !rooms.contains_key(&id) {
                return id;
            }
        }
    }
}

fn joined_res(joined: crate::types::JoinedInfo, mac_key: String) -> JoinedRoomRes {
    JoinedRoomRes {
        room_info: joined.room_info,
        players: joined.players,
        client_id: joined.client.id().clone(),
        master_id: joined.master_id,
        deadline: joined.deadline,
        mac_key,
    }
}

fn parse_props(raw: &[u8], what: &str) -> Result<Dict, RoomError> {
    if raw.is_empty() {
        return Ok(Dict::new());
    }
    Dict::unmarshal(raw)
        .map_err(|e| RoomError::InvalidArgument(format!("{what}: {e}")))
}

/// Random 128-bit hex secret for signing one client's frames.
fn generate_key() -> String {
    generate_hex(16)
}

fn generate_hex(bytes: usize) -> String {
    let mut rng = rand::rng();
    (0..bytes)
        .map(|_| {
            let b: u8 = rng.random();
            format!("{b:02x}")
        })
        .collect()
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =========================================================================
// Tests
// =========================================================================
