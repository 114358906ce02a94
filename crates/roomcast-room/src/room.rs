//! The room actor: one task owning all room state.
//!
//! Every mutation of membership, properties, master election, and
//! last-activity tracking happens on this task, driven by typed messages
//! from the control plane (with reply channels) and from client loops.
//! Outbound delivery is a non-blocking push into each client's mailbox,
//! so the actor never waits on a slow socket.
//!
//! A second task per room publishes room-info snapshots to the store; a
//! `watch` channel coalesces bursts of updates into single writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use roomcast_protocol::{
    Dict, Msg, MsgBody, RegularEvent, SystemEvent, Type, Value,
};

use crate::client::Client;
use crate::repository::RepoShared;
use crate::store::RoomInfoStore;
use crate::types::{ClientId, ClientInfo, JoinedInfo, RoomId, RoomInfo, RoomSnapshot};
use crate::{RelayConfig, RoomError};

/// Retry interval for failed room-info store writes.
const STORE_RETRY: Duration = Duration::from_secs(1);

/// Inbound messages to a room actor.
pub(crate) enum RoomMsg {
    // -- Control plane (reply channels) --
    Create {
        info: ClientInfo,
        mac_key: String,
        reply: oneshot::Sender<Result<JoinedInfo, RoomError>>,
    },
    Join {
        info: ClientInfo,
        mac_key: String,
        reply: oneshot::Sender<Result<JoinedInfo, RoomError>>,
    },
    Watch {
        info: ClientInfo,
        mac_key: String,
        reply: oneshot::Sender<Result<JoinedInfo, RoomError>>,
    },
    GetRoomInfo {
        reply: oneshot::Sender<RoomSnapshot>,
    },
    AdminKick {
        target: ClientId,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },

    // -- Client-initiated --
    Ping { sender: Client, timestamp: u64 },
    NodeCount { sender: Client, count: u32 },
    /// A sequenced wire message (leave, props, relay, kick, ...).
    Regular { sender: Client, msg: Msg },

    // -- Internal --
    ClientError { sender: Client, err: String },
    ClientTimeout { sender: Client },
}

impl RoomMsg {
    /// The client this message came from, when it came from one.
    fn sender(&self) -> Option<&Client> {
        match self {
            RoomMsg::Ping { sender, .. }
            | RoomMsg::NodeCount { sender, .. }
            | RoomMsg::Regular { sender, .. }
            | RoomMsg::ClientError { sender, .. }
            | RoomMsg::ClientTimeout { sender } => Some(sender),
            _ => None,
        }
    }
}

/// Handle the repository keeps per live room.
#[derive(Clone)]
pub(crate) struct RoomHandle {
    pub id: RoomId,
    pub tx: mpsc::Sender<RoomMsg>,
    pub done: CancellationToken,
}

/// Spawns the actor and its room-info publisher.
pub(crate) fn spawn_room(
    repo: Arc<RepoShared>,
    store: Arc<dyn RoomInfoStore>,
    conf: &RelayConfig,
    info: RoomInfo,
    deadline: Duration,
    public_props: Dict,
    private_props: Dict,
) -> RoomHandle {
    let (msg_tx, msg_rx) = mpsc::channel(conf.room_msg_ch_size);
    let done = CancellationToken::new();
    let (info_tx, info_rx) = watch::channel(info.clone());

    let publisher = tokio::spawn(publish_room_info(
        info_rx,
        store.clone(),
        done.clone(),
    ));

    let handle = RoomHandle {
        id: info.id.clone(),
        tx: msg_tx.clone(),
        done: done.clone(),
    };

    let actor = RoomActor {
        info,
        conf: conf.clone(),
        repo,
        store,
        deadline,
        public_props,
        private_props,
        msg_tx,
        msg_rx,
        done,
        players: HashMap::new(),
        master: ClientId(String::new()),
        master_order: Vec::new(),
        watchers: HashMap::new(),
        last_msg: Dict::new(),
        info_tx,
        tasks: JoinSet::new(),
        publisher,
    };
    tokio::spawn(actor.run());

    handle
}

/// A room member: the live client plus the state the room owns for it.
struct Member {
    client: Client,
    info: ClientInfo,
    props: Dict,
    node_count: u32,
}

struct RoomActor {
    info: RoomInfo,
    conf: RelayConfig,
    repo: Arc<RepoShared>,
    store: Arc<dyn RoomInfoStore>,
    deadline: Duration,

    public_props: Dict,
    private_props: Dict,

    msg_tx: mpsc::Sender<RoomMsg>,
    msg_rx: mpsc::Receiver<RoomMsg>,
    done: CancellationToken,

    players: HashMap<ClientId, Member>,
    /// Never empty while `players` is non-empty.
    master: ClientId,
    /// Player ids in arrival order of their current occupancy; the next
    /// master is always the front. A rejoin keeps its old slot.
    master_order: Vec<ClientId>,
    watchers: HashMap<ClientId, Member>,

    /// Player id → marshaled ULong unix-millis of last inbound message.
    last_msg: Dict,

    info_tx: watch::Sender<RoomInfo>,
    tasks: JoinSet<()>,
    publisher: JoinHandle<()>,
}

impl RoomActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.done.cancelled() => {
                    tracing::info!(room_id = %self.info.id, "room closed");
                    break;
                }
                msg = self.msg_rx.recv() => match msg {
                    None => break,
                    Some(msg) => {
                        if let Some(sender) = msg.sender() {
                            self.update_last_msg(sender.id());
                        }
                        self.dispatch(msg);
                    }
                }
            }
        }

        // Watchers outlive the last player only up to this point. Players
        // are normally gone already; a room cancelled mid-create still
        // needs its members released or the drain below never finishes.
        let remaining: Vec<Client> = self
            .players
            .values()
            .chain(self.watchers.values())
            .map(|m| m.client.clone())
            .collect();
        for client in remaining {
            if client.is_player() {
                let cid = client.id().clone();
                if let Some(member) = self.players.remove(&cid) {
                    self.repo.unregister_client(
                        &self.info.id,
                        &cid,
                        member.client.instance(),
                    );
                    member.client.removed("room closed");
                }
            } else {
                self.remove_watcher(&client, "room closed");
            }
        }

        self.repo.remove_room(&self.info.id);
        self.drain().await;

        let _ = self.publisher.await;
        if let Err(e) = self.store.remove_room(&self.info.id).await {
            tracing::warn!(room_id = %self.info.id, error = %e, "room row removal failed");
        }
    }

    /// Keeps receiving (and discarding) messages until every client task
    /// has exited, so no client loop stays blocked on a full channel.
    async fn drain(&mut self) {
        loop {
            tokio::select! {
                msg = self.msg_rx.recv() => {
                    if msg.is_some() {
                        tracing::debug!(room_id = %self.info.id, "discarding message after close");
                    }
                }
                next = self.tasks.join_next() => {
                    if next.is_none() {
                        break;
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, msg: RoomMsg) {
        match msg {
            RoomMsg::Create { info, mac_key, reply } => {
                let result = self.msg_create(info, mac_key);
                let _ = reply.send(result);
            }
            RoomMsg::Join { info, mac_key, reply } => {
                let result = self.msg_join(info, mac_key);
                let _ = reply.send(result);
            }
            RoomMsg::Watch { info, mac_key, reply } => {
                let result = self.msg_watch(info, mac_key);
                let _ = reply.send(result);
            }
            RoomMsg::GetRoomInfo { reply } => {
                let _ = reply.send(self.snapshot());
            }
            RoomMsg::AdminKick { target, reply } => {
                let _ = reply.send(self.msg_admin_kick(target));
            }
            RoomMsg::Ping { sender, timestamp } => self.msg_ping(&sender, timestamp),
            RoomMsg::NodeCount { sender, count } => self.msg_node_count(&sender, count),
            RoomMsg::Regular { sender, msg } => self.msg_regular(sender, msg),
            RoomMsg::ClientError { sender, err } => {
                if self.is_current(&sender) {
                    self.remove_client(&sender, &err);
                }
            }
            RoomMsg::ClientTimeout { sender } => {
                if self.is_current(&sender) {
                    self.remove_client(&sender, "timeout");
                }
            }
        }
    }

    // -- Membership ---------------------------------------------------------

    fn msg_create(
        &mut self,
        info: ClientInfo,
        mac_key: String,
    ) -> Result<JoinedInfo, RoomError> {
        let (client, member) = self.new_member(info, mac_key.clone(), true)?;
        let cid = member.info.id.clone();
        let props = member.info.props.clone();
        tracing::info!(room_id = %self.info.id, client_id = %cid, "new player (master)");

        self.players.insert(cid.clone(), member);
        self.master = cid.clone();
        self.master_order.push(cid.clone());
        self.info.players = 1;
        self.update_room_info();
        self.repo
            .register_client(&self.info.id, client.clone(), mac_key);

        let joined = JoinedInfo {
            room_info: self.info.clone(),
            players: self.player_infos(),
            client,
            master_id: cid.clone(),
            deadline: self.deadline,
        };
        self.broadcast(RegularEvent::joined(&cid.0, &props));
        self.write_last_msg(&cid);
        Ok(joined)
    }

    fn msg_join(
        &mut self,
        info: ClientInfo,
        mac_key: String,
    ) -> Result<JoinedInfo, RoomError> {
        if !self.info.joinable {
            return Err(RoomError::FailedPrecondition(format!(
                "room {} is not joinable",
                self.info.id
            )));
        }

        let cid = info.id.clone();
        // Re-entry before the deadline replaces the old incarnation and
        // announces Rejoined instead of Joined.
        let rejoin = self.players.contains_key(&cid);
        if self.watchers.contains_key(&cid) {
            return Err(RoomError::AlreadyExists(format!(
                "client {cid} is already watching room {}",
                self.info.id
            )));
        }
        if !rejoin && self.players.len() as u32 >= self.info.max_players {
            return Err(RoomError::ResourceExhausted(format!(
                "room {} is full (max {})",
                self.info.id, self.info.max_players
            )));
        }

        let (client, member) = self.new_member(info, mac_key.clone(), true)?;
        let props = member.info.props.clone();
        let old = self.players.insert(cid.clone(), member);
        if rejoin {
            if let Some(old) = old {
                old.client.removed("client rejoined as a new client");
            }
            // The master reference is by id, so a rejoining master keeps
            // the role; master_order keeps the original slot.
            tracing::info!(room_id = %self.info.id, client_id = %cid, "player rejoined");
        } else {
            self.master_order.push(cid.clone());
            self.info.players = self.players.len() as u32;
            self.update_room_info();
            tracing::info!(room_id = %self.info.id, client_id = %cid, "new player");
        }
        self.repo
            .register_client(&self.info.id, client.clone(), mac_key);

        self.send_roster(&cid);

        let joined = JoinedInfo {
            room_info: self.info.clone(),
            players: self.player_infos(),
            client,
            master_id: self.master.clone(),
            deadline: self.deadline,
        };
        if rejoin {
            self.broadcast(RegularEvent::rejoined(&cid.0, &props));
        } else {
            self.broadcast(RegularEvent::joined(&cid.0, &props));
        }
        self.write_last_msg(&cid);
        Ok(joined)
    }

    fn msg_watch(
        &mut self,
        info: ClientInfo,
        mac_key: String,
    ) -> Result<JoinedInfo, RoomError> {
        if !self.info.watchable {
            return Err(RoomError::FailedPrecondition(format!(
                "room {} is not watchable",
                self.info.id
            )));
        }
        let cid = info.id.clone();
        if self.players.contains_key(&cid) {
            return Err(RoomError::AlreadyExists(format!(
                "client {cid} is already playing in room {}",
                self.info.id
            )));
        }

        let (client, member) = self.new_member(info, mac_key.clone(), false)?;
        let node_count = member.node_count;
        let old = self.watchers.insert(cid.clone(), member);
        if let Some(old) = old {
            old.client.removed("client rejoined as a new client");
            self.info.watchers -= old.node_count;
            tracing::info!(room_id = %self.info.id, client_id = %cid, "watcher rejoined");
        } else {
            tracing::info!(room_id = %self.info.id, client_id = %cid, "new watcher");
        }
        self.info.watchers += node_count;
        self.update_room_info();
        self.repo
            .register_client(&self.info.id, client.clone(), mac_key);

        self.send_roster(&cid);

        Ok(JoinedInfo {
            room_info: self.info.clone(),
            players: self.player_infos(),
            client,
            master_id: self.master.clone(),
            deadline: self.deadline,
        })
    }

    /// Builds a member, spawning its client loop into the room's task set.
    fn new_member(
        &mut self,
        mut info: ClientInfo,
        mac_key: String,
        is_player: bool,
    ) -> Result<(Client, Member), RoomError> {
        let props = if info.props.is_empty() {
            Dict::new()
        } else {
            Dict::unmarshal(&info.props).map_err(|e| {
                RoomError::InvalidArgument(format!(
                    "client {} props: {e}",
                    info.id
                ))
            })?
        };
        info.props = props.marshal();

        let (client, task) = Client::new(
            info.id.clone(),
            self.info.id.clone(),
            is_player,
            mac_key,
            self.deadline,
            self.conf.event_buf_size,
            self.msg_tx.clone(),
        );
        self.tasks.spawn(task);

        let member = Member {
            client: client.clone(),
            info,
            props,
            node_count: 1,
        };
        Ok((client, member))
    }

    /// Replays the current player roster to a client that just entered, so
    /// its event stream starts with the people already in the room.
    fn send_roster(&mut self, entrant: &ClientId) {
        let roster: Vec<(ClientId, Vec<u8>)> = self
            .master_order
            .iter()
            .filter(|id| *id != entrant)
            .filter_map(|id| {
                self.players
                    .get(id)
                    .map(|m| (id.clone(), m.info.props.clone()))
            })
            .collect();
        let Some(client) = self.find_member(entrant).map(|m| m.client.clone()) else {
            return;
        };
        for (id, props) in roster {
            let ev = Arc::new(RegularEvent::joined(&id.0, &props));
            if client.send(ev).is_err() {
                self.remove_client(&client, "event send failed");
                return;
            }
        }
    }

    fn find_member(&self, id: &ClientId) -> Option<&Member> {
        self.players.get(id).or_else(|| self.watchers.get(id))
    }

    /// Whether this handle is the current incarnation of its id. Messages
    /// from a replaced client fail this and are ignored.
    fn is_current(&self, client: &Client) -> bool {
        let map = if client.is_player() {
            &self.players
        } else {
            &self.watchers
        };
        map.get(client.id())
            .is_some_and(|m| m.client.instance() == client.instance())
    }

    fn remove_client(&mut self, client: &Client, cause: &str) {
        if client.is_player() {
            self.remove_player(client, cause);
        } else {
            self.remove_watcher(client, cause);
        }
    }

    fn remove_player(&mut self, client: &Client, cause: &str) {
        let cid = client.id().clone();
        let Some(member) = self.players.remove(&cid) else {
            tracing::info!(client_id = %cid, %cause, "player already removed");
            return;
        };
        if member.client.instance() != client.instance() {
            self.players.insert(cid, member);
            return;
        }

        self.master_order.retain(|id| *id != cid);
        self.repo
            .unregister_client(&self.info.id, &cid, member.client.instance());
        tracing::info!(room_id = %self.info.id, client_id = %cid, %cause, "player left");
        member.client.removed(cause);

        if self.players.is_empty() {
            self.done.cancel();
            return;
        }

        if self.master == cid {
            if let Some(next) = self.master_order.first() {
                tracing::info!(
                    room_id = %self.info.id,
                    old = %cid,
                    new = %next,
                    "master switched"
                );
                self.master = next.clone();
            }
        }

        self.info.players = self.players.len() as u32;
        self.update_room_info();
        self.broadcast(RegularEvent::left(&cid.0, &self.master.0.clone(), cause));
        self.last_msg.remove(&cid.0);
    }

    fn remove_watcher(&mut self, client: &Client, cause: &str) {
        let cid = client.id().clone();
        let Some(member) = self.watchers.remove(&cid) else {
            tracing::debug!(client_id = %cid, %cause, "watcher already removed");
            return;
        };
        if member.client.instance() != client.instance() {
            self.watchers.insert(cid, member);
            return;
        }

        self.repo
            .unregister_client(&self.info.id, &cid, member.client.instance());
        tracing::info!(room_id = %self.info.id, client_id = %cid, %cause, "watcher left");
        self.info.watchers -= member.node_count;
        self.update_room_info();
        member.client.removed(cause);
    }

    // -- Client messages ----------------------------------------------------

    fn msg_ping(&mut self, sender: &Client, timestamp: u64) {
        if !self.is_current(sender) {
            return;
        }
        tracing::debug!(client_id = %sender.id(), timestamp, "ping");
        let ev = SystemEvent::pong(timestamp, self.info.watchers, &self.last_msg);
        if sender.send_system_event(ev).is_err() {
            let sender = sender.clone();
            self.remove_client(&sender, "event send failed");
        }
    }

    fn msg_node_count(&mut self, sender: &Client, count: u32) {
        if !self.is_current(sender) || sender.is_player() {
            return;
        }
        let Some(member) = self.watchers.get_mut(sender.id()) else {
            return;
        };
        if member.node_count == count {
            return;
        }
        self.info.watchers = (self.info.watchers - member.node_count) + count;
        tracing::debug!(
            client_id = %sender.id(),
            old = member.node_count,
            new = count,
            total = self.info.watchers,
            "node count updated"
        );
        member.node_count = count;
        self.update_room_info();
    }

    fn msg_regular(&mut self, sender: Client, msg: Msg) {
        if !self.is_current(&sender) {
            return;
        }
        match &msg.body {
            MsgBody::Leave { message } => {
                let message = message.clone();
                self.remove_client(&sender, &message);
            }
            MsgBody::RoomProp(_) => self.msg_room_prop(&sender, &msg),
            MsgBody::ClientProp { .. } => self.msg_client_prop(&sender, &msg),
            MsgBody::SwitchMaster { .. } => self.msg_switch_master(&sender, &msg),
            MsgBody::Targets { .. } => self.msg_targets(&sender, &msg),
            MsgBody::ToMaster { .. } => self.msg_to_master(&sender, &msg),
            MsgBody::Broadcast { .. } => self.msg_broadcast(&sender, &msg),
            MsgBody::Kick { .. } => self.msg_kick(&sender, &msg),
            MsgBody::Ping { .. } | MsgBody::NodeCount { .. } => {
                tracing::debug!(client_id = %sender.id(), "system message on regular path");
            }
        }
    }

    fn msg_room_prop(&mut self, sender: &Client, msg: &Msg) {
        let MsgBody::RoomProp(rpp) = &msg.body else { return };

        if *sender.id() != self.master {
            tracing::warn!(
                client_id = %sender.id(),
                master = %self.master,
                "room prop from non-master"
            );
            self.send_to_client(sender, Arc::new(RegularEvent::permission_denied(msg)));
            return;
        }

        self.info.visible = rpp.visible;
        self.info.joinable = rpp.joinable;
        self.info.watchable = rpp.watchable;
        self.info.search_group = rpp.search_group;
        self.info.max_players = rpp.max_players as u32;

        if !rpp.public_props.is_empty() {
            self.public_props.merge(&rpp.public_props);
            self.info.public_props = self.public_props.marshal();
        }
        if !rpp.private_props.is_empty() {
            self.private_props.merge(&rpp.private_props);
            self.info.private_props = self.private_props.marshal();
        }
        self.update_room_info();

        if rpp.client_deadline != 0 {
            let deadline = Duration::from_secs(rpp.client_deadline as u64);
            if deadline != self.deadline {
                self.deadline = deadline;
                for member in self.players.values() {
                    member.client.set_deadline(deadline);
                }
                tracing::info!(
                    room_id = %self.info.id,
                    deadline_secs = rpp.client_deadline,
                    "client deadline updated"
                );
            }
        }

        self.send_to_client(sender, Arc::new(RegularEvent::succeeded(msg)));
        self.broadcast(RegularEvent::room_prop(msg.payload()));
    }

    fn msg_client_prop(&mut self, sender: &Client, msg: &Msg) {
        let MsgBody::ClientProp { props } = &msg.body else { return };

        if !sender.is_player() {
            tracing::warn!(client_id = %sender.id(), "client prop from watcher");
            self.send_to_client(sender, Arc::new(RegularEvent::permission_denied(msg)));
            return;
        }

        if !props.is_empty() {
            if let Some(member) = self.players.get_mut(sender.id()) {
                member.props.merge(props);
                member.info.props = member.props.marshal();
            }
        }

        self.send_to_client(sender, Arc::new(RegularEvent::succeeded(msg)));
        self.broadcast(RegularEvent::client_prop(&sender.id().0, msg.payload()));
    }

    fn msg_switch_master(&mut self, sender: &Client, msg: &Msg) {
        let MsgBody::SwitchMaster { target } = &msg.body else { return };

        if *sender.id() != self.master {
            tracing::warn!(
                client_id = %sender.id(),
                master = %self.master,
                "switch master from non-master"
            );
            self.send_to_client(sender, Arc::new(RegularEvent::permission_denied(msg)));
            return;
        }

        let target = ClientId(target.clone());
        if !self.players.contains_key(&target) {
            tracing::info!(client_id = %sender.id(), %target, "switch target absent");
            self.send_to_client(
                sender,
                Arc::new(RegularEvent::target_not_found(msg, &[target.0])),
            );
            return;
        }

        tracing::info!(
            room_id = %self.info.id,
            old = %self.master,
            new = %target,
            "master switched"
        );
        self.master = target.clone();
        self.send_to_client(sender, Arc::new(RegularEvent::succeeded(msg)));
        self.broadcast(RegularEvent::master_switched(&target.0));
    }

    fn msg_targets(&mut self, sender: &Client, msg: &Msg) {
        let MsgBody::Targets { targets, data } = &msg.body else { return };

        let ev = Arc::new(RegularEvent::message(&sender.id().0, data));
        let mut absent = Vec::new();
        let mut failed = Vec::new();
        for target in targets {
            match self.players.get(&ClientId(target.clone())) {
                Some(member) => {
                    if member.client.send(ev.clone()).is_err() {
                        failed.push(member.client.clone());
                    }
                }
                None => {
                    tracing::info!(client_id = %sender.id(), target, "target absent");
                    absent.push(target.clone());
                }
            }
        }
        for client in failed {
            self.remove_client(&client, "event send failed");
        }

        if !absent.is_empty() {
            self.send_to_client(
                sender,
                Arc::new(RegularEvent::target_not_found(msg, &absent)),
            );
        }
    }

    fn msg_to_master(&mut self, sender: &Client, msg: &Msg) {
        let MsgBody::ToMaster { data } = &msg.body else { return };
        let Some(master) = self.players.get(&self.master).map(|m| m.client.clone())
        else {
            return;
        };
        let ev = Arc::new(RegularEvent::message(&sender.id().0, data));
        if master.send(ev).is_err() {
            self.remove_client(&master, "event send failed");
        }
    }

    fn msg_broadcast(&mut self, sender: &Client, msg: &Msg) {
        let MsgBody::Broadcast { data } = &msg.body else { return };
        self.broadcast(RegularEvent::message(&sender.id().0, data));
    }

    fn msg_kick(&mut self, sender: &Client, msg: &Msg) {
        let MsgBody::Kick { target, message } = &msg.body else { return };

        if *sender.id() != self.master {
            tracing::warn!(
                client_id = %sender.id(),
                master = %self.master,
                "kick from non-master"
            );
            self.send_to_client(sender, Arc::new(RegularEvent::permission_denied(msg)));
            return;
        }

        let target_id = ClientId(target.clone());
        let Some(target_client) =
            self.players.get(&target_id).map(|m| m.client.clone())
        else {
            tracing::warn!(client_id = %sender.id(), target, "kick target absent");
            self.send_to_client(
                sender,
                Arc::new(RegularEvent::target_not_found(msg, &[target.clone()])),
            );
            return;
        };

        tracing::info!(room_id = %self.info.id, target = %target_id, "kick");
        self.send_to_client(sender, Arc::new(RegularEvent::succeeded(msg)));
        let cause = if message.is_empty() {
            "kicked".to_string()
        } else {
            message.clone()
        };
        self.remove_client(&target_client, &cause);
    }

    fn msg_admin_kick(&mut self, target: ClientId) -> Result<(), RoomError> {
        let Some(client) = self.players.get(&target).map(|m| m.client.clone()) else {
            return Err(RoomError::NotFound(format!("player {target} not found")));
        };
        self.remove_client(&client, "kicked by admin");
        Ok(())
    }

    fn snapshot(&self) -> RoomSnapshot {
        let last_msg_times = self
            .last_msg
            .iter()
            .filter_map(|(id, raw)| {
                match Value::unmarshal_as(raw, &[Type::ULong]) {
                    Ok((Value::ULong(ms), _)) => Some((ClientId(id.to_string()), ms)),
                    _ => None,
                }
            })
            .collect();
        RoomSnapshot {
            room_info: self.info.clone(),
            clients: self.player_infos(),
            master_id: self.master.clone(),
            last_msg_times,
        }
    }

    // -- Delivery -----------------------------------------------------------

    /// Sends to one member; a dead mailbox removes that member, nobody
    /// else is affected.
    fn send_to_client(&mut self, client: &Client, ev: Arc<RegularEvent>) {
        if client.send(ev).is_err() {
            tracing::info!(client_id = %client.id(), "event send failed");
            let client = client.clone();
            self.remove_client(&client, "event send failed");
        }
    }

    /// Sends to every player and watcher. Per-client order is the dispatch
    /// order; failures are swept after the iteration completes.
    fn broadcast(&mut self, ev: RegularEvent) {
        let ev = Arc::new(ev);
        let mut failed = Vec::new();
        for member in self.players.values().chain(self.watchers.values()) {
            if member.client.send(ev.clone()).is_err() {
                failed.push(member.client.clone());
            }
        }
        for client in failed {
            self.remove_client(&client, "event send failed");
        }
    }

    // -- Bookkeeping --------------------------------------------------------

    fn player_infos(&self) -> Vec<ClientInfo> {
        self.master_order
            .iter()
            .filter_map(|id| self.players.get(id).map(|m| m.info.clone()))
            .collect()
    }

    fn write_last_msg(&mut self, cid: &ClientId) {
        self.last_msg
            .insert(cid.0.clone(), Value::ULong(now_unix_millis()).marshal());
    }

    /// Refreshes the last-activity stamp for senders already tracked
    /// (players only; watchers never get an entry).
    fn update_last_msg(&mut self, cid: &ClientId) {
        if self.last_msg.contains_key(&cid.0) {
            self.write_last_msg(cid);
        }
    }

    /// Publishes the current room info; the publisher task coalesces
    /// bursts into single store writes.
    fn update_room_info(&mut self) {
        self.info_tx.send_replace(self.info.clone());
    }
}

/// Writes room-info snapshots to the store as they change, retrying with
/// a fixed backoff. Several updates during one write collapse into
/// exactly one follow-up.
async fn publish_room_info(
    mut rx: watch::Receiver<RoomInfo>,
    store: Arc<dyn RoomInfoStore>,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
                loop {
                    let snapshot = rx.borrow_and_update().clone();
                    match store.put_room(&snapshot).await {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::error!(
                                room_id = %snapshot.id,
                                error = %e,
                                "room info write failed; retrying"
                            );
                            tokio::time::sleep(STORE_RETRY).await;
                        }
                    }
                }
            }
        }
    }
}

pub(crate) fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
