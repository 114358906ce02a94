//! A logical room participant, independent of any one socket.
//!
//! The client outlives its connections: it owns the outbound event ring,
//! the idle-deadline timer, and the slot for the current peer. Its loop
//! serializes everything that touches those — event sends, peer swaps on
//! reconnect, inbound message forwarding — so none of it needs locking.
//!
//! The [`Client`] struct itself is a cheap clonable handle; the room keeps
//! one per member and the repository one per registration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use roomcast_protocol::{Msg, MsgBody, RegularEvent, SystemEvent};
use roomcast_transport::{close_frame, CloseCode, WsStream};

use crate::evbuf::EventBuffer;
use crate::peer::Peer;
use crate::room::RoomMsg;
use crate::types::{ClientId, RoomId};
use crate::RoomError;

/// Distinguishes successive incarnations of the same client id. A rejoin
/// creates a fresh instance; stale messages from the old one are dropped
/// by comparing this.
static NEXT_CLIENT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// The client task is gone; the room responds by removing the member.
#[derive(Debug, thiserror::Error)]
#[error("client task terminated")]
pub(crate) struct ClientGone;

/// Inputs to the client loop.
pub(crate) enum ClientNotify {
    /// A regular event to buffer and push to the current peer.
    Event(Arc<RegularEvent>),
    /// A system event to write through to the current peer.
    System(SystemEvent),
    /// A new socket wants to become this client's peer.
    Attach {
        conn: WsStream,
        last_event_seq: u32,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    /// A peer's read task finished.
    PeerExited { peer: u64 },
    /// A decoded, MAC-verified message from a peer.
    Msg { peer: u64, msg: Msg },
    /// The room deadline changed.
    NewDeadline(Duration),
    /// Terminal: the room dropped this client.
    Removed { cause: String },
}

struct ClientShared {
    id: ClientId,
    room_id: RoomId,
    instance: u64,
    is_player: bool,
    done: CancellationToken,
    notify: mpsc::UnboundedSender<ClientNotify>,
}

/// Handle to a client. Cloning shares the same participant.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("instance", &self.shared.instance)
            .field("is_player", &self.shared.is_player)
            .finish()
    }
}

impl Client {
    /// Creates the client and returns its loop as a future for the room's
    /// task set.
    pub(crate) fn new(
        id: ClientId,
        room_id: RoomId,
        is_player: bool,
        mac_key: String,
        deadline: Duration,
        event_buf_size: usize,
        room_tx: mpsc::Sender<RoomMsg>,
    ) -> (Self, impl std::future::Future<Output = ()> + Send + 'static) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared {
            id,
            room_id,
            instance: NEXT_CLIENT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            is_player,
            done: CancellationToken::new(),
            notify: notify_tx,
        });
        let client = Self {
            shared: shared.clone(),
        };

        let task = ClientLoop {
            shared,
            mac_key,
            rx: notify_rx,
            room_tx,
            evbuf: EventBuffer::new(event_buf_size),
            peer: None,
            next_peer_id: 0,
            last_recv_msg_seq: 0,
            deadline,
            deadline_at: Instant::now() + deadline,
            handle: client.clone(),
        };
        (client, task.run())
    }

    pub fn id(&self) -> &ClientId {
        &self.shared.id
    }

    pub fn instance(&self) -> u64 {
        self.shared.instance
    }

    pub(crate) fn is_player(&self) -> bool {
        self.shared.is_player
    }

    /// Queues a regular event. Non-blocking: the loop buffers it and, when
    /// a peer is attached, pushes it out in order.
    pub(crate) fn send(&self, ev: Arc<RegularEvent>) -> Result<(), ClientGone> {
        self.shared
            .notify
            .send(ClientNotify::Event(ev))
            .map_err(|_| ClientGone)
    }

    /// Queues a system event for write-through to the current peer.
    pub(crate) fn send_system_event(&self, ev: SystemEvent) -> Result<(), ClientGone> {
        self.shared
            .notify
            .send(ClientNotify::System(ev))
            .map_err(|_| ClientGone)
    }

    pub(crate) fn set_deadline(&self, deadline: Duration) {
        let _ = self.shared.notify.send(ClientNotify::NewDeadline(deadline));
    }

    /// Terminal removal. Closes the current peer with NormalClosure and
    /// stops the loop. Idempotent.
    pub(crate) fn removed(&self, cause: &str) {
        let _ = self.shared.notify.send(ClientNotify::Removed {
            cause: cause.to_string(),
        });
    }

    /// Offers a freshly upgraded socket as this client's peer.
    ///
    /// Rejection (future seq, ring fallen behind, client gone) closes the
    /// socket with GoingAway — the client must not retry. On success the
    /// peer has been sent `PeerReady` and the replay from
    /// `last_event_seq + 1` onward.
    pub async fn attach_peer(
        &self,
        conn: WsStream,
        last_event_seq: u32,
    ) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if let Err(send_err) = self.shared.notify.send(ClientNotify::Attach {
            conn,
            last_event_seq,
            reply: reply_tx,
        }) {
            // The loop is gone; close the orphaned socket ourselves.
            if let ClientNotify::Attach { mut conn, .. } = send_err.0 {
                tokio::spawn(async move {
                    let _ = conn
                        .close(Some(close_frame(CloseCode::Away, "client left the room")))
                        .await;
                });
            }
            return Err(RoomError::NotFound(format!(
                "client {} no longer in room",
                self.shared.id
            )));
        }
        reply_rx
            .await
            .map_err(|_| RoomError::Unavailable("client terminated".into()))?
    }
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Stop,
}

struct ClientLoop {
    shared: Arc<ClientShared>,
    mac_key: String,
    rx: mpsc::UnboundedReceiver<ClientNotify>,
    room_tx: mpsc::Sender<RoomMsg>,
    evbuf: EventBuffer,
    peer: Option<Peer>,
    next_peer_id: u64,
    /// Highest inbound message seq accepted; echoed in PeerReady.
    last_recv_msg_seq: u32,
    deadline: Duration,
    deadline_at: Instant,
    handle: Client,
}

impl ClientLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shared.done.cancelled() => break,
                _ = tokio::time::sleep_until(self.deadline_at) => {
                    tracing::warn!(
                        room_id = %self.shared.room_id,
                        client_id = %self.shared.id,
                        "client idle deadline exceeded"
                    );
                    let _ = self
                        .room_tx
                        .send(RoomMsg::ClientTimeout { sender: self.handle.clone() })
                        .await;
                    // The room answers with Removed; rearm so a slow room
                    // doesn't make this fire in a tight loop.
                    self.deadline_at += self.deadline;
                }
                notify = self.rx.recv() => match notify {
                    None => break,
                    Some(n) => {
                        if matches!(self.handle_notify(n).await, Flow::Stop) {
                            break;
                        }
                    }
                }
            }
        }

        if let Some(peer) = self.peer.take() {
            peer.detach();
        }
        self.shared.done.cancel();
    }

    async fn handle_notify(&mut self, notify: ClientNotify) -> Flow {
        match notify {
            ClientNotify::Event(ev) => {
                self.evbuf.write(ev);
                self.flush_to_peer().await;
            }
            ClientNotify::System(ev) => {
                if let Some(peer) = &self.peer {
                    peer.send_system_event(&ev).await;
                }
            }
            ClientNotify::Attach {
                conn,
                last_event_seq,
                reply,
            } => {
                let result = self.handle_attach(conn, last_event_seq).await;
                let _ = reply.send(result);
            }
            ClientNotify::PeerExited { peer } => {
                if self.peer.as_ref().map(Peer::id) == Some(peer) {
                    tracing::info!(
                        room_id = %self.shared.room_id,
                        client_id = %self.shared.id,
                        peer,
                        "peer detached"
                    );
                    self.peer = None;
                }
            }
            ClientNotify::Msg { peer, msg } => {
                if self.peer.as_ref().map(Peer::id) != Some(peer) {
                    // A detached peer drained its last frames; ignore.
                    return Flow::Continue;
                }
                self.handle_msg(msg).await;
            }
            ClientNotify::NewDeadline(deadline) => {
                self.deadline = deadline;
                self.deadline_at = Instant::now() + deadline;
            }
            ClientNotify::Removed { cause } => {
                tracing::info!(
                    room_id = %self.shared.room_id,
                    client_id = %self.shared.id,
                    %cause,
                    "client removed"
                );
                if let Some(peer) = self.peer.take() {
                    peer.close_with(CloseCode::Normal, &cause).await;
                    peer.detach();
                }
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Applies the inbound seq discipline and forwards to the room.
    ///
    /// A seq at or below the accepted high-water mark is a resend from a
    /// reconnect and is dropped (each message applies at most once). A gap
    /// means lost client state and removes the client.
    async fn handle_msg(&mut self, msg: Msg) {
        if msg.seq <= self.last_recv_msg_seq {
            tracing::debug!(
                client_id = %self.shared.id,
                seq = msg.seq,
                accepted = self.last_recv_msg_seq,
                "dropping duplicate message"
            );
            return;
        }
        if msg.seq != self.last_recv_msg_seq + 1 {
            tracing::error!(
                client_id = %self.shared.id,
                seq = msg.seq,
                accepted = self.last_recv_msg_seq,
                "message sequence gap"
            );
            let _ = self
                .room_tx
                .send(RoomMsg::ClientError {
                    sender: self.handle.clone(),
                    err: format!(
                        "message seq gap: got {}, accepted {}",
                        msg.seq, self.last_recv_msg_seq
                    ),
                })
                .await;
            return;
        }

        self.last_recv_msg_seq = msg.seq;
        self.deadline_at = Instant::now() + self.deadline;

        let room_msg = match msg.body {
            MsgBody::Ping { timestamp } => RoomMsg::Ping {
                sender: self.handle.clone(),
                timestamp,
            },
            MsgBody::NodeCount { count } => RoomMsg::NodeCount {
                sender: self.handle.clone(),
                count,
            },
            _ => RoomMsg::Regular {
                sender: self.handle.clone(),
                msg,
            },
        };
        let _ = self.room_tx.send(room_msg).await;
    }

    async fn handle_attach(
        &mut self,
        mut conn: WsStream,
        last_event_seq: u32,
    ) -> Result<(), RoomError> {
        if last_event_seq > self.evbuf.last_seq() {
            let reason = format!(
                "unknown event seq {last_event_seq} (written up to {})",
                self.evbuf.last_seq()
            );
            tracing::warn!(client_id = %self.shared.id, %reason, "attach rejected");
            let _ = conn
                .close(Some(close_frame(CloseCode::Away, &reason)))
                .await;
            return Err(RoomError::InvalidArgument(reason));
        }
        if !self.evbuf.can_resume_from(last_event_seq) {
            let reason = format!("event seq {last_event_seq} already evicted");
            tracing::warn!(client_id = %self.shared.id, %reason, "attach rejected");
            let _ = conn
                .close(Some(close_frame(CloseCode::Away, &reason)))
                .await;
            return Err(RoomError::FailedPrecondition(reason));
        }

        if let Some(old) = self.peer.take() {
            old.detach();
            old.close_with(CloseCode::Away, "superseded by a new connection")
                .await;
        }

        self.next_peer_id += 1;
        let peer = Peer::spawn(
            self.next_peer_id,
            conn,
            last_event_seq,
            self.shared.id.clone(),
            self.mac_key.clone(),
            self.shared.notify.clone(),
            self.shared.done.clone(),
        );

        if let Err(e) = peer.send_ready(self.last_recv_msg_seq).await {
            peer.detach();
            return Err(RoomError::Unavailable(format!("peer ready: {e}")));
        }

        // Replay everything past the client's resume point.
        if peer.send_events(&self.evbuf).await.is_err() {
            // Validated above; only reachable if the ring moved between
            // the check and the send, which this single loop cannot do.
            peer.detach();
            return Err(RoomError::FailedPrecondition(
                "event buffer too old".into(),
            ));
        }

        self.deadline_at = Instant::now() + self.deadline;
        self.peer = Some(peer);
        Ok(())
    }

    /// Pushes pending buffered events to the current peer. A too-old ring
    /// here is fatal for the whole client, not just the socket.
    async fn flush_to_peer(&mut self) {
        let Some(peer) = &self.peer else { return };
        if let Err(too_old) = peer.send_events(&self.evbuf).await {
            let _ = self
                .room_tx
                .send(RoomMsg::ClientError {
                    sender: self.handle.clone(),
                    err: too_old.to_string(),
                })
                .await;
        }
    }
}
