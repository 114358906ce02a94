//! One WebSocket attachment bound to a client.
//!
//! A peer splits its socket: the read half is owned by a dedicated task
//! that decodes and MAC-verifies inbound frames and hands them to the
//! client loop; the write half sits behind a mutex so ready/system/event
//! writes serialize. At most one peer per client is live — attaching a new
//! one detaches the old, which then drains out through its read task.
//!
//! Close codes tell the client whether reconnecting is worthwhile:
//! Normal (1000) and Away (1001) mean "do not come back", anything else
//! permits another attempt.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use roomcast_protocol::{unmarshal_msg, SystemEvent};
use roomcast_transport::{close_frame, CloseCode, WsStream};

use crate::client::ClientNotify;
use crate::error::PeerError;
use crate::evbuf::{EventBuffer, TooOld};
use crate::types::ClientId;

/// Socket writes that stall longer than this close the peer.
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) struct Peer {
    id: u64,
    client_id: ClientId,
    writer: Arc<Mutex<PeerWriter>>,
    detached: CancellationToken,
}

struct PeerWriter {
    sink: SplitSink<WsStream, Message>,
    closed: bool,
    /// Last event seq written to this socket; replay resumes after it.
    ev_seq: u32,
}

impl Peer {
    /// Splits the socket, starts the read task, and returns the handle.
    /// The caller (the client loop) still has to send `PeerReady` and the
    /// initial replay before the attachment is serving.
    pub(crate) fn spawn(
        id: u64,
        conn: WsStream,
        last_event_seq: u32,
        client_id: ClientId,
        mac_key: String,
        notify: mpsc::UnboundedSender<ClientNotify>,
        client_done: CancellationToken,
    ) -> Self {
        let (sink, stream) = conn.split();
        let writer = Arc::new(Mutex::new(PeerWriter {
            sink,
            closed: false,
            ev_seq: last_event_seq,
        }));
        let detached = CancellationToken::new();

        tokio::spawn(read_loop(
            id,
            stream,
            client_id.clone(),
            mac_key,
            notify,
            client_done,
            detached.clone(),
            writer.clone(),
        ));

        Self {
            id,
            client_id,
            writer,
            detached,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Signals the read task that this peer was superseded. Idempotent.
    pub(crate) fn detach(&self) {
        self.detached.cancel();
    }

    /// Sends `PeerReady` with the last message seq the server processed,
    /// telling the client where to resume its outbound stream.
    pub(crate) async fn send_ready(&self, last_msg_seq: u32) -> Result<(), PeerError> {
        let mut w = self.writer.lock().await;
        if w.closed {
            return Err(PeerError::Closed);
        }
        tracing::info!(
            client_id = %self.client_id,
            peer = self.id,
            last_msg_seq,
            "peer ready"
        );
        let data = SystemEvent::peer_ready(last_msg_seq).marshal();
        match write(&mut w.sink, data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                close_locked(&mut w, CloseCode::Error, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Fire-and-forget system event. A write failure closes this peer so
    /// the client can come back on a fresh socket.
    pub(crate) async fn send_system_event(&self, ev: &SystemEvent) {
        let mut w = self.writer.lock().await;
        if w.closed {
            return;
        }
        if let Err(e) = write(&mut w.sink, ev.marshal()).await {
            tracing::warn!(
                client_id = %self.client_id,
                peer = self.id,
                ev_type = %ev.ev_type(),
                error = %e,
                "system event write failed"
            );
            close_locked(&mut w, CloseCode::Error, &e.to_string()).await;
        }
    }

    /// Writes every buffered event past this peer's cursor, advancing the
    /// cursor as frames go out.
    ///
    /// A plain write failure closes the peer and returns `Ok` — the client
    /// may reconnect and resume. Falling behind the ring is unrecoverable:
    /// the peer closes with GoingAway and the error propagates so the
    /// client gets removed from the room.
    pub(crate) async fn send_events(&self, evbuf: &EventBuffer) -> Result<(), TooOld> {
        let mut w = self.writer.lock().await;
        if w.closed {
            return Ok(());
        }

        let evs = match evbuf.read_from(w.ev_seq) {
            Ok(evs) => evs,
            Err(too_old) => {
                tracing::error!(
                    client_id = %self.client_id,
                    peer = self.id,
                    error = %too_old,
                    "peer fell behind the event ring"
                );
                close_locked(&mut w, CloseCode::Away, &too_old.to_string()).await;
                return Err(too_old);
            }
        };

        for (seq, ev) in evs {
            if let Err(e) = write(&mut w.sink, ev.marshal(seq)).await {
                tracing::warn!(
                    client_id = %self.client_id,
                    peer = self.id,
                    seq,
                    error = %e,
                    "event write failed"
                );
                close_locked(&mut w, CloseCode::Error, &e.to_string()).await;
                return Ok(());
            }
            w.ev_seq = seq;
        }
        Ok(())
    }

    /// Closes the socket with the given code. Idempotent.
    pub(crate) async fn close_with(&self, code: CloseCode, reason: &str) {
        let mut w = self.writer.lock().await;
        close_locked(&mut w, code, reason).await;
    }
}

async fn write(
    sink: &mut SplitSink<WsStream, Message>,
    data: Vec<u8>,
) -> Result<(), PeerError> {
    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Binary(data.into())))
        .await
    {
        Err(_) => Err(PeerError::Timeout),
        Ok(Err(e)) => Err(PeerError::Write(e.to_string())),
        Ok(Ok(())) => Ok(()),
    }
}

async fn close_locked(w: &mut PeerWriter, code: CloseCode, reason: &str) {
    if w.closed {
        return;
    }
    w.closed = true;
    let frame = close_frame(code, reason);
    let _ = tokio::time::timeout(
        WRITE_TIMEOUT,
        w.sink.send(Message::Close(Some(frame))),
    )
    .await;
}

/// Reads inbound frames until the socket dies, the peer is detached, or
/// the client terminates. Parsed messages go to the client loop tagged
/// with this peer's id so stale peers can't inject after replacement.
#[allow(clippy::too_many_arguments)]
async fn read_loop(
    id: u64,
    mut stream: SplitStream<WsStream>,
    client_id: ClientId,
    mac_key: String,
    notify: mpsc::UnboundedSender<ClientNotify>,
    client_done: CancellationToken,
    detached: CancellationToken,
    writer: Arc<Mutex<PeerWriter>>,
) {
    loop {
        tokio::select! {
            _ = detached.cancelled() => break,
            _ = client_done.cancelled() => break,
            frame = stream.next() => match frame {
                None | Some(Ok(Message::Close(_))) => {
                    tracing::info!(%client_id, peer = id, "peer closed");
                    break;
                }
                Some(Ok(Message::Binary(data))) => {
                    match unmarshal_msg(&mac_key, &data) {
                        Ok(msg) => {
                            if notify
                                .send(ClientNotify::Msg { peer: id, msg })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                %client_id,
                                peer = id,
                                error = %e,
                                "inbound frame rejected"
                            );
                            let mut w = writer.lock().await;
                            close_locked(&mut w, CloseCode::Invalid, &e.to_string())
                                .await;
                            break;
                        }
                    }
                }
                // The protocol is binary-only; pings are answered by the
                // websocket layer and anything else is ignored.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::info!(%client_id, peer = id, error = %e, "peer read error");
                    break;
                }
            }
        }
    }

    let _ = notify.send(ClientNotify::PeerExited { peer: id });
}
