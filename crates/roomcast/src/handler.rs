//! Per-connection upgrade handling.
//!
//! An attachment is only an introduction: the upgrade names a room and a
//! client the control plane must already have registered, and the socket
//! is handed to that client to become its peer. Everything after —
//! replay, supersede, close codes — is the client's business.

use std::sync::Arc;

use roomcast_room::{ClientId, Repository, RoomId};
use roomcast_transport::{
    UpgradeReject, UpgradeRequest, WsListener, WsStream,
};

use crate::RoomcastError;

/// Accepts one connection and spawns its serving task.
pub(crate) async fn accept_attachment(
    listener: &WsListener,
    repository: &Arc<Repository>,
) -> Result<(), RoomcastError> {
    let (conn, upgrade) = listener
        .accept(|u| validate(repository, u))
        .await?;

    let repository = repository.clone();
    tokio::spawn(serve(conn, upgrade, repository));
    Ok(())
}

/// Pre-handshake check: wrong app, unknown room, or unregistered client
/// is answered at the HTTP layer and never becomes a socket.
fn validate(repository: &Repository, u: &UpgradeRequest) -> Result<(), UpgradeReject> {
    if u.app_id != repository.app_id() {
        return Err(UpgradeReject::forbidden(format!(
            "unknown app: {}",
            u.app_id
        )));
    }
    let room_id = RoomId(u.room_id.clone());
    if !repository.room_exists(&room_id) {
        return Err(UpgradeReject::not_found(format!(
            "room not found: {}",
            u.room_id
        )));
    }
    let client_id = ClientId(u.client_id.clone());
    if repository.get_client(&room_id, &client_id).is_none() {
        return Err(UpgradeReject::not_found(format!(
            "client not in room: {}",
            u.client_id
        )));
    }
    Ok(())
}

async fn serve(conn: WsStream, upgrade: UpgradeRequest, repository: Arc<Repository>) {
    let room_id = RoomId(upgrade.room_id);
    let client_id = ClientId(upgrade.client_id);

    // The client may have been removed between validation and now; the
    // attach path owns the socket either way.
    let Some((client, _mac_key)) = repository.get_client(&room_id, &client_id) else {
        tracing::info!(%room_id, %client_id, "client gone before attach");
        drop(conn);
        return;
    };

    match client.attach_peer(conn, upgrade.last_event_seq).await {
        Ok(()) => {
            tracing::debug!(%room_id, %client_id, "peer attached");
        }
        Err(e) => {
            tracing::info!(%room_id, %client_id, error = %e, "attach rejected");
        }
    }
}
