//! `RelayServer` builder and accept loop.
//!
//! The server owns two surfaces: the [`Repository`] the control plane
//! drives (create/join/watch/kick/get-room-info), and the WebSocket
//! listener that turns upgrades into peer attachments for clients the
//! repository already knows about.

use std::sync::Arc;

use roomcast_room::{MemoryRoomStore, RelayConfig, Repository, RoomInfoStore};
use roomcast_transport::WsListener;

use crate::handler::accept_attachment;
use crate::RoomcastError;

/// Builder for configuring and starting a relay node.
///
/// # Example
///
/// ```rust,ignore
/// use roomcast::prelude::*;
///
/// let server = RelayServer::builder()
///     .bind("0.0.0.0:8000")
///     .app("myapp")
///     .build()
///     .await?;
/// let repo = server.repository();
/// server.run().await
/// ```
pub struct RelayServerBuilder {
    bind_addr: String,
    app_id: String,
    host_id: u32,
    config: RelayConfig,
    store: Option<Arc<dyn RoomInfoStore>>,
}

impl RelayServerBuilder {
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            app_id: "default".to_string(),
            host_id: 1,
            config: RelayConfig::default(),
            store: None,
        }
    }

    /// Sets the address to listen on.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the application id this node serves.
    pub fn app(mut self, app_id: &str) -> Self {
        self.app_id = app_id.to_string();
        self
    }

    /// Sets this node's host id, as published in room info rows.
    pub fn host_id(mut self, host_id: u32) -> Self {
        self.host_id = host_id;
        self
    }

    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the room-info store. Defaults to an in-process
    /// [`MemoryRoomStore`].
    pub fn store(mut self, store: Arc<dyn RoomInfoStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> Result<RelayServer, RoomcastError> {
        let listener = WsListener::bind(&self.bind_addr).await?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryRoomStore::new()));
        let repository = Arc::new(Repository::new(
            self.app_id,
            self.host_id,
            self.config,
            store,
        ));
        Ok(RelayServer {
            listener,
            repository,
        })
    }
}

impl Default for RelayServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running relay node.
pub struct RelayServer {
    listener: WsListener,
    repository: Arc<Repository>,
}

impl RelayServer {
    pub fn builder() -> RelayServerBuilder {
        RelayServerBuilder::new()
    }

    /// The room registry. The control-plane façade (gRPC or otherwise)
    /// calls straight into this.
    pub fn repository(&self) -> Arc<Repository> {
        self.repository.clone()
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts attachments until the process ends. Per-connection failures
    /// are logged and do not stop the loop.
    pub async fn run(self) -> Result<(), RoomcastError> {
        tracing::info!(app_id = %self.repository.app_id(), "relay running");
        loop {
            if let Err(e) = accept_attachment(&self.listener, &self.repository).await {
                tracing::debug!(error = %e, "attachment failed");
            }
        }
    }
}
