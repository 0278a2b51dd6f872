//! RTMP server listener
//!
//! Handles TCP accept loop and spawns supervised connection tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::registry::{RegistryConfig, StreamRegistry};
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::server::handler::{DisconnectReason, RtmpHandler};
use crate::session::SessionContext;

/// RTMP server
pub struct RtmpServer<H: RtmpHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    registry: Arc<StreamRegistry>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl<H: RtmpHandler> RtmpServer<H> {
    /// Create a new server with the given configuration and handler
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self::with_registry_config(config, handler, RegistryConfig::default())
    }

    /// Create a new server with custom registry configuration
    pub fn with_registry_config(
        config: ServerConfig,
        handler: H,
        registry_config: RegistryConfig,
    ) -> Self {
        Self::with_registry(
            config,
            handler,
            Arc::new(StreamRegistry::with_config(registry_config)),
        )
    }

    /// Create a server around an existing registry
    ///
    /// Lets other consumers (packagers, relays, an admin API) share the
    /// registry with the RTMP sessions.
    pub fn with_registry(
        config: ServerConfig,
        handler: H,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            handler: Arc::new(handler),
            registry,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    /// Get a reference to the stream registry
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Run the server
    ///
    /// This method blocks until the listener fails to bind.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "RTMP server listening");

        let _cleanup_handle = self.registry.spawn_cleanup_task();
        self.accept_loop(&listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "RTMP server listening");

        let cleanup_handle = self.registry.spawn_cleanup_task();

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        cleanup_handle.abort();

        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let permit = match self.acquire_permit() {
            Ok(permit) => permit,
            Err(()) => {
                tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                return;
            }
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let config = self.config.clone();
        let handler = Arc::clone(&self.handler);
        let registry = Arc::clone(&self.registry);

        let session = tokio::spawn({
            let handler = Arc::clone(&handler);
            let registry = Arc::clone(&registry);
            async move {
                let mut connection =
                    Connection::new(session_id, socket, peer_addr, config, handler, registry);
                connection.run().await
            }
        });

        tokio::spawn(async move {
            let _permit = permit;
            supervise(session, session_id, peer_addr, registry, handler).await;
        });
    }

    fn acquire_permit(&self) -> std::result::Result<Option<OwnedSemaphorePermit>, ()> {
        match &self.connection_semaphore {
            Some(sem) => Arc::clone(sem)
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| ()),
            None => Ok(None),
        }
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}

/// Wait for a session task and clean up after it if it did not finish normally
///
/// A panicking session never ran its own teardown, so the publisher slots it
/// held are released here and the handler still sees one `on_disconnect`.
pub async fn supervise<H: RtmpHandler>(
    session: JoinHandle<Result<()>>,
    session_id: u64,
    peer_addr: SocketAddr,
    registry: Arc<StreamRegistry>,
    handler: Arc<H>,
) {
    match session.await {
        Ok(Ok(())) => {
            tracing::debug!(session_id = session_id, "Connection closed");
        }
        Ok(Err(e)) if e.is_handshake() => {
            tracing::debug!(session_id = session_id, error = %e, "Handshake failed");
        }
        Ok(Err(e)) => {
            tracing::debug!(session_id = session_id, error = %e, "Connection error");
        }
        Err(join_error) => {
            tracing::error!(
                session_id = session_id,
                panic = join_error.is_panic(),
                "Session task failed"
            );
            let released = registry.release_session(session_id).await;
            if released > 0 {
                tracing::warn!(
                    session_id = session_id,
                    released = released,
                    "Released publisher slots of failed session"
                );
            }
            let ctx = SessionContext::new(session_id, peer_addr);
            handler.on_disconnect(&ctx, &DisconnectReason::Panicked).await;
        }
    }
}
