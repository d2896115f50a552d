//! BroadcastServer accept loop
//!
//! Owns the listening socket and the registry handle. Every accepted
//! socket is registered and handed to its own worker task.

use std::future::{pending, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::ClientConnection;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handler::handle_client;
use crate::registry::{Registry, RegistryHandle};
use crate::strategy::ConnectionStrategy;

/// WebSocket server running one strategy per connection
pub struct BroadcastServer<S> {
    config: ServerConfig,
    strategy: Arc<S>,
    registry: RegistryHandle,
}

impl<S: ConnectionStrategy> BroadcastServer<S> {
    /// Create the server and spawn its registry actor
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig, strategy: S) -> Self {
        let registry = Registry::spawn(config.registry_buffer);
        Self {
            config,
            strategy: Arc::new(strategy),
            registry,
        }
    }

    /// Handle to the connection registry
    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address with SO_REUSEADDR and listen
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let addr: SocketAddr = tokio::net::lookup_host(self.config.bind_addr())
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address to bind"))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(self.config.backlog)
    }

    /// Bind and serve until a fault escapes the accept loop
    pub async fn start(self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, pending()).await
    }

    /// Accept connections until `shutdown` resolves or accept fails
    ///
    /// Either way every registered socket is closed and every worker
    /// aborted before returning.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!("WebSocket server listening on {}", listener.local_addr()?);

        let mut workers = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            debug!("Waiting for connection...");
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            break Err(ServerError::Io(e));
                        }
                    };
                    info!("Connection from: {}", addr);

                    let mut conn = ClientConnection::new(stream, addr)
                        .with_max_request(self.config.handshake_buffer)
                        .with_write_timeout(self.config.write_timeout());
                    conn.set_timeout(self.config.handshake_timeout());

                    if let Err(e) = self.registry.register(conn.handle()).await {
                        break Err(e);
                    }

                    let registry = self.registry.clone();
                    let strategy = Arc::clone(&self.strategy);
                    workers.spawn(async move {
                        handle_client(conn, registry, strategy.as_ref()).await;
                    });
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Worker task failed: {}", e);
                    }
                }
            }
        };

        self.shutdown_all(&mut workers).await;
        outcome
    }

    /// Close every registered socket and abort all workers
    async fn shutdown_all(&self, workers: &mut JoinSet<()>) {
        let clients = self.registry.drain().await.unwrap_or_else(|e| {
            error!("Registry unavailable during shutdown: {}", e);
            Vec::new()
        });

        // Workers go first so none is left holding a writer lock
        workers.abort_all();
        while workers.join_next().await.is_some() {}

        info!("Closing {} connections", clients.len());
        for client in clients {
            if let Err(e) = client.close().await {
                debug!("Closing client {} failed: {}", client.id(), e);
            }
        }
    }
}
