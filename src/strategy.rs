//! Per-connection strategies
//!
//! A strategy is the application behaviour a worker runs once its
//! connection is upgraded. It is chosen when the server is built.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::client::ClientConnection;
use crate::error::ServerError;
use crate::registry::{Recipients, RegistryHandle};

/// Injected per-connection behaviour
///
/// `run` may read from and write to its own connection and broadcast
/// through the registry. Returning ends the connection; an error is
/// logged by the worker before teardown.
pub trait ConnectionStrategy: Send + Sync + 'static {
    fn run(
        &self,
        conn: &mut ClientConnection,
        registry: &RegistryHandle,
    ) -> impl Future<Output = Result<(), ServerError>> + Send;
}

/// Writes each received message back to its sender
#[derive(Debug, Clone)]
pub struct Echo {
    pub poll_interval: Duration,
}

impl ConnectionStrategy for Echo {
    async fn run(
        &self,
        conn: &mut ClientConnection,
        _registry: &RegistryHandle,
    ) -> Result<(), ServerError> {
        loop {
            match conn.read().await? {
                Some(msg) => conn.write(&msg).await?,
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

/// Rebroadcasts each received message to every other client
///
/// The sender does not receive its own message.
#[derive(Debug, Clone)]
pub struct BroadcastChat {
    pub poll_interval: Duration,
}

impl ConnectionStrategy for BroadcastChat {
    async fn run(
        &self,
        conn: &mut ClientConnection,
        registry: &RegistryHandle,
    ) -> Result<(), ServerError> {
        loop {
            match conn.read().await? {
                Some(msg) => {
                    let delivered = registry
                        .broadcast(&msg, Recipients::Except(conn.id()))
                        .await?;
                    debug!("Client {} message delivered to {} peers", conn.id(), delivered);
                }
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

/// Periodic tick with rebroadcast
///
/// Every period: a received message goes to all clients, the sender
/// included, then the connection gets the next tick number.
#[derive(Debug, Clone)]
pub struct Ticker {
    pub period: Duration,
}

impl ConnectionStrategy for Ticker {
    async fn run(
        &self,
        conn: &mut ClientConnection,
        registry: &RegistryHandle,
    ) -> Result<(), ServerError> {
        let mut tick: u64 = 0;
        loop {
            if let Some(msg) = conn.read().await? {
                registry.broadcast(&msg, Recipients::All).await?;
            }
            conn.write(&tick.to_string()).await?;
            tick += 1;
            tokio::time::sleep(self.period).await;
        }
    }
}
