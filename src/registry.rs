//! Connection registry actor
//!
//! The registry owns the set of live connections. Accept loop and
//! workers reach it only through `RegistryHandle`, so registering a new
//! connection and taking a broadcast snapshot are serialized by the
//! actor's command channel.

use std::collections::HashMap;
use std::io;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::{ClientHandle, ClientId};
use crate::codec;
use crate::error::ServerError;

/// Who receives a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    /// Every upgraded connection, sender included
    All,
    /// Every upgraded connection except the given one
    Except(ClientId),
}

impl Recipients {
    fn includes(&self, id: ClientId) -> bool {
        match self {
            Recipients::All => true,
            Recipients::Except(excluded) => *excluded != id,
        }
    }
}

/// Commands sent from the accept loop and workers to the registry actor
#[derive(Debug)]
pub enum RegistryCommand {
    /// Socket accepted
    Register { handle: ClientHandle },
    /// Handshake finished; the connection may receive broadcasts
    MarkUpgraded { client_id: ClientId },
    /// Worker exited
    Unregister { client_id: ClientId },
    /// Upgraded connections matching `recipients`
    Snapshot {
        recipients: Recipients,
        reply: oneshot::Sender<Vec<ClientHandle>>,
    },
    /// Number of registered connections, upgraded or not
    Count { reply: oneshot::Sender<usize> },
    /// Remove and return every connection
    Drain {
        reply: oneshot::Sender<Vec<ClientHandle>>,
    },
}

/// Registry entry
struct Entry {
    handle: ClientHandle,
    upgraded: bool,
}

/// The registry actor
///
/// Processes commands until every `RegistryHandle` is dropped.
pub struct Registry {
    /// All registered connections: ClientId -> Entry
    clients: HashMap<ClientId, Entry>,
    /// Command receiver channel
    receiver: mpsc::Receiver<RegistryCommand>,
}

impl Registry {
    /// Create a new registry with the given command receiver
    pub fn new(receiver: mpsc::Receiver<RegistryCommand>) -> Self {
        Self {
            clients: HashMap::new(),
            receiver,
        }
    }

    /// Spawn the actor on the current runtime and return its handle
    pub fn spawn(buffer: usize) -> RegistryHandle {
        let (sender, receiver) = mpsc::channel(buffer);
        tokio::spawn(Registry::new(receiver).run());
        RegistryHandle { sender }
    }

    /// Run the registry event loop
    pub async fn run(mut self) {
        debug!("Registry started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        debug!("Registry shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register { handle } => {
                debug!("Registered client {} from {}", handle.id(), handle.peer_addr());
                self.clients.insert(
                    handle.id(),
                    Entry {
                        handle,
                        upgraded: false,
                    },
                );
                debug!("Total clients: {}", self.clients.len());
            }
            RegistryCommand::MarkUpgraded { client_id } => {
                if let Some(entry) = self.clients.get_mut(&client_id) {
                    entry.upgraded = true;
                }
            }
            RegistryCommand::Unregister { client_id } => {
                if self.clients.remove(&client_id).is_some() {
                    debug!("Unregistered client {}", client_id);
                }
                debug!("Total clients: {}", self.clients.len());
            }
            RegistryCommand::Snapshot { recipients, reply } => {
                let handles = self
                    .clients
                    .values()
                    .filter(|entry| entry.upgraded && recipients.includes(entry.handle.id()))
                    .map(|entry| entry.handle.clone())
                    .collect();
                let _ = reply.send(handles);
            }
            RegistryCommand::Count { reply } => {
                let _ = reply.send(self.clients.len());
            }
            RegistryCommand::Drain { reply } => {
                let handles = self.clients.drain().map(|(_, entry)| entry.handle).collect();
                let _ = reply.send(handles);
            }
        }
    }
}

/// Cloneable handle to the registry actor
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Wrap an existing command sender
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    async fn send(&self, cmd: RegistryCommand) -> Result<(), ServerError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| ServerError::RegistryClosed)
    }

    async fn request<T>(
        &self,
        cmd: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, ServerError> {
        let (reply, response) = oneshot::channel();
        self.send(cmd(reply)).await?;
        response.await.map_err(|_| ServerError::RegistryClosed)
    }

    pub async fn register(&self, handle: ClientHandle) -> Result<(), ServerError> {
        self.send(RegistryCommand::Register { handle }).await
    }

    pub async fn mark_upgraded(&self, client_id: ClientId) -> Result<(), ServerError> {
        self.send(RegistryCommand::MarkUpgraded { client_id }).await
    }

    pub async fn unregister(&self, client_id: ClientId) -> Result<(), ServerError> {
        self.send(RegistryCommand::Unregister { client_id }).await
    }

    /// Snapshot of all upgraded connections
    pub async fn clients(&self) -> Result<Vec<ClientHandle>, ServerError> {
        self.request(|reply| RegistryCommand::Snapshot {
            recipients: Recipients::All,
            reply,
        })
        .await
    }

    /// Registered connections, including those still handshaking
    pub async fn len(&self) -> Result<usize, ServerError> {
        self.request(|reply| RegistryCommand::Count { reply }).await
    }

    /// Remove every connection and hand back their handles
    pub async fn drain(&self) -> Result<Vec<ClientHandle>, ServerError> {
        self.request(|reply| RegistryCommand::Drain { reply }).await
    }

    /// Write `text` to every matching connection
    ///
    /// The frame is encoded once, before any write. A recipient whose
    /// write fails is skipped; its own worker tears it down. A recipient
    /// whose write timed out is also unregistered at once. Returns the
    /// number of connections the frame was delivered to.
    pub async fn broadcast(&self, text: &str, recipients: Recipients) -> Result<usize, ServerError> {
        let frame = codec::encode_text(text)?;
        let targets = self
            .request(|reply| RegistryCommand::Snapshot { recipients, reply })
            .await?;

        let mut delivered = 0;
        for target in &targets {
            match target.write_frame(&frame).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Broadcast to client {} failed: {}", target.id(), e);
                    if e.kind() == io::ErrorKind::TimedOut {
                        self.unregister(target.id()).await?;
                    }
                }
            }
        }

        if delivered < targets.len() {
            info!("Broadcast reached {} of {} clients", delivered, targets.len());
        }
        Ok(delivered)
    }
}
