//! Minimal WebSocket Broadcast Server Library
//!
//! A small RFC6455 server layer: TCP accept handling, the opening
//! handshake and a single-frame text codec, with broadcast fan-out
//! across all connected clients.
//!
//! # Features
//! - Opening handshake (Sec-WebSocket-Accept computation)
//! - Unfragmented text frames up to 126 bytes
//! - One worker task per connection
//! - Pluggable per-connection strategy (echo, chat, tick)
//! - Broadcast to all clients, with or without the sender
//! - Close frame with status code on protocol violations
//!
//! # Architecture
//! - `BroadcastServer` runs the accept loop and spawns workers
//! - `Registry` is an actor owning the set of live connections;
//!   workers and the accept loop talk to it over `mpsc` channels
//! - Each worker owns its `ClientConnection`; the registry only
//!   keeps its `ClientHandle` (the write side)
//!
//! # Example
//! ```ignore
//! use ws_broadcast::{BroadcastServer, Echo, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ws_broadcast::ServerError> {
//!     let config = ServerConfig::default();
//!     let strategy = Echo { poll_interval: config.poll_interval() };
//!     BroadcastServer::new(config, strategy).start().await
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod strategy;

// Re-export main types for convenience
pub use client::{ClientConnection, ClientHandle, ClientId};
pub use config::{ServerConfig, StrategyKind};
pub use error::{HandshakeError, ProtocolError, ServerError};
pub use handler::handle_client;
pub use registry::{Recipients, Registry, RegistryCommand, RegistryHandle};
pub use server::BroadcastServer;
pub use strategy::{BroadcastChat, ConnectionStrategy, Echo, Ticker};
