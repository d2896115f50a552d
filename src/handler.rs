//! Per-connection worker
//!
//! Runs the handshake, hands the upgraded connection to the strategy,
//! and always tears the connection down afterwards.

use tracing::{debug, info, warn};

use crate::client::ClientConnection;
use crate::codec::Opcode;
use crate::error::{ProtocolError, ServerError};
use crate::registry::RegistryHandle;
use crate::strategy::ConnectionStrategy;

/// Drive one connection from handshake to teardown
///
/// Every per-connection fault is logged here and never escapes, so a
/// misbehaving client cannot disturb the accept loop or its siblings.
pub async fn handle_client<S>(mut conn: ClientConnection, registry: RegistryHandle, strategy: &S)
where
    S: ConnectionStrategy,
{
    let client_id = conn.id();
    let peer_addr = conn.peer_addr();

    match conn.handshake().await {
        Ok(()) => {
            if let Err(e) = registry.mark_upgraded(client_id).await {
                warn!("Client {} could not be marked upgraded: {}", client_id, e);
            }
            conn.set_blocking(false);
            info!("Client {} connected from {}", client_id, peer_addr);

            if let Err(e) = strategy.run(&mut conn, &registry).await {
                report(&conn, e).await;
            }
        }
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer_addr, e);
        }
    }

    if let Err(e) = registry.unregister(client_id).await {
        debug!("Unregistering client {} failed: {}", client_id, e);
    }
    if let Err(e) = conn.close().await {
        debug!("Closing client {} failed: {}", client_id, e);
    }
    info!("Client closed: {}", peer_addr);
}

/// Log a strategy fault; protocol faults also get a close frame
async fn report(conn: &ClientConnection, err: ServerError) {
    let client_id = conn.id();
    match err {
        ServerError::ConnectionClosed => {
            debug!("Client {} closed the connection", client_id);
        }
        ServerError::Protocol(fault) => {
            match fault {
                ProtocolError::UnsupportedOpcode(op) => warn!(
                    "Client {} sent {:?} frame",
                    client_id,
                    Opcode::from_u8(op)
                ),
                ref other => warn!("Protocol error from client {}: {}", client_id, other),
            }
            if let Err(e) = conn.send_close(fault.close_code()).await {
                debug!("Close frame to client {} failed: {}", client_id, e);
            }
        }
        other => {
            warn!("Client {} failed: {}", client_id, other);
        }
    }
}
