//! Network infrastructure for the client application.
//!
//! Opens the TCP stream to the relay server and hands it to a
//! [`RelayClient`].  Everything after the connect (framing, dispatch,
//! continuations) is owned by the client's [`Connection`](relay_core::Connection).

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::application::client::{ClientError, ClientOptions, ClientServices, RelayClient};
use crate::application::events::ClientEvent;

/// Connects to the relay server at `addr`.
///
/// # Errors
///
/// Returns [`ClientError::Connect`] if the TCP connection cannot be opened.
pub async fn connect(
    addr: SocketAddr,
    services: ClientServices,
    options: ClientOptions,
) -> Result<(RelayClient, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ClientError::Connect { addr, source })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {e}");
    }
    info!("connected to relay server at {addr}");
    Ok(RelayClient::open(stream, services, options))
}
