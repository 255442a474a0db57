//! TCP accept loop.
//!
//! Each accepted stream becomes one broker endpoint with its own connection
//! workers, so a slow endpoint never delays the accept loop or the others.
//! The loop polls a shared `running` flag every 200 ms and stops accepting
//! once it is cleared.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::application::broker::SessionBroker;

const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Errors raised while setting up the listening socket.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("could not read the local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// A bound listener that feeds accepted streams to a [`SessionBroker`].
pub struct RelayListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RelayListener {
    /// Binds `addr`.  Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] if the address is in use or not
    /// permitted.
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::BindFailed { addr, source })?;
        let local_addr = listener.local_addr().map_err(NetworkError::LocalAddr)?;
        info!("relay server listening on {local_addr}");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `running` is cleared, then closes every
    /// endpoint still attached to `broker`.
    pub async fn serve(self, broker: Arc<SessionBroker>, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            match timeout(ACCEPT_POLL, self.listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay for {peer_addr} failed: {e}");
                    }
                    broker.attach(stream, Some(peer_addr)).await;
                }
                // Transient (e.g. too many open files); keep accepting.
                Ok(Err(e)) => error!("accept error: {e}"),
                Err(_) => {}
            }
        }

        info!("shutdown flag set; stopping accept loop");
        broker.shutdown().await;
    }
}
