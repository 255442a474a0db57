//! Relay Sessions client entry point.
//!
//! A headless client: it logs in, optionally opens a session with `--peer`
//! and sends a text message and/or a file, then either leaves or keeps
//! serving peer requests until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! relay-client --email <EMAIL> [OPTIONS]
//!
//! Options:
//!   --server       <ADDR>  Relay server address [default: 127.0.0.1:8888]
//!   --email        <EMAIL> Login identity
//!   --peer         <EMAIL> Request a session with this client
//!   --message      <TEXT>  Text to send once in session
//!   --upload       <PATH>  File to upload once in session
//!   --download-dir <DIR>   Where accepted uploads are written [default: .]
//!   --buffer-size  <N>     Upload chunk size in bytes [default: 1024]
//!   --frame-file   <PATH>  Encoded frame served to frame requests
//!   --auto-accept          Accept session invitations and uploads
//! ```
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ connect()              -- TCP + RelayClient
//!  └─ login()
//!  └─ event loop task
//!       ├─ SessionRequested  -> confirm / refuse (--auto-accept)
//!       ├─ UploadRequested   -> accept into --download-dir / refuse
//!       ├─ GenericRequest    -> fail (no application handlers)
//!       └─ Disconnected      -> stop
//!  └─ --peer: request_session, send text, upload, end session, disconnect
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_client::infrastructure::file_store::LocalFileStore;
use relay_client::infrastructure::frame_provider::{StaticFrameProvider, UnavailableFrameProvider};
use relay_client::{
    connect, ClientEvent, ClientOptions, ClientServices, FrameProvider, UploadStatus,
};
use relay_core::protocol::messages::{DEFAULT_FRAME_QUALITY, DEFAULT_UPLOAD_BUFFER_SIZE};

/// Relay Sessions client.
#[derive(Debug, Parser)]
#[command(
    name = "relay-client",
    about = "Logs in to a Relay Sessions server and exchanges messages and files with a peer",
    version
)]
struct Cli {
    /// Relay server address.
    #[arg(long, default_value = "127.0.0.1:8888", env = "RELAY_SERVER")]
    server: SocketAddr,

    /// Identity to log in with.
    #[arg(long, env = "RELAY_EMAIL")]
    email: String,

    /// Email of the client to open a session with.
    #[arg(long)]
    peer: Option<String>,

    /// Text message to send once the session is open.
    #[arg(long, requires = "peer")]
    message: Option<String>,

    /// File to upload once the session is open.
    #[arg(long, requires = "peer")]
    upload: Option<PathBuf>,

    /// Directory accepted uploads are written to.
    #[arg(long, default_value = ".", env = "RELAY_DOWNLOAD_DIR")]
    download_dir: PathBuf,

    /// Upload chunk size in bytes.
    #[arg(long, default_value_t = DEFAULT_UPLOAD_BUFFER_SIZE, value_parser = clap::value_parser!(u32).range(1..))]
    buffer_size: u32,

    /// Encoded image served to the peer's frame requests.
    #[arg(long, env = "RELAY_FRAME_FILE")]
    frame_file: Option<PathBuf>,

    /// Accept every session invitation and upload without asking.
    #[arg(long)]
    auto_accept: bool,
}

impl Cli {
    fn options(&self) -> ClientOptions {
        ClientOptions {
            upload_buffer_size: self.buffer_size,
            frame_quality: DEFAULT_FRAME_QUALITY,
        }
    }

    fn frame_provider(&self) -> anyhow::Result<Arc<dyn FrameProvider>> {
        Ok(match &self.frame_file {
            Some(path) => Arc::new(
                StaticFrameProvider::from_file(path)
                    .with_context(|| format!("failed to read frame file {}", path.display()))?,
            ),
            None => Arc::new(UnavailableFrameProvider),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!("Relay Sessions client starting");

    let services = ClientServices::new(Arc::new(LocalFileStore), cli.frame_provider()?);
    let (client, events) = connect(cli.server, services, cli.options())
        .await
        .with_context(|| format!("failed to connect to {}", cli.server))?;

    client
        .login(cli.email.clone())
        .await
        .with_context(|| format!("login as {} failed", cli.email))?;

    let event_loop = tokio::spawn(run_events(events, cli.download_dir.clone(), cli.auto_accept));

    let Some(peer) = cli.peer.as_deref() else {
        info!("logged in as {}; waiting for peers.  Press Ctrl-C to exit.", cli.email);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
            _ = client.closed() => warn!("server closed the connection"),
        }
        client.disconnect();
        client.closed().await;
        let _ = event_loop.await;
        return Ok(());
    };

    let peer = client
        .request_session(peer)
        .await
        .with_context(|| format!("session with {peer} failed"))?;
    info!("in session with {peer}");

    if let Some(text) = &cli.message {
        client.send_text(text.clone())?;
    }
    if let Some(path) = &cli.upload {
        let bytes = client
            .upload(path)
            .await
            .with_context(|| format!("upload of {} failed", path.display()))?;
        info!("uploaded {} ({bytes} bytes)", path.display());
    }

    if let Err(e) = client.end_session().await {
        warn!("ending the session failed: {e}");
    }
    client.disconnect();
    client.closed().await;
    let _ = event_loop.await;

    info!("Relay Sessions client stopped");
    Ok(())
}

/// Handles everything the server and the peer send that is not a reply.
async fn run_events(
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    download_dir: PathBuf,
    auto_accept: bool,
) {
    while let Some(event) = events.recv().await {
        let result = match event {
            ClientEvent::SessionRequested(invitation) => {
                info!("session requested by {}", invitation.requester());
                if auto_accept {
                    invitation.confirm()
                } else {
                    invitation.refuse()
                }
            }
            ClientEvent::SessionEndedByPeer => {
                info!("session ended by peer");
                Ok(())
            }
            ClientEvent::PeerDisconnected => {
                info!("peer disconnected");
                Ok(())
            }
            ClientEvent::TextMessage(text) => {
                info!("message: {text}");
                Ok(())
            }
            ClientEvent::UploadRequested(invitation) => {
                info!(
                    "upload offered: {} ({} bytes)",
                    invitation.file_name(),
                    invitation.total_bytes()
                );
                if auto_accept {
                    let destination = download_dir.join(invitation.file_name());
                    invitation.accept(destination)
                } else {
                    invitation.refuse()
                }
            }
            ClientEvent::UploadProgress(progress) => {
                match &progress.status {
                    UploadStatus::Completed => info!(
                        "received {} ({} bytes)",
                        progress.file_name, progress.total_bytes
                    ),
                    UploadStatus::Failed(e) => warn!("receiving {} failed: {e}", progress.file_name),
                    UploadStatus::InProgress => {}
                }
                Ok(())
            }
            ClientEvent::GenericRequest(call) => {
                let type_name = call.type_name().to_string();
                call.fail(format!("no handler for {type_name}"))
            }
            ClientEvent::Disconnected => break,
        };
        if let Err(e) = result {
            error!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["relay-client", "--email", "alice@example.com"]);
        assert_eq!(cli.server, "127.0.0.1:8888".parse::<SocketAddr>().expect("addr"));
        assert_eq!(cli.buffer_size, 1024);
        assert_eq!(cli.download_dir, PathBuf::from("."));
        assert!(!cli.auto_accept);
        assert!(cli.peer.is_none());
    }

    #[test]
    fn test_cli_session_flags() {
        let cli = Cli::parse_from([
            "relay-client",
            "--email",
            "alice@example.com",
            "--peer",
            "bob@example.com",
            "--message",
            "hi",
            "--buffer-size",
            "4096",
        ]);
        assert_eq!(cli.peer.as_deref(), Some("bob@example.com"));
        assert_eq!(cli.message.as_deref(), Some("hi"));
        assert_eq!(cli.options().upload_buffer_size, 4096);
    }

    #[test]
    fn test_cli_message_requires_peer() {
        let result = Cli::try_parse_from(["relay-client", "--email", "a", "--message", "hi"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_rejects_zero_buffer_size() {
        let result = Cli::try_parse_from(["relay-client", "--email", "a", "--buffer-size", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_frame_file_is_an_error() {
        let cli = Cli::parse_from([
            "relay-client",
            "--email",
            "a",
            "--frame-file",
            "/definitely/not/here.jpg",
        ]);
        assert!(cli.frame_provider().is_err());
    }
}
