//! Relay Sessions server entry point.
//!
//! Loads the configuration, binds the listener and runs the session broker
//! until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! relay-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>   TOML config file [default: platform config dir]
//!   --bind   <ADDR>   Overrides [server] bind_address
//!   --port   <PORT>   Overrides [server] port
//! ```
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()          -- file, then CLI overrides
//!  └─ SessionBroker::new()   -- login policy from [access]
//!  └─ start services
//!       ├─ RelayListener::serve  (accept loop, one Connection per endpoint)
//!       ├─ broker event pump     (logs BrokerEvents)
//!       └─ endpoint snapshot     (periodic debug log)
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use relay_server::application::broker::{BrokerEvent, SessionBroker};
use relay_server::application::login_policy::policy_for;
use relay_server::infrastructure::network::RelayListener;
use relay_server::infrastructure::storage::config::{load_config, ServerConfig};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Relay Sessions server.
#[derive(Debug, Parser)]
#[command(
    name = "relay-server",
    about = "Brokers login, session pairing and message relay for Relay Sessions clients",
    version
)]
struct Cli {
    /// Path of the TOML configuration file.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to listen on (overrides the config file).
    #[arg(long, env = "RELAY_BIND")]
    bind: Option<String>,

    /// TCP port to listen on (overrides the config file).
    #[arg(long, env = "RELAY_PORT")]
    port: Option<u16>,
}

impl Cli {
    /// Applies the command-line overrides on top of `config`.
    fn apply(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.apply(
        load_config(cli.config.as_deref()).context("failed to load server configuration")?,
    );

    // Level comes from the config file unless `RUST_LOG` is set.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    info!("Relay Sessions server starting");

    let addr = config.server.socket_addr()?;
    let listener = RelayListener::bind(addr).await?;
    let (broker, mut events) = SessionBroker::new(policy_for(&config.access.allowed_emails));

    // Shutdown flag shared across all background services.
    let running = Arc::new(AtomicBool::new(true));

    // ── Broker event pump ─────────────────────────────────────────────────────
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                BrokerEvent::LoginRefused { email, reason, .. } => {
                    info!("login refused for {email}: {reason}")
                }
                BrokerEvent::SessionStarted {
                    requester,
                    responder,
                } => info!("session started: {requester} <-> {responder}"),
                BrokerEvent::SessionEnded { first, second } => {
                    info!("session ended: {first} <-> {second}")
                }
                other => debug!("{other:?}"),
            }
        }
    });

    // ── Endpoint snapshot ─────────────────────────────────────────────────────
    let snapshot_broker = Arc::clone(&broker);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
        loop {
            ticker.tick().await;
            for endpoint in snapshot_broker.endpoints().await {
                debug!(
                    "endpoint {} {:?} {:?} paired_with={:?} bytes={}",
                    endpoint.id,
                    endpoint.email,
                    endpoint.status,
                    endpoint.paired_with,
                    endpoint.total_bytes_usage
                );
            }
        }
    });

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────────
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl-C signal: {e}"),
        }
    });

    info!("Relay Sessions server ready on {}.  Press Ctrl-C to exit.", listener.local_addr());
    listener.serve(broker, running).await;

    info!("Relay Sessions server stopped");
    Ok(())
}
