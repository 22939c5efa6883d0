//! Wyre daemon binary.
//!
//! Loads configuration, binds the listener, dials static peers, and runs
//! sessions until shutdown.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};
use wyre::{Config, Endpoint, Host, MemoryHost, NetworkPolicy, Origin, Session};

/// Wyre peer-to-peer node daemon
#[derive(Parser, Debug)]
#[command(name = "wyred", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("wyred starting");

    // Load configuration
    let (config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("no config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "loaded config file");
        }
    }

    // Identity
    if !config.has_identity() {
        warn!("no identity configured, generating an ephemeral one");
    }
    let node_id = match config.create_node_id() {
        Ok(id) => id,
        Err(e) => {
            error!("failed to create identity: {}", e);
            std::process::exit(1);
        }
    };

    let policy = NetworkPolicy {
        local_networking: config.net.local_networking,
        ..NetworkPolicy::default()
    };
    let host: Arc<dyn Host> = Arc::new(
        MemoryHost::new(node_id, config.net.listen_port())
            .with_client_version(config.net.client_version())
            .with_policy(policy),
    );

    info!("node ready:");
    info!("       id: {}", node_id);
    info!("   client: {}", config.net.client_version());
    info!("   listen: {}:{}", config.net.listen_addr(), config.net.listen_port());

    // Bind the listener before dialling anyone.
    let bind = format!("{}:{}", config.net.listen_addr(), config.net.listen_port());
    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind = %bind, "failed to bind listener: {}", e);
            std::process::exit(1);
        }
    };

    dial_static_peers(&host, &config).await;

    info!("wyred running, press Ctrl+C to exit");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        info!(remote = %remote, "inbound connection");
                        match Session::new(&host, stream, Endpoint::from(remote)) {
                            Ok(session) => session.start(),
                            Err(e) => warn!(remote = %remote, error = %e, "failed to create session"),
                        }
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!("wyred shutdown complete");
}

/// Dial every statically configured peer once.
async fn dial_static_peers(host: &Arc<dyn Host>, config: &Config) {
    for peer in &config.peers {
        let endpoint: Endpoint = match peer.addr.parse::<std::net::SocketAddr>() {
            Ok(addr) => addr.into(),
            Err(e) => {
                warn!(addr = %peer.addr, error = %e, "invalid peer address");
                continue;
            }
        };
        let expected = match peer.node_id() {
            Ok(id) => id,
            Err(e) => {
                warn!(addr = %peer.addr, error = %e, "invalid peer id");
                continue;
            }
        };

        info!(addr = %peer.addr, "dialling static peer");
        let stream = match TcpStream::connect(endpoint.socket_addr()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(addr = %peer.addr, error = %e, "dial failed");
                continue;
            }
        };

        let session = match expected {
            Some(id) => {
                // Operator-pinned identity.
                let record = host.note_node(id, endpoint, Origin::Perfect, true, None);
                Session::with_node(host, stream, record, peer.force)
            }
            None => Session::new(host, stream, endpoint),
        };

        match session {
            Ok(session) => session.start(),
            Err(e) => warn!(addr = %peer.addr, error = %e, "failed to create session"),
        }
    }
}
