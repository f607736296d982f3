//! hopper
//!
//! Session-transfer proxy. Accepts clients on one TCP address, binds each to
//! the default backend and moves it to another backend on `/transfer <name>`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hopper_proxy::{
    BackendDirectory, Cli, Listener, ListenerConfig, PacketTransport, Proxy, ProxyConfig,
    RawTransport, StreamTransport, TransportKind,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Prefer RUST_LOG, fall back to --log-level / HOPPER_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = cli.proxy_config().context("invalid proxy configuration")?;
    let backends = cli.load_backends().context("failed to load backends")?;
    let directory = Arc::new(BackendDirectory::from_backends(backends));

    info!("Starting hopper");
    info!(
        listen = %cli.listen,
        transport = ?cli.transport,
        backends = directory.len(),
        transfer_failure_policy = %config.transfer_failure_policy,
        "Configuration loaded"
    );
    if directory.is_empty() {
        warn!("No backends configured; clients will be turned away");
    }
    directory.log_summary();

    match cli.transport {
        TransportKind::Raw => {
            let transport = RawTransport::new().with_proxy_protocol(config.proxy_protocol);
            serve(&cli, transport, directory, config).await
        }
        TransportKind::Packet => {
            let transport = PacketTransport::new()
                .with_max_packet_size(config.max_packet_size)
                .with_handshake_timeout(config.handshake_timeout);
            serve(&cli, transport, directory, config).await
        }
    }
}

async fn serve<T: StreamTransport>(
    cli: &Cli,
    transport: T,
    directory: Arc<BackendDirectory>,
    config: ProxyConfig,
) -> Result<()> {
    let mut listener_config = ListenerConfig::new(cli.listen);
    listener_config.max_connections = config.max_connections;

    let proxy = Proxy::new(transport, directory, config);
    let listener = Arc::new(
        Listener::bind(listener_config, proxy.clone())
            .await
            .with_context(|| format!("failed to bind {}", cli.listen))?,
    );

    let accept_loop = tokio::spawn(Arc::clone(&listener).run());

    tokio::select! {
        joined = accept_loop => {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Listener error");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!(sessions = proxy.registry().len(), "Shutting down");
        }
    }

    let drain_timeout = proxy.config().drain_timeout;
    proxy.drain(drain_timeout).await;
    Ok(())
}
