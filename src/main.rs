use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use meshgate::{
    ChannelRouter, DEFAULT_MUX_PORT, DEFAULT_TLS_PORT, Gateway, GatewayConfig, Keypair,
    TrustStore,
};

#[derive(Parser, Debug)]
#[command(name = "meshgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TLS listen port.
    #[arg(short, long, default_value_t = DEFAULT_TLS_PORT)]
    port: u16,

    /// QUIC mux port (UDP).
    #[arg(long, default_value_t = DEFAULT_MUX_PORT)]
    mux_port: u16,

    /// Require a client certificate on TLS requests (default).
    #[arg(long, overrides_with = "no_mtls")]
    mtls: bool,

    /// Admit TLS requests without a client certificate.
    #[arg(long = "no-mtls", overrides_with = "mtls")]
    no_mtls: bool,

    /// Hex secret key file; generated when missing.
    #[arg(short, long, default_value = "meshgate.key")]
    identity: PathBuf,

    /// Authorized keys: `<role> <hex-key> [comment]` per line.
    #[arg(short, long)]
    authorized_keys: Option<PathBuf>,

    /// Extra DNS names for the local certificate.
    #[arg(long, value_name = "NAME")]
    san: Vec<String>,

    #[arg(long)]
    access_log: bool,

    /// Path fragments left out of the access log.
    #[arg(long, value_name = "FRAGMENT")]
    silence: Vec<String>,

    /// Seconds after which an unseen node is forgotten.
    #[arg(long, default_value_t = 24 * 3600)]
    node_ttl: u64,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = Keypair::load_or_generate(&args.identity)
        .with_context(|| format!("failed to load identity from {}", args.identity.display()))?;

    let trust = Arc::new(TrustStore::new());
    if let Some(path) = &args.authorized_keys {
        let count = trust
            .load(path)
            .with_context(|| format!("failed to load authorized keys from {}", path.display()))?;
        info!(count, path = %path.display(), "authorized keys loaded");
    }

    let mut config = GatewayConfig {
        listen: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), args.port),
        mux_listen: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), args.mux_port),
        mtls: args.mtls || !args.no_mtls,
        san: args.san,
        access_log: args.access_log,
        node_ttl: Duration::from_secs(args.node_ttl),
        ..GatewayConfig::default()
    };
    config.silenced.extend(args.silence);

    let router = Arc::new(ChannelRouter::new());
    let gateway = Gateway::bind(keypair, config, trust, router.clone()).await?;
    info!(
        address = %gateway.address(),
        key = %gateway.encoded_key().to_hex(),
        "node identity"
    );

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting");
                break;
            }
            _ = interval.tick() => {
                let state = gateway.registry().mesh_state().await;
                info!(
                    nodes = gateway.registry().len().await,
                    sessions = gateway.cached_sessions(),
                    bus_connections = router.connection_count(),
                    upstream_ap = ?state.upstream_ap,
                    "telemetry snapshot"
                );
            }
        }
    }

    gateway.shutdown();
    Ok(())
}
