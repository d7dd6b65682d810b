//! DNS broker (WebSocket to UDP relay)
//!
//! Accepts WebSocket sessions from tenants and relays their DNS traffic to a
//! single upstream resolver, enforcing per-tenant tunnel and bandwidth quotas.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dnsbroker_control::{
    load_tenants_file, resolve_upstream, RelaySettings, Scheduler, SchedulerConfig,
    SessionAcceptor, TenantRegistry, DEFAULT_UPSTREAM,
};
use dnsbroker_transport_websocket::{WsServer, WsServerConfig};

/// DNS broker - relays tenant DNS traffic from WebSocket clients to a resolver
#[derive(Parser, Debug)]
#[command(name = "dnsbroker")]
#[command(about = "Run a multi-tenant DNS over WebSocket broker", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server_args: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a tenants file and print its tenants
    CheckConfig {
        /// Path to the tenants JSON file
        #[arg(long, env = "DNSBROKER_TENANTS")]
        tenants: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// WebSocket server bind address
    #[arg(long, env = "DNSBROKER_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Path accepting tunnel upgrades (clients add ?uuid=<tenant>)
    #[arg(long, env = "DNSBROKER_PATH", default_value = dnsbroker_transport_websocket::DEFAULT_PATH)]
    path: String,

    /// Path to the tenants JSON file
    #[arg(long, env = "DNSBROKER_TENANTS", default_value = "tenants.json")]
    tenants: PathBuf,

    /// Upstream DNS resolver (host:port), resolved once at startup
    #[arg(long, env = "DNSBROKER_UPSTREAM", default_value = DEFAULT_UPSTREAM)]
    upstream: String,

    /// Scheduler tick in milliseconds; every tick refills rate budgets
    #[arg(long, env = "DNSBROKER_TICK_MS", default_value = "1000")]
    tick_ms: u64,

    /// Run keepalive every N ticks; tunnels silent for N ticks are evicted
    #[arg(long, env = "DNSBROKER_KEEPALIVE_TICKS", default_value = "30")]
    keepalive_ticks: u32,

    /// Frames buffered per tunnel towards a slow client
    #[arg(long, env = "DNSBROKER_CLIENT_BUFFER", default_value = "64")]
    client_buffer: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DNSBROKER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn check_config(path: &Path) -> Result<()> {
    let records = load_tenants_file(path)
        .with_context(|| format!("Invalid tenants file {}", path.display()))?;

    // Validation is shared with startup; the upstream is irrelevant here.
    let placeholder = SocketAddr::from(([127, 0, 0, 1], 53));
    let registry = TenantRegistry::load(&records, RelaySettings::new(placeholder))
        .context("Invalid tenant records")?;

    println!("{} tenant(s) OK", registry.len());
    for record in &records {
        let rate = if record.rate_limit == 0 {
            "unlimited".to_string()
        } else {
            format!("{} B/s", record.rate_limit)
        };
        println!(
            "  {}  max_tunnels={}  rate={}",
            record.id, record.max_tunnels, rate
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        return match command {
            Commands::CheckConfig { tenants } => check_config(&tenants),
        };
    }

    let args = cli.server_args;
    init_logging(&args.log_level)?;

    info!("Starting dnsbroker {}", env!("GIT_TAG"));

    let scheduler_config = SchedulerConfig {
        tick_interval: Duration::from_millis(args.tick_ms.max(1)),
        keepalive_every: args.keepalive_ticks.max(1),
    };

    let records = load_tenants_file(&args.tenants)
        .with_context(|| format!("Failed to load tenants from {}", args.tenants.display()))?;
    if records.is_empty() {
        warn!("No tenants configured; every session will be rejected");
    }

    let upstream = resolve_upstream(&args.upstream).await?;
    info!("Upstream resolver: {} ({})", args.upstream, upstream);

    let mut settings =
        RelaySettings::new(upstream).with_keepalive_window(scheduler_config.keepalive_window());
    settings.client_buffer = args.client_buffer.max(1);

    let registry = Arc::new(TenantRegistry::load(&records, settings)?);
    info!("Loaded {} tenant(s)", registry.len());

    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::new(registry.clone(), scheduler_config).spawn(shutdown.clone());

    let server = WsServer::new(
        WsServerConfig {
            bind_addr: args.listen,
            path: args.path,
        },
        SessionAcceptor::new(registry.clone()),
    );
    let server_shutdown = shutdown.clone();
    let mut server_handle = tokio::spawn(async move { server.start(server_shutdown).await });

    info!("Press Ctrl+C to stop");

    let server_result = tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping broker..."),
                Err(err) => error!("Error listening for shutdown signal: {}", err),
            }
            None
        }
        result = &mut server_handle => Some(result),
    };

    shutdown.cancel();
    for tenant in registry.tenants() {
        for tunnel in tenant.tunnel_list() {
            tunnel.close();
        }
    }

    if let Err(e) = scheduler.await {
        warn!("Scheduler task failed: {}", e);
    }

    let server_result = match server_result {
        Some(result) => result,
        None => server_handle.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e).context("WebSocket server failed"),
        Err(e) => warn!("Server task failed: {}", e),
    }

    info!("Broker stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
