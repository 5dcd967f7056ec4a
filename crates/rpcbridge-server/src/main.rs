//! rpcbridge server - hosts the built-in methods over HTTP+SSE and raw TCP.

mod methods;

use anyhow::{Context, Result};
use clap::Parser;
use methods::BuiltinMethods;
use rpcbridge::{
    engine_factory, DispatchEngine, HttpServerConfig, HttpStreamingServer, TcpBridge,
    TcpBridgeConfig,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "rpcbridge-server")]
#[command(about = "JSON-RPC over streamable HTTP and a raw TCP bridge")]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// HTTP port (0 = auto-assign)
    #[arg(long, default_value = "8080")]
    http_port: u16,

    /// Path accepting JSON-RPC POSTs
    #[arg(long, default_value = "/mcp")]
    rpc_path: String,

    /// Also serve the TCP bridge on this port (0 = auto-assign)
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Give up on a request whose response has not arrived after this many seconds
    #[arg(long)]
    response_timeout_secs: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Stdout is reserved for the port announcements.
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);

    if args.json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting rpcbridge server");

    let factory =
        engine_factory(|transport| DispatchEngine::new(transport, Arc::new(BuiltinMethods)));

    let http_config = HttpServerConfig {
        bind: SocketAddr::new(args.host, args.http_port),
        rpc_path: args.rpc_path.clone(),
        response_timeout: args.response_timeout_secs.map(Duration::from_secs),
        ..Default::default()
    };
    let http = HttpStreamingServer::new(http_config, factory.clone())
        .context("invalid HTTP server configuration")?;
    let http_addr = http.start().await.context("failed to start HTTP server")?;

    // Parent processes read these lines to discover the ports.
    println!("HTTP_PORT={}", http_addr.port());

    let tcp = match args.tcp_port {
        Some(port) => {
            let config = TcpBridgeConfig {
                bind: SocketAddr::new(args.host, port),
                ..Default::default()
            };
            let bridge =
                TcpBridge::new(config, factory).context("invalid TCP bridge configuration")?;
            let addr = bridge.start().await.context("failed to start TCP bridge")?;
            println!("TCP_PORT={}", addr.port());
            Some(bridge)
        }
        None => None,
    };

    info!("Server running; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");

    http.shutdown().await;
    if let Some(bridge) = tcp {
        bridge.shutdown().await;
    }

    info!("Shutdown complete");
    Ok(())
}
