//! RTMP hub server example
//!
//! Run with: cargo run --example hub_server [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example hub_server                    # binds to 0.0.0.0:1935
//!   cargo run --example hub_server localhost          # binds to 127.0.0.1:1935
//!   cargo run --example hub_server 127.0.0.1:1936     # binds to 127.0.0.1:1936
//!
//! ## Publishing
//!
//!   ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost/live/test_key
//!
//! ## Playing
//!
//!   ffplay rtmp://localhost/live/test_key
//!
//! Players joining late get the sequence headers and the current GOP, and a
//! publisher that drops out has 10s to come back before its players are told
//! the stream ended.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rtmp_hub::server::DisconnectReason;
use rtmp_hub::session::{SessionContext, StreamContext};
use rtmp_hub::{RegistryConfig, RtmpHandler, RtmpServer, ServerConfig, StreamRegistry};

/// Handler that logs lifecycle events and accepts everything but an empty key
struct LoggingHandler;

impl RtmpHandler for LoggingHandler {
    async fn on_connection(&self, ctx: &SessionContext) -> bool {
        tracing::info!(session_id = ctx.session_id, peer = %ctx.peer_addr, "New connection");
        true
    }

    async fn is_publish_allowed(&self, app: &str, key: &str) -> bool {
        tracing::info!(app = app, key = key, "Publish requested");
        !key.is_empty()
    }

    async fn on_publish_start(&self, ctx: &StreamContext) {
        tracing::info!(
            session_id = ctx.session.session_id,
            stream = %ctx.stream_key,
            "Publishing"
        );
    }

    async fn on_play_start(&self, ctx: &StreamContext) {
        tracing::info!(
            session_id = ctx.session.session_id,
            stream = %ctx.stream_key,
            "Playing"
        );
    }

    async fn on_disconnect(&self, ctx: &SessionContext, reason: &DisconnectReason) {
        tracing::info!(session_id = ctx.session_id, reason = %reason, "Disconnected");
    }
}

/// Parse bind address from command line argument.
///
/// Accepts "localhost", "localhost:PORT", "IP" and "IP:PORT".
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    const DEFAULT_PORT: u16 = 1935;

    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: hub_server [BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:1935)");
}

/// Log a one-line summary of every stream now and then
async fn report_streams(registry: Arc<StreamRegistry>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        ticker.tick().await;
        for stream in registry.list_streams().await {
            tracing::info!(
                stream = %stream.key,
                state = ?stream.state,
                subscribers = stream.subscriber_count,
                gop_packets = stream.gop_packets,
                degraded = stream.gop_degraded,
                packets = stream.packets_published,
                "Stream"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let bind_addr = match args.get(1) {
        Some(addr_str) => match parse_bind_addr(addr_str) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => ServerConfig::default().bind_addr,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmp_hub=debug".parse()?)
                .add_directive("hub_server=debug".parse()?),
        )
        .init();

    let config = ServerConfig::default().bind(bind_addr);
    let registry_config = RegistryConfig::default()
        .publisher_grace_period(Duration::from_secs(10))
        .allow_play_before_publish(true);

    let server = RtmpServer::with_registry_config(config, LoggingHandler, registry_config);
    let reporter = tokio::spawn(report_streams(Arc::clone(server.registry())));

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    reporter.abort();
    Ok(())
}
