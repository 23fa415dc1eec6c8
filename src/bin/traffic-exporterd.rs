//! traffic-exporterd - Prometheus exporter for iptables and V2Ray traffic
//! counters.
//!
//! Usage:
//!   traffic-exporterd                                  # defaults
//!   traffic-exporterd --web.listen-address 0.0.0.0:9550
//!   traffic-exporterd --disable-collector iptables
//!   traffic-exporterd --collector.v2ray.endpoint 10.0.0.2:10085

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use traffic_exporter::collector::{Config, Registry, V2rayConfig};
use traffic_exporter::exporter;

/// Prometheus exporter for iptables and V2Ray traffic counters.
#[derive(Parser)]
#[command(name = "traffic-exporterd", about = "Traffic metrics exporter")]
struct Args {
    /// Address to listen on for the web interface and telemetry.
    #[arg(long = "web.listen-address", default_value = "127.0.0.1:9550")]
    listen_address: SocketAddr,

    /// Path under which to expose metrics.
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    telemetry_path: String,

    /// V2Ray stats API endpoint, host:port.
    #[arg(long = "collector.v2ray.endpoint", default_value = "127.0.0.1:10085")]
    v2ray_endpoint: String,

    /// V2Ray stats API timeout in seconds.
    #[arg(long = "collector.v2ray.timeout", default_value_t = 3)]
    v2ray_timeout: u8,

    /// Enable a collector that is disabled by default. May be repeated.
    #[arg(long = "enable-collector", value_name = "NAME")]
    enable_collectors: Vec<String>,

    /// Disable a collector that is enabled by default. May be repeated.
    #[arg(long = "disable-collector", value_name = "NAME")]
    disable_collectors: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if !args.telemetry_path.starts_with('/') || args.telemetry_path == "/" {
        eprintln!(
            "Error: telemetry path {:?} must start with '/' and not be the root",
            args.telemetry_path
        );
        std::process::exit(1);
    }

    let config = Config {
        v2ray: V2rayConfig {
            endpoint: args.v2ray_endpoint,
            timeout: args.v2ray_timeout,
        },
    };

    let registry =
        match Registry::from_config(&config, &args.enable_collectors, &args.disable_collectors) {
            Ok(registry) => registry,
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        };
    for name in registry.collector_names() {
        info!(collector = name, "collector enabled");
    }

    if let Err(e) = exporter::serve(
        Arc::new(registry),
        args.listen_address,
        &args.telemetry_path,
    )
    .await
    {
        eprintln!("Error running exporter: {}", e);
        std::process::exit(1);
    }
}
