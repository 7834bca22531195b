//! WebSocket-gRPC bridge server.

use anyhow::Context;
use clap::{ArgAction, Parser};
use grpc_websocket_bridge::{Bridge, DescriptorRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bridge")]
#[command(about = "Bridge browser WebSocket clients to backend gRPC services")]
#[command(version)]
struct Cli {
    /// WebSocket listen port
    #[arg(long, default_value_t = 8080)]
    ws_port: u16,

    /// Proto file to load (repeatable)
    #[arg(long = "proto", value_name = "PATH")]
    protos: Vec<PathBuf>,

    /// Include directory for proto imports (repeatable)
    #[arg(long = "include", value_name = "DIR")]
    includes: Vec<PathBuf>,

    /// Precompiled binary descriptor set to load (repeatable)
    #[arg(long = "descriptor-set", value_name = "PATH")]
    descriptor_sets: Vec<PathBuf>,

    /// Fallback gRPC target for start frames without an explicit target
    #[arg(long, default_value = "localhost:50051", value_name = "HOST:PORT")]
    default_target: String,

    /// Use TLS toward backend gRPC servers
    #[arg(long)]
    secure: bool,

    /// Root CA bundle for backend TLS (system trust store when omitted)
    #[arg(long, value_name = "PATH")]
    tls_ca: Option<PathBuf>,

    /// Maximum concurrent calls per connection
    #[arg(long, default_value_t = 100)]
    max_calls: usize,

    /// Debug logging (pass --verbose=false to quiet down)
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose {
        "grpc_websocket_bridge=debug,info"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.protos.is_empty() && cli.descriptor_sets.is_empty() {
        anyhow::bail!("at least one --proto or --descriptor-set is required");
    }

    let mut registry = DescriptorRegistry::new();
    registry
        .load_protos(&cli.protos, &cli.includes)
        .context("failed to load proto files")?;
    for path in &cli.descriptor_sets {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read descriptor set {}", path.display()))?;
        registry
            .add_descriptor_set_bytes(&bytes)
            .with_context(|| format!("failed to load descriptor set {}", path.display()))?;
    }

    let mut builder = Bridge::builder()
        .registry(registry)
        .default_target(cli.default_target.clone())
        .secure(cli.secure)
        .max_calls_per_connection(cli.max_calls);
    if let Some(ca) = &cli.tls_ca {
        builder = builder.tls_ca(ca.clone());
    }
    let bridge = builder.build()?;

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.ws_port));
    bridge.serve(addr).await?;
    Ok(())
}
