use clap::Parser;
use color_eyre::Result;
use protocol_gateway::{Gateway, GatewayConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "protocol-gateway", version, about = "MQTT ingestion gateway with batched storage")]
struct Args {
    /// Config file, defaults to ~/.config/protocol-gateway/gateway.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let args = Args::parse();

    let path = args.config.unwrap_or_else(GatewayConfig::default_path);
    GatewayConfig::ensure_default_config(&path).await?;
    let config = GatewayConfig::load(&path).await?;
    info!("Loaded config from {}", path.display());

    let gateway = Gateway::start(config).await?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received"),
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    gateway.run_until_cancelled(token).await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
