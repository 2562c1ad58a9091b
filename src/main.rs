use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use inetbox_bridge::bridge::Bridge;
use inetbox_bridge::config::BridgeConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Bridges the RV heater/AC controller to an MQTT broker.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the `[logging]` section.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup()?;

    let path = match args.config {
        Some(path) => path,
        None => BridgeConfig::default_path()?,
    };
    // Config problems end the process before any task starts
    let config = BridgeConfig::load(&path).await?;
    setup_logging(args.debug || config.logging.any_debug());
    info!("inetbox2mqtt {} starting", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
        }
        signal.cancel();
    });

    Bridge::create(config).assemble().run(shutdown).await;
    info!("Stopped");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(debug: bool) {
    FmtSubscriber::builder()
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
