use clap::Parser;
use slipway::args::Args;
use tracing::{error, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .init();

    trace!(args = ?args, "parsed args");

    if let Err(error) = slipway::start(args).await {
        error!(error = %error, "control plane failed to start");
        std::process::exit(1);
    }
}
