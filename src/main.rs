use clap::Parser;
use tracing_subscriber::EnvFilter;

use aegis::cli::{Cli, Transport};
use aegis::proxy::AppState;
use aegis::{config, transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Diagnostics always go to stderr: the stdio transport owns stdout.
    let filter = EnvFilter::new(
        std::env::var("LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "aegis=info".into()),
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let mut cfg = config::load(&args.config)?;
    if let Some(port) = args.port {
        cfg.port = port;
    }

    let state = AppState::from_config(cfg)?;
    state.start().await;

    let served = match args.transport {
        Transport::Stdio => transport::stdio::run(state.clone()).await,
        Transport::Http => {
            let port = state.config.port;
            transport::http::run(state.clone(), port).await
        }
    };

    state.shutdown().await;
    served
}
