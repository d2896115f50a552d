//! WebSocket Broadcast Server - Entry Point
//!
//! Loads the configuration, picks the strategy and runs the server
//! until Ctrl-C.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ws_broadcast::{
    BroadcastChat, BroadcastServer, ConnectionStrategy, Echo, ServerConfig, StrategyKind, Ticker,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=ws_broadcast=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ws_broadcast=info")),
        )
        .init();

    // WS_CONFIG file, then `[port] [strategy]` from the command line
    let config = ServerConfig::load()?;
    info!("Running '{:?}' strategy on port {}", config.strategy, config.port);

    match config.strategy {
        StrategyKind::Echo => {
            let strategy = Echo {
                poll_interval: config.poll_interval(),
            };
            run(config, strategy).await
        }
        StrategyKind::Chat => {
            let strategy = BroadcastChat {
                poll_interval: config.poll_interval(),
            };
            run(config, strategy).await
        }
        StrategyKind::Tick => {
            let strategy = Ticker {
                period: config.tick_interval(),
            };
            run(config, strategy).await
        }
    }
}

async fn run<S: ConnectionStrategy>(
    config: ServerConfig,
    strategy: S,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = BroadcastServer::new(config, strategy);
    let listener = server.bind().await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    server.serve(listener, shutdown).await?;
    info!("Server stopped");
    Ok(())
}
