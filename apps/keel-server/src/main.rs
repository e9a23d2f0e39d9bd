use keel_server::config::ServerConfig;
use keel_server::server::Server;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Parse CLI args for config file path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "keel.yaml".to_string());

    // Load configuration (try file first, fall back to env)
    let config = if std::path::Path::new(&config_path).exists() {
        tracing::info!("Loading configuration from {}", config_path);
        ServerConfig::load_from_file(&config_path)?
    } else {
        tracing::warn!("Config file {} not found, loading from environment", config_path);
        ServerConfig::load_from_env()?
    };

    let mut server = Server::new(config);
    server.start().await?;

    tracing::info!("keel node is ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Received shutdown signal, gracefully shutting down");
    server.shutdown().await?;

    Ok(())
}
