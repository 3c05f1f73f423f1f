use berth::Config;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "./berth.yaml".to_string()),
    );
    let config = Config::load(&config_path)?;

    info!(
        "Starting berthd on {}:{}",
        config.server.bind_address,
        config.server.port
    );
    info!("Container runtime endpoint: {}", config.runtime.endpoint);
    info!("Volume root: {}", config.storage.volume_root.display());
    info!("Archive root: {}", config.storage.archive_root.display());

    berth::run(config).await?;
    Ok(())
}
