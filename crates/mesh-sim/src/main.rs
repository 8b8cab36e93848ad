use anyhow::Result;
use mesh_sim::{run_friendship, run_transfer, SimSettings};
use shared::config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ble_mesh=debug,mesh_sim=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting mesh friendship simulator");

    // Load configuration
    let config = Config::from_env()?;
    let settings = SimSettings::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Every timer in the run advances on the virtual clock
    tokio::time::pause();

    let friendship = run_friendship(&config, &settings).await?;
    println!("{}", serde_json::to_string_pretty(&friendship)?);

    let payload: Vec<u8> = (0..=255u8).cycle().take(120).collect();
    let transfer = run_transfer(&payload, settings.loss, settings.seed)?;
    println!("{}", serde_json::to_string_pretty(&transfer)?);

    if friendship.established == 0 {
        tracing::warn!("LPN never established a friendship");
    }
    Ok(())
}
