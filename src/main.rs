use shelly_net_metering::{run_from_config, Config};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Starting Shelly net metering");
    let config = Config::from_env()?;
    info!(
        shelly = %config.shelly_address,
        state_file = %config.state_file.display(),
        "loaded config"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
    };

    let energy = run_from_config(&config, shutdown).await?;
    info!(
        imported_wh = energy.imported_wh,
        exported_wh = energy.exported_wh,
        "stopped"
    );
    Ok(())
}
