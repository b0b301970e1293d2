use sigil::{app, initialize_state, telemetry};
use tokio::net::TcpListener;

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "cannot listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::setup_logging();
    let metrics = telemetry::setup_metrics_recorder()?;

    let state = initialize_state(Some(metrics)).await?;
    let address = state.config.address.clone();

    let listener = TcpListener::bind(&address).await?;
    tracing::info!(%address, version = state.config.version(), "server started");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
