use imagenn::{build_pipeline, create_router, init, AppState, Config, Result};

use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize the application
    init()?;

    let config = Config::from_env()?;
    log::debug!("Configuration: {:?}", config);

    // Model provisioning and loading happen before the port is bound
    let pipeline = build_pipeline(&config).await?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| imagenn::AppError::Config(format!("bad listen address: {}", e)))?;

    let state = AppState::new(config, pipeline);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
