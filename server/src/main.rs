mod forward;

use remotedialer::{HeaderAuthorizer, TunnelConfig, TunnelServer};

#[derive(Debug, thiserror::Error)]
enum ServerError {
    #[error("invalid PORT: {0}")]
    InvalidPort(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .map_err(|e: std::num::ParseIntError| ServerError::InvalidPort(e.to_string()))?;

    let authorizer = HeaderAuthorizer::from_env();
    if !authorizer.requires_token() {
        tracing::warn!("TUNNEL_TOKENS not set; accepting every agent");
    }
    let server = TunnelServer::new(authorizer, TunnelConfig::from_env());

    if let Some(config) = forward::ForwardConfig::from_env() {
        let registry = server.registry().clone();
        let ctx = server.shutdown_token();
        tokio::spawn(async move {
            if let Err(e) = forward::run(config, registry, ctx).await {
                tracing::error!(error = %e, "port forward stopped");
            }
        });
    }

    let app = server.router();
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    tracing::info!(%port, "tunnel server listening");
    let shutdown = server.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            shutdown.shutdown().await;
        })
        .await?;
    Ok(())
}
