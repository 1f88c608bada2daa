use std::net::SocketAddr;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ENV_PORT: &str = "JOBWATCH_DEV_PORT";
const DEFAULT_PORT: u16 = 47900;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,jobwatch_devserver=info,tower_http=info".into()),
        )
        .init();

    let port = match std::env::var(ENV_PORT) {
        Ok(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("{ENV_PORT}={raw:?} is not a valid port"))?,
        Err(_) => DEFAULT_PORT,
    };

    let state = jobwatch_devserver::state::DevState::new();
    let app = jobwatch_devserver::app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("jobwatch dev server listening on {addr}");
    axum::serve(listener, app).await.context("dev server")?;
    Ok(())
}
