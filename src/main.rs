use anyhow::{Context, Result};
use creatorflow::config::Config;
use creatorflow::{init, server};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    creatorflow::init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr.clone();
    let state = init::build_state(config)?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind {bind_addr}"))?;
    tracing::info!("listening on {}", bind_addr);

    axum::serve(listener, server::router(state))
        .await
        .context("server error")?;
    Ok(())
}
