use anyhow::Context;
use myko_vision::{EngineConfig, Session};
use myko_vision_server::{ServerConfig, start_server};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn load_engine_config() -> anyhow::Result<EngineConfig> {
    let Ok(path) = std::env::var("MYKO_CONFIG") else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading engine config {path}"))?;
    EngineConfig::from_json(&text).with_context(|| format!("parsing engine config {path}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let engine = load_engine_config()?;
    let session = Arc::new(Session::new(engine).context("creating segmentation session")?);
    let cfg = ServerConfig::from_env();

    let handle = start_server(session, cfg.clone())
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    // Park until the server task ends.
    handle.await.context("server task panicked")?;
    Ok(())
}
