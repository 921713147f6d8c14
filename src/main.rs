use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use modkv::{
    config::ServerConfig,
    dump,
    engine::Engine,
    plugins::register_builtin,
    server::Server,
};

fn init_tracing(default_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    init_tracing(&config.log_level);

    let mut engine = Engine::new(config.engine_config());
    register_builtin(&mut engine, config.dump.clone()).context("registering plugins")?;
    let engine = Arc::new(engine);

    let loaded = dump::load(&engine, &config.dump)
        .await
        .with_context(|| format!("loading dump file {}", config.dump.display()))?;
    info!(entries = loaded, "keyspace ready");

    let server = Server::bind(config.address(), Arc::clone(&engine))
        .await
        .with_context(|| format!("binding {}", config.address()))?;

    if let Some(master) = config.replicaof.clone() {
        if let Err(e) = engine.replication().slave_of(&engine, master).await {
            warn!("could not attach to master at startup: {}", e);
        }
    }

    server.run_until_ctrl_c().await;

    Ok(())
}
