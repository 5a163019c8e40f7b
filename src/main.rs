use std::sync::Arc;

use anyhow::Context;
use fedflow::config::Config;
use fedflow::engine::{EngineRegistry, ProcessEngine, SimulationEngine};
use fedflow::federation::{Federation, HttpFederation};
use fedflow::node::Node;
use fedflow::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    eprintln!("fedflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Party: {} (instance {})", config.party_id, config.instance_id);
    eprintln!("   Listen: http://{}", config.bind_addr);
    eprintln!("   Peers: {}", config.peers.len());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Engines ──────────────────────────────────────────────────────────
    let engines = Arc::new(EngineRegistry::new());
    engines
        .register(Arc::new(ProcessEngine::new(
            config.task_command.clone(),
            config.output_dir.clone(),
        )))
        .await;
    engines.register(Arc::new(SimulationEngine::new())).await;
    eprintln!("   Engines: {}", engines.names().await.join(", "));

    // ── Federation ───────────────────────────────────────────────────────
    let transport: Arc<dyn Federation> = Arc::new(HttpFederation::new(
        config.peers.clone(),
        config.request_timeout,
        config.retry.clone(),
    )?);

    let bind_addr = config.bind_addr;
    let node = Node::start(config, db, engines, transport).await?;
    let _loops = node.spawn_loops();

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "Federation server started");
    axum::serve(listener, node.router()).await?;

    Ok(())
}
