use std::sync::Arc;

use skein_core::engine::Engine;
use skein_core::router::{RouterConfig, StreamRouter};
use skein_core::store::JobStore;
use skein_core::store_memory::MemoryStore;
use skein_core::types::now_ms;
use skein_server::grpc::proto::skein_server::SkeinServer;
use skein_server::grpc::SkeinService;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let addr = "0.0.0.0:50052".parse()?;

    let store: Arc<dyn JobStore> = match parse_database_url() {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = skein_core::store_postgres::PostgresStore::new(pool);
            pg.migrate().await?;
            tracing::info!("Using PostgresStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "--database-url / DATABASE_URL set but postgres feature not enabled, using MemoryStore"
            );
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("Using MemoryStore (no database URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Engine::new(store);

    // Graph manifests given at boot; more arrive via the RegisterGraph RPC.
    for path in graph_manifest_paths() {
        let yaml = std::fs::read_to_string(&path)?;
        let graph = engine.register_graph_yaml(&yaml).await?;
        tracing::info!(topic = %graph.subscribes, path, "registered graph manifest");
    }

    let router = Arc::new(StreamRouter::new(engine.clone(), RouterConfig::default()));
    for topic in engine.graphs().topics() {
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = router.run(&topic, "server-0").await {
                tracing::error!(topic, error = %e, "router consumer exited");
            }
        });
    }

    // Time-hook dispatcher: wake elapsed sleeps once a second.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                if let Err(e) = engine.fire_due_timers(now_ms()).await {
                    tracing::error!(error = %e, "timer dispatch failed");
                }
                if let Err(e) = engine.sweep_expired(now_ms()).await {
                    tracing::error!(error = %e, "expiration sweep failed");
                }
            }
        });
    }

    tracing::info!("skein gRPC server listening on {}", addr);

    let service = SkeinService {
        engine: engine.clone(),
    };
    Server::builder()
        .add_service(SkeinServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}

/// Parse database URL from `--database-url <url>` CLI arg or `DATABASE_URL`
/// env var.
fn parse_database_url() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args
        .windows(2)
        .find(|w| w[0] == "--database-url")
        .map(|w| w[1].clone())
    {
        return Some(url);
    }
    std::env::var("DATABASE_URL").ok()
}

/// Graph manifest paths from repeated `--graph <path>` CLI args.
fn graph_manifest_paths() -> Vec<String> {
    let args: Vec<String> = std::env::args().collect();
    args.windows(2)
        .filter(|w| w[0] == "--graph")
        .map(|w| w[1].clone())
        .collect()
}
