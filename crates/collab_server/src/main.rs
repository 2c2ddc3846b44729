//! Collaboration server binary.
//!
//! Usage: `collab-server [config.json]`
//!
//! The optional config file holds a JSON `ServerConfig`; omitted fields take
//! their defaults. `COLLAB_BIND` and `COLLAB_PORT` override the listen
//! address, and `RUST_LOG` controls logging.

use anyhow::Context;
use code_collab::server::{CollaborationServer, ServerConfig};
use code_collab::store::{DocumentStore, FileDocumentStore, MemoryDocumentStore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn load_config() -> anyhow::Result<ServerConfig> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?
        }
        None => ServerConfig::default(),
    };

    if let Ok(bind) = std::env::var("COLLAB_BIND") {
        config.bind_address = bind;
    }
    if let Ok(port) = std::env::var("COLLAB_PORT") {
        config.port = port.parse().with_context(|| format!("invalid COLLAB_PORT {port:?}"))?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config()?;

    let store: Arc<dyn DocumentStore> = match &config.storage_dir {
        Some(dir) => {
            tracing::info!("Storing checkpoints in {:?}", dir);
            Arc::new(FileDocumentStore::new(dir).context("opening storage directory")?)
        }
        None => {
            tracing::warn!("No storage_dir configured, documents live in memory only");
            Arc::new(MemoryDocumentStore::new())
        }
    };

    let server = CollaborationServer::new(config, store);
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}
