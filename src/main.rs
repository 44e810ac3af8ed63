use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use open_music_cluster::{Cluster, ClusterConfig, Event, EventHandler};

/// Registra en el log todo lo que pasa en el clúster.
struct LogHook;

#[async_trait]
impl EventHandler for LogHook {
    async fn handle(&self, event: &Event) -> Result<()> {
        match event {
            Event::NodeConnected { node } => info!("✅ Nodo {} listo", node),
            Event::NodeDisconnected { node, reason } => {
                warn!("❌ Nodo {} perdido: {}", node, reason)
            }
            Event::NodeChanged {
                guild_id,
                old_node,
                new_node,
            } => info!("🔀 {}: {} → {}", guild_id, old_node, new_node),
            other => info!("📨 {:?}", other),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_cluster=debug".parse()?)
                .add_directive("tungstenite=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Cluster v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = ClusterConfig::load()?;
    info!("{}", config.summary());

    let cluster = Cluster::new(config)?;
    cluster.register(None, Arc::new(LogHook));
    cluster.connect();

    info!("🚀 Clúster en marcha, Ctrl+C para salir");
    tokio::signal::ctrl_c().await?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");

    cluster.shutdown().await;
    Ok(())
}
