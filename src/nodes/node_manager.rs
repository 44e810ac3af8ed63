use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    transport::{Handshake, NodeSignal, Transport},
    Node,
};
use crate::{
    config::ClusterConfig,
    error::{Error, Result},
    model::GuildId,
};

/// Registro fijo de los nodos configurados.
///
/// Los nodos no se agregan ni se quitan en tiempo de ejecución; cada uno
/// serializa sus propias mutaciones, así que la selección y las
/// asignaciones sobre nodos distintos no se bloquean entre sí.
pub struct NodeManager {
    nodes: Vec<Arc<Node>>,
    handshake: Handshake,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeManager {
    pub fn new(config: &ClusterConfig) -> Self {
        let nodes = config
            .nodes
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, node)| Arc::new(Node::new(index, node, config.penalty)))
            .collect();

        Self {
            nodes,
            handshake: Handshake::from(config),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Nodos en orden de configuración.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn get_node(&self, identifier: &str) -> Option<Arc<Node>> {
        self.nodes
            .iter()
            .find(|node| node.identifier() == identifier)
            .cloned()
    }

    pub fn available_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|node| node.is_available())
            .cloned()
            .collect()
    }

    /// Determines the best available node.
    ///
    /// Lowest penalty wins; ties go to the node with fewer assigned guilds,
    /// then to configuration order.
    pub fn best_node(&self) -> Result<Arc<Node>> {
        self.best_node_in(None)
    }

    /// Like [`NodeManager::best_node`], preferring nodes of `region` when any
    /// of them is available.
    pub fn best_node_in(&self, region: Option<&str>) -> Result<Arc<Node>> {
        let available = self.available_nodes();

        let regional: Vec<_> = match region {
            Some(region) => available
                .iter()
                .filter(|node| node.region() == Some(region))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        let candidates = if regional.is_empty() {
            available
        } else {
            regional
        };

        candidates
            .into_iter()
            .map(|node| (node.penalty(), node.guild_count(), node))
            .min_by(|(pa, ga, a), (pb, gb, b)| {
                pa.rank(pb)
                    .then(ga.cmp(gb))
                    .then(a.index().cmp(&b.index()))
            })
            .map(|(_, _, node)| node)
            .ok_or(Error::NoAvailableNodes)
    }

    pub fn assign(&self, guild_id: GuildId) -> Result<Arc<Node>> {
        self.assign_in(guild_id, None)
    }

    pub fn assign_in(&self, guild_id: GuildId, region: Option<&str>) -> Result<Arc<Node>> {
        let node = self.best_node_in(region).inspect_err(|_| {
            warn!("Sin nodos disponibles para el guild {}", guild_id);
        })?;
        node.add_guild(guild_id);
        Ok(node)
    }

    /// Quita el guild del nodo. Llamarlo dos veces no tiene efecto.
    pub fn release(&self, guild_id: GuildId, node: &Node) {
        if node.remove_guild(guild_id) {
            debug!("Guild {} liberado del nodo {}", guild_id, node.identifier());
        }
    }

    /// Nodo al que está asignado el guild, si hay alguno.
    pub fn node_for(&self, guild_id: GuildId) -> Option<Arc<Node>> {
        self.nodes
            .iter()
            .find(|node| node.has_guild(guild_id))
            .cloned()
    }

    /// Lanza una tarea de transporte por nodo. Las siguientes llamadas no
    /// hacen nada.
    pub(crate) fn connect_all(&self, signals: UnboundedSender<NodeSignal>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.cancel.is_cancelled() {
            return;
        }

        for node in &self.nodes {
            let Some(outbound) = node.take_outbound() else {
                error!("La cola del nodo {} ya fue tomada", node.identifier());
                continue;
            };

            info!("🎼 Conectando nodo {} ({})", node.identifier(), node.config().websocket_url());
            let transport = Transport::new(
                Arc::clone(node),
                self.handshake.clone(),
                outbound,
                signals.clone(),
                self.cancel.clone(),
            );
            tasks.push(transport.spawn());
        }
    }

    /// Cierra todas las conexiones. Los nodos quedan en `Closed` y no
    /// reconectan.
    pub async fn close_all(&self) {
        self.cancel.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Tarea de transporte terminó con error: {:?}", e);
            }
        }

        info!("🔌 Todos los nodos cerrados");
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::NodeConfig,
        nodes::ConnectionState,
        stats::{FrameStats, NodeStats},
    };
    use pretty_assertions::assert_eq;

    fn manager(ids: &[&str]) -> NodeManager {
        let nodes = ids
            .iter()
            .map(|id| NodeConfig::new(*id, "localhost", 2333))
            .collect();
        NodeManager::new(&ClusterConfig::new(1, nodes))
    }

    fn connect(manager: &NodeManager, id: &str, playing: Option<u32>) {
        let node = manager.get_node(id).unwrap();
        node.set_state(ConnectionState::Connected);
        if let Some(playing) = playing {
            node.update_stats(NodeStats {
                playing_player_count: playing,
                frames: Some(FrameStats::default()),
                ..NodeStats::default()
            });
        }
    }

    fn best(manager: &NodeManager) -> String {
        manager.best_node().unwrap().identifier().to_string()
    }

    #[test]
    fn test_lowest_penalty_wins() {
        let manager = manager(&["a", "b", "c"]);
        connect(&manager, "a", Some(5));
        connect(&manager, "b", Some(1));
        connect(&manager, "c", Some(3));

        assert_eq!(best(&manager), "b");
    }

    #[test]
    fn test_unavailable_nodes_are_never_chosen() {
        let manager = manager(&["a", "b"]);
        connect(&manager, "a", Some(50));
        // "b" tendría menor carga pero no está conectado.
        manager.get_node("b").unwrap().update_stats(NodeStats::default());

        assert_eq!(best(&manager), "a");
    }

    #[test]
    fn test_no_available_nodes() {
        let manager = manager(&["a", "b"]);
        assert!(matches!(manager.best_node(), Err(Error::NoAvailableNodes)));
        assert!(matches!(
            manager.assign(GuildId(1)),
            Err(Error::NoAvailableNodes)
        ));
    }

    #[test]
    fn test_ties_break_by_guild_count_then_order() {
        let manager = manager(&["a", "b", "c"]);
        connect(&manager, "a", Some(2));
        connect(&manager, "b", Some(2));
        connect(&manager, "c", Some(2));

        assert_eq!(best(&manager), "a");

        manager.get_node("a").unwrap().add_guild(GuildId(10));
        assert_eq!(best(&manager), "b");

        manager.get_node("b").unwrap().add_guild(GuildId(11));
        manager.get_node("c").unwrap().add_guild(GuildId(12));
        assert_eq!(best(&manager), "a");
    }

    #[test]
    fn test_unknown_load_ranks_after_measured() {
        let manager = manager(&["fresh", "loaded"]);
        connect(&manager, "fresh", None);
        connect(&manager, "loaded", Some(40));

        assert_eq!(best(&manager), "loaded");

        manager.get_node("loaded").unwrap().set_state(ConnectionState::Disconnected);
        assert_eq!(best(&manager), "fresh");
    }

    #[test]
    fn test_assign_spreads_equal_nodes_and_release_is_idempotent() {
        let manager = manager(&["a", "b"]);
        connect(&manager, "a", Some(0));
        connect(&manager, "b", Some(0));

        let first = manager.assign(GuildId(1)).unwrap();
        let second = manager.assign(GuildId(2)).unwrap();
        assert_eq!(first.identifier(), "a");
        assert_eq!(second.identifier(), "b");
        assert_eq!(
            manager.node_for(GuildId(2)).unwrap().identifier(),
            "b"
        );

        manager.release(GuildId(1), &first);
        manager.release(GuildId(1), &first);
        assert_eq!(first.guild_count(), 0);
        assert!(manager.node_for(GuildId(1)).is_none());
    }

    #[test]
    fn test_region_preference_falls_back_to_cluster() {
        let nodes = vec![
            NodeConfig::new("us", "localhost", 1).with_region("us"),
            NodeConfig::new("eu", "localhost", 2).with_region("europe"),
        ];
        let manager = NodeManager::new(&ClusterConfig::new(1, nodes));
        connect(&manager, "us", Some(0));
        connect(&manager, "eu", Some(9));

        let pick = |region| {
            manager
                .best_node_in(region)
                .unwrap()
                .identifier()
                .to_string()
        };
        assert_eq!(pick(Some("europe")), "eu");
        assert_eq!(pick(None), "us");

        manager.get_node("eu").unwrap().set_state(ConnectionState::Disconnected);
        assert_eq!(pick(Some("europe")), "us");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let manager = manager(&["a", "b", "c", "d"]);
        for (id, load) in [("a", 7), ("b", 3), ("c", 3), ("d", 9)] {
            connect(&manager, id, Some(load));
        }

        let picks: Vec<_> = (0..5).map(|_| best(&manager)).collect();
        assert!(picks.iter().all(|p| p == "b"));
    }
}
