use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::ClusterConfig,
    events::{Event, EventBus, EventHandler, EventKind},
    model::{IncomingMessage, NodeEvent},
    nodes::{transport::NodeSignal, ConnectionState, NodeManager},
    player::PlayerManager,
    track::Track,
};

/// Punto de entrada del clúster: nodos, players y hooks de eventos.
///
/// ```no_run
/// # async fn run() -> anyhow::Result<()> {
/// use open_music_cluster::{Cluster, ClusterConfig, NodeConfig};
///
/// let config = ClusterConfig::new(1234, vec![NodeConfig::new("main", "localhost", 2333)]);
/// let cluster = Cluster::new(config)?;
/// cluster.connect();
/// // ...
/// cluster.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Cluster {
    config: ClusterConfig,
    nodes: Arc<NodeManager>,
    players: Arc<PlayerManager>,
    bus: Arc<EventBus>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let nodes = Arc::new(NodeManager::new(&config));
        let bus = Arc::new(EventBus::new());
        let players = Arc::new(PlayerManager::new(
            Arc::clone(&nodes),
            Arc::clone(&bus),
            config.default_volume,
        ));

        Ok(Self {
            config,
            nodes,
            players,
            bus,
            dispatcher: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn nodes(&self) -> &Arc<NodeManager> {
        &self.nodes
    }

    pub fn players(&self) -> &Arc<PlayerManager> {
        &self.players
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Registra un hook; `None` lo suscribe a todos los eventos.
    pub fn register(&self, kind: Option<EventKind>, handler: Arc<dyn EventHandler>) -> bool {
        self.bus.register(kind, handler)
    }

    /// Abre la conexión de cada nodo y empieza a procesar sus mensajes.
    /// Las siguientes llamadas no hacen nada.
    pub fn connect(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }

        let (signals, signals_rx) = mpsc::unbounded_channel();
        self.nodes.connect_all(signals);

        let task = Dispatcher {
            nodes: Arc::clone(&self.nodes),
            players: Arc::clone(&self.players),
            bus: Arc::clone(&self.bus),
        };
        *dispatcher = Some(tokio::spawn(task.run(signals_rx)));
    }

    /// Cierra todos los nodos, espera a que se procesen sus últimas señales
    /// y descarta players y hooks.
    pub async fn shutdown(&self) {
        info!("⚠️ Apagando clúster...");
        self.nodes.close_all().await;

        let dispatcher = self.dispatcher.lock().take();
        if let Some(task) = dispatcher {
            if let Err(e) = task.await {
                error!("El dispatcher terminó con error: {:?}", e);
            }
        }

        self.players.clear().await;
        self.bus.close().await;
        self.bus.clear();
        info!("👋 Clúster apagado");
    }
}

/// Aplica las señales de los transportes al estado del clúster.
pub(crate) struct Dispatcher {
    nodes: Arc<NodeManager>,
    players: Arc<PlayerManager>,
    bus: Arc<EventBus>,
}

impl Dispatcher {
    async fn run(self, mut signals: UnboundedReceiver<NodeSignal>) {
        while let Some(signal) = signals.recv().await {
            self.handle(signal).await;
        }
        debug!("Dispatcher detenido");
    }

    pub(crate) async fn handle(&self, signal: NodeSignal) {
        match signal {
            NodeSignal::State {
                node,
                previous,
                state,
                reason,
            } => self.on_state(node, previous, state, reason).await,
            NodeSignal::Message { node, message } => self.on_message(&node, message).await,
        }
    }

    async fn on_state(
        &self,
        node: String,
        previous: ConnectionState,
        state: ConnectionState,
        reason: Option<String>,
    ) {
        match state {
            ConnectionState::Connected => {
                self.bus.publish(Event::NodeConnected { node: node.clone() });
                self.players.restore_on(&node).await;
                self.adopt_orphans(&node).await;
            }
            ConnectionState::Disconnected | ConnectionState::Closed
                if previous == ConnectionState::Connected =>
            {
                let reason = reason.unwrap_or_else(|| "conexión cerrada".to_string());
                self.bus.publish(Event::NodeDisconnected {
                    node: node.clone(),
                    reason,
                });

                // Al apagar no hay a dónde migrar.
                if state == ConnectionState::Disconnected {
                    self.players.migrate_from(&node).await;
                }
            }
            _ => trace!("Nodo {}: {:?} → {:?}", node, previous, state),
        }
    }

    /// Players que quedaron en otros nodos caídos sin poder migrar.
    async fn adopt_orphans(&self, connected: &str) {
        for node in self.nodes.nodes() {
            if node.identifier() == connected || node.is_available() || node.guild_count() == 0 {
                continue;
            }
            self.players.migrate_from(node.identifier()).await;
        }
    }

    async fn on_message(&self, node: &str, message: IncomingMessage) {
        match message {
            // El transporte ya las aplicó dentro de su sesión.
            IncomingMessage::Stats(_) => trace!("Stats del nodo {} ya aplicadas", node),
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                self.players.update_state(node, guild_id, state).await
            }
            IncomingMessage::Event(event) => self.on_event(node, event).await,
            IncomingMessage::Unknown => debug!("Op desconocido del nodo {}, ignorado", node),
        }
    }

    async fn on_event(&self, node: &str, event: NodeEvent) {
        let event = match event {
            NodeEvent::TrackStart { guild_id, track } => Event::TrackStart {
                guild_id,
                track: decode(&track),
            },
            NodeEvent::TrackEnd {
                guild_id,
                track,
                reason,
            } => {
                self.bus.publish(Event::TrackEnd {
                    guild_id,
                    track: decode(&track),
                    reason,
                });

                if reason.may_start_next() {
                    if let Err(e) = self.players.track_ended(node, guild_id, &track).await {
                        warn!("No se pudo avanzar la cola de {}: {}", guild_id, e);
                    }
                }
                return;
            }
            NodeEvent::TrackException {
                guild_id,
                track,
                exception,
                error,
            } => {
                let message = exception
                    .and_then(|e| e.message)
                    .or(error)
                    .unwrap_or_else(|| "error desconocido".to_string());
                warn!("❌ Excepción de track en {}: {}", guild_id, message);

                Event::TrackException {
                    guild_id,
                    track: decode(&track),
                    message,
                }
            }
            NodeEvent::TrackStuck {
                guild_id,
                track,
                threshold_ms,
            } => Event::TrackStuck {
                guild_id,
                track: decode(&track),
                threshold_ms,
            },
            NodeEvent::WebSocketClosed {
                guild_id,
                code,
                reason,
                by_remote,
            } => Event::WebSocketClosed {
                guild_id,
                code,
                reason,
                by_remote,
            },
            NodeEvent::Unknown => {
                debug!("Evento desconocido del nodo {}, ignorado", node);
                return;
            }
        };

        self.bus.publish(event);
    }
}

fn decode(encoded: &str) -> Option<Track> {
    Track::decode(encoded)
        .inspect_err(|e| debug!("Track no decodificable: {}", e))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::NodeConfig,
        model::GuildId,
        stats::Penalty,
        track::tests::track,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    const GUILD: GuildId = GuildId(42);

    #[derive(Default)]
    struct Recorder(parking_lot::Mutex<Vec<Event>>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            self.0.lock().push(event.clone());
            Ok(())
        }
    }

    async fn kinds(dispatcher: &Dispatcher, recorder: &Recorder) -> Vec<EventKind> {
        dispatcher.bus.flush().await;
        recorder.0.lock().iter().map(Event::kind).collect()
    }

    fn cluster(ids: &[&str]) -> (Cluster, Dispatcher, Arc<Recorder>) {
        let nodes = ids
            .iter()
            .map(|id| NodeConfig::new(*id, "localhost", 2333))
            .collect();
        let cluster = Cluster::new(ClusterConfig::new(1, nodes)).unwrap();
        let recorder = Arc::new(Recorder::default());
        cluster.register(None, recorder.clone());

        let dispatcher = Dispatcher {
            nodes: Arc::clone(cluster.nodes()),
            players: Arc::clone(cluster.players()),
            bus: Arc::clone(cluster.events()),
        };
        (cluster, dispatcher, recorder)
    }

    fn state(node: &str, previous: ConnectionState, state: ConnectionState) -> NodeSignal {
        NodeSignal::State {
            node: node.to_string(),
            previous,
            state,
            reason: Some("socket cerrado".to_string()),
        }
    }

    fn message(node: &str, raw: serde_json::Value) -> NodeSignal {
        NodeSignal::Message {
            node: node.to_string(),
            message: serde_json::from_value(raw).unwrap(),
        }
    }

    fn connect(cluster: &Cluster, id: &str) {
        cluster
            .nodes()
            .get_node(id)
            .unwrap()
            .set_state(ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_stale_stats_do_not_survive_reconnect() {
        let (cluster, dispatcher, _) = cluster(&["a"]);
        let node = cluster.nodes().get_node("a").unwrap();
        node.set_state(ConnectionState::Connected);
        node.set_state(ConnectionState::Disconnected);

        dispatcher
            .handle(state("a", ConnectionState::Connected, ConnectionState::Disconnected))
            .await;
        dispatcher
            .handle(message(
                "a",
                json!({
                    "op": "stats",
                    "players": 4,
                    "playingPlayers": 2,
                    "frameStats": {"sent": 3000, "nulled": 0, "deficit": 0}
                }),
            ))
            .await;

        node.set_state(ConnectionState::Connected);
        dispatcher
            .handle(state("a", ConnectionState::Reconnecting, ConnectionState::Connected))
            .await;

        assert_eq!(node.penalty(), Penalty::Unknown);
        assert!(node.stats().is_none());
    }

    #[tokio::test]
    async fn test_track_end_advances_only_for_finishing_reasons() {
        let (cluster, dispatcher, recorder) = cluster(&["a"]);
        connect(&cluster, "a");
        let players = cluster.players();
        let (uno, dos, tres) = (track("uno"), track("dos"), track("tres"));
        players.play(GUILD, uno.clone()).await.unwrap();
        players.play(GUILD, dos.clone()).await.unwrap();
        players.play(GUILD, tres).await.unwrap();

        let end = |track: &Track, reason: &str| {
            message(
                "a",
                json!({
                    "op": "event",
                    "type": "TrackEndEvent",
                    "guildId": GUILD.to_string(),
                    "track": track.encoded,
                    "reason": reason
                }),
            )
        };

        dispatcher.handle(end(&uno, "REPLACED")).await;
        assert_eq!(players.get(GUILD).await.unwrap().current, Some(uno.clone()));

        dispatcher.handle(end(&uno, "FINISHED")).await;
        assert_eq!(players.get(GUILD).await.unwrap().current, Some(dos.clone()));

        dispatcher.handle(end(&dos, "LOAD_FAILED")).await;
        assert_eq!(players.queue(GUILD).await.len(), 0);
        assert_eq!(
            kinds(&dispatcher, &recorder).await,
            vec![EventKind::TrackEnd, EventKind::TrackEnd, EventKind::TrackEnd]
        );
    }

    #[tokio::test]
    async fn test_track_exception_message_prefers_exception() {
        let (_cluster, dispatcher, recorder) = cluster(&["a"]);

        dispatcher
            .handle(message(
                "a",
                json!({
                    "op": "event",
                    "type": "TrackExceptionEvent",
                    "guildId": "42",
                    "track": "no-es-base64",
                    "exception": {"message": "video privado", "severity": "COMMON"},
                    "error": "viejo"
                }),
            ))
            .await;

        dispatcher.bus.flush().await;
        let events = recorder.0.lock();
        match &events[..] {
            [Event::TrackException {
                guild_id,
                track,
                message,
            }] => {
                assert_eq!(*guild_id, GUILD);
                assert!(track.is_none());
                assert_eq!(message, "video privado");
            }
            other => panic!("eventos inesperados: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lost_node_publishes_and_migrates_players() {
        let (cluster, dispatcher, recorder) = cluster(&["a", "b"]);
        connect(&cluster, "a");
        cluster.players().play(GUILD, track("uno")).await.unwrap();
        connect(&cluster, "b");

        let a = cluster.nodes().get_node("a").unwrap();
        a.set_state(ConnectionState::Disconnected);
        dispatcher
            .handle(state("a", ConnectionState::Connected, ConnectionState::Disconnected))
            .await;

        assert_eq!(
            kinds(&dispatcher, &recorder).await,
            vec![EventKind::NodeDisconnected, EventKind::NodeChanged]
        );
        assert_eq!(cluster.players().get(GUILD).await.unwrap().node_id, "b");

        // Un reintento fallido no vuelve a emitir la desconexión.
        dispatcher
            .handle(state("a", ConnectionState::Connecting, ConnectionState::Disconnected))
            .await;
        assert_eq!(kinds(&dispatcher, &recorder).await.len(), 2);
    }

    #[tokio::test]
    async fn test_reconnected_node_adopts_orphaned_players() {
        let (cluster, dispatcher, recorder) = cluster(&["a", "b"]);
        connect(&cluster, "a");
        cluster.players().play(GUILD, track("uno")).await.unwrap();

        let a = cluster.nodes().get_node("a").unwrap();
        a.set_state(ConnectionState::Disconnected);
        dispatcher
            .handle(state("a", ConnectionState::Connected, ConnectionState::Disconnected))
            .await;
        assert_eq!(cluster.players().get(GUILD).await.unwrap().node_id, "a");

        connect(&cluster, "b");
        dispatcher
            .handle(state("b", ConnectionState::Connecting, ConnectionState::Connected))
            .await;

        assert_eq!(cluster.players().get(GUILD).await.unwrap().node_id, "b");
        assert_eq!(
            kinds(&dispatcher, &recorder).await,
            vec![
                EventKind::NodeDisconnected,
                EventKind::NodeConnected,
                EventKind::NodeChanged
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_ops_are_ignored() {
        let (_cluster, dispatcher, recorder) = cluster(&["a"]);

        dispatcher
            .handle(message("a", json!({"op": "ready", "resumed": false})))
            .await;
        dispatcher
            .handle(message("a", json!({"op": "event", "type": "SegmentSkipped"})))
            .await;
        assert!(kinds(&dispatcher, &recorder).await.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(Cluster::new(ClusterConfig::new(1, Vec::new())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_nodes_and_evicts_players() {
        let mut config = ClusterConfig::new(1, vec![NodeConfig::new("a", "127.0.0.1", 1)]);
        config.backoff.base = Duration::from_millis(10);
        config.backoff.max = Duration::from_millis(10);
        let cluster = Cluster::new(config).unwrap();

        cluster.connect();
        cluster.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cluster.shutdown().await;
        assert_eq!(
            cluster.nodes().get_node("a").unwrap().state(),
            ConnectionState::Closed
        );
        assert!(cluster.players().is_empty());
        assert_eq!(cluster.events().handler_count(None), 0);
    }
}
