use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use super::ConnectionState;
use crate::{
    config::{NodeConfig, PenaltyWeights},
    error::{Error, Result},
    model::{GuildId, OutgoingMessage},
    stats::{NodeStats, Penalty},
};

#[derive(Debug, Default)]
struct Telemetry {
    stats: Option<NodeStats>,
    penalty: Penalty,
}

/// Un nodo Lavalink remoto.
///
/// Guarda el último snapshot de estadísticas, el estado de su conexión y los
/// guilds asignados. Los comandos salen por una cola que consume la tarea de
/// transporte del nodo.
#[derive(Debug)]
pub struct Node {
    index: usize,
    config: NodeConfig,
    weights: PenaltyWeights,
    state: RwLock<ConnectionState>,
    telemetry: RwLock<Telemetry>,
    guilds: Mutex<HashSet<GuildId>>,
    outbound: UnboundedSender<OutgoingMessage>,
    outbound_rx: Mutex<Option<UnboundedReceiver<OutgoingMessage>>>,
}

impl Node {
    pub(crate) fn new(index: usize, config: NodeConfig, weights: PenaltyWeights) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        Self {
            index,
            config,
            weights,
            state: RwLock::new(ConnectionState::Disconnected),
            telemetry: RwLock::new(Telemetry::default()),
            guilds: Mutex::new(HashSet::new()),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn region(&self) -> Option<&str> {
        self.config.region.as_deref()
    }

    /// Posición en la configuración; desempata la selección.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_available(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Cambia el estado y devuelve el anterior. Perder la conexión descarta
    /// la telemetría: tras reconectar el nodo vuelve a carga desconocida.
    pub(crate) fn set_state(&self, state: ConnectionState) -> ConnectionState {
        let mut current = self.state.write();
        let previous = std::mem::replace(&mut *current, state);

        if previous == ConnectionState::Connected && state != ConnectionState::Connected {
            *self.telemetry.write() = Telemetry::default();
        }

        previous
    }

    /// Guarda las stats del nodo. Se ignoran si el nodo no está conectado:
    /// pueden venir de una sesión que ya se cerró.
    pub fn update_stats(&self, stats: NodeStats) {
        let state = self.state.read();
        if *state != ConnectionState::Connected {
            trace!("Stats de {} ignoradas: nodo {:?}", self.identifier(), *state);
            return;
        }

        let penalty = Penalty::compute(&stats, &self.weights);
        trace!(
            "Stats de {}: {} players ({} activos), penalty {:?}",
            self.identifier(),
            stats.player_count,
            stats.playing_player_count,
            penalty.total()
        );

        *self.telemetry.write() = Telemetry {
            stats: Some(stats),
            penalty,
        };
    }

    /// Igual que [`Node::update_stats`] pero desde el JSON crudo del mensaje.
    pub fn update_stats_raw(&self, raw: &str) -> Result<()> {
        let stats: NodeStats = serde_json::from_str(raw)?;
        self.update_stats(stats);
        Ok(())
    }

    pub fn stats(&self) -> Option<NodeStats> {
        self.telemetry.read().stats.clone()
    }

    pub fn penalty(&self) -> Penalty {
        self.telemetry.read().penalty
    }

    /// Encola un comando para el nodo.
    ///
    /// Falla de inmediato con `NodeUnavailable` si el nodo no está conectado;
    /// no reintenta.
    pub fn send(&self, message: OutgoingMessage) -> Result<()> {
        if !self.is_available() {
            return Err(self.unavailable());
        }

        trace!("{} → {} ({})", message.op(), self.identifier(), message.guild_id());
        self.outbound.send(message).map_err(|_| self.unavailable())
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        let mut guilds: Vec<_> = self.guilds.lock().iter().copied().collect();
        guilds.sort_unstable();
        guilds
    }

    pub fn guild_count(&self) -> usize {
        self.guilds.lock().len()
    }

    pub fn has_guild(&self, guild_id: GuildId) -> bool {
        self.guilds.lock().contains(&guild_id)
    }

    pub(crate) fn add_guild(&self, guild_id: GuildId) {
        if self.guilds.lock().insert(guild_id) {
            debug!("Guild {} asignado al nodo {}", guild_id, self.identifier());
        }
    }

    pub(crate) fn remove_guild(&self, guild_id: GuildId) -> bool {
        self.guilds.lock().remove(&guild_id)
    }

    /// Entrega la cola de salida a la tarea de transporte. Solo una vez.
    pub(crate) fn take_outbound(&self) -> Option<UnboundedReceiver<OutgoingMessage>> {
        self.outbound_rx.lock().take()
    }

    fn unavailable(&self) -> Error {
        Error::NodeUnavailable {
            node: self.identifier().to_string(),
        }
    }
}
