use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Player, PlayerControl};
use crate::{
    config::MAX_VOLUME,
    error::{Error, Result},
    events::{Event, EventBus},
    model::{GuildId, OutgoingMessage, PlayerState, VoiceUpdate},
    nodes::{Node, NodeManager},
    track::Track,
};

type Slot = Arc<Mutex<Player>>;

/// Resultado de migrar todos los guilds de un nodo caído.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    pub attempted: usize,
    /// Guild y nodo nuevo.
    pub moved: Vec<(GuildId, String)>,
    pub failed: Vec<GuildId>,
}

/// Registro guild → player y enrutamiento de comandos hacia el nodo dueño.
///
/// Los comandos son fire-and-forget: el estado local se actualiza en cuanto
/// el nodo acepta el mensaje en su cola, nunca antes. Si el nodo no está
/// disponible el player se migra al mejor nodo y el comando se reintenta
/// allí una vez.
pub struct PlayerManager {
    players: DashMap<GuildId, Slot>,
    nodes: Arc<NodeManager>,
    bus: Arc<EventBus>,
    default_volume: u16,
}

impl PlayerManager {
    pub fn new(nodes: Arc<NodeManager>, bus: Arc<EventBus>, default_volume: u16) -> Self {
        Self {
            players: DashMap::new(),
            nodes,
            bus,
            default_volume: default_volume.min(MAX_VOLUME),
        }
    }

    /// Devuelve el player del guild, creándolo en el mejor nodo si no existe.
    pub async fn get_or_create(&self, guild_id: GuildId) -> Result<Player> {
        let slot = self.slot_or_create(guild_id, None)?;
        let player = slot.lock().await;
        Ok(player.clone())
    }

    /// Igual que [`PlayerManager::get_or_create`], prefiriendo nodos de la
    /// región indicada.
    pub async fn get_or_create_in(&self, guild_id: GuildId, region: &str) -> Result<Player> {
        let slot = self.slot_or_create(guild_id, Some(region))?;
        let player = slot.lock().await;
        Ok(player.clone())
    }

    pub async fn get(&self, guild_id: GuildId) -> Option<Player> {
        let slot = self.existing(guild_id)?;
        let player = slot.lock().await;
        Some(player.clone())
    }

    pub async fn queue(&self, guild_id: GuildId) -> Vec<Track> {
        match self.existing(guild_id) {
            Some(slot) => slot.lock().await.queue.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.players.contains_key(&guild_id)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        let mut guilds: Vec<_> = self.players.iter().map(|entry| *entry.key()).collect();
        guilds.sort_unstable();
        guilds
    }

    /// Reenvía al nodo el evento de servidor de voz del guild. Se guarda para
    /// reenviarlo en cada migración.
    pub async fn voice_update(
        &self,
        guild_id: GuildId,
        session_id: impl Into<String>,
        event: Value,
    ) -> Result<()> {
        let slot = self.slot_or_create(guild_id, None)?;
        let voice = VoiceUpdate {
            session_id: session_id.into(),
            event,
        };

        let mut events = Vec::new();
        let result = {
            let mut player = slot.lock().await;
            let message = OutgoingMessage::VoiceUpdate {
                guild_id,
                session_id: voice.session_id.clone(),
                event: voice.event.clone(),
            };
            self.dispatch(&mut player, message, &mut events)
                .map(|()| player.voice = Some(voice))
        };

        self.publish_all(events);
        result
    }

    /// Reproduce el track si no hay nada sonando; si no, lo agrega al final
    /// de la cola.
    pub async fn play(&self, guild_id: GuildId, track: Track) -> Result<()> {
        let slot = self.slot_or_create(guild_id, None)?;

        let mut events = Vec::new();
        let result = {
            let mut player = slot.lock().await;
            if player.current.is_some() {
                info!("➕ Agregado a la cola de {}: {}", guild_id, track.title);
                player.queue.push_back(track);
                Ok(())
            } else {
                self.start_track(&mut player, track, &mut events)
            }
        };

        self.publish_all(events);
        result
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<()> {
        self.set_paused(guild_id, true).await
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<()> {
        self.set_paused(guild_id, false).await
    }

    pub async fn seek(&self, guild_id: GuildId, position: Duration) -> Result<()> {
        let slot = self.slot(guild_id)?;

        let mut events = Vec::new();
        let result = {
            let mut player = slot.lock().await;
            let track = player
                .current
                .clone()
                .ok_or(Error::NothingPlaying(guild_id))?;
            if !track.is_seekable {
                return Err(Error::NotSeekable);
            }

            let position = (position.as_millis() as u64).min(track.duration_ms);
            let message = OutgoingMessage::Seek { guild_id, position };
            self.dispatch(&mut player, message, &mut events)
                .map(|()| player.set_position(position))
        };

        self.publish_all(events);
        result
    }

    pub async fn set_volume(&self, guild_id: GuildId, volume: u16) -> Result<()> {
        let slot = self.slot(guild_id)?;
        let volume = volume.min(MAX_VOLUME);

        let mut events = Vec::new();
        let result = {
            let mut player = slot.lock().await;
            let message = OutgoingMessage::Volume { guild_id, volume };
            self.dispatch(&mut player, message, &mut events)
                .map(|()| player.volume = volume)
        };

        self.publish_all(events);
        if result.is_ok() {
            debug!("🔊 Volumen de {} ajustado a {}", guild_id, volume);
        }
        result
    }

    /// Detiene el track actual y deja la cola intacta. Sin player, no hace
    /// nada.
    pub async fn stop(&self, guild_id: GuildId) -> Result<()> {
        let Some(slot) = self.existing(guild_id) else {
            return Ok(());
        };

        let mut player = slot.lock().await;
        if player.current.is_none() {
            return Ok(());
        }

        // Un nodo caído ya no está reproduciendo nada.
        self.send_or_skip(&player, OutgoingMessage::Stop { guild_id })?;
        player.current = None;
        player.paused = false;
        player.set_position(0);
        info!("⏹️ Reproducción detenida en {}", guild_id);

        Ok(())
    }

    /// Elimina el player y libera su guild del nodo. Sin player, no hace nada.
    pub async fn destroy(&self, guild_id: GuildId) -> Result<()> {
        let Some((_, slot)) = self.players.remove(&guild_id) else {
            return Ok(());
        };

        let player = slot.lock().await;
        if let Some(node) = self.nodes.get_node(&player.node_id) {
            if let Err(e) = self.send_or_skip(&player, OutgoingMessage::Destroy { guild_id }) {
                warn!("No se pudo destruir el player de {} en {}: {}", guild_id, node.identifier(), e);
            }
            self.nodes.release(guild_id, &node);
        }

        info!("🗑️ Player de {} destruido", guild_id);
        Ok(())
    }

    /// Salta al siguiente track de la cola. Con la cola vacía detiene la
    /// reproducción y emite `QueueEnd`.
    pub async fn skip(&self, guild_id: GuildId) -> Result<Option<Track>> {
        let slot = self.slot(guild_id)?;

        let mut events = Vec::new();
        let result = {
            let mut player = slot.lock().await;
            match player.queue.pop_front() {
                Some(next) => match self.start_track(&mut player, next.clone(), &mut events) {
                    Ok(()) => Ok(Some(next)),
                    Err(e) => {
                        player.queue.push_front(next);
                        Err(e)
                    }
                },
                None => {
                    if player.current.is_some() {
                        self.send_or_skip(&player, OutgoingMessage::Stop { guild_id })?;
                        player.current = None;
                        player.paused = false;
                        player.set_position(0);
                    }
                    events.push(Event::QueueEnd { guild_id });
                    Ok(None)
                }
            }
        };

        self.publish_all(events);
        result
    }

    /// Avanza la cola tras el final del track actual.
    ///
    /// Con la cola vacía emite `QueueEnd`; si no, reproduce el siguiente.
    pub async fn on_track_end(&self, guild_id: GuildId) -> Result<Option<Track>> {
        let slot = self.slot(guild_id)?;

        let mut events = Vec::new();
        let result = {
            let mut player = slot.lock().await;
            self.advance(&mut player, &mut events)
        };

        self.publish_all(events);
        result
    }

    /// Final de track reportado por un nodo. Se ignora si el nodo ya no es el
    /// dueño del guild o si el track no es el actual.
    pub(crate) async fn track_ended(
        &self,
        node_id: &str,
        guild_id: GuildId,
        encoded: &str,
    ) -> Result<Option<Track>> {
        let Some(slot) = self.existing(guild_id) else {
            return Ok(None);
        };

        let mut events = Vec::new();
        let result = {
            let mut player = slot.lock().await;
            let current = player.current.as_ref().map(|t| t.encoded.as_str());
            if player.node_id != node_id || current != Some(encoded) {
                debug!(
                    "Ignorando fin de track obsoleto de {} para {}",
                    node_id, guild_id
                );
                return Ok(None);
            }
            self.advance(&mut player, &mut events)
        };

        self.publish_all(events);
        result
    }

    pub(crate) async fn update_state(&self, node_id: &str, guild_id: GuildId, state: PlayerState) {
        let Some(slot) = self.existing(guild_id) else {
            return;
        };

        let mut player = slot.lock().await;
        if player.node_id == node_id {
            player.apply_state(state);
        }
    }

    /// Migra el player del guild fuera de `from`. Si ya estaba en otro nodo
    /// devuelve ese nodo sin tocar nada.
    pub async fn migrate(&self, guild_id: GuildId, from: &str) -> Result<String> {
        let Some(slot) = self.existing(guild_id) else {
            if let Some(node) = self.nodes.get_node(from) {
                self.nodes.release(guild_id, &node);
            }
            return Err(Error::PlayerNotFound(guild_id));
        };

        let mut events = Vec::new();
        let result = {
            let mut player = slot.lock().await;
            if player.node_id != from {
                Ok(player.node_id.clone())
            } else {
                match self.migrate_locked(&mut player, &mut events) {
                    Ok(node) => Ok(node.identifier().to_string()),
                    Err(e) => {
                        // Sigue apuntando al nodo caído hasta que haya otro.
                        player.freeze();
                        player.connected = false;
                        Err(e)
                    }
                }
            }
        };

        self.publish_all(events);
        result
    }

    /// Un intento de migración por cada guild asignado al nodo.
    pub async fn migrate_from(&self, node_id: &str) -> MigrationReport {
        let Some(node) = self.nodes.get_node(node_id) else {
            return MigrationReport::default();
        };

        let guilds = node.guilds();
        let mut report = MigrationReport {
            attempted: guilds.len(),
            ..MigrationReport::default()
        };

        for guild_id in guilds {
            match self.migrate(guild_id, node_id).await {
                Ok(new_node) => report.moved.push((guild_id, new_node)),
                Err(e) => {
                    warn!("No se pudo migrar el guild {} desde {}: {}", guild_id, node_id, e);
                    report.failed.push(guild_id);
                }
            }
        }

        if report.attempted > 0 {
            info!(
                "🔀 Nodo {} caído: {} migrados, {} sin nodo",
                node_id,
                report.moved.len(),
                report.failed.len()
            );
        }

        report
    }

    /// Reconstruye en un nodo recién reconectado los players que siguieron
    /// asignados a él. Devuelve cuántos se restauraron.
    pub async fn restore_on(&self, node_id: &str) -> usize {
        let Some(node) = self.nodes.get_node(node_id) else {
            return 0;
        };

        let mut restored = 0;
        for guild_id in node.guilds() {
            let Some(slot) = self.existing(guild_id) else {
                self.nodes.release(guild_id, &node);
                continue;
            };

            let mut events = Vec::new();
            {
                let mut player = slot.lock().await;
                if player.node_id != node_id {
                    continue;
                }

                for message in player.replay_messages() {
                    if let Err(e) = node.send(message) {
                        warn!("No se pudo restaurar {} en {}: {}", guild_id, node_id, e);
                    }
                }
                let position = player.estimated_position();
                player.set_position(position);

                if player.current.is_none() && !player.queue.is_empty() {
                    if let Err(e) = self.advance(&mut player, &mut events) {
                        warn!("No se pudo reanudar la cola de {}: {}", guild_id, e);
                    }
                }
                restored += 1;
            }
            self.publish_all(events);
        }

        if restored > 0 {
            info!("♻️ {} players restaurados en el nodo {}", restored, node_id);
        }
        restored
    }

    /// Quita todos los players y libera sus guilds. Se usa al apagar.
    pub async fn clear(&self) {
        let guilds = self.guilds();
        for guild_id in guilds {
            if let Some((_, slot)) = self.players.remove(&guild_id) {
                let player = slot.lock().await;
                if let Some(node) = self.nodes.get_node(&player.node_id) {
                    self.nodes.release(guild_id, &node);
                }
            }
        }
    }

    fn existing(&self, guild_id: GuildId) -> Option<Slot> {
        self.players
            .get(&guild_id)
            .map(|slot| Arc::clone(slot.value()))
    }

    fn slot(&self, guild_id: GuildId) -> Result<Slot> {
        self.existing(guild_id)
            .ok_or(Error::PlayerNotFound(guild_id))
    }

    fn slot_or_create(&self, guild_id: GuildId, region: Option<&str>) -> Result<Slot> {
        if let Some(slot) = self.existing(guild_id) {
            return Ok(slot);
        }

        match self.players.entry(guild_id) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let node = self.nodes.assign_in(guild_id, region)?;
                info!("🎛️ Player creado para {} en el nodo {}", guild_id, node.identifier());

                let mut player = Player::new(guild_id, node.identifier(), self.default_volume);
                player.region = region.map(str::to_string);

                let slot = Arc::new(Mutex::new(player));
                entry.insert(Arc::clone(&slot));
                Ok(slot)
            }
        }
    }

    async fn set_paused(&self, guild_id: GuildId, pause: bool) -> Result<()> {
        let slot = self.slot(guild_id)?;

        let mut events = Vec::new();
        let result = {
            let mut player = slot.lock().await;
            let message = OutgoingMessage::Pause { guild_id, pause };
            self.dispatch(&mut player, message, &mut events).map(|()| {
                let position = player.estimated_position();
                player.paused = pause;
                player.set_position(position);
            })
        };

        self.publish_all(events);
        if result.is_ok() {
            debug!("{} {}", if pause { "⏸️ Pausado" } else { "▶️ Reanudado" }, guild_id);
        }
        result
    }

    fn start_track(&self, player: &mut Player, track: Track, events: &mut Vec<Event>) -> Result<()> {
        let message = player.play_message(&track, None, false);
        self.dispatch(player, message, events)?;

        info!("🎵 Reproduciendo en {}: {}", player.guild_id, track.title);
        player.current = Some(track);
        player.paused = false;
        player.set_position(0);
        Ok(())
    }

    fn advance(&self, player: &mut Player, events: &mut Vec<Event>) -> Result<Option<Track>> {
        player.current = None;
        player.paused = false;
        player.set_position(0);

        match player.queue.pop_front() {
            Some(next) => match self.start_track(player, next.clone(), events) {
                Ok(()) => Ok(Some(next)),
                Err(e) => {
                    player.queue.push_front(next);
                    Err(e)
                }
            },
            None => {
                debug!("Cola vacía para guild {}", player.guild_id);
                events.push(Event::QueueEnd {
                    guild_id: player.guild_id,
                });
                Ok(None)
            }
        }
    }

    /// Envía al nodo del player; si no está disponible, migra y reintenta
    /// una vez en el nodo nuevo.
    fn dispatch(
        &self,
        player: &mut Player,
        message: OutgoingMessage,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        match self.current_node(player)?.send(message.clone()) {
            Err(Error::NodeUnavailable { node }) => {
                warn!(
                    "Nodo {} no disponible para {}, migrando player",
                    node, player.guild_id
                );
                match self.migrate_locked(player, events) {
                    Ok(new_node) => new_node.send(message),
                    Err(Error::NoAvailableNodes) => Err(Error::NodeUnavailable { node }),
                    Err(e) => Err(e),
                }
            }
            other => other,
        }
    }

    fn send_or_skip(&self, player: &Player, message: OutgoingMessage) -> Result<()> {
        match self.current_node(player)?.send(message) {
            Ok(()) | Err(Error::NodeUnavailable { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn current_node(&self, player: &Player) -> Result<Arc<Node>> {
        self.nodes
            .get_node(&player.node_id)
            .ok_or_else(|| Error::UnknownNode(player.node_id.clone()))
    }

    fn migrate_locked(&self, player: &mut Player, events: &mut Vec<Event>) -> Result<Arc<Node>> {
        let guild_id = player.guild_id;
        let old_node = player.node_id.clone();
        let new_node = self.nodes.assign_in(guild_id, player.region.as_deref())?;

        if new_node.identifier() != old_node {
            if let Some(old) = self.nodes.get_node(&old_node) {
                self.nodes.release(guild_id, &old);
            }
        }

        let replay = player.replay_messages();
        let position = player.estimated_position();
        player.node_id = new_node.identifier().to_string();
        player.set_position(position);

        for message in replay {
            if let Err(e) = new_node.send(message) {
                warn!("Fallo al reconstruir {} en {}: {}", guild_id, new_node.identifier(), e);
            }
        }

        if new_node.identifier() != old_node {
            info!(
                "🔀 Guild {} migrado de {} a {}",
                guild_id,
                old_node,
                new_node.identifier()
            );
            events.push(Event::NodeChanged {
                guild_id,
                old_node,
                new_node: new_node.identifier().to_string(),
            });
        }

        Ok(new_node)
    }

    fn publish_all(&self, events: Vec<Event>) {
        for event in events {
            self.bus.publish(event);
        }
    }
}

#[async_trait]
impl PlayerControl for PlayerManager {
    async fn play(&self, guild_id: GuildId, track: Track) -> Result<()> {
        PlayerManager::play(self, guild_id, track).await
    }

    async fn pause(&self, guild_id: GuildId) -> Result<()> {
        PlayerManager::pause(self, guild_id).await
    }

    async fn resume(&self, guild_id: GuildId) -> Result<()> {
        PlayerManager::resume(self, guild_id).await
    }

    async fn seek(&self, guild_id: GuildId, position: Duration) -> Result<()> {
        PlayerManager::seek(self, guild_id, position).await
    }

    async fn set_volume(&self, guild_id: GuildId, volume: u16) -> Result<()> {
        PlayerManager::set_volume(self, guild_id, volume).await
    }

    async fn stop(&self, guild_id: GuildId) -> Result<()> {
        PlayerManager::stop(self, guild_id).await
    }
}
