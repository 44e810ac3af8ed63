//! Estado de reproducción por guild.
//!
//! [`PlayerManager`] es el dueño de todos los [`Player`] y el único que los
//! muta; cada player se protege con su propio mutex para que un avance de
//! cola y un `stop` concurrentes no se pisen.

mod manager;

pub use self::manager::{MigrationReport, PlayerManager};

use async_trait::async_trait;
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

use crate::{
    error::Result,
    model::{GuildId, OutgoingMessage, PlayerState, VoiceUpdate},
    track::Track,
};

/// Operaciones de reproducción que expone el clúster a la capa de comandos.
///
/// [`PlayerManager`] la implementa directamente; otra implementación puede
/// envolverla para agregar comportamiento propio.
#[async_trait]
pub trait PlayerControl: Send + Sync {
    async fn play(&self, guild_id: GuildId, track: Track) -> Result<()>;
    async fn pause(&self, guild_id: GuildId) -> Result<()>;
    async fn resume(&self, guild_id: GuildId) -> Result<()>;
    async fn seek(&self, guild_id: GuildId, position: Duration) -> Result<()>;
    async fn set_volume(&self, guild_id: GuildId, volume: u16) -> Result<()>;
    async fn stop(&self, guild_id: GuildId) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub guild_id: GuildId,
    /// Nodo que produce el audio de este guild.
    pub node_id: String,
    /// Región preferida al elegir nodo, también al migrar.
    pub region: Option<String>,
    pub current: Option<Track>,
    pub queue: VecDeque<Track>,
    pub volume: u16,
    pub paused: bool,
    /// Última posición conocida en milisegundos.
    pub position_ms: u64,
    /// Timestamp del nodo del último `playerUpdate`.
    pub node_time: i64,
    pub connected: bool,
    pub voice: Option<VoiceUpdate>,
    last_update: Option<Instant>,
}

impl Player {
    pub(crate) fn new(guild_id: GuildId, node_id: impl Into<String>, volume: u16) -> Self {
        Self {
            guild_id,
            node_id: node_id.into(),
            region: None,
            current: None,
            queue: VecDeque::new(),
            volume,
            paused: false,
            position_ms: 0,
            node_time: 0,
            connected: false,
            voice: None,
            last_update: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some() && !self.paused
    }

    /// Posición estimada: la última reportada más lo transcurrido desde
    /// entonces si el track sigue sonando, sin pasar de su duración.
    pub fn estimated_position(&self) -> u64 {
        let Some(track) = &self.current else {
            return 0;
        };

        let elapsed = match self.last_update {
            Some(at) if !self.paused => at.elapsed().as_millis() as u64,
            _ => 0,
        };

        let position = self.position_ms.saturating_add(elapsed);
        if track.is_stream {
            position
        } else {
            position.min(track.duration_ms)
        }
    }

    pub(crate) fn apply_state(&mut self, state: PlayerState) {
        self.position_ms = state.position.unwrap_or(0).max(0) as u64;
        self.node_time = state.time;
        self.connected = state.connected;
        self.last_update = Some(Instant::now());
    }

    pub(crate) fn set_position(&mut self, position_ms: u64) {
        self.position_ms = position_ms;
        self.last_update = Some(Instant::now());
    }

    /// Congela la posición estimada: deja de avanzar hasta el próximo
    /// `set_position` o `playerUpdate`.
    pub(crate) fn freeze(&mut self) {
        self.position_ms = self.estimated_position();
        self.last_update = None;
    }

    pub(crate) fn play_message(
        &self,
        track: &Track,
        start_time: Option<u64>,
        pause: bool,
    ) -> OutgoingMessage {
        OutgoingMessage::Play {
            guild_id: self.guild_id,
            track: track.encoded.clone(),
            start_time,
            end_time: None,
            no_replace: false,
            pause,
            volume: Some(self.volume),
        }
    }

    /// Comandos para reconstruir este player en un nodo que no lo conoce.
    ///
    /// El track se vuelve a emitir como un `play` nuevo: el estado de
    /// reproducción no sobrevive entre nodos.
    pub(crate) fn replay_messages(&self) -> Vec<OutgoingMessage> {
        let mut messages = Vec::new();

        if let Some(voice) = &self.voice {
            messages.push(OutgoingMessage::VoiceUpdate {
                guild_id: self.guild_id,
                session_id: voice.session_id.clone(),
                event: voice.event.clone(),
            });
        }

        match &self.current {
            Some(track) => {
                let position = self.estimated_position();
                let start = (track.is_seekable && position > 0).then_some(position);
                messages.push(self.play_message(track, start, self.paused));
            }
            None => messages.push(OutgoingMessage::Volume {
                guild_id: self.guild_id,
                volume: self.volume,
            }),
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::tests::track;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_estimated_position_advances_only_while_playing() {
        let mut player = Player::new(GuildId(1), "a", 100);
        player.current = Some(track("uno"));
        player.apply_state(PlayerState {
            time: 0,
            position: Some(1_000),
            connected: true,
        });

        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert_eq!(player.estimated_position(), 3_500);

        player.paused = true;
        assert_eq!(player.estimated_position(), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimated_position_is_capped_by_duration() {
        let mut player = Player::new(GuildId(1), "a", 100);
        player.current = Some(track("uno"));
        player.set_position(179_000);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(player.estimated_position(), 180_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frozen_position_stops_advancing() {
        let mut player = Player::new(GuildId(1), "a", 100);
        player.current = Some(track("uno"));
        player.set_position(10_000);

        tokio::time::advance(Duration::from_secs(5)).await;
        player.freeze();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(player.estimated_position(), 15_000);
    }

    #[test]
    fn test_replay_sends_voice_then_track_at_position() {
        let mut player = Player::new(GuildId(3), "a", 80);
        let current = track("uno");
        player.current = Some(current.clone());
        player.paused = true;
        player.position_ms = 42_000;
        player.voice = Some(VoiceUpdate {
            session_id: "s".to_string(),
            event: json!({"endpoint": "e"}),
        });

        let messages = player.replay_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].op(), "voiceUpdate");
        assert_eq!(
            messages[1],
            OutgoingMessage::Play {
                guild_id: GuildId(3),
                track: current.encoded,
                start_time: Some(42_000),
                end_time: None,
                no_replace: false,
                pause: true,
                volume: Some(80),
            }
        );
    }

    #[test]
    fn test_replay_without_track_restores_volume() {
        let player = Player::new(GuildId(3), "a", 55);
        assert_eq!(
            player.replay_messages(),
            vec![OutgoingMessage::Volume {
                guild_id: GuildId(3),
                volume: 55
            }]
        );
    }
}
