//! Modelos del protocolo WebSocket de Lavalink.
//!
//! Todos los mensajes son JSON con un campo `op`. Los salientes son comandos
//! de reproducción (fire-and-forget); los entrantes son estadísticas,
//! actualizaciones de player y eventos de track.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::{fmt, str::FromStr};

use crate::stats::NodeStats;

/// ID de un guild de Discord. En el cable viaja como string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GuildId(pub u64);

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for GuildId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl FromStr for GuildId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl Serialize for GuildId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for GuildId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct GuildIdVisitor;

        impl de::Visitor<'_> for GuildIdVisitor {
            type Value = GuildId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("un guild id como string o número")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<GuildId, E> {
                Ok(GuildId(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<GuildId, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(GuildIdVisitor)
    }
}

/// Payload de voz que Discord entrega al bot y que el nodo necesita para
/// conectarse al canal de voz del guild.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceUpdate {
    pub session_id: String,
    pub event: Value,
}

/// Mensajes cliente → nodo.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutgoingMessage {
    #[serde(rename_all = "camelCase")]
    Play {
        guild_id: GuildId,
        track: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        no_replace: bool,
        pause: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<u16>,
    },
    #[serde(rename_all = "camelCase")]
    Stop { guild_id: GuildId },
    #[serde(rename_all = "camelCase")]
    Pause { guild_id: GuildId, pause: bool },
    #[serde(rename_all = "camelCase")]
    Seek { guild_id: GuildId, position: u64 },
    #[serde(rename_all = "camelCase")]
    Volume { guild_id: GuildId, volume: u16 },
    #[serde(rename_all = "camelCase")]
    VoiceUpdate {
        guild_id: GuildId,
        session_id: String,
        event: Value,
    },
    #[serde(rename_all = "camelCase")]
    Destroy { guild_id: GuildId },
}

impl OutgoingMessage {
    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::Play { guild_id, .. }
            | Self::Stop { guild_id }
            | Self::Pause { guild_id, .. }
            | Self::Seek { guild_id, .. }
            | Self::Volume { guild_id, .. }
            | Self::VoiceUpdate { guild_id, .. }
            | Self::Destroy { guild_id } => *guild_id,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Self::Play { .. } => "play",
            Self::Stop { .. } => "stop",
            Self::Pause { .. } => "pause",
            Self::Seek { .. } => "seek",
            Self::Volume { .. } => "volume",
            Self::VoiceUpdate { .. } => "voiceUpdate",
            Self::Destroy { .. } => "destroy",
        }
    }
}

/// Mensajes nodo → cliente.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Stats(NodeStats),
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        guild_id: GuildId,
        state: PlayerState,
    },
    Event(NodeEvent),
    #[serde(other)]
    Unknown,
}

/// Estado que el nodo reporta periódicamente para un player.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct PlayerState {
    /// Timestamp Unix en milisegundos del reporte.
    pub time: i64,
    /// Posición en milisegundos; ausente si no hay track.
    pub position: Option<i64>,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Solo un final natural o un fallo de carga avanzan la cola.
    pub fn may_start_next(self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: String,
    pub cause: Option<String>,
}

/// Eventos de track que el nodo envía con `op: "event"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum NodeEvent {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { guild_id: GuildId, track: String },
    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: GuildId,
        track: String,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: GuildId,
        track: String,
        #[serde(default)]
        exception: Option<TrackException>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        guild_id: GuildId,
        track: String,
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        guild_id: GuildId,
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
    #[serde(other)]
    Unknown,
}
