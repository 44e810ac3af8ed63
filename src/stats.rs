use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::PenaltyWeights;

/// Estadísticas de frames del último minuto. Ausentes si el nodo no tiene
/// players activos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// Snapshot de la telemetría de un nodo. Cada mensaje `stats` reemplaza al
/// anterior por completo.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "StatsPayload", into = "StatsPayload")]
pub struct NodeStats {
    pub player_count: u32,
    pub playing_player_count: u32,
    pub uptime_ms: u64,
    pub cpu_cores: u32,
    pub cpu_system_load: f64,
    pub cpu_lavalink_load: f64,
    pub memory_used: u64,
    pub memory_free: u64,
    pub memory_allocated: u64,
    pub memory_reservable: u64,
    pub frames: Option<FrameStats>,
}

// Forma anidada que usa el nodo en el cable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsPayload {
    #[serde(default)]
    players: u32,
    #[serde(default)]
    playing_players: u32,
    #[serde(default)]
    uptime: u64,
    #[serde(default)]
    memory: MemoryPayload,
    #[serde(default)]
    cpu: CpuPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
struct MemoryPayload {
    free: u64,
    used: u64,
    allocated: u64,
    reservable: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CpuPayload {
    cores: u32,
    system_load: f64,
    lavalink_load: f64,
}

impl From<StatsPayload> for NodeStats {
    fn from(raw: StatsPayload) -> Self {
        Self {
            player_count: raw.players,
            playing_player_count: raw.playing_players,
            uptime_ms: raw.uptime,
            cpu_cores: raw.cpu.cores,
            cpu_system_load: raw.cpu.system_load,
            cpu_lavalink_load: raw.cpu.lavalink_load,
            memory_used: raw.memory.used,
            memory_free: raw.memory.free,
            memory_allocated: raw.memory.allocated,
            memory_reservable: raw.memory.reservable,
            frames: raw.frame_stats,
        }
    }
}

impl From<NodeStats> for StatsPayload {
    fn from(stats: NodeStats) -> Self {
        Self {
            players: stats.player_count,
            playing_players: stats.playing_player_count,
            uptime: stats.uptime_ms,
            memory: MemoryPayload {
                free: stats.memory_free,
                used: stats.memory_used,
                allocated: stats.memory_allocated,
                reservable: stats.memory_reservable,
            },
            cpu: CpuPayload {
                cores: stats.cpu_cores,
                system_load: stats.cpu_system_load,
                lavalink_load: stats.cpu_lavalink_load,
            },
            frame_stats: stats.frames,
        }
    }
}

/// Componentes de la penalización de un nodo con telemetría.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PenaltyBreakdown {
    pub players: f64,
    pub cpu: f64,
    pub null_frames: f64,
    pub deficit_frames: f64,
}

impl PenaltyBreakdown {
    pub fn total(&self) -> f64 {
        self.players + self.cpu + self.null_frames + self.deficit_frames
    }
}

/// Puntuación de carga de un nodo; menor es mejor.
///
/// `Unknown` corresponde a un nodo recién conectado que aún no envió `stats`:
/// siempre queda detrás de cualquier nodo medido.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Penalty {
    Measured(PenaltyBreakdown),
    #[default]
    Unknown,
}

impl Penalty {
    /// Función pura del snapshot: mismo `NodeStats` y mismos pesos dan
    /// siempre el mismo valor.
    pub fn compute(stats: &NodeStats, weights: &PenaltyWeights) -> Self {
        let players = weights.player * f64::from(stats.playing_player_count);
        let cpu = weights.cpu_base.powf(100.0 * stats.cpu_system_load.max(0.0)) * weights.cpu_scale
            - weights.cpu_scale;

        let (null_frames, deficit_frames) = match stats.frames {
            Some(frames) => {
                let nulled = frame_curve(frames.nulled, weights, weights.null_frame_scale)
                    * weights.null_frame_multiplier;
                let deficit = frame_curve(frames.deficit, weights, weights.deficit_frame_scale);
                (nulled, deficit)
            }
            None => (0.0, 0.0),
        };

        Self::Measured(PenaltyBreakdown {
            players,
            cpu,
            null_frames,
            deficit_frames,
        })
    }

    pub fn total(&self) -> Option<f64> {
        match self {
            Self::Measured(breakdown) => Some(breakdown.total()),
            Self::Unknown => None,
        }
    }

    /// Orden total: medidos por valor ascendente, `Unknown` al final.
    pub fn rank(&self, other: &Self) -> Ordering {
        match (self.total(), other.total()) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

// Los nodos reportan -1 cuando no hay datos de frames.
fn frame_curve(frames: i64, weights: &PenaltyWeights, scale: f64) -> f64 {
    if frames <= 0 {
        return 0.0;
    }
    let ratio = frames as f64 / weights.frame_window;
    weights.frame_base.powf(500.0 * ratio) * scale - scale
}
