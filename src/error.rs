use thiserror::Error;

use crate::model::GuildId;

/// Errores del cliente de clúster.
///
/// Los errores de conexión se recuperan dentro del transporte y nunca llegan
/// a quien usa la API de reproducción; los de comando sí se devuelven tipados.
#[derive(Debug, Error)]
pub enum Error {
    #[error("error de conexión: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("el handshake no terminó en {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("el nodo {node} no está conectado")]
    NodeUnavailable { node: String },

    #[error("no hay nodos disponibles")]
    NoAvailableNodes,

    #[error("track inválido: {0}")]
    InvalidTrack(String),

    #[error("no existe player para el guild {0}")]
    PlayerNotFound(GuildId),

    #[error("no hay nada reproduciéndose en el guild {0}")]
    NothingPlaying(GuildId),

    #[error("el track actual no permite seek")]
    NotSeekable,

    #[error("nodo desconocido: {0}")]
    UnknownNode(String),

    #[error("error de JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
