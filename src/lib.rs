//! Cliente de clúster Lavalink para Open Music.
//!
//! Mantiene una conexión websocket por nodo, elige el nodo menos cargado para
//! cada guild y migra los players cuando un nodo se cae.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod nodes;
pub mod player;
pub mod stats;
pub mod track;

pub use crate::client::Cluster;
pub use crate::config::{BackoffConfig, ClusterConfig, NodeConfig, PenaltyWeights};
pub use crate::error::{Error, Result};
pub use crate::events::{Event, EventBus, EventHandler, EventKind};
pub use crate::model::GuildId;
pub use crate::nodes::{ConnectionState, Node, NodeManager};
pub use crate::player::{MigrationReport, Player, PlayerControl, PlayerManager};
pub use crate::stats::{NodeStats, Penalty};
pub use crate::track::{format_time, parse_time, TimeParts, Track};
