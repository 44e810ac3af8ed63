//! Module containing structs for connecting to Lavalink nodes and choosing
//! which node plays audio for each guild.

mod node;
mod node_manager;
pub(crate) mod transport;

pub use self::node::Node;
pub use self::node_manager::NodeManager;
pub use self::transport::{Backoff, ConnectionState};
