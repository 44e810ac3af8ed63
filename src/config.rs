use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, time::Duration};

/// Conexión a un nodo Lavalink. No se recarga sin reconectar el nodo.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub region: Option<String>,
    pub identifier: String,
    #[serde(default)]
    pub secure: bool,
}

impl NodeConfig {
    pub fn new(identifier: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: "youshallnotpass".to_string(),
            region: None,
            identifier: identifier.into(),
            secure: false,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn websocket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Política de reconexión: el retardo se duplica desde `base` hasta `max`
/// y vuelve a `base` tras una conexión exitosa.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2,
        }
    }
}

/// Coeficientes de la penalización de nodos.
///
/// Solo el orden resultante importa para la selección; los valores por
/// defecto reproducen la curva clásica de los clientes Lavalink: el CPU y la
/// pérdida de frames crecen exponencialmente y pesan mucho más que el número
/// de players reproduciendo.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PenaltyWeights {
    pub player: f64,
    pub cpu_base: f64,
    pub cpu_scale: f64,
    pub frame_base: f64,
    /// Frames esperados por minuto (50 por segundo).
    pub frame_window: f64,
    pub null_frame_scale: f64,
    pub null_frame_multiplier: f64,
    pub deficit_frame_scale: f64,
}

impl Default for PenaltyWeights {
    fn default() -> Self {
        Self {
            player: 1.0,
            cpu_base: 1.05,
            cpu_scale: 10.0,
            frame_base: 1.03,
            frame_window: 3000.0,
            null_frame_scale: 300.0,
            null_frame_multiplier: 2.0,
            deficit_frame_scale: 600.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// ID de usuario del bot, enviado en el handshake.
    pub user_id: u64,
    pub num_shards: u64,
    pub client_name: String,
    pub nodes: Vec<NodeConfig>,
    pub backoff: BackoffConfig,
    /// Sin ningún mensaje del nodo durante esta ventana la conexión se da
    /// por muerta. Lavalink envía `stats` cada minuto.
    pub liveness_window: Duration,
    /// Tiempo máximo para completar el handshake WebSocket. Vencerlo cuenta
    /// como un intento fallido.
    pub connect_timeout: Duration,
    pub penalty: PenaltyWeights,
    pub default_volume: u16,
}

pub const MAX_VOLUME: u16 = 1000;

impl ClusterConfig {
    pub fn new(user_id: u64, nodes: Vec<NodeConfig>) -> Self {
        Self {
            user_id,
            nodes,
            ..Self::default()
        }
    }

    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let nodes = match std::env::var("LAVALINK_NODES") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str::<Vec<NodeConfig>>(&raw)
                .context("LAVALINK_NODES debe ser un array JSON de nodos")?,
            _ => vec![NodeConfig {
                host: std::env::var("LAVALINK_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: std::env::var("LAVALINK_PORT")
                    .unwrap_or_else(|_| "2333".to_string())
                    .parse()?,
                password: std::env::var("LAVALINK_PASSWORD")
                    .unwrap_or_else(|_| "youshallnotpass".to_string()),
                region: std::env::var("LAVALINK_REGION").ok(),
                identifier: std::env::var("LAVALINK_IDENTIFIER")
                    .unwrap_or_else(|_| "main".to_string()),
                secure: std::env::var("LAVALINK_SECURE")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()?,
            }],
        };

        let config = Self {
            user_id: std::env::var("BOT_USER_ID")
                .context("BOT_USER_ID es obligatorio")?
                .parse()?,
            num_shards: std::env::var("NUM_SHARDS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()?,
            client_name: std::env::var("CLIENT_NAME")
                .unwrap_or_else(|_| concat!("open-music-cluster/", env!("CARGO_PKG_VERSION")).to_string()),
            nodes,
            backoff: BackoffConfig {
                base: Duration::from_millis(
                    std::env::var("RECONNECT_BASE_MS")
                        .unwrap_or_else(|_| "1000".to_string())
                        .parse()?,
                ),
                max: Duration::from_millis(
                    std::env::var("RECONNECT_MAX_MS")
                        .unwrap_or_else(|_| "60000".to_string())
                        .parse()?,
                ),
                factor: 2,
            },
            liveness_window: Duration::from_secs(
                std::env::var("LIVENESS_WINDOW_SECS")
                    .unwrap_or_else(|_| "90".to_string())
                    .parse()?,
            ),
            connect_timeout: Duration::from_secs(
                std::env::var("CONNECT_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
            ),
            penalty: PenaltyWeights::default(),
            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - At least one node, with unique identifiers
    /// - Reconnect base delay must be non-zero and not above the maximum
    /// - Liveness window and connect timeout must be non-zero
    /// - Default volume must be between 0 and 1000
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("Se necesita al menos un nodo Lavalink");
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.identifier.trim().is_empty() {
                anyhow::bail!("El nodo {}:{} no tiene identificador", node.host, node.port);
            }
            if !seen.insert(node.identifier.as_str()) {
                anyhow::bail!("Identificador de nodo duplicado: {}", node.identifier);
            }
        }

        if self.backoff.base.is_zero() {
            anyhow::bail!("El retardo base de reconexión debe ser mayor que 0");
        }

        if self.backoff.base > self.backoff.max {
            anyhow::bail!(
                "El retardo base ({:?}) no puede superar al máximo ({:?})",
                self.backoff.base,
                self.backoff.max
            );
        }

        if self.backoff.factor < 1 {
            anyhow::bail!("El factor de backoff debe ser al menos 1");
        }

        if self.liveness_window.is_zero() {
            anyhow::bail!("La ventana de liveness debe ser mayor que 0");
        }

        if self.connect_timeout.is_zero() {
            anyhow::bail!("El timeout de conexión debe ser mayor que 0");
        }

        if self.default_volume > MAX_VOLUME {
            anyhow::bail!(
                "El volumen por defecto debe estar entre 0 y {}, recibido: {}",
                MAX_VOLUME,
                self.default_volume
            );
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes node passwords.
    pub fn summary(&self) -> String {
        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                format!(
                    "{}@{}:{} ({})",
                    n.identifier,
                    n.host,
                    n.port,
                    n.region.as_deref().unwrap_or("sin región")
                )
            })
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Cluster Summary:\n  \
            User: {} ({} shards)\n  \
            Nodes: {}\n  \
            Reconnect: {:?} → {:?}, liveness {:?}, timeout {:?}\n  \
            Default volume: {}",
            self.user_id,
            self.num_shards,
            nodes,
            self.backoff.base,
            self.backoff.max,
            self.liveness_window,
            self.connect_timeout,
            self.default_volume,
        )
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            user_id: 0,
            num_shards: 1,
            client_name: concat!("open-music-cluster/", env!("CARGO_PKG_VERSION")).to_string(),
            nodes: Vec::new(),
            backoff: BackoffConfig::default(),
            liveness_window: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            penalty: PenaltyWeights::default(),
            default_volume: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig::new(1, vec![NodeConfig::new("a", "localhost", 2333)])
    }

    #[test]
    fn test_default_config_with_node_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_and_duplicate_nodes() {
        let mut cfg = config();
        cfg.nodes.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.nodes.push(NodeConfig::new("a", "otherhost", 2333));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff_and_loud_volume() {
        let mut cfg = config();
        cfg.backoff.base = Duration::from_secs(120);
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.default_volume = MAX_VOLUME + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_connect_timeout() {
        let mut cfg = config();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));

        cfg.connect_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_websocket_url_and_summary_hide_password() {
        let mut node = NodeConfig::new("eu", "lava.example", 443)
            .with_password("secreto")
            .with_region("europe");
        node.secure = true;
        assert_eq!(node.websocket_url(), "wss://lava.example:443");

        let cfg = ClusterConfig::new(5, vec![node]);
        let summary = cfg.summary();
        assert!(summary.contains("eu@lava.example:443 (europe)"));
        assert!(!summary.contains("secreto"));
    }

    #[test]
    fn test_nodes_parse_from_json() {
        let raw = r#"[{"host":"h","port":1,"password":"p","identifier":"x","region":"us"}]"#;
        let nodes: Vec<NodeConfig> = serde_json::from_str(raw).unwrap();
        assert_eq!(nodes[0].region.as_deref(), Some("us"));
        assert!(!nodes[0].secure);
    }
}
