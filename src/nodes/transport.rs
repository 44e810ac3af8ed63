//! Conexión WebSocket persistente con un nodo.
//!
//! Cada nodo tiene su propia tarea que conecta, lee y escribe mensajes, y
//! reconecta con backoff exponencial hasta que el clúster se apaga. El orden
//! de llegada de mensajes solo está garantizado dentro de un mismo nodo.

use futures::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tokio_tungstenite::{
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderValue, Request},
        protocol::Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::Node;
use crate::{
    config::{BackoffConfig, ClusterConfig},
    error::{Error, Result},
    model::{IncomingMessage, OutgoingMessage},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    /// Terminal: solo tras un apagado explícito.
    Closed,
}

/// Retardo entre intentos de reconexión.
///
/// Nunca decrece entre fallos consecutivos y vuelve a la base con `reset`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.base.min(config.max),
            attempts: 0,
            config,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .saturating_mul(self.config.factor.max(1))
            .min(self.config.max);
        self.attempts += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.base.min(self.config.max);
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Lo que una tarea de transporte informa al clúster.
#[derive(Debug)]
pub(crate) enum NodeSignal {
    State {
        node: String,
        previous: ConnectionState,
        state: ConnectionState,
        reason: Option<String>,
    },
    Message {
        node: String,
        message: IncomingMessage,
    },
}

/// Datos del handshake comunes a todos los nodos.
#[derive(Debug, Clone)]
pub(crate) struct Handshake {
    pub user_id: u64,
    pub num_shards: u64,
    pub client_name: String,
    pub backoff: BackoffConfig,
    pub liveness_window: Duration,
    pub connect_timeout: Duration,
}

impl From<&ClusterConfig> for Handshake {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            user_id: config.user_id,
            num_shards: config.num_shards,
            client_name: config.client_name.clone(),
            backoff: config.backoff,
            liveness_window: config.liveness_window,
            connect_timeout: config.connect_timeout,
        }
    }
}

enum SessionEnd {
    Lost(String),
    Shutdown,
}

pub(crate) struct Transport {
    node: Arc<Node>,
    handshake: Handshake,
    backoff: Backoff,
    outbound: UnboundedReceiver<OutgoingMessage>,
    signals: UnboundedSender<NodeSignal>,
    cancel: CancellationToken,
}

impl Transport {
    pub(crate) fn new(
        node: Arc<Node>,
        handshake: Handshake,
        outbound: UnboundedReceiver<OutgoingMessage>,
        signals: UnboundedSender<NodeSignal>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backoff: Backoff::new(handshake.backoff),
            node,
            handshake,
            outbound,
            signals,
            cancel,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        loop {
            self.transition(ConnectionState::Connecting, None);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(socket) => {
                    self.backoff.reset();
                    self.drain_stale();
                    self.transition(ConnectionState::Connected, None);
                    info!("🔌 Nodo {} conectado", self.node.identifier());

                    match self.run_session(socket).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            warn!("⚠️ Nodo {} desconectado: {}", self.node.identifier(), reason);
                            self.transition(ConnectionState::Disconnected, Some(reason));
                        }
                    }
                }
                Err(e) => {
                    debug!("No se pudo conectar al nodo {}: {}", self.node.identifier(), e);
                    self.transition(ConnectionState::Disconnected, Some(e.to_string()));
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            let delay = self.backoff.next_delay();
            self.transition(ConnectionState::Reconnecting, None);
            info!(
                "🔄 Reconectando nodo {} en {:?} (intento {})",
                self.node.identifier(),
                delay,
                self.backoff.attempts()
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.transition(ConnectionState::Closed, None);
        debug!("Transporte del nodo {} cerrado", self.node.identifier());
    }

    async fn connect(&self) -> Result<Socket> {
        let request = self.request()?;
        let limit = self.handshake.connect_timeout;
        let (socket, _) = timeout(limit, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| Error::ConnectTimeout(limit))??;
        Ok(socket)
    }

    fn request(&self) -> Result<Request<()>> {
        let config = self.node.config();
        let mut request = config.websocket_url().into_client_request()?;

        let headers = request.headers_mut();
        headers.insert("Authorization", header_value(&config.password)?);
        headers.insert("User-Id", header_value(&self.handshake.user_id.to_string())?);
        headers.insert("Num-Shards", header_value(&self.handshake.num_shards.to_string())?);
        headers.insert("Client-Name", header_value(&self.handshake.client_name)?);

        Ok(request)
    }

    async fn run_session(&mut self, socket: Socket) -> SessionEnd {
        let (mut write, mut read) = socket.split();
        let window = self.handshake.liveness_window;
        let liveness = sleep(window);
        tokio::pin!(liveness);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = &mut liveness => {
                    return SessionEnd::Lost(format!("sin mensajes del nodo en {:?}", window));
                }
                outgoing = self.outbound.recv() => {
                    let Some(message) = outgoing else {
                        return SessionEnd::Shutdown;
                    };
                    let payload = match serde_json::to_string(&message) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("No se pudo serializar {}: {}", message.op(), e);
                            continue;
                        }
                    };
                    trace!("→ {}: {}", self.node.identifier(), payload);
                    if let Err(e) = write.send(Message::text(payload)).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                incoming = read.next() => {
                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                        None => return SessionEnd::Lost("stream cerrado".to_string()),
                    };
                    liveness.as_mut().reset(Instant::now() + window);

                    match message {
                        Message::Text(text) => self.dispatch(&text),
                        Message::Binary(data) => match std::str::from_utf8(&data) {
                            Ok(text) => self.dispatch(text),
                            Err(_) => warn!("Mensaje binario no UTF-8 del nodo {}", self.node.identifier()),
                        },
                        Message::Close(frame) => {
                            return SessionEnd::Lost(format!("cerrado por el nodo: {:?}", frame));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        trace!("← {}: {}", self.node.identifier(), text);

        match serde_json::from_str::<IncomingMessage>(text) {
            // Se aplican aquí para que nunca sobrevivan a la sesión que las trajo.
            Ok(IncomingMessage::Stats(stats)) => self.node.update_stats(stats),
            Ok(message) => {
                let _ = self.signals.send(NodeSignal::Message {
                    node: self.node.identifier().to_string(),
                    message,
                });
            }
            Err(e) => warn!("JSON inválido del nodo {}: {}", self.node.identifier(), e),
        }
    }

    // Comandos que quedaron en cola durante la sesión anterior no se
    // reenvían: el estado se restaura desde los players.
    fn drain_stale(&mut self) {
        let mut dropped = 0;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Descartados {} comandos pendientes del nodo {}", dropped, self.node.identifier());
        }
    }

    fn transition(&self, state: ConnectionState, reason: Option<String>) {
        let previous = self.node.set_state(state);
        if previous == state {
            return;
        }

        let _ = self.signals.send(NodeSignal::State {
            node: self.node.identifier().to_string(),
            previous,
            state,
            reason,
        });
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| {
        Error::Connection(tokio_tungstenite::tungstenite::Error::HttpFormat(e.into()))
    })
}
