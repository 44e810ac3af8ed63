//! Bus de eventos del clúster.
//!
//! Los hooks se registran por tipo de evento o de forma genérica (`None`),
//! y viven lo mismo que el `Cluster` que los posee. Publicar solo encola:
//! los hooks corren en una tarea aparte para no frenar comandos ni la
//! lectura de los nodos.

use async_trait::async_trait;
use futures::{future::join_all, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    runtime::Handle,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, warn};

use crate::{
    model::{GuildId, TrackEndReason},
    track::Track,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TrackStart,
    TrackEnd,
    TrackException,
    TrackStuck,
    WebSocketClosed,
    QueueEnd,
    NodeConnected,
    NodeDisconnected,
    NodeChanged,
}

#[derive(Debug, Clone)]
pub enum Event {
    TrackStart {
        guild_id: GuildId,
        track: Option<Track>,
    },
    TrackEnd {
        guild_id: GuildId,
        track: Option<Track>,
        reason: TrackEndReason,
    },
    TrackException {
        guild_id: GuildId,
        track: Option<Track>,
        message: String,
    },
    TrackStuck {
        guild_id: GuildId,
        track: Option<Track>,
        threshold_ms: u64,
    },
    WebSocketClosed {
        guild_id: GuildId,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    QueueEnd {
        guild_id: GuildId,
    },
    NodeConnected {
        node: String,
    },
    NodeDisconnected {
        node: String,
        reason: String,
    },
    /// Un player fue migrado de un nodo a otro.
    NodeChanged {
        guild_id: GuildId,
        old_node: String,
        new_node: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TrackStart { .. } => EventKind::TrackStart,
            Self::TrackEnd { .. } => EventKind::TrackEnd,
            Self::TrackException { .. } => EventKind::TrackException,
            Self::TrackStuck { .. } => EventKind::TrackStuck,
            Self::WebSocketClosed { .. } => EventKind::WebSocketClosed,
            Self::QueueEnd { .. } => EventKind::QueueEnd,
            Self::NodeConnected { .. } => EventKind::NodeConnected,
            Self::NodeDisconnected { .. } => EventKind::NodeDisconnected,
            Self::NodeChanged { .. } => EventKind::NodeChanged,
        }
    }

    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::TrackStuck { guild_id, .. }
            | Self::WebSocketClosed { guild_id, .. }
            | Self::QueueEnd { guild_id }
            | Self::NodeChanged { guild_id, .. } => Some(*guild_id),
            Self::NodeConnected { .. } | Self::NodeDisconnected { .. } => None,
        }
    }
}

/// Hook asíncrono. Un error devuelto se registra y no afecta a los demás
/// hooks.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

type Hooks = HashMap<Option<EventKind>, Vec<Arc<dyn EventHandler>>>;

/// Tiempo que `close` espera a los hooks pendientes.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

enum Job {
    Deliver(Event),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
pub struct EventBus {
    hooks: Arc<RwLock<Hooks>>,
    queue: Mutex<Option<UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un hook para `kind`, o para todos los eventos con `None`.
    ///
    /// Devuelve `false` si ese mismo hook ya estaba registrado para esa clave.
    pub fn register(&self, kind: Option<EventKind>, handler: Arc<dyn EventHandler>) -> bool {
        let mut hooks = self.hooks.write();
        let entry = hooks.entry(kind).or_default();

        if entry.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }

        entry.push(handler);
        true
    }

    pub fn unregister(&self, kind: Option<EventKind>, handler: &Arc<dyn EventHandler>) -> bool {
        let mut hooks = self.hooks.write();
        match hooks.get_mut(&kind) {
            Some(entry) => {
                let before = entry.len();
                entry.retain(|h| !same_handler(h, handler));
                entry.len() != before
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.hooks.write().clear();
    }

    pub fn handler_count(&self, kind: Option<EventKind>) -> usize {
        self.hooks.read().get(&kind).map_or(0, Vec::len)
    }

    /// Encola el evento para los hooks específicos y los genéricos.
    ///
    /// No espera a los hooks: una tarea propia del bus los ejecuta en orden
    /// de publicación. Sin runtime de tokio el evento se descarta.
    pub fn publish(&self, event: Event) {
        if !self.has_handlers(event.kind()) {
            return;
        }

        let kind = event.kind();
        if !self.enqueue(Job::Deliver(event)) {
            warn!("Evento {:?} descartado: el bus no tiene tarea de entrega", kind);
        }
    }

    /// Entrega el evento en la tarea actual y espera a todos los hooks.
    ///
    /// Devuelve cuántos hooks fallaron (error o panic).
    pub async fn deliver(&self, event: Event) -> usize {
        deliver_to(&self.hooks, &event).await
    }

    /// Espera a que se entreguen todos los eventos publicados hasta ahora.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        let queued = {
            let queue = self.queue.lock();
            queue
                .as_ref()
                .is_some_and(|tx| tx.send(Job::Flush(done)).is_ok())
        };

        if queued {
            let _ = wait.await;
        }
    }

    /// Deja de aceptar eventos y espera a que se entreguen los pendientes.
    /// Los hooks que no terminan en [`CLOSE_GRACE`] se abortan.
    pub async fn close(&self) {
        self.queue.lock().take();

        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            if timeout(CLOSE_GRACE, &mut worker).await.is_err() {
                warn!("Hooks sin terminar tras {:?}, abortando entrega", CLOSE_GRACE);
                worker.abort();
            }
        }
    }

    fn has_handlers(&self, kind: EventKind) -> bool {
        let hooks = self.hooks.read();
        [Some(kind), None]
            .iter()
            .any(|key| hooks.get(key).is_some_and(|h| !h.is_empty()))
    }

    // La tarea de entrega se crea con el primer evento, ya dentro del runtime.
    fn enqueue(&self, job: Job) -> bool {
        let mut queue = self.queue.lock();

        if queue.as_ref().is_none_or(|tx| tx.is_closed()) {
            let Ok(runtime) = Handle::try_current() else {
                return false;
            };
            let (tx, rx) = mpsc::unbounded_channel();
            *self.worker.lock() = Some(runtime.spawn(run_worker(Arc::clone(&self.hooks), rx)));
            *queue = Some(tx);
        }

        queue.as_ref().is_some_and(|tx| tx.send(job).is_ok())
    }
}

async fn run_worker(hooks: Arc<RwLock<Hooks>>, mut jobs: UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Deliver(event) => {
                deliver_to(&hooks, &event).await;
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Tarea de entrega de eventos terminada");
}

async fn deliver_to(hooks: &RwLock<Hooks>, event: &Event) -> usize {
    let handlers: Vec<Arc<dyn EventHandler>> = {
        let hooks = hooks.read();
        hooks
            .get(&Some(event.kind()))
            .into_iter()
            .chain(hooks.get(&None))
            .flatten()
            .cloned()
            .collect()
    };

    if handlers.is_empty() {
        return 0;
    }

    debug!("Publicando {:?} a {} hooks", event.kind(), handlers.len());

    let results = join_all(
        handlers
            .iter()
            .map(|handler| AssertUnwindSafe(handler.handle(event)).catch_unwind()),
    )
    .await;

    let mut failed = 0;
    for result in results {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                error!("Hook de {:?} falló: {:?}", event.kind(), e);
            }
            Err(_) => {
                failed += 1;
                error!("Hook de {:?} entró en pánico", event.kind());
            }
        }
    }

    failed
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("hook roto")
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            panic!("hook en pánico")
        }
    }

    fn track_end() -> Event {
        Event::TrackEnd {
            guild_id: GuildId(1),
            track: None,
            reason: TrackEndReason::Finished,
        }
    }

    #[tokio::test]
    async fn test_specific_and_generic_hooks_each_run_once() {
        let bus = EventBus::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let generic = Arc::new(Counter::default());

        bus.register(Some(EventKind::TrackEnd), a.clone());
        bus.register(Some(EventKind::TrackEnd), b.clone());
        bus.register(None, generic.clone());

        assert_eq!(bus.deliver(track_end()).await, 0);
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
        assert_eq!(generic.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_hooks_are_isolated() {
        let bus = EventBus::new();
        let a = Arc::new(Counter::default());
        let generic = Arc::new(Counter::default());

        bus.register(Some(EventKind::TrackEnd), Arc::new(Failing));
        bus.register(Some(EventKind::TrackEnd), a.clone());
        bus.register(None, Arc::new(Panicking));
        bus.register(None, generic.clone());

        assert_eq!(bus.deliver(track_end()).await, 2);
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(generic.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_noop() {
        let bus = EventBus::new();
        let hook: Arc<dyn EventHandler> = Arc::new(Counter::default());

        assert!(bus.register(Some(EventKind::QueueEnd), hook.clone()));
        assert!(!bus.register(Some(EventKind::QueueEnd), hook.clone()));
        assert!(bus.register(None, hook.clone()));
        assert_eq!(bus.handler_count(Some(EventKind::QueueEnd)), 1);

        assert!(bus.unregister(Some(EventKind::QueueEnd), &hook));
        assert_eq!(bus.handler_count(Some(EventKind::QueueEnd)), 0);
    }

    #[tokio::test]
    async fn test_other_kinds_are_not_delivered() {
        let bus = EventBus::new();
        let hook = Arc::new(Counter::default());
        bus.register(Some(EventKind::NodeConnected), hook.clone());

        bus.publish(track_end());
        bus.flush().await;
        assert_eq!(hook.0.load(Ordering::SeqCst), 0);

        bus.publish(Event::NodeConnected {
            node: "a".to_string(),
        });
        bus.flush().await;
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    }

    struct Sleepy(Counter);

    #[async_trait]
    impl EventHandler for Sleepy {
        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.0.handle(event).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_does_not_wait_for_slow_hooks() {
        let bus = EventBus::new();
        let slow = Arc::new(Sleepy(Counter::default()));
        bus.register(None, slow.clone());

        let start = tokio::time::Instant::now();
        bus.publish(track_end());
        bus.publish(track_end());
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(slow.0 .0.load(Ordering::SeqCst), 0);

        bus.flush().await;
        assert_eq!(slow.0 .0.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_hooks() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter::default());
        bus.register(None, Arc::new(Panicking));
        bus.register(None, counter.clone());

        bus.publish(track_end());
        bus.publish(track_end());
        bus.flush().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_aborts_hooks_that_never_finish() {
        let bus = EventBus::new();
        bus.register(None, Arc::new(Sleepy(Counter::default())));
        bus.publish(track_end());

        let start = tokio::time::Instant::now();
        bus.close().await;
        assert_eq!(start.elapsed(), CLOSE_GRACE);

        // Tras cerrar, publicar vuelve a levantar la entrega.
        let counter = Arc::new(Counter::default());
        bus.clear();
        bus.register(None, counter.clone());
        bus.publish(track_end());
        bus.flush().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
