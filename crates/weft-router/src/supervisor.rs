use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_core::{ContextId, Envelope, Liveness, Target, WakeId};

use crate::registry::ContextRegistry;
use crate::transport::HostTransport;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Message kind of the synthetic envelope a firing wake injects. The wake
/// name rides in the payload.
pub const WAKE_KIND: &str = "wake";

/// A handler declaration (re)installed on every coordinator instantiation.
///
/// Declarations are evaluated once, synchronously, before the first event
/// of an instantiation is dequeued. There is no late registration: a
/// declaration added while the coordinator is alive takes effect on the
/// next instantiation.
#[derive(Clone)]
pub struct StartupHandler {
    pub name: String,
    /// Restrict to one message kind; `None` sees every event.
    pub kind: Option<String>,
    pub callback: Arc<dyn Fn(&Envelope) + Send + Sync>,
}

impl StartupHandler {
    pub fn new(name: impl Into<String>, callback: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            kind: None,
            callback: Arc::new(callback),
        }
    }

    pub fn for_kind(
        name: impl Into<String>,
        kind: impl Into<String>,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: Some(kind.into()),
            callback: Arc::new(callback),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum WakeSchedule {
    Every(Duration),
    At(DateTime<Utc>),
}

/// Proof that the coordinator was alive when obtained. The generation
/// changes on every re-instantiation, so holders can detect a restart.
#[derive(Clone, Debug)]
pub struct CoordinatorHandle {
    pub context: ContextId,
    pub generation: u64,
}

/// Consumes envelopes before the handler table sees them; returning `None`
/// marks the envelope consumed (request correlation, port frames).
type Preprocess = Arc<dyn Fn(Envelope) -> Option<Envelope> + Send + Sync>;
type EvictHook = Arc<dyn Fn(&ContextId) + Send + Sync>;

struct Instance {
    generation: u64,
    cancel: CancellationToken,
}

struct WakeEntry {
    id: WakeId,
    cancel: CancellationToken,
}

/// Owns the one privileged coordinator context.
///
/// The coordinator is not resident: after `idle_timeout` with no inbound
/// event it is terminated, and the next inbound event or wake brings it
/// back. In-memory coordinator state does not survive the cycle; only the
/// store does.
pub struct Supervisor {
    coordinator: ContextId,
    transport: Arc<dyn HostTransport>,
    registry: Arc<ContextRegistry>,
    idle_timeout: Duration,
    handlers: RwLock<Vec<StartupHandler>>,
    preprocess: RwLock<Option<Preprocess>>,
    evict_hook: RwLock<Option<EvictHook>>,
    instance: Mutex<Option<Instance>>,
    generation: AtomicU64,
    wakes: DashMap<String, WakeEntry>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        coordinator: ContextId,
        transport: Arc<dyn HostTransport>,
        registry: Arc<ContextRegistry>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            transport,
            registry,
            idle_timeout,
            handlers: RwLock::new(Vec::new()),
            preprocess: RwLock::new(None),
            evict_hook: RwLock::new(None),
            instance: Mutex::new(None),
            generation: AtomicU64::new(0),
            wakes: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn coordinator_id(&self) -> &ContextId {
        &self.coordinator
    }

    /// Wired once at runtime assembly: the router's correlation step and
    /// the port manager's frame step run ahead of the handler table.
    pub fn set_preprocess(&self, f: impl Fn(Envelope) -> Option<Envelope> + Send + Sync + 'static) {
        *self.preprocess.write() = Some(Arc::new(f));
    }

    /// Called with the coordinator id when an idle termination tears it
    /// down, so ports anchored there can close with `host-evicted`.
    pub fn set_evict_hook(&self, f: impl Fn(&ContextId) + Send + Sync + 'static) {
        *self.evict_hook.write() = Some(Arc::new(f));
    }

    /// Add handler declarations. Takes effect on the next instantiation.
    pub fn register_at_startup(&self, handlers: Vec<StartupHandler>) {
        self.handlers.write().extend(handlers);
    }

    pub fn is_alive(&self) -> bool {
        self.instance
            .lock()
            .as_ref()
            .map(|i| !i.cancel.is_cancelled())
            .unwrap_or(false)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Instantiate the coordinator if it is not running.
    ///
    /// Handler installation and inbox attachment happen before this
    /// returns, so an event delivered right after cannot race past the
    /// handler table.
    pub fn ensure_coordinator_alive(self: &Arc<Self>) -> CoordinatorHandle {
        let mut slot = self.instance.lock();
        if let Some(instance) = slot.as_ref() {
            if !instance.cancel.is_cancelled() {
                return CoordinatorHandle {
                    context: self.coordinator.clone(),
                    generation: instance.generation,
                };
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handlers = self.handlers.read().clone();
        let rx = self.transport.subscribe(&self.coordinator);
        self.registry.mark(&self.coordinator, Liveness::Alive);
        let cancel = self.shutdown.child_token();
        *slot = Some(Instance {
            generation,
            cancel: cancel.clone(),
        });
        drop(slot);

        info!(context = %self.coordinator, generation, "coordinator instantiated");
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            sup.consume_loop(generation, handlers, rx, cancel).await;
        });

        CoordinatorHandle {
            context: self.coordinator.clone(),
            generation,
        }
    }

    async fn consume_loop(
        self: Arc<Self>,
        generation: u64,
        handlers: Vec<StartupHandler>,
        mut rx: tokio::sync::mpsc::Receiver<bytes::Bytes>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.idle_timeout) => {
                    self.terminate(generation, "idle timeout");
                    return;
                }
                maybe = rx.recv() => {
                    let Some(frame) = maybe else { return };
                    let envelope = match Envelope::decode(&frame) {
                        Ok(e) => e,
                        Err(e) => {
                            warn!(context = %self.coordinator, error = %e, "dropping undecodable frame");
                            continue;
                        }
                    };
                    let remaining = {
                        let preprocess = self.preprocess.read().clone();
                        match preprocess {
                            Some(f) => f(envelope),
                            None => Some(envelope),
                        }
                    };
                    if let Some(envelope) = remaining {
                        for handler in &handlers {
                            if handler.kind.as_deref().map_or(true, |k| k == envelope.kind) {
                                (handler.callback)(&envelope);
                            }
                        }
                    }
                }
            }
        }
    }

    fn terminate(&self, generation: u64, cause: &str) {
        let mut slot = self.instance.lock();
        // A newer instantiation may already have replaced this one.
        if slot.as_ref().map_or(true, |i| i.generation != generation) {
            return;
        }
        if let Some(instance) = slot.take() {
            instance.cancel.cancel();
        }
        drop(slot);

        self.transport.detach(&self.coordinator);
        self.registry.mark(&self.coordinator, Liveness::Gone);
        if let Some(hook) = self.evict_hook.read().clone() {
            hook(&self.coordinator);
        }
        info!(context = %self.coordinator, generation, cause, "coordinator terminated");
    }

    /// Schedule a named wake. Replaces any existing wake with the same
    /// name. A firing wake counts as an inbound event: it re-instantiates
    /// the coordinator if needed and injects a `wake`-kind envelope
    /// carrying the wake's name as payload.
    pub fn schedule_wake(self: &Arc<Self>, name: impl Into<String>, schedule: WakeSchedule) -> WakeId {
        let name = name.into();
        self.cancel_wake(&name);

        let id = WakeId::new();
        let cancel = self.shutdown.child_token();
        self.wakes.insert(
            name.clone(),
            WakeEntry {
                id: id.clone(),
                cancel: cancel.clone(),
            },
        );
        debug!(wake = %name, ?schedule, "wake scheduled");

        let sup = Arc::clone(self);
        tokio::spawn(async move {
            match schedule {
                WakeSchedule::Every(period) => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(period) => sup.fire_wake(&name).await,
                    }
                },
                WakeSchedule::At(at) => {
                    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {
                            sup.fire_wake(&name).await;
                            sup.wakes.remove(&name);
                        }
                    }
                }
            }
        });

        id
    }

    async fn fire_wake(self: &Arc<Self>, name: &str) {
        self.ensure_coordinator_alive();
        let envelope = Envelope::fire_and_forget(
            ContextId::from_raw("host"),
            Target::Context(self.coordinator.clone()),
            WAKE_KIND,
            bytes::Bytes::from(name.as_bytes().to_vec()),
        );
        let frame = match envelope.encode() {
            Ok(f) => f,
            Err(e) => {
                warn!(wake = name, error = %e, "wake envelope encode failed");
                return;
            }
        };
        // The coordinator can idle out between ensure and deliver; one
        // more ensure covers that window.
        if self.transport.deliver(&self.coordinator, frame.clone()).await.is_err() {
            self.ensure_coordinator_alive();
            if let Err(e) = self.transport.deliver(&self.coordinator, frame).await {
                warn!(wake = name, error = %e, "wake delivery failed");
                return;
            }
        }
        debug!(wake = name, "wake fired");
    }

    pub fn cancel_wake(&self, name: &str) -> bool {
        if let Some((_, entry)) = self.wakes.remove(name) {
            entry.cancel.cancel();
            debug!(wake = name, id = %entry.id, "wake cancelled");
            true
        } else {
            false
        }
    }

    pub fn active_wakes(&self) -> Vec<(String, WakeId)> {
        self.wakes
            .iter()
            .map(|e| (e.key().clone(), e.value().id.clone()))
            .collect()
    }

    /// Tear everything down: coordinator instance and all wake timers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut slot = self.instance.lock();
        if slot.take().is_some() {
            self.transport.detach(&self.coordinator);
            self.registry.mark(&self.coordinator, Liveness::Gone);
        }
    }
}
