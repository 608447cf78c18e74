use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;
use weft_core::{
    ContextDescriptor, ContextId, Envelope, Liveness, RouteError, Target, WakeId,
};
use weft_router::ports::is_port_kind;
use weft_router::{
    ContextRegistry, CoordinatorHandle, HostTransport, LoopbackTransport, PortHandle,
    PortManager, Router, StartupHandler, Supervisor, UnreachablePolicy, WakeSchedule,
};
use weft_rules::{FilterEngine, RuleError};
use weft_store::{Database, StateStore, StoreError, Tier};

use crate::config::RuntimeConfig;
use crate::diagnostics::{ActiveRule, RuntimeSnapshot};
use crate::topology::PackageDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("rule error: {0}")]
    Rules(#[from] RuleError),

    #[error("routing error: {0}")]
    Route(#[from] RouteError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    /// The coordinator is owned by the supervisor; use
    /// [`Runtime::ensure_coordinator`] instead of attaching it.
    #[error("coordinator context is supervisor-managed")]
    CoordinatorManaged,
}

/// The composed runtime: store, rules, router, ports, and supervisor over
/// one host transport.
pub struct Runtime {
    config: RuntimeConfig,
    transport: Arc<dyn HostTransport>,
    registry: Arc<ContextRegistry>,
    supervisor: Arc<Supervisor>,
    router: Arc<Router>,
    ports: Arc<PortManager>,
    store: Arc<StateStore>,
    rules: Arc<FilterEngine>,
}

impl Runtime {
    /// Assemble a runtime over the given transport.
    pub fn with_transport(
        config: RuntimeConfig,
        transport: Arc<dyn HostTransport>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let db = match &config.db_path {
            Some(path) => Database::open(Path::new(path))?,
            None => Database::in_memory()?,
        };
        let store = Arc::new(StateStore::open(db, config.quotas.to_quotas())?);

        let coordinator = ContextId::from_raw(config.coordinator_id.clone());
        let registry = Arc::new(ContextRegistry::new());
        registry.insert(ContextDescriptor::coordinator(config.coordinator_id.clone()));

        let supervisor = Arc::new(Supervisor::new(
            coordinator,
            transport.clone(),
            registry.clone(),
            config.idle_timeout(),
        ));
        let router = Arc::new(Router::new(
            transport.clone(),
            registry.clone(),
            supervisor.clone(),
            config.router_config(),
        ));
        let ports = Arc::new(PortManager::with_backoff(
            router.clone(),
            config.reconnect_base(),
            config.reconnect_cap(),
        ));

        // The coordinator's pump runs inside the supervisor; splice the
        // router's correlation step and the port frames in front of the
        // startup handler table.
        {
            let router = router.clone();
            let ports = ports.clone();
            let coordinator = ContextId::from_raw(config.coordinator_id.clone());
            supervisor.set_preprocess(move |envelope| {
                let envelope = router.handle_inbound(envelope)?;
                if is_port_kind(&envelope.kind) {
                    ports.handle_frame(&coordinator, envelope);
                    return None;
                }
                Some(envelope)
            });
        }
        {
            let ports = ports.clone();
            supervisor.set_evict_hook(move |ctx| ports.evict_context(ctx));
        }

        Ok(Arc::new(Self {
            config,
            transport,
            registry,
            supervisor,
            router,
            ports,
            store,
            rules: Arc::new(FilterEngine::new()),
        }))
    }

    /// Runtime over an in-process loopback transport, for tests and demos.
    pub fn loopback(
        config: RuntimeConfig,
    ) -> Result<(Arc<Self>, Arc<LoopbackTransport>), RuntimeError> {
        let transport = Arc::new(LoopbackTransport::new());
        let runtime = Self::with_transport(config, transport.clone())?;
        Ok((runtime, transport))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn rules(&self) -> &Arc<FilterEngine> {
        &self.rules
    }

    pub fn coordinator_id(&self) -> ContextId {
        ContextId::from_raw(self.config.coordinator_id.clone())
    }

    /// Register the contexts a package descriptor declares.
    pub fn load_topology(&self, descriptor: &PackageDescriptor) {
        for context in descriptor.initial_contexts(&self.config.coordinator_id) {
            self.registry.insert(context);
        }
    }

    /// Attach a non-coordinator context and start pumping its inbox.
    pub fn attach(self: &Arc<Self>, descriptor: ContextDescriptor) -> Result<ContextHandle, RuntimeError> {
        if descriptor.is_coordinator() {
            return Err(RuntimeError::CoordinatorManaged);
        }
        let id = descriptor.id.clone();
        let mut descriptor = descriptor;
        descriptor.liveness = Liveness::Alive;
        self.registry.insert(descriptor);

        let rx = self.transport.subscribe(&id);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.spawn_pump(id.clone(), rx, inbound_tx);

        if self.router.config().unreachable_policy == UnreachablePolicy::Queue {
            let router = self.router.clone();
            let ctx = id.clone();
            tokio::spawn(async move {
                router.flush_queued(&ctx).await;
            });
        }

        Ok(ContextHandle {
            id,
            runtime: Arc::clone(self),
            inbound: inbound_rx,
        })
    }

    fn spawn_pump(
        self: &Arc<Self>,
        ctx: ContextId,
        mut rx: mpsc::Receiver<Bytes>,
        tx: mpsc::UnboundedSender<Envelope>,
    ) {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let envelope = match Envelope::decode(&frame) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(context = %ctx, error = %e, "dropping undecodable frame");
                        continue;
                    }
                };
                let Some(envelope) = runtime.router.handle_inbound(envelope) else {
                    continue;
                };
                if is_port_kind(&envelope.kind) {
                    runtime.ports.handle_frame(&ctx, envelope);
                    continue;
                }
                // The handle may be gone while ports stay live; keep pumping.
                let _ = tx.send(envelope);
            }
        });
    }

    // ── Coordinator lifecycle ───────────────────────────────────────────

    pub fn ensure_coordinator(&self) -> CoordinatorHandle {
        self.supervisor.ensure_coordinator_alive()
    }

    pub fn register_at_startup(&self, handlers: Vec<StartupHandler>) {
        self.supervisor.register_at_startup(handlers);
    }

    pub fn schedule_wake(&self, name: impl Into<String>, schedule: WakeSchedule) -> WakeId {
        self.supervisor.schedule_wake(name, schedule)
    }

    pub fn cancel_wake(&self, name: &str) -> bool {
        self.supervisor.cancel_wake(name)
    }

    /// Send the response half of a request exchange on the coordinator's
    /// behalf; startup handlers use this from spawned tasks.
    pub async fn reply(&self, request: &Envelope, payload: impl Into<Bytes>) -> Result<(), RuntimeError> {
        let response = Envelope::response_to(request, self.coordinator_id(), payload);
        self.router.respond(response).await?;
        Ok(())
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            contexts: self.registry.all(),
            ports: self.ports.open_ports(),
            store: [Tier::DurableLocal, Tier::DurableSynced, Tier::VolatileSession]
                .into_iter()
                .map(|t| self.store.usage(t))
                .collect(),
            rules: self
                .rules
                .active_rules()
                .into_iter()
                .map(|(source, rule)| ActiveRule { source, rule })
                .collect(),
            coordinator_alive: self.supervisor.is_alive(),
            coordinator_generation: self.supervisor.generation(),
            pending_requests: self.router.pending_requests(),
        }
    }

    pub fn shutdown(&self) {
        self.supervisor.shutdown();
    }
}

/// An attached context's surface onto the runtime.
pub struct ContextHandle {
    id: ContextId,
    runtime: Arc<Runtime>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl ContextHandle {
    pub fn id(&self) -> &ContextId {
        &self.id
    }

    /// Next inbound envelope (requests and fire-and-forget; responses and
    /// port frames are consumed upstream).
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Send a request with the default deadline and wait for the response.
    pub async fn request(
        &self,
        to: ContextId,
        kind: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes, RouteError> {
        let envelope = Envelope::request(self.id.clone(), to, kind, payload);
        self.runtime.router.request(envelope).await
    }

    pub async fn request_with_deadline(
        &self,
        to: ContextId,
        kind: impl Into<String>,
        payload: impl Into<Bytes>,
        deadline: Duration,
    ) -> Result<Bytes, RouteError> {
        let envelope = Envelope::request(self.id.clone(), to, kind, payload)
            .with_deadline_ms(deadline.as_millis() as u64);
        self.runtime.router.request(envelope).await
    }

    /// Fire-and-forget send; returns once the transport accepts it.
    pub async fn notify(
        &self,
        to: ContextId,
        kind: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<(), RouteError> {
        let envelope =
            Envelope::fire_and_forget(self.id.clone(), Target::Context(to), kind, payload);
        self.runtime.router.fire_and_forget(envelope).await
    }

    /// Fan out to every known context; per-context outcomes.
    pub async fn broadcast(
        &self,
        kind: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Vec<(ContextId, Result<(), RouteError>)> {
        let envelope =
            Envelope::fire_and_forget(self.id.clone(), Target::Broadcast, kind, payload);
        self.runtime.router.broadcast(envelope).await
    }

    /// Answer a request received via [`ContextHandle::recv`].
    pub async fn respond(
        &self,
        request: &Envelope,
        payload: impl Into<Bytes>,
    ) -> Result<(), RouteError> {
        let response = Envelope::response_to(request, self.id.clone(), payload);
        self.runtime.router.respond(response).await
    }

    /// Open a port to another context. See [`PortHandle`].
    pub fn connect(&self, peer: ContextId, name: impl Into<String>) -> PortHandle {
        self.runtime.ports.connect(self.id.clone(), peer, name)
    }

    /// Incoming ports other contexts open toward this one.
    pub fn incoming_ports(&self) -> mpsc::UnboundedReceiver<PortHandle> {
        self.runtime.ports.listen(&self.id)
    }

    /// Detach from the transport; the context becomes unreachable until
    /// re-attached or re-materialized.
    pub fn detach(self) {
        self.runtime.transport.detach(&self.id);
        self.runtime.registry.mark(&self.id, Liveness::Gone);
        self.runtime.ports.evict_context(&self.id);
    }
}
