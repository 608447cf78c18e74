use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use weft_core::{ContextId, Envelope, Liveness, MessageId, Mode, RouteError, Target};

use crate::registry::ContextRegistry;
use crate::supervisor::Supervisor;
use crate::transport::{HostTransport, TransportError};

/// What to do with a fire-and-forget message whose destination stayed
/// unreachable after recovery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnreachablePolicy {
    /// Surface `Unreachable` and drop the message. The conservative
    /// default: queuing can mask a permanently gone context.
    #[default]
    Drop,
    /// Hold the message in the registry; it is flushed in order when the
    /// context next attaches.
    Queue,
}

#[derive(Clone, Copy, Debug)]
pub struct RouterConfig {
    /// Deadline applied to request-mode sends that carry none.
    pub default_deadline: Duration,
    pub unreachable_policy: UnreachablePolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_deadline: Duration::from_secs(2),
            unreachable_policy: UnreachablePolicy::Drop,
        }
    }
}

/// Routes envelopes between contexts over the host transport.
///
/// Request-mode sends park a oneshot in the correlation map and suspend
/// the caller until the matching response or the deadline. Delivery gets
/// one attempt plus exactly one recovery (re-materialize, retry once);
/// the second failure is terminal and surfaces `Unreachable`.
pub struct Router {
    transport: Arc<dyn HostTransport>,
    registry: Arc<ContextRegistry>,
    supervisor: Arc<Supervisor>,
    pending: DashMap<MessageId, oneshot::Sender<Envelope>>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        transport: Arc<dyn HostTransport>,
        registry: Arc<ContextRegistry>,
        supervisor: Arc<Supervisor>,
        config: RouterConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            supervisor,
            pending: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    /// Send a request and wait for its response.
    ///
    /// The wait is cancelled locally at the deadline; the in-flight
    /// delivery is not aborted remotely, and a response arriving after
    /// the deadline is discarded.
    pub async fn request(&self, envelope: Envelope) -> Result<Bytes, RouteError> {
        debug_assert_eq!(envelope.mode, Mode::Request);
        let destination = match &envelope.to {
            Target::Context(id) => id.clone(),
            Target::Broadcast => {
                return Err(RouteError::Transport("request cannot broadcast".into()))
            }
        };
        let deadline = envelope
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_deadline);

        let (tx, rx) = oneshot::channel();
        let correlation = envelope.id.clone();
        self.pending.insert(correlation.clone(), tx);

        if let Err(e) = self.deliver_with_recovery(&destination, &envelope).await {
            self.pending.remove(&correlation);
            debug!(id = %correlation, to = %destination, kind = %envelope.kind,
                   outcome = e.error_kind(), "request failed");
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => {
                debug!(id = %correlation, to = %destination, kind = %envelope.kind,
                       outcome = "response", "request completed");
                Ok(response.payload)
            }
            // Sender dropped without a response; treat as timeout-shaped.
            Ok(Err(_)) => {
                self.pending.remove(&correlation);
                Err(RouteError::Timeout(deadline))
            }
            Err(_) => {
                self.pending.remove(&correlation);
                debug!(id = %correlation, to = %destination, kind = %envelope.kind,
                       outcome = "timeout", "request completed");
                Err(RouteError::Timeout(deadline))
            }
        }
    }

    /// Hand a fire-and-forget message to the transport. Returns once the
    /// transport accepts it; no delivery guarantee beyond that.
    pub async fn fire_and_forget(&self, envelope: Envelope) -> Result<(), RouteError> {
        debug_assert_eq!(envelope.mode, Mode::FireAndForget);
        let destination = match &envelope.to {
            Target::Context(id) => id.clone(),
            Target::Broadcast => {
                self.broadcast(envelope).await;
                return Ok(());
            }
        };
        match self.deliver_with_recovery(&destination, &envelope).await {
            Ok(()) => Ok(()),
            Err(RouteError::Unreachable(ctx))
                if self.config.unreachable_policy == UnreachablePolicy::Queue =>
            {
                debug!(to = %ctx, kind = %envelope.kind, "destination unreachable, queueing");
                self.registry.queue_for(&ctx, envelope);
                Ok(())
            }
            Err(e) => {
                debug!(to = %destination, kind = %envelope.kind,
                       outcome = e.error_kind(), "fire-and-forget failed");
                Err(e)
            }
        }
    }

    /// Send the response half of a request exchange.
    pub async fn respond(&self, response: Envelope) -> Result<(), RouteError> {
        debug_assert_eq!(response.mode, Mode::Response);
        let destination = match &response.to {
            Target::Context(id) => id.clone(),
            Target::Broadcast => {
                return Err(RouteError::Transport("response cannot broadcast".into()))
            }
        };
        self.deliver_with_recovery(&destination, &response).await
    }

    /// Fan out to every known context except the sender. Individual
    /// failures never fail the broadcast; each context gets its own
    /// outcome.
    pub async fn broadcast(&self, envelope: Envelope) -> Vec<(ContextId, Result<(), RouteError>)> {
        let mut outcomes = Vec::new();
        for descriptor in self.registry.all() {
            if descriptor.id == envelope.from {
                continue;
            }
            let mut copy = envelope.clone();
            copy.to = Target::Context(descriptor.id.clone());
            let outcome = self.deliver_with_recovery(&descriptor.id, &copy).await;
            if let Err(e) = &outcome {
                debug!(to = %descriptor.id, kind = %envelope.kind,
                       outcome = e.error_kind(), "broadcast leg failed");
            }
            outcomes.push((descriptor.id, outcome));
        }
        outcomes
    }

    /// One delivery attempt; on `NoSuchContext`, exactly one recovery
    /// (re-materialize the destination, retry once). A second failure is
    /// `Unreachable`.
    async fn deliver_with_recovery(
        &self,
        destination: &ContextId,
        envelope: &Envelope,
    ) -> Result<(), RouteError> {
        let frame = envelope.encode()?;

        match self.transport.deliver(destination, frame.clone()).await {
            Ok(()) => {
                self.registry.mark(destination, Liveness::Alive);
                return Ok(());
            }
            Err(TransportError::Closed(_)) => {
                return Err(RouteError::Transport(format!(
                    "inbound channel closed for {destination}"
                )))
            }
            Err(TransportError::NoSuchContext(_)) => {}
        }

        debug!(to = %destination, "destination gone, attempting recovery");
        if self.materialize(destination).await.is_err() {
            self.registry.mark(destination, Liveness::Gone);
            return Err(RouteError::Unreachable(destination.clone()));
        }

        match self.transport.deliver(destination, frame).await {
            Ok(()) => {
                self.registry.mark(destination, Liveness::Alive);
                Ok(())
            }
            Err(_) => {
                self.registry.mark(destination, Liveness::Gone);
                Err(RouteError::Unreachable(destination.clone()))
            }
        }
    }

    async fn materialize(&self, destination: &ContextId) -> Result<(), TransportError> {
        if destination == self.supervisor.coordinator_id() {
            self.supervisor.ensure_coordinator_alive();
            Ok(())
        } else {
            self.transport.materialize(destination).await
        }
    }

    /// Correlation step for a context's inbound pump: responses complete
    /// their pending request and are consumed; everything else is handed
    /// back for dispatch. Late responses are dropped here.
    pub fn handle_inbound(&self, envelope: Envelope) -> Option<Envelope> {
        if envelope.mode != Mode::Response {
            return Some(envelope);
        }
        match self.pending.remove(&envelope.id) {
            Some((_, tx)) => {
                if tx.send(envelope).is_err() {
                    // Waiter timed out between removal and send.
                }
                None
            }
            None => {
                debug!(id = %envelope.id, from = %envelope.from, "dropping late response");
                None
            }
        }
    }

    /// Deliver a context's queued fire-and-forget backlog, in order.
    /// Called when a context attaches under the `queue` policy.
    pub async fn flush_queued(&self, destination: &ContextId) {
        for envelope in self.registry.drain_queued(destination) {
            let frame = match envelope.encode() {
                Ok(f) => f,
                Err(e) => {
                    warn!(to = %destination, error = %e, "dropping unencodable queued message");
                    continue;
                }
            };
            if let Err(e) = self.transport.deliver(destination, frame).await {
                warn!(to = %destination, error = %e, "queued message flush failed");
            }
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use weft_core::ContextDescriptor;

    struct Rig {
        router: Arc<Router>,
        transport: Arc<LoopbackTransport>,
        registry: Arc<ContextRegistry>,
    }

    fn rig(config: RouterConfig) -> Rig {
        let transport = Arc::new(LoopbackTransport::new());
        let registry = Arc::new(ContextRegistry::new());
        registry.insert(ContextDescriptor::coordinator("coordinator"));
        let supervisor = Arc::new(Supervisor::new(
            ContextId::from_raw("coordinator"),
            transport.clone(),
            registry.clone(),
            Duration::from_secs(30),
        ));
        let router = Arc::new(Router::new(
            transport.clone(),
            registry.clone(),
            supervisor,
            config,
        ));
        Rig {
            router,
            transport,
            registry,
        }
    }

    fn ctx(s: &str) -> ContextId {
        ContextId::from_raw(s)
    }

    /// Pump one context's inbox: correlate responses, echo PING requests.
    fn spawn_echo(rig: &Rig, id: &str) {
        let mut rx = rig.transport.subscribe(&ctx(id));
        let router = rig.router.clone();
        let transport = rig.transport.clone();
        let me = ctx(id);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let envelope = Envelope::decode(&frame).unwrap();
                let Some(envelope) = router.handle_inbound(envelope) else {
                    continue;
                };
                if envelope.mode == Mode::Request {
                    let reply = Envelope::response_to(&envelope, me.clone(), Bytes::from_static(b"pong"));
                    let to = envelope.from.clone();
                    transport.deliver(&to, reply.encode().unwrap()).await.ok();
                }
            }
        });
    }

    #[tokio::test]
    async fn request_gets_response_payload() {
        let rig = rig(RouterConfig::default());
        spawn_echo(&rig, "page-1");
        spawn_echo(&rig, "ui");

        let envelope = Envelope::request(ctx("ui"), ctx("page-1"), "PING", Bytes::from_static(b"ping"));
        let payload = rig.router.request(envelope).await.unwrap();
        assert_eq!(payload, Bytes::from_static(b"pong"));
        assert_eq!(rig.router.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_destination_times_out_at_deadline() {
        let rig = rig(RouterConfig::default());
        // Attached but never responds.
        let _rx = rig.transport.subscribe(&ctx("page-1"));

        let envelope = Envelope::request(ctx("ui"), ctx("page-1"), "PING", Bytes::new())
            .with_deadline_ms(100);
        let started = tokio::time::Instant::now();
        let err = rig.router.request(envelope).await.unwrap_err();
        assert!(matches!(err, RouteError::Timeout(d) if d == Duration::from_millis(100)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(rig.router.pending_requests(), 0);
    }

    #[tokio::test]
    async fn never_started_context_is_unreachable_not_timeout() {
        let rig = rig(RouterConfig::default());

        let envelope = Envelope::request(ctx("ui"), ctx("page-b"), "PING", Bytes::new())
            .with_deadline_ms(100);
        let err = rig.router.request(envelope).await.unwrap_err();
        assert!(matches!(err, RouteError::Unreachable(id) if id == ctx("page-b")));
        // Exactly one recovery attempt, no unbounded retry.
        assert_eq!(rig.transport.materialize_count(&ctx("page-b")), 1);
        assert_eq!(rig.router.pending_requests(), 0);
    }

    #[tokio::test]
    async fn recovery_rematerializes_then_delivers() {
        let rig = rig(RouterConfig::default());
        let transport = rig.transport.clone();
        let router = rig.router.clone();
        // The materializer reattaches the context with a live echo pump.
        rig.transport.set_materializer(ctx("page-1"), move || {
            let mut rx = transport.subscribe(&ctx("page-1"));
            let router = router.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let envelope = Envelope::decode(&frame).unwrap();
                    if let Some(envelope) = router.handle_inbound(envelope) {
                        let reply =
                            Envelope::response_to(&envelope, ctx("page-1"), Bytes::from_static(b"ok"));
                        let to = envelope.from.clone();
                        transport.deliver(&to, reply.encode().unwrap()).await.ok();
                    }
                }
            });
        });
        spawn_echo(&rig, "ui");

        let envelope = Envelope::request(ctx("ui"), ctx("page-1"), "PING", Bytes::new());
        let payload = rig.router.request(envelope).await.unwrap();
        assert_eq!(payload, Bytes::from_static(b"ok"));
        assert_eq!(rig.transport.materialize_count(&ctx("page-1")), 1);
    }

    #[tokio::test]
    async fn late_response_is_discarded() {
        let rig = rig(RouterConfig::default());
        let request = Envelope::request(ctx("ui"), ctx("page-1"), "PING", Bytes::new());
        let reply = Envelope::response_to(&request, ctx("page-1"), Bytes::from_static(b"late"));
        // No pending entry for this correlation id.
        assert!(rig.router.handle_inbound(reply).is_none());
    }

    #[tokio::test]
    async fn broadcast_aggregates_per_context_outcomes() {
        let rig = rig(RouterConfig::default());
        rig.registry.insert(ContextDescriptor::page_bound("page-1", "https://a/*"));
        rig.registry.insert(ContextDescriptor::page_bound("page-2", "https://b/*"));
        let _rx1 = rig.transport.subscribe(&ctx("page-1"));
        // page-2 never attaches.
        let _rx_coord = rig.transport.subscribe(&ctx("coordinator"));

        let envelope =
            Envelope::fire_and_forget(ctx("ui"), Target::Broadcast, "notice", Bytes::new());
        let outcomes = rig.router.broadcast(envelope).await;
        assert_eq!(outcomes.len(), 3);
        let ok = |id: &str| {
            outcomes
                .iter()
                .find(|(c, _)| c == &ctx(id))
                .map(|(_, r)| r.is_ok())
                .unwrap()
        };
        assert!(ok("page-1"));
        assert!(!ok("page-2"));
        assert!(ok("coordinator"));
    }

    #[tokio::test]
    async fn drop_policy_surfaces_unreachable() {
        let rig = rig(RouterConfig::default());
        let envelope = Envelope::fire_and_forget(
            ctx("ui"),
            Target::Context(ctx("page-9")),
            "notice",
            Bytes::new(),
        );
        let err = rig.router.fire_and_forget(envelope).await.unwrap_err();
        assert!(matches!(err, RouteError::Unreachable(_)));
        assert_eq!(rig.registry.queued_len(&ctx("page-9")), 0);
    }

    #[tokio::test]
    async fn queue_policy_holds_and_flushes_in_order() {
        let rig = rig(RouterConfig {
            unreachable_policy: UnreachablePolicy::Queue,
            ..RouterConfig::default()
        });

        for kind in ["a", "b"] {
            let envelope = Envelope::fire_and_forget(
                ctx("ui"),
                Target::Context(ctx("page-9")),
                kind,
                Bytes::new(),
            );
            rig.router.fire_and_forget(envelope).await.unwrap();
        }
        assert_eq!(rig.registry.queued_len(&ctx("page-9")), 2);

        let mut rx = rig.transport.subscribe(&ctx("page-9"));
        rig.router.flush_queued(&ctx("page-9")).await;
        let first = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        let second = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.kind, "a");
        assert_eq!(second.kind, "b");
    }

    #[tokio::test]
    async fn coordinator_destination_recovers_via_supervisor() {
        let rig = rig(RouterConfig::default());
        // Coordinator not yet instantiated; delivery should wake it
        // through the supervisor rather than the transport materializer.
        let envelope = Envelope::fire_and_forget(
            ctx("page-1"),
            Target::Context(ctx("coordinator")),
            "event",
            Bytes::new(),
        );
        rig.router.fire_and_forget(envelope).await.unwrap();
        assert_eq!(rig.transport.materialize_count(&ctx("coordinator")), 0);
        assert!(rig.transport.is_attached(&ctx("coordinator")));
    }
}
