use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use weft_core::ContextId;

/// Per-context inbox depth before `deliver` applies backpressure.
const INBOX_CAPACITY: usize = 256;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// The destination context is not currently instantiated.
    #[error("no such context: {0}")]
    NoSuchContext(ContextId),

    /// The context exists but its inbound channel is gone.
    #[error("transport closed for {0}")]
    Closed(ContextId),
}

/// The host's delivery primitive, treated as opaque by everything above it.
///
/// `deliver` makes one attempt; it never retries. `materialize` asks the
/// host to (re)instantiate a context so a retry can follow.
#[async_trait]
pub trait HostTransport: Send + Sync {
    /// Hand one encoded frame to a context. Exactly one attempt.
    async fn deliver(&self, ctx: &ContextId, frame: Bytes) -> Result<(), TransportError>;

    /// Attach a context and return its ordered inbound stream. Frames
    /// delivered before `subscribe` are lost; there is no replay.
    fn subscribe(&self, ctx: &ContextId) -> mpsc::Receiver<Bytes>;

    /// Detach a context; subsequent `deliver` calls fail `NoSuchContext`.
    fn detach(&self, ctx: &ContextId);

    /// Ask the host to re-instantiate a context (re-inject page-bound
    /// logic). Fails if the host has no way to bring the context back.
    async fn materialize(&self, ctx: &ContextId) -> Result<(), TransportError>;
}

type Materializer = Arc<dyn Fn() + Send + Sync>;

/// In-process transport: one bounded mpsc inbox per attached context.
///
/// `materialize` invokes a per-context callback registered with
/// [`LoopbackTransport::set_materializer`]; the callback is expected to
/// re-attach the context. Contexts with no materializer cannot be
/// recovered, which is how tests model a permanently gone destination.
#[derive(Default)]
pub struct LoopbackTransport {
    inboxes: DashMap<ContextId, mpsc::Sender<Bytes>>,
    materializers: DashMap<ContextId, Materializer>,
    materialize_calls: DashMap<ContextId, Arc<AtomicU64>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_materializer(&self, ctx: ContextId, f: impl Fn() + Send + Sync + 'static) {
        self.materializers.insert(ctx, Arc::new(f));
    }

    pub fn is_attached(&self, ctx: &ContextId) -> bool {
        self.inboxes.contains_key(ctx)
    }

    /// How many times `materialize` was invoked for a context. Used by
    /// tests asserting the single-recovery contract.
    pub fn materialize_count(&self, ctx: &ContextId) -> u64 {
        self.materialize_calls
            .get(ctx)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[async_trait]
impl HostTransport for LoopbackTransport {
    async fn deliver(&self, ctx: &ContextId, frame: Bytes) -> Result<(), TransportError> {
        let tx = match self.inboxes.get(ctx) {
            Some(entry) => entry.value().clone(),
            None => return Err(TransportError::NoSuchContext(ctx.clone())),
        };
        tx.send(frame)
            .await
            .map_err(|_| TransportError::Closed(ctx.clone()))
    }

    fn subscribe(&self, ctx: &ContextId) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.insert(ctx.clone(), tx);
        debug!(context = %ctx, "context attached");
        rx
    }

    fn detach(&self, ctx: &ContextId) {
        if self.inboxes.remove(ctx).is_some() {
            debug!(context = %ctx, "context detached");
        }
    }

    async fn materialize(&self, ctx: &ContextId) -> Result<(), TransportError> {
        self.materialize_calls
            .entry(ctx.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);

        let f = match self.materializers.get(ctx) {
            Some(entry) => entry.value().clone(),
            None => return Err(TransportError::NoSuchContext(ctx.clone())),
        };
        f();
        if self.inboxes.contains_key(ctx) {
            Ok(())
        } else {
            Err(TransportError::NoSuchContext(ctx.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(s: &str) -> ContextId {
        ContextId::from_raw(s)
    }

    #[tokio::test]
    async fn deliver_to_unattached_context_fails() {
        let transport = LoopbackTransport::new();
        let err = transport
            .deliver(&ctx("page-1"), Bytes::from_static(b"hi"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NoSuchContext(ctx("page-1")));
    }

    #[tokio::test]
    async fn frames_arrive_in_delivery_order() {
        let transport = LoopbackTransport::new();
        let mut rx = transport.subscribe(&ctx("page-1"));
        for b in [&b"a"[..], b"b", b"c"] {
            transport.deliver(&ctx("page-1"), Bytes::from_static(b)).await.unwrap();
        }
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"b"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"c"));
    }

    #[tokio::test]
    async fn detach_makes_context_unreachable() {
        let transport = LoopbackTransport::new();
        let _rx = transport.subscribe(&ctx("ui"));
        transport.detach(&ctx("ui"));
        assert!(transport
            .deliver(&ctx("ui"), Bytes::from_static(b"x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn materialize_without_callback_fails_and_is_counted() {
        let transport = LoopbackTransport::new();
        assert!(transport.materialize(&ctx("gone")).await.is_err());
        assert_eq!(transport.materialize_count(&ctx("gone")), 1);
    }

    #[tokio::test]
    async fn materializer_reattaches_context() {
        let transport = Arc::new(LoopbackTransport::new());
        let t2 = transport.clone();
        transport.set_materializer(ctx("page-1"), move || {
            let _rx = t2.subscribe(&ctx("page-1"));
        });
        assert!(!transport.is_attached(&ctx("page-1")));
        transport.materialize(&ctx("page-1")).await.unwrap();
        assert!(transport.is_attached(&ctx("page-1")));
    }
}
