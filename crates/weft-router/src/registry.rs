use dashmap::DashMap;
use tracing::debug;
use weft_core::{ContextDescriptor, ContextId, Envelope, Liveness};

/// All contexts the runtime currently knows about, keyed by id.
///
/// Liveness here is advisory: the transport is the source of truth for
/// whether a delivery lands. The registry also holds the queued
/// fire-and-forget backlog for contexts under the `queue` unreachable
/// policy, drained when the context next attaches.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: DashMap<ContextId, ContextDescriptor>,
    queued: DashMap<ContextId, Vec<Envelope>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: ContextDescriptor) {
        debug!(context = %descriptor.id, kind = %descriptor.kind, "context registered");
        self.contexts.insert(descriptor.id.clone(), descriptor);
    }

    pub fn remove(&self, id: &ContextId) -> Option<ContextDescriptor> {
        self.contexts.remove(id).map(|(_, d)| d)
    }

    pub fn get(&self, id: &ContextId) -> Option<ContextDescriptor> {
        self.contexts.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &ContextId) -> bool {
        self.contexts.contains_key(id)
    }

    pub fn mark(&self, id: &ContextId, liveness: Liveness) {
        if let Some(mut entry) = self.contexts.get_mut(id) {
            entry.value_mut().liveness = liveness;
        }
    }

    pub fn liveness(&self, id: &ContextId) -> Liveness {
        self.contexts
            .get(id)
            .map(|e| e.value().liveness)
            .unwrap_or(Liveness::Unknown)
    }

    /// Snapshot of every known context, for broadcast fan-out and the
    /// diagnostics surface.
    pub fn all(&self) -> Vec<ContextDescriptor> {
        self.contexts.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Hold a fire-and-forget message for a currently unreachable context.
    pub fn queue_for(&self, id: &ContextId, envelope: Envelope) {
        self.queued.entry(id.clone()).or_default().push(envelope);
    }

    /// Take the queued backlog for a context, in original send order.
    pub fn drain_queued(&self, id: &ContextId) -> Vec<Envelope> {
        self.queued.remove(id).map(|(_, v)| v).unwrap_or_default()
    }

    pub fn queued_len(&self, id: &ContextId) -> usize {
        self.queued.get(id).map(|e| e.value().len()).unwrap_or(0)
    }
}
