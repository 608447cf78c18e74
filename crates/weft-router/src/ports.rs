use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use weft_core::{ContextId, DisconnectReason, Envelope, PortId, RouteError, Target};

use crate::router::Router;

/// Envelope kinds reserved for port traffic.
pub const PORT_CTL_KIND: &str = "port:ctl";
pub const PORT_MSG_KIND: &str = "port:msg";

pub fn is_port_kind(kind: &str) -> bool {
    kind == PORT_CTL_KIND || kind == PORT_MSG_KIND
}

pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Port protocol frames, carried as JSON in the envelope payload.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "op", rename_all = "snake_case")]
enum PortFrame {
    Connect { port: PortId, name: String },
    Accept { port: PortId },
    Payload { port: PortId, seq: u64, data: Vec<u8> },
    Close { port: PortId, reason: DisconnectReason },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    Connecting,
    Open,
    /// Terminal.
    Closed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PortEvent {
    Opened,
    Message(Bytes),
    Disconnected(DisconnectReason),
}

struct PortInner {
    state: PortState,
    reason: Option<DisconnectReason>,
    seq: u64,
    /// Taken by the writer task when the port opens.
    outbound_rx: Option<mpsc::UnboundedReceiver<(u64, Bytes)>>,
    reconnect: Option<CancellationToken>,
}

struct PortEntry {
    id: PortId,
    name: String,
    local: ContextId,
    peer: ContextId,
    initiator: bool,
    inner: Mutex<PortInner>,
    events: mpsc::UnboundedSender<PortEvent>,
    outbound_tx: mpsc::UnboundedSender<(u64, Bytes)>,
}

impl PortEntry {
    fn new(
        id: PortId,
        name: String,
        local: ContextId,
        peer: ContextId,
        initiator: bool,
        state: PortState,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PortEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let entry = Arc::new(Self {
            id,
            name,
            local,
            peer,
            initiator,
            inner: Mutex::new(PortInner {
                state,
                reason: None,
                seq: 0,
                outbound_rx: Some(outbound_rx),
                reconnect: None,
            }),
            events: events_tx,
            outbound_tx,
        });
        (entry, events_rx)
    }

    fn state(&self) -> PortState {
        self.inner.lock().state
    }
}

/// One endpoint's view of a port. Dropping the handle does not close the
/// port; call [`PortHandle::close`].
pub struct PortHandle {
    manager: Arc<PortManager>,
    entry: Arc<PortEntry>,
    events: mpsc::UnboundedReceiver<PortEvent>,
}

impl PortHandle {
    pub fn id(&self) -> &PortId {
        &self.entry.id
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn peer(&self) -> &ContextId {
        &self.entry.peer
    }

    pub fn state(&self) -> PortState {
        self.entry.state()
    }

    /// Queue a payload for ordered, best-effort delivery.
    ///
    /// While the port is connecting the payload is buffered and flushed
    /// in order at open. After close this rejects synchronously; nothing
    /// is silently dropped.
    pub fn post(&self, payload: impl Into<Bytes>) -> Result<(), RouteError> {
        let mut inner = self.entry.inner.lock();
        match inner.state {
            PortState::Closed => Err(RouteError::Disconnected(
                inner.reason.unwrap_or(DisconnectReason::Normal),
            )),
            PortState::Connecting | PortState::Open => {
                inner.seq += 1;
                let seq = inner.seq;
                self.entry.outbound_tx.send((seq, payload.into())).ok();
                Ok(())
            }
        }
    }

    /// Next port event: `Opened`, inbound `Message`s in send order, and
    /// finally one `Disconnected`.
    pub async fn recv(&mut self) -> Option<PortEvent> {
        self.events.recv().await
    }

    /// Close deliberately; the peer endpoint is notified with `normal`.
    /// Also cancels a pending reconnect.
    pub fn close(&self) {
        self.manager
            .close_port(&self.entry, DisconnectReason::Normal, true);
    }
}

/// Open-port summary for the diagnostics surface.
#[derive(Clone, Debug, Serialize)]
pub struct PortInfo {
    pub id: PortId,
    pub name: String,
    pub local: ContextId,
    pub peer: ContextId,
    pub initiator: bool,
    pub connecting: bool,
}

/// Manages every port endpoint in the process.
///
/// Port traffic rides the router as fire-and-forget envelopes with the
/// reserved `port:` kinds; per-port order comes from the single writer
/// task each open endpoint runs.
pub struct PortManager {
    router: Arc<Router>,
    ports: DashMap<(PortId, ContextId), Arc<PortEntry>>,
    acceptors: DashMap<ContextId, mpsc::UnboundedSender<PortHandle>>,
    reconnect_base: Duration,
    reconnect_cap: Duration,
}

impl PortManager {
    pub fn new(router: Arc<Router>) -> Self {
        Self::with_backoff(router, DEFAULT_RECONNECT_BASE, DEFAULT_RECONNECT_CAP)
    }

    pub fn with_backoff(router: Arc<Router>, base: Duration, cap: Duration) -> Self {
        Self {
            router,
            ports: DashMap::new(),
            acceptors: DashMap::new(),
            reconnect_base: base,
            reconnect_cap: cap,
        }
    }

    /// Incoming ports for a context. One acceptor per context; a second
    /// call replaces the first.
    pub fn listen(&self, ctx: &ContextId) -> mpsc::UnboundedReceiver<PortHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.acceptors.insert(ctx.clone(), tx);
        rx
    }

    /// Open a port from `local` to `peer`.
    ///
    /// The returned handle starts out connecting; posts are buffered
    /// until open. Only this initiating side auto-reconnects, with
    /// exponential backoff from the base up to the cap, until the
    /// connect lands or the handle is closed.
    pub fn connect(
        self: &Arc<Self>,
        local: ContextId,
        peer: ContextId,
        name: impl Into<String>,
    ) -> PortHandle {
        let id = PortId::new();
        let name = name.into();
        let (entry, events) = PortEntry::new(
            id.clone(),
            name.clone(),
            local.clone(),
            peer.clone(),
            true,
            PortState::Connecting,
        );
        let cancel = CancellationToken::new();
        entry.inner.lock().reconnect = Some(cancel.clone());
        self.ports.insert((id.clone(), local.clone()), entry.clone());
        debug!(port = %id, from = %local, to = %peer, name = %name, "port connecting");

        let manager = Arc::clone(self);
        let connect_entry = entry.clone();
        tokio::spawn(async move {
            manager.connect_loop(connect_entry, cancel).await;
        });

        PortHandle {
            manager: Arc::clone(self),
            entry,
            events,
        }
    }

    async fn connect_loop(self: Arc<Self>, entry: Arc<PortEntry>, cancel: CancellationToken) {
        let frame = PortFrame::Connect {
            port: entry.id.clone(),
            name: entry.name.clone(),
        };
        let mut delay = self.reconnect_base;
        loop {
            if entry.state() != PortState::Connecting {
                return;
            }
            let envelope = match control_envelope(&entry.local, &entry.peer, &frame) {
                Ok(e) => e,
                Err(e) => {
                    warn!(port = %entry.id, error = %e, "connect frame encode failed");
                    return;
                }
            };
            match self.router.fire_and_forget(envelope).await {
                // Delivered; the accept frame will open the port.
                Ok(()) => return,
                Err(e) => {
                    debug!(port = %entry.id, to = %entry.peer, error = %e,
                           retry_in = ?delay, "connect attempt failed");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {
                    delay = (delay * 2).min(self.reconnect_cap);
                }
            }
        }
    }

    fn start_writer(self: &Arc<Self>, entry: &Arc<PortEntry>) {
        let Some(mut rx) = entry.inner.lock().outbound_rx.take() else {
            return;
        };
        let manager = Arc::clone(self);
        let entry = entry.clone();
        tokio::spawn(async move {
            while let Some((seq, data)) = rx.recv().await {
                let frame = PortFrame::Payload {
                    port: entry.id.clone(),
                    seq,
                    data: data.to_vec(),
                };
                let envelope = match message_envelope(&entry.local, &entry.peer, &frame) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(port = %entry.id, error = %e, "payload frame encode failed");
                        continue;
                    }
                };
                if let Err(e) = manager.router.fire_and_forget(envelope).await {
                    debug!(port = %entry.id, to = %entry.peer, error = %e,
                           "port send failed after recovery, closing");
                    manager.close_port(&entry, DisconnectReason::PeerGone, false);
                    return;
                }
            }
        });
    }

    /// Handle an inbound `port:` envelope for one context. Sync so it can
    /// run inside a context's pump; peer-directed replies are spawned.
    pub fn handle_frame(self: &Arc<Self>, local: &ContextId, envelope: Envelope) {
        let frame: PortFrame = match serde_json::from_slice(&envelope.payload) {
            Ok(f) => f,
            Err(e) => {
                warn!(context = %local, error = %e, "undecodable port frame");
                return;
            }
        };
        match frame {
            PortFrame::Connect { port, name } => {
                self.accept(local, envelope.from, port, name);
            }
            PortFrame::Accept { port } => {
                let Some(entry) = self.get(&port, local) else { return };
                let mut inner = entry.inner.lock();
                if inner.state != PortState::Connecting {
                    return;
                }
                inner.state = PortState::Open;
                if let Some(token) = inner.reconnect.take() {
                    token.cancel();
                }
                drop(inner);
                debug!(port = %port, context = %local, "port open");
                entry.events.send(PortEvent::Opened).ok();
                self.start_writer(&entry);
            }
            PortFrame::Payload { port, seq, data } => {
                let Some(entry) = self.get(&port, local) else {
                    debug!(port = %port, context = %local, seq, "payload for unknown port");
                    return;
                };
                entry.events.send(PortEvent::Message(Bytes::from(data))).ok();
            }
            PortFrame::Close { port, reason } => {
                if let Some(entry) = self.get(&port, local) {
                    self.close_port(&entry, reason, false);
                }
            }
        }
    }

    fn accept(self: &Arc<Self>, local: &ContextId, peer: ContextId, port: PortId, name: String) {
        let (entry, events) = PortEntry::new(
            port.clone(),
            name,
            local.clone(),
            peer.clone(),
            false,
            PortState::Open,
        );
        self.ports.insert((port.clone(), local.clone()), entry.clone());
        entry.events.send(PortEvent::Opened).ok();
        self.start_writer(&entry);

        let reply = PortFrame::Accept { port: port.clone() };
        match control_envelope(local, &peer, &reply) {
            Ok(envelope) => {
                let router = self.router.clone();
                tokio::spawn(async move {
                    router.fire_and_forget(envelope).await.ok();
                });
            }
            Err(e) => warn!(port = %port, error = %e, "accept frame encode failed"),
        }

        let handle = PortHandle {
            manager: Arc::clone(self),
            entry: entry.clone(),
            events,
        };
        let delivered = self
            .acceptors
            .get(local)
            .map(|tx| tx.value().send(handle).is_ok())
            .unwrap_or(false);
        if !delivered {
            warn!(port = %port, context = %local, "no acceptor for incoming port");
            self.close_port(&entry, DisconnectReason::Normal, true);
        } else {
            debug!(port = %port, context = %local, from = %peer, "port accepted");
        }
    }

    fn get(&self, port: &PortId, local: &ContextId) -> Option<Arc<PortEntry>> {
        self.ports
            .get(&(port.clone(), local.clone()))
            .map(|e| e.value().clone())
    }

    fn close_port(self: &Arc<Self>, entry: &Arc<PortEntry>, reason: DisconnectReason, notify_peer: bool) {
        let was_open = {
            let mut inner = entry.inner.lock();
            if inner.state == PortState::Closed {
                return;
            }
            let was_open = inner.state == PortState::Open;
            inner.state = PortState::Closed;
            inner.reason = Some(reason);
            if let Some(token) = inner.reconnect.take() {
                token.cancel();
            }
            was_open
        };
        entry.events.send(PortEvent::Disconnected(reason)).ok();
        self.ports.remove(&(entry.id.clone(), entry.local.clone()));
        debug!(port = %entry.id, context = %entry.local, reason = %reason, "port closed");

        // A port that never left Connecting has no peer state to tear down;
        // notifying would poke a context that may not even exist yet.
        if notify_peer && was_open {
            let frame = PortFrame::Close {
                port: entry.id.clone(),
                reason,
            };
            if let Ok(envelope) = control_envelope(&entry.local, &entry.peer, &frame) {
                let router = self.router.clone();
                tokio::spawn(async move {
                    router.fire_and_forget(envelope).await.ok();
                });
            }
        }
    }

    /// Tear down every port anchored in an evicted context; surviving
    /// peers are told `host-evicted`.
    pub fn evict_context(self: &Arc<Self>, ctx: &ContextId) {
        let evicted: Vec<_> = self
            .ports
            .iter()
            .filter(|e| &e.value().local == ctx)
            .map(|e| e.value().clone())
            .collect();
        for entry in evicted {
            self.close_port(&entry, DisconnectReason::HostEvicted, true);
        }
    }

    pub fn open_ports(&self) -> Vec<PortInfo> {
        self.ports
            .iter()
            .map(|e| {
                let entry = e.value();
                PortInfo {
                    id: entry.id.clone(),
                    name: entry.name.clone(),
                    local: entry.local.clone(),
                    peer: entry.peer.clone(),
                    initiator: entry.initiator,
                    connecting: entry.state() == PortState::Connecting,
                }
            })
            .collect()
    }
}

fn control_envelope(
    from: &ContextId,
    to: &ContextId,
    frame: &PortFrame,
) -> Result<Envelope, serde_json::Error> {
    Ok(Envelope::fire_and_forget(
        from.clone(),
        Target::Context(to.clone()),
        PORT_CTL_KIND,
        Bytes::from(serde_json::to_vec(frame)?),
    ))
}

fn message_envelope(
    from: &ContextId,
    to: &ContextId,
    frame: &PortFrame,
) -> Result<Envelope, serde_json::Error> {
    Ok(Envelope::fire_and_forget(
        from.clone(),
        Target::Context(to.clone()),
        PORT_MSG_KIND,
        Bytes::from(serde_json::to_vec(frame)?),
    ))
}
