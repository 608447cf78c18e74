//! Cross-context message routing and state synchronization runtime.
//!
//! A host process runs several isolated execution contexts: one ephemeral,
//! privileged coordinator, page-bound contexts tied to page lifetimes, and
//! UI surface contexts. This crate composes the pieces that let them talk
//! and share state:
//!
//! - [`weft_router::Router`]: correlated request/response, fire-and-forget,
//!   broadcast, with bounded one-shot recovery of gone contexts
//! - [`weft_router::PortManager`]: ordered, long-lived channels with
//!   backoff reconnect on the initiating side
//! - [`weft_store::StateStore`]: tiered, quota-bounded persistent store
//!   with change notification
//! - [`weft_router::Supervisor`]: coordinator instantiation, idle
//!   termination, and wake scheduling
//! - [`weft_rules::FilterEngine`]: declarative request filtering
//!
//! [`Runtime`] wires them together over a pluggable [`HostTransport`].

pub mod config;
pub mod diagnostics;
mod runtime;
pub mod telemetry;
pub mod topology;

pub use config::{load_config, load_config_from_path, QuotaConfig, RuntimeConfig};
pub use diagnostics::RuntimeSnapshot;
pub use runtime::{ContextHandle, Runtime, RuntimeError};
pub use topology::PackageDescriptor;

pub use weft_core::{
    ContextDescriptor, ContextId, ContextKind, DisconnectReason, Envelope, Liveness, MessageId,
    Mode, PortId, RouteError, Target, WakeId,
};
pub use weft_router::{
    HostTransport, LoopbackTransport, PortEvent, PortHandle, PortState, StartupHandler,
    TransportError, UnreachablePolicy, WakeSchedule,
};
pub use weft_rules::{
    FilterEngine, RequestDescriptor, ResourceType, Rule, RuleAction, RuleError, RuleSource,
};
pub use weft_store::{ChangeEvent, StateStore, StoreError, StoreQuotas, Tier, TierQuota};
