//! Read-only, non-transactional snapshot for external tooling. Each
//! section is captured independently; the whole is not a consistent cut.

use serde::Serialize;
use weft_core::ContextDescriptor;
use weft_router::ports::PortInfo;
use weft_rules::{Rule, RuleSource};
use weft_store::TierUsage;

#[derive(Clone, Debug, Serialize)]
pub struct ActiveRule {
    pub source: RuleSource,
    #[serde(flatten)]
    pub rule: Rule,
}

#[derive(Clone, Debug, Serialize)]
pub struct RuntimeSnapshot {
    pub contexts: Vec<ContextDescriptor>,
    pub ports: Vec<PortInfo>,
    pub store: Vec<TierUsage>,
    pub rules: Vec<ActiveRule>,
    pub coordinator_alive: bool,
    pub coordinator_generation: u64,
    pub pending_requests: usize,
}
