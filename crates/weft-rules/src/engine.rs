use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::RuleError;
use crate::rule::{RequestDescriptor, Rule, RuleAction, RuleSource};

struct CompiledRule {
    rule: Rule,
    source: RuleSource,
    pattern: Regex,
}

impl CompiledRule {
    fn matches(&self, descriptor: &RequestDescriptor) -> bool {
        if !self.pattern.is_match(&descriptor.url) {
            return false;
        }
        let cond = &self.rule.condition;
        if !cond.methods.is_empty()
            && !cond
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&descriptor.method))
        {
            return false;
        }
        if !cond.resource_types.is_empty()
            && !cond.resource_types.contains(&descriptor.resource_type)
        {
            return false;
        }
        true
    }
}

/// One source's compiled rules, shared between snapshots so updating one
/// source never recompiles or invalidates the others.
type SourceRules = Arc<Vec<Arc<CompiledRule>>>;

struct Snapshot {
    sources: [SourceRules; 3],
    enabled: [bool; 3],
}

fn source_index(source: RuleSource) -> usize {
    match source {
        RuleSource::Static => 0,
        RuleSource::Dynamic => 1,
        RuleSource::Session => 2,
    }
}

/// The winning rule of a dry-run match.
#[derive(Clone, Debug, Serialize)]
pub struct RuleMatch {
    pub source: RuleSource,
    pub rule_id: u32,
    pub priority: i32,
    pub action: RuleAction,
}

/// Evaluates outbound-request descriptors against the union of static,
/// dynamic, and session rules.
///
/// The active rule set is an immutable snapshot behind an atomic swap, so
/// concurrent `evaluate` calls never observe a partially updated set.
pub struct FilterEngine {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterEngine {
    pub fn new() -> Self {
        let empty: SourceRules = Arc::new(Vec::new());
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot {
                sources: [empty.clone(), empty.clone(), empty],
                enabled: [true; 3],
            })),
        }
    }

    fn compile(source: RuleSource, rule: Rule) -> Result<Arc<CompiledRule>, RuleError> {
        let pattern = Regex::new(&rule.condition.url_pattern).map_err(|e| RuleError::InvalidRule {
            id: rule.id,
            reason: format!("url_pattern: {e}"),
        })?;
        if let RuleAction::Redirect { to } = &rule.action {
            if to.is_empty() {
                return Err(RuleError::InvalidRule {
                    id: rule.id,
                    reason: "redirect target is empty".into(),
                });
            }
        }
        Ok(Arc::new(CompiledRule { rule, source, pattern }))
    }

    fn validate_ids(source: RuleSource, rules: &[Arc<CompiledRule>]) -> Result<(), RuleError> {
        let mut seen = HashSet::new();
        for compiled in rules {
            if !seen.insert(compiled.rule.id) {
                return Err(RuleError::DuplicateId {
                    rule_source: source,
                    id: compiled.rule.id,
                });
            }
        }
        Ok(())
    }

    /// Replace one source's rule set wholesale. The whole batch is validated
    /// before the swap; on error the active set is unchanged.
    pub fn replace_source(&self, source: RuleSource, rules: Vec<Rule>) -> Result<(), RuleError> {
        let compiled: Vec<Arc<CompiledRule>> = rules
            .into_iter()
            .map(|r| Self::compile(source, r))
            .collect::<Result<_, _>>()?;
        Self::validate_ids(source, &compiled)?;

        let mut guard = self.snapshot.write();
        let current = Arc::clone(&guard);
        let mut sources = current.sources.clone();
        sources[source_index(source)] = Arc::new(compiled);
        *guard = Arc::new(Snapshot {
            sources,
            enabled: current.enabled,
        });
        debug!(source = %source, "rule source replaced");
        Ok(())
    }

    /// Incrementally update the dynamic or session set: remove by id, then
    /// add. Unrelated sources keep sharing their compiled rules untouched.
    pub fn update_source(
        &self,
        source: RuleSource,
        add: Vec<Rule>,
        remove_ids: &[u32],
    ) -> Result<(), RuleError> {
        let added: Vec<Arc<CompiledRule>> = add
            .into_iter()
            .map(|r| Self::compile(source, r))
            .collect::<Result<_, _>>()?;

        let mut guard = self.snapshot.write();
        let current = Arc::clone(&guard);

        let mut next: Vec<Arc<CompiledRule>> = current.sources[source_index(source)]
            .iter()
            .filter(|c| !remove_ids.contains(&c.rule.id))
            .cloned()
            .collect();
        next.extend(added);
        Self::validate_ids(source, &next)?;

        let mut sources = current.sources.clone();
        sources[source_index(source)] = Arc::new(next);
        *guard = Arc::new(Snapshot {
            sources,
            enabled: current.enabled,
        });
        Ok(())
    }

    pub fn set_enabled(&self, source: RuleSource, enabled: bool) {
        let mut guard = self.snapshot.write();
        let current = Arc::clone(&guard);
        let mut flags = current.enabled;
        flags[source_index(source)] = enabled;
        *guard = Arc::new(Snapshot {
            sources: current.sources.clone(),
            enabled: flags,
        });
    }

    fn best_match(&self, descriptor: &RequestDescriptor) -> Option<RuleMatch> {
        let snapshot = self.snapshot.read().clone();
        let mut best: Option<&CompiledRule> = None;
        for (idx, rules) in snapshot.sources.iter().enumerate() {
            if !snapshot.enabled[idx] {
                continue;
            }
            for compiled in rules.iter() {
                if !compiled.matches(descriptor) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some(current) => {
                        let lhs = (compiled.rule.priority, compiled.rule.action.class_rank());
                        let rhs = (current.rule.priority, current.rule.action.class_rank());
                        lhs > rhs
                    }
                };
                if better {
                    best = Some(compiled);
                }
            }
        }
        best.map(|c| RuleMatch {
            source: c.source,
            rule_id: c.rule.id,
            priority: c.rule.priority,
            action: c.rule.action.clone(),
        })
    }

    /// Return the single winning action for a request. With no matching
    /// enabled rule the request passes (`Allow`).
    pub fn evaluate(&self, descriptor: &RequestDescriptor) -> RuleAction {
        match self.best_match(descriptor) {
            Some(m) => {
                debug!(
                    url = %descriptor.url,
                    rule_id = m.rule_id,
                    source = %m.source,
                    action = m.action.class_name(),
                    "request matched rule"
                );
                m.action
            }
            None => RuleAction::Allow,
        }
    }

    /// Dry run for diagnostics: which rule would win, without acting on it.
    pub fn test_match(&self, descriptor: &RequestDescriptor) -> Option<RuleMatch> {
        self.best_match(descriptor)
    }

    /// All currently active (enabled-source) rules, for the diagnostics
    /// snapshot.
    pub fn active_rules(&self) -> Vec<(RuleSource, Rule)> {
        let snapshot = self.snapshot.read().clone();
        let mut out = Vec::new();
        for (idx, rules) in snapshot.sources.iter().enumerate() {
            if !snapshot.enabled[idx] {
                continue;
            }
            for compiled in rules.iter() {
                out.push((compiled.source, compiled.rule.clone()));
            }
        }
        out
    }

    pub fn rule_count(&self, source: RuleSource) -> usize {
        self.snapshot.read().sources[source_index(source)].len()
    }
}
