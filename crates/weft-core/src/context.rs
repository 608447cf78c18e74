use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, host-assigned identifier for an execution context.
///
/// Unlike the runtime's own branded ids, context ids are minted by the host
/// platform and treated as opaque strings.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContextId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// What kind of execution unit a context is.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// The single privileged, host-managed, ephemeral context.
    Coordinator,
    /// Injected into a page; keyed by the tab/frame scope it is bound to.
    PageBound,
    /// Transient UI surface (popup, options panel, side panel).
    UiSurface,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinator => write!(f, "coordinator"),
            Self::PageBound => write!(f, "page_bound"),
            Self::UiSurface => write!(f, "ui_surface"),
        }
    }
}

/// Liveness is never directly observable; it is inferred from delivery
/// outcomes and starts out unknown.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Unknown,
    Alive,
    Gone,
}

/// An addressable execution unit as known to the router.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextDescriptor {
    pub id: ContextId,
    pub kind: ContextKind,
    /// Tab/frame binding for page-bound contexts; None otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub liveness: Liveness,
}

impl ContextDescriptor {
    pub fn coordinator(id: impl Into<String>) -> Self {
        Self {
            id: ContextId::from_raw(id),
            kind: ContextKind::Coordinator,
            scope: None,
            liveness: Liveness::Unknown,
        }
    }

    pub fn page_bound(id: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            id: ContextId::from_raw(id),
            kind: ContextKind::PageBound,
            scope: Some(scope.into()),
            liveness: Liveness::Unknown,
        }
    }

    pub fn ui_surface(id: impl Into<String>) -> Self {
        Self {
            id: ContextId::from_raw(id),
            kind: ContextKind::UiSurface,
            scope: None,
            liveness: Liveness::Unknown,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.kind == ContextKind::Coordinator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_id_is_opaque() {
        let id = ContextId::from_raw("host-assigned-42");
        assert_eq!(id.as_str(), "host-assigned-42");
        assert_eq!(id.to_string(), "host-assigned-42");
    }

    #[test]
    fn page_bound_carries_scope() {
        let ctx = ContextDescriptor::page_bound("page-1", "tab:7/frame:0");
        assert_eq!(ctx.kind, ContextKind::PageBound);
        assert_eq!(ctx.scope.as_deref(), Some("tab:7/frame:0"));
        assert_eq!(ctx.liveness, Liveness::Unknown);
    }

    #[test]
    fn coordinator_has_no_scope() {
        let ctx = ContextDescriptor::coordinator("bg");
        assert!(ctx.is_coordinator());
        assert!(ctx.scope.is_none());
    }

    #[test]
    fn kind_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&ContextKind::PageBound).unwrap(),
            r#""page_bound""#
        );
        assert_eq!(
            serde_json::to_string(&ContextKind::UiSurface).unwrap(),
            r#""ui_surface""#
        );
    }

    #[test]
    fn descriptor_serde_roundtrip() {
        let ctx = ContextDescriptor::page_bound("p", "tab:1");
        let json = serde_json::to_string(&ctx).unwrap();
        let parsed: ContextDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, ctx.id);
        assert_eq!(parsed.scope, ctx.scope);
    }
}
