use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::ContextId;

/// Why a port was closed. Reported to both endpoints on disconnect.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    /// One endpoint closed the port deliberately.
    Normal,
    /// The peer context disappeared and could not be recovered.
    PeerGone,
    /// The host tore down one endpoint's context (e.g. coordinator idle
    /// termination).
    HostEvicted,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::PeerGone => write!(f, "peer-gone"),
            Self::HostEvicted => write!(f, "host-evicted"),
        }
    }
}

/// Typed errors for message and port delivery.
///
/// Transport-level failures (`Unreachable`) have already been recovered once
/// (re-materialize + one retry) by the time they surface; callers decide
/// whether to degrade, retry with backoff, or abort.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RouteError {
    #[error("destination unreachable: {0}")]
    Unreachable(ContextId),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("port disconnected ({0})")]
    Disconnected(DisconnectReason),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl RouteError {
    /// Transport failures were already retried once by the router; anything
    /// beyond that is the caller's policy.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_) | Self::Transport(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Timeout(_) => "timeout",
            Self::Disconnected(_) => "disconnected",
            Self::Transport(_) => "transport",
            Self::Codec(_) => "codec",
        }
    }
}

impl From<serde_json::Error> for RouteError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
