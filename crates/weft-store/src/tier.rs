use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Isolation/quota class of the persistent store.
#[derive(Clone, Copy, Debug, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Large aggregate bound, persisted locally.
    DurableLocal,
    /// Tight aggregate and per-entry caps; models a cross-device
    /// replication budget.
    DurableSynced,
    /// Mirrors durable-local's bound but lives in memory only and is
    /// dropped on a full host restart.
    VolatileSession,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::DurableLocal, Tier::DurableSynced, Tier::VolatileSession];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DurableLocal => "durable_local",
            Self::DurableSynced => "durable_synced",
            Self::VolatileSession => "volatile_session",
        }
    }

    pub fn is_durable(&self) -> bool {
        !matches!(self, Self::VolatileSession)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "durable_local" => Ok(Self::DurableLocal),
            "durable_synced" => Ok(Self::DurableSynced),
            "volatile_session" => Ok(Self::VolatileSession),
            other => Err(format!("unknown store tier: {other}")),
        }
    }
}

/// Byte bounds for one tier.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierQuota {
    pub max_total_bytes: usize,
    /// None means no meaningful per-entry cap.
    pub max_entry_bytes: Option<usize>,
}

/// Quotas for all three tiers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StoreQuotas {
    pub durable_local: TierQuota,
    pub durable_synced: TierQuota,
    pub volatile_session: TierQuota,
}

impl StoreQuotas {
    pub fn for_tier(&self, tier: Tier) -> TierQuota {
        match tier {
            Tier::DurableLocal => self.durable_local,
            Tier::DurableSynced => self.durable_synced,
            Tier::VolatileSession => self.volatile_session,
        }
    }
}

impl Default for StoreQuotas {
    fn default() -> Self {
        // Bounds model the usual host storage budget: a roomy local tier,
        // a tight synced tier (aggregate and per-entry), and a session tier
        // mirroring local.
        let local = TierQuota {
            max_total_bytes: 10 * 1024 * 1024,
            max_entry_bytes: None,
        };
        Self {
            durable_local: local,
            durable_synced: TierQuota {
                max_total_bytes: 100 * 1024,
                max_entry_bytes: Some(8 * 1024),
            },
            volatile_session: local,
        }
    }
}
