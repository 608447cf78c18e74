use crate::tier::Tier;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The write would push the tier over its quota. Nothing was written.
    #[error("quota exceeded on {tier}: {attempted} bytes over a {quota} byte bound")]
    QuotaExceeded {
        tier: Tier,
        attempted: usize,
        quota: usize,
    },

    /// A single entry exceeds the tier's per-entry cap. Nothing was written.
    #[error("entry '{key}' exceeds per-entry cap on {tier}: {size} > {cap} bytes")]
    EntryTooLarge {
        tier: Tier,
        key: String,
        size: usize,
        cap: usize,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    /// Quota violations are configuration errors: never retried automatically.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. } | Self::EntryTooLarge { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
