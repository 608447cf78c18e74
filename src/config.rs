//! Runtime configuration with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RuntimeConfig::default()`]
//! 2. If the config file exists, deep-merge its values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use weft_router::{RouterConfig, UnreachablePolicy};
use weft_store::{StoreQuotas, TierQuota};

use crate::RuntimeError;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnreachablePolicyConfig {
    #[default]
    Drop,
    Queue,
}

impl From<UnreachablePolicyConfig> for UnreachablePolicy {
    fn from(p: UnreachablePolicyConfig) -> Self {
        match p {
            UnreachablePolicyConfig::Drop => UnreachablePolicy::Drop,
            UnreachablePolicyConfig::Queue => UnreachablePolicy::Queue,
        }
    }
}

/// Per-tier byte bounds. `0` for an entry cap means uncapped.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuotaConfig {
    pub local_max_bytes: usize,
    pub synced_max_bytes: usize,
    pub synced_max_entry_bytes: usize,
    pub session_max_bytes: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let defaults = StoreQuotas::default();
        Self {
            local_max_bytes: defaults.durable_local.max_total_bytes,
            synced_max_bytes: defaults.durable_synced.max_total_bytes,
            synced_max_entry_bytes: defaults.durable_synced.max_entry_bytes.unwrap_or(0),
            session_max_bytes: defaults.volatile_session.max_total_bytes,
        }
    }
}

impl QuotaConfig {
    pub fn to_quotas(&self) -> StoreQuotas {
        StoreQuotas {
            durable_local: TierQuota {
                max_total_bytes: self.local_max_bytes,
                max_entry_bytes: None,
            },
            durable_synced: TierQuota {
                max_total_bytes: self.synced_max_bytes,
                max_entry_bytes: (self.synced_max_entry_bytes > 0)
                    .then_some(self.synced_max_entry_bytes),
            },
            volatile_session: TierQuota {
                max_total_bytes: self.session_max_bytes,
                max_entry_bytes: None,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Id of the privileged coordinator context.
    pub coordinator_id: String,
    /// Coordinator idle termination timeout.
    pub idle_timeout_ms: u64,
    /// Deadline applied to request sends that carry none.
    pub default_deadline_ms: u64,
    /// Port reconnect backoff, initiating side only.
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub unreachable_policy: UnreachablePolicyConfig,
    /// SQLite path for the durable tiers; `None` keeps them in memory.
    pub db_path: Option<String>,
    pub quotas: QuotaConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            coordinator_id: "coordinator".to_string(),
            idle_timeout_ms: 30_000,
            default_deadline_ms: 2_000,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            unreachable_policy: UnreachablePolicyConfig::Drop,
            db_path: None,
            quotas: QuotaConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            default_deadline: Duration::from_millis(self.default_deadline_ms),
            unreachable_policy: self.unreachable_policy.into(),
        }
    }
}

/// Resolve the path to the config file (`~/.weft/config.json`).
pub fn config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".weft").join("config.json")
}

/// Load config from the default path with env var overrides.
pub fn load_config() -> Result<RuntimeConfig, RuntimeError> {
    load_config_from_path(&config_path())
}

/// Load config from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_config_from_path(path: &Path) -> Result<RuntimeConfig, RuntimeError> {
    let defaults = serde_json::to_value(RuntimeConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("read {}: {e}", path.display())))?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: RuntimeConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to a loaded config.
///
/// Integers must parse and fall within range; invalid values are ignored
/// with a warning, falling back to file/default.
pub fn apply_env_overrides(config: &mut RuntimeConfig) {
    if let Some(v) = read_env_string("WEFT_COORDINATOR_ID") {
        config.coordinator_id = v;
    }
    if let Some(v) = read_env_u64("WEFT_IDLE_TIMEOUT_MS", 100, 3_600_000) {
        config.idle_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("WEFT_DEFAULT_DEADLINE_MS", 10, 600_000) {
        config.default_deadline_ms = v;
    }
    if let Some(v) = read_env_u64("WEFT_RECONNECT_BASE_MS", 10, 600_000) {
        config.reconnect_base_ms = v;
    }
    if let Some(v) = read_env_u64("WEFT_RECONNECT_CAP_MS", 10, 3_600_000) {
        config.reconnect_cap_ms = v;
    }
    if let Some(v) = read_env_string("WEFT_UNREACHABLE_POLICY") {
        match parse_policy(&v) {
            Some(policy) => config.unreachable_policy = policy,
            None => {
                tracing::warn!(value = %v, "invalid WEFT_UNREACHABLE_POLICY, ignoring")
            }
        }
    }
    if let Some(v) = read_env_string("WEFT_DB_PATH") {
        config.db_path = Some(v);
    }
    if let Some(v) = read_env_usize("WEFT_LOCAL_MAX_BYTES", 1024, 1_073_741_824) {
        config.quotas.local_max_bytes = v;
    }
    if let Some(v) = read_env_usize("WEFT_SYNCED_MAX_BYTES", 128, 1_073_741_824) {
        config.quotas.synced_max_bytes = v;
    }
    if let Some(v) = read_env_usize("WEFT_SESSION_MAX_BYTES", 1024, 1_073_741_824) {
        config.quotas.session_max_bytes = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

pub fn parse_policy(val: &str) -> Option<UnreachablePolicyConfig> {
    match val.to_lowercase().as_str() {
        "drop" => Some(UnreachablePolicyConfig::Drop),
        "queue" => Some(UnreachablePolicyConfig::Queue),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_simple_override() {
        let merged = deep_merge(json!({"a": 1, "b": 2}), json!({"b": 3}));
        assert_eq!(merged, json!({"a": 1, "b": 3}));
    }

    #[test]
    fn merge_is_recursive_for_objects() {
        let merged = deep_merge(
            json!({"quotas": {"localMaxBytes": 1, "syncedMaxBytes": 2}}),
            json!({"quotas": {"syncedMaxBytes": 5}}),
        );
        assert_eq!(merged, json!({"quotas": {"localMaxBytes": 1, "syncedMaxBytes": 5}}));
    }

    #[test]
    fn merge_skips_nulls() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null, "b": 2}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_replaces_arrays_entirely() {
        let merged = deep_merge(json!({"a": [1, 2, 3]}), json!({"a": [9]}));
        assert_eq!(merged, json!({"a": [9]}));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config_from_path(Path::new("/nonexistent/weft-config.json")).unwrap();
        assert_eq!(config.coordinator_id, "coordinator");
        assert_eq!(config.idle_timeout_ms, 30_000);
        assert_eq!(config.unreachable_policy, UnreachablePolicyConfig::Drop);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = std::env::temp_dir().join("weft-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("partial.json");
        std::fs::write(&path, r#"{"idleTimeoutMs": 5000, "quotas": {"syncedMaxBytes": 4096}}"#)
            .unwrap();

        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.idle_timeout_ms, 5000);
        assert_eq!(config.quotas.synced_max_bytes, 4096);
        // Untouched keys keep defaults.
        assert_eq!(config.default_deadline_ms, 2000);
        assert_eq!(config.quotas.local_max_bytes, QuotaConfig::default().local_max_bytes);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = std::env::temp_dir().join("weft-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_config_from_path(&path).is_err());
    }

    #[test]
    fn policy_parsing() {
        assert_eq!(parse_policy("drop"), Some(UnreachablePolicyConfig::Drop));
        assert_eq!(parse_policy("QUEUE"), Some(UnreachablePolicyConfig::Queue));
        assert_eq!(parse_policy("hold"), None);
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_u64_range("500", 100, 1000), Some(500));
        assert_eq!(parse_u64_range("99", 100, 1000), None);
        assert_eq!(parse_u64_range("1001", 100, 1000), None);
        assert_eq!(parse_u64_range("abc", 100, 1000), None);
    }

    #[test]
    fn zero_entry_cap_means_uncapped() {
        let quotas = QuotaConfig {
            synced_max_entry_bytes: 0,
            ..QuotaConfig::default()
        }
        .to_quotas();
        assert_eq!(quotas.durable_synced.max_entry_bytes, None);
    }
}
