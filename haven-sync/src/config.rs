//! Engine configuration.
//!
//! Loaded once from TOML at startup and shared read-only as
//! `Arc<HavenConfig>`. Every group falls back to its defaults, so a partial
//! file only needs the values it overrides. Durations are integer
//! milliseconds on disk.
//!
//! ```
//! use haven_sync::HavenConfig;
//!
//! let config = HavenConfig::from_toml_str(
//!     r#"
//!     [sync]
//!     max_retry_attempts = 5
//!     retry_delays = [500, 2000]
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.sync.max_retry_attempts, 5);
//! ```

use crate::conflict::ConflictStrategy;
use crate::error::{Result, SyncError};
use crate::network::QualityTier;
use haven_store::{Namespace, StoreOptions};
use haven_types::OperationKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Priority for a kind missing from `sync.priorities`.
pub const DEFAULT_PRIORITY: i32 = 1;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HavenConfig {
    pub sync: SyncConfig,
    pub network: NetworkConfig,
    pub conflict: ConflictConfig,
    pub mutations: MutationConfig,
    pub security: SecurityConfig,
    pub storage: StorageConfig,
}

impl HavenConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| SyncError::Configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SyncError::Configuration(msg));

        if self.sync.retry_delays.is_empty() {
            return invalid("sync.retry_delays must not be empty".into());
        }
        if self.sync.background.enabled && self.sync.background.interval.is_zero() {
            return invalid("sync.background.interval must be positive when enabled".into());
        }
        if self.network.polling_interval.is_zero() {
            return invalid("network.polling_interval must be positive".into());
        }
        if self.network.connection_timeout.is_zero() {
            return invalid("network.connection_timeout must be positive".into());
        }
        let rate = &self.security.rate_limit;
        if rate.enabled && rate.max_operations_per_minute == 0 {
            return invalid("security.rate_limit.max_operations_per_minute must be positive".into());
        }

        for key in self.sync.priorities.keys() {
            check_kind("sync.priorities", key)?;
        }
        for key in self.conflict.strategies.keys() {
            check_kind("conflict.strategies", key)?;
        }
        for (key, endpoint) in &self.mutations.endpoints {
            check_kind("mutations.endpoints", key)?;
            if !endpoint.path.starts_with('/') {
                return invalid(format!(
                    "mutations.endpoints.{key}.path must start with '/': {}",
                    endpoint.path
                ));
            }
        }
        Ok(())
    }

    /// Store options derived from the `storage` and `security` groups.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            namespace: Namespace::new(&self.storage.namespace, &self.storage.cache_buster),
            sensitive_keys: self.security.sensitive_keys.clone(),
        }
    }
}

fn check_kind(group: &str, key: &str) -> Result<()> {
    OperationKind::from_str(key)
        .map(|_| ())
        .map_err(|_| SyncError::Configuration(format!("{group}: unknown operation kind {key}")))
}

// ── sync ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_retry_attempts: u32,
    /// Backoff table, indexed by retry count minus one and clamped to the
    /// last entry.
    #[serde(with = "durations_ms")]
    pub retry_delays: Vec<Duration>,
    /// Drain priority per operation kind wire name. Higher drains first.
    pub priorities: BTreeMap<String, i32>,
    pub background: BackgroundConfig,
    pub manual: ManualConfig,
    /// Keep permanently failed operations for inspection instead of
    /// dropping them.
    pub retain_failed: bool,
    /// Bound on retained failed operations. The oldest are dropped first.
    pub max_failed_operations: usize,
    /// Bound on `SyncStatus::errors`.
    pub max_errors: usize,
}

impl SyncConfig {
    pub fn priority_for(&self, kind: OperationKind) -> i32 {
        self.priorities
            .get(kind.as_str())
            .copied()
            .unwrap_or(DEFAULT_PRIORITY)
    }

    /// Delay before the next attempt of an operation that has failed
    /// `retry_count` times.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let Some(last) = self.retry_delays.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (retry_count.saturating_sub(1) as usize).min(last);
        self.retry_delays[index]
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        use OperationKind::*;
        let priorities = [
            (EmergencyAlert, 10),
            (CreateIncident, 5),
            (UpdateIncident, 4),
            (UpdateSafetyPlan, 4),
            (UploadEvidence, 3),
            (CreateCaseNote, 3),
            (UpdateCaseStatus, 3),
            (SendMessage, 3),
            (CreateAppointment, 2),
            (UpdateAppointment, 2),
            (CancelAppointment, 2),
            (UpdateProfile, 1),
        ]
        .into_iter()
        .map(|(kind, priority)| (kind.as_str().to_string(), priority))
        .collect();

        Self {
            max_retry_attempts: 3,
            retry_delays: vec![
                Duration::from_millis(1_000),
                Duration::from_millis(5_000),
                Duration::from_millis(15_000),
            ],
            priorities,
            background: BackgroundConfig::default(),
            manual: ManualConfig::default(),
            retain_failed: true,
            max_failed_operations: 100,
            max_errors: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub interval: Duration,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualConfig {
    #[serde(with = "duration_ms")]
    pub debounce: Duration,
    pub show_progress: bool,
}

impl Default for ManualConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1_000),
            show_progress: true,
        }
    }
}

// ── network ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Period of [`NetworkMonitor::spawn_polling`](crate::NetworkMonitor::spawn_polling)
    /// for platforms without change events.
    #[serde(with = "duration_ms")]
    pub polling_interval: Duration,
    /// Upper bound on a single dispatch.
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    pub minimum_quality: QualityTier,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            minimum_quality: QualityTier::Poor,
        }
    }
}

// ── conflict ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub default_strategy: ConflictStrategy,
    /// Strategy per operation kind wire name.
    pub strategies: BTreeMap<String, ConflictStrategy>,
    /// Field ownership per entity, used by the merge strategy.
    pub field_priorities: BTreeMap<String, FieldPriorities>,
    /// Record field holding the last modification time in epoch ms.
    pub timestamp_field: String,
}

impl ConflictConfig {
    pub fn strategy_for(&self, kind: OperationKind) -> ConflictStrategy {
        self.strategies
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default_strategy)
    }

    pub fn fields_for(&self, kind: OperationKind) -> Option<&FieldPriorities> {
        self.field_priorities.get(kind.entity())
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        let strategies = [
            (OperationKind::UpdateIncident, ConflictStrategy::Merge),
            (OperationKind::UpdateSafetyPlan, ConflictStrategy::LastWriteWins),
            (OperationKind::UpdateCaseStatus, ConflictStrategy::ServerWins),
            (OperationKind::UpdateProfile, ConflictStrategy::ClientWins),
        ]
        .into_iter()
        .map(|(kind, strategy)| (kind.as_str().to_string(), strategy))
        .collect();

        let field_priorities = [
            (
                "incident",
                FieldPriorities::new(
                    &["description", "narrative", "survivor_statement"],
                    &["status", "assigned_officer", "case_number"],
                ),
            ),
            (
                "safety_plan",
                FieldPriorities::new(
                    &["emergency_contacts", "safe_locations", "warning_signs", "coping_strategies"],
                    &["reviewed_by", "review_status"],
                ),
            ),
            (
                "case",
                FieldPriorities::new(&["notes"], &["status", "assigned_to"]),
            ),
        ]
        .into_iter()
        .map(|(entity, fields)| (entity.to_string(), fields))
        .collect();

        Self {
            default_strategy: ConflictStrategy::LastWriteWins,
            strategies,
            field_priorities,
            timestamp_field: "updated_at".to_string(),
        }
    }
}

/// Which side owns which fields during a merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldPriorities {
    /// Fields that keep the local value.
    pub high_priority: Vec<String>,
    /// Fields that take the server value.
    pub server_priority: Vec<String>,
}

impl FieldPriorities {
    pub fn new(high_priority: &[&str], server_priority: &[&str]) -> Self {
        Self {
            high_priority: high_priority.iter().map(|f| f.to_string()).collect(),
            server_priority: server_priority.iter().map(|f| f.to_string()).collect(),
        }
    }
}

// ── mutations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Where and how one operation kind is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: HttpMethod,
    /// Path below `mutations.base_url`. `{field}` placeholders are filled
    /// from the operation data.
    pub path: String,
    /// Cached reads to drop after a successful dispatch.
    #[serde(default)]
    pub invalidates: Vec<String>,
}

impl Endpoint {
    pub fn new(method: HttpMethod, path: &str, invalidates: &[&str]) -> Self {
        Self {
            method,
            path: path.to_string(),
            invalidates: invalidates.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Fills `{field}` placeholders from top-level fields of `data`.
    pub fn resolve_path(&self, data: &serde_json::Value) -> Result<String> {
        let mut resolved = String::with_capacity(self.path.len());
        let mut rest = self.path.as_str();
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                return Err(SyncError::Configuration(format!(
                    "unterminated placeholder in {}",
                    self.path
                )));
            };
            let field = &rest[start + 1..start + len];
            let value = match data.get(field) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => {
                    return Err(SyncError::Configuration(format!(
                        "operation data has no `{field}` for {}",
                        self.path
                    )));
                }
            };
            resolved.push_str(&rest[..start]);
            resolved.push_str(&value);
            rest = &rest[start + len + 1..];
        }
        resolved.push_str(rest);
        Ok(resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    pub base_url: String,
    /// Endpoint per operation kind wire name.
    pub endpoints: BTreeMap<String, Endpoint>,
}

impl MutationConfig {
    pub fn endpoint_for(&self, kind: OperationKind) -> Option<&Endpoint> {
        self.endpoints.get(kind.as_str())
    }
}

impl Default for MutationConfig {
    fn default() -> Self {
        use HttpMethod::*;
        use OperationKind::*;
        let endpoints = [
            (CreateIncident, Endpoint::new(Post, "/incidents", &["incidents", "dashboard"])),
            (UpdateIncident, Endpoint::new(Patch, "/incidents/{id}", &["incidents"])),
            (CreateAppointment, Endpoint::new(Post, "/appointments", &["appointments"])),
            (UpdateAppointment, Endpoint::new(Patch, "/appointments/{id}", &["appointments"])),
            (
                CancelAppointment,
                Endpoint::new(Post, "/appointments/{id}/cancel", &["appointments"]),
            ),
            (UpdateSafetyPlan, Endpoint::new(Put, "/safety-plans/{id}", &["safety_plan"])),
            (CreateCaseNote, Endpoint::new(Post, "/cases/{case_id}/notes", &["cases"])),
            (UpdateCaseStatus, Endpoint::new(Patch, "/cases/{id}/status", &["cases", "dashboard"])),
            (SendMessage, Endpoint::new(Post, "/messages", &["messages"])),
            (UploadEvidence, Endpoint::new(Post, "/evidence", &["evidence", "incidents"])),
            (UpdateProfile, Endpoint::new(Patch, "/profile", &["profile"])),
            (EmergencyAlert, Endpoint::new(Post, "/alerts/emergency", &["alerts"])),
        ]
        .into_iter()
        .map(|(kind, endpoint)| (kind.as_str().to_string(), endpoint))
        .collect();

        Self {
            base_url: "http://localhost:3000/api".to_string(),
            endpoints,
        }
    }
}

// ── security ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Offline time after which the host should lock sensitive screens.
    #[serde(with = "duration_ms")]
    pub offline_timeout: Duration,
    /// Logical storage keys removed on logout.
    pub clear_on_logout: Vec<String>,
    /// Logical storage keys encrypted at rest.
    pub sensitive_keys: Vec<String>,
    pub rate_limit: RateLimitConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            offline_timeout: Duration::from_secs(24 * 60 * 60),
            clear_on_logout: ["sync_queue", "failed_operations", "last_sync", "network_state"]
                .map(String::from)
                .to_vec(),
            sensitive_keys: ["sync_queue", "failed_operations"].map(String::from).to_vec(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_operations_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_operations_per_minute: 60,
        }
    }
}

// ── storage ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub namespace: String,
    /// Bumped when the persisted layout changes. Entries under any other
    /// version are purged at startup.
    pub cache_buster: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            namespace: "haven".to_string(),
            cache_buster: "v1".to_string(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod durations_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(values: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            values
                .iter()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        Vec::<u64>::deserialize(deserializer)
            .map(|millis| millis.into_iter().map(Duration::from_millis).collect())
    }
}
