//! Conflict Resolver.
//!
//! Pure decision logic: given a local and a server version of the same
//! record, pick or build the authoritative one. No I/O and no hidden state,
//! so resolving the same input twice yields the same output, and feeding a
//! resolved value back in as the new local side changes nothing.

use crate::config::ConflictConfig;
use haven_types::{OperationKind, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// How to reconcile a local record with the server's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    ServerWins,
    ClientWins,
    /// Newer timestamp wins. Exact ties go to the server.
    #[default]
    LastWriteWins,
    /// Field-level reconciliation using the entity's field priorities.
    Merge,
}

/// A detected divergence. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictData<T> {
    pub local: T,
    pub server: T,
    pub local_timestamp: Timestamp,
    pub server_timestamp: Timestamp,
    /// The diverging field, when the server names one.
    pub field: Option<String>,
}

/// Records that can be merged field by field.
pub trait Mergeable: Clone {
    /// Starts from `server`. Fields in `high_priority` take the local
    /// value, fields in `server_priority` keep the server value, and
    /// unclassified fields keep the server value. A field listed on both
    /// sides keeps the server value. Fields the server does not have at all
    /// keep the local value.
    fn merge_fields(
        local: &Self,
        server: &Self,
        high_priority: &[String],
        server_priority: &[String],
    ) -> Self;
}

impl Mergeable for Value {
    fn merge_fields(
        local: &Self,
        server: &Self,
        high_priority: &[String],
        server_priority: &[String],
    ) -> Self {
        let (Value::Object(local), Value::Object(server)) = (local, server) else {
            return server.clone();
        };

        let mut merged = server.clone();
        for (field, local_value) in local {
            let local_owned = high_priority.iter().any(|f| f == field);
            let server_owned = server_priority.iter().any(|f| f == field);
            if (local_owned && !server_owned) || !server.contains_key(field) {
                merged.insert(field.clone(), local_value.clone());
            }
        }
        Value::Object(merged)
    }
}

/// Applies the configured strategies.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    config: ConflictConfig,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    /// Resolves with `strategy`, or the default strategy when `None`.
    ///
    /// `Merge` without an entity has no field priorities, so every shared
    /// field keeps the server value.
    pub fn resolve<T: Mergeable>(
        &self,
        conflict: &ConflictData<T>,
        strategy: Option<ConflictStrategy>,
    ) -> T {
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        self.apply(conflict, strategy, &[], &[])
    }

    /// Resolves with the strategy configured for `kind`.
    pub fn resolve_by_type<T: Mergeable>(&self, conflict: &ConflictData<T>, kind: OperationKind) -> T {
        let strategy = self.config.strategy_for(kind);
        debug!(kind = %kind, ?strategy, field = ?conflict.field, "resolving conflict");
        match self.config.fields_for(kind) {
            Some(fields) => self.apply(
                conflict,
                strategy,
                &fields.high_priority,
                &fields.server_priority,
            ),
            None => self.apply(conflict, strategy, &[], &[]),
        }
    }

    /// Field-level merge of two records.
    pub fn resolve_fields<T: Mergeable>(
        &self,
        local: &T,
        server: &T,
        high_priority: &[String],
        server_priority: &[String],
    ) -> T {
        T::merge_fields(local, server, high_priority, server_priority)
    }

    fn apply<T: Mergeable>(
        &self,
        conflict: &ConflictData<T>,
        strategy: ConflictStrategy,
        high_priority: &[String],
        server_priority: &[String],
    ) -> T {
        match strategy {
            ConflictStrategy::ServerWins => conflict.server.clone(),
            ConflictStrategy::ClientWins => conflict.local.clone(),
            ConflictStrategy::LastWriteWins => {
                if conflict.local_timestamp > conflict.server_timestamp {
                    conflict.local.clone()
                } else {
                    conflict.server.clone()
                }
            }
            ConflictStrategy::Merge => {
                self.resolve_fields(&conflict.local, &conflict.server, high_priority, server_priority)
            }
        }
    }

    /// Reads the configured timestamp field of a record as epoch ms.
    pub fn timestamp_of(&self, record: &Value) -> Option<Timestamp> {
        record
            .get(&self.config.timestamp_field)
            .and_then(Value::as_u64)
            .map(Timestamp::from_millis)
    }

    /// Builds conflict data for JSON records. The local side falls back to
    /// `local_fallback` (the enqueue time). A server record without a
    /// timestamp takes the local timestamp, so the tie goes to the server.
    pub fn conflict_for(
        &self,
        local: Value,
        server: Value,
        local_fallback: Timestamp,
    ) -> ConflictData<Value> {
        let local_timestamp = self.timestamp_of(&local).unwrap_or(local_fallback);
        let server_timestamp = self.timestamp_of(&server).unwrap_or(local_timestamp);
        ConflictData {
            local,
            server,
            local_timestamp,
            server_timestamp,
            field: None,
        }
    }
}
