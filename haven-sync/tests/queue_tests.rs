mod common;

use common::{memory_store, store_on, test_config, FlakyBackend, START};
use haven_store::{EncryptedStore, KeyValueBackend, MemoryBackend, StorageKey};
use haven_sync::{
    Clock, HavenConfig, ManualClock, OperationPatch, PendingOperation, SyncError, SyncQueue,
    DEFAULT_PRIORITY,
};
use haven_types::{OperationId, OperationKind, Timestamp};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

async fn open_queue(config: HavenConfig) -> (SyncQueue, Arc<ManualClock>, Arc<EncryptedStore>) {
    let store = memory_store(&config);
    let clock = Arc::new(ManualClock::new(START));
    let queue = SyncQueue::open(store.clone(), Arc::new(config), clock.clone())
        .await
        .unwrap();
    (queue, clock, store)
}

fn op(priority: i32, enqueued_at: u64, sequence: u64) -> PendingOperation {
    PendingOperation {
        id: OperationId::new(),
        kind: OperationKind::SendMessage,
        data: json!({}),
        enqueued_at: Timestamp::from_millis(enqueued_at),
        retry_count: 0,
        priority,
        last_attempt_at: None,
        last_error: None,
        sequence,
    }
}

// ── addOperation ────────────────────────────────────────────────

#[tokio::test]
async fn add_operation_fills_defaults() {
    let (queue, _clock, _store) = open_queue(test_config()).await;

    let op = queue
        .add_operation(OperationKind::EmergencyAlert, json!({ "lat": 1.5 }))
        .await
        .unwrap();

    assert_eq!(op.kind, OperationKind::EmergencyAlert);
    assert_eq!(op.data, json!({ "lat": 1.5 }));
    assert_eq!(op.enqueued_at, START);
    assert_eq!(op.retry_count, 0);
    assert_eq!(op.priority, 10);
    assert_eq!(op.last_attempt_at, None);
    assert_eq!(op.last_error, None);
    assert_eq!(queue.get_queue().await, vec![op]);
}

#[tokio::test]
async fn unmapped_kind_gets_default_priority() {
    let mut config = test_config();
    config.sync.priorities.clear();
    let (queue, _clock, _store) = open_queue(config).await;

    let op = queue
        .add_operation(OperationKind::CreateIncident, json!({}))
        .await
        .unwrap();
    assert_eq!(op.priority, DEFAULT_PRIORITY);
}

#[tokio::test]
async fn ids_are_unique() {
    let (queue, _clock, _store) = open_queue(test_config()).await;
    let mut ids = std::collections::HashSet::new();
    for _ in 0..20 {
        let op = queue
            .add_operation(OperationKind::SendMessage, json!({}))
            .await
            .unwrap();
        assert!(ids.insert(op.id));
    }
    assert_eq!(queue.pending_count().await, 20);
}

// ── Ordering ────────────────────────────────────────────────────

#[tokio::test]
async fn sorted_queue_orders_by_priority_then_time() {
    let (queue, clock, _store) = open_queue(test_config()).await;

    let profile = queue
        .add_operation(OperationKind::UpdateProfile, json!({}))
        .await
        .unwrap();
    let message_a = queue
        .add_operation(OperationKind::SendMessage, json!({ "n": "a" }))
        .await
        .unwrap();
    clock.advance(Duration::from_millis(5));
    let alert = queue
        .add_operation(OperationKind::EmergencyAlert, json!({}))
        .await
        .unwrap();
    let message_b = queue
        .add_operation(OperationKind::SendMessage, json!({ "n": "b" }))
        .await
        .unwrap();

    let sorted: Vec<_> = queue.get_sorted_queue().await.into_iter().map(|o| o.id).collect();
    assert_eq!(sorted, vec![alert.id, message_a.id, message_b.id, profile.id]);

    // getQueue keeps insertion order.
    let raw: Vec<_> = queue.get_queue().await.into_iter().map(|o| o.id).collect();
    assert_eq!(raw, vec![profile.id, message_a.id, alert.id, message_b.id]);
}

proptest! {
    #[test]
    fn drain_order_is_total(
        entries in proptest::collection::vec((0i32..5, 0u64..10), 1..40)
    ) {
        let mut ops: Vec<_> = entries
            .iter()
            .enumerate()
            .map(|(i, (priority, at))| op(*priority, *at, i as u64))
            .collect();
        ops.sort_by(PendingOperation::drain_order);

        for pair in ops.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(a.priority >= b.priority);
            if a.priority == b.priority {
                prop_assert!(a.enqueued_at <= b.enqueued_at);
                if a.enqueued_at == b.enqueued_at {
                    prop_assert!(a.sequence < b.sequence);
                }
            }
        }
    }
}

// ── Queries and removal ─────────────────────────────────────────

#[tokio::test]
async fn operations_by_type_and_removal() {
    let (queue, _clock, _store) = open_queue(test_config()).await;
    let a = queue
        .add_operation(OperationKind::SendMessage, json!({ "n": 1 }))
        .await
        .unwrap();
    queue
        .add_operation(OperationKind::UpdateProfile, json!({}))
        .await
        .unwrap();
    let c = queue
        .add_operation(OperationKind::SendMessage, json!({ "n": 2 }))
        .await
        .unwrap();

    let messages = queue.get_operations_by_type(OperationKind::SendMessage).await;
    assert_eq!(messages, vec![a.clone(), c]);
    assert!(queue
        .get_operations_by_type(OperationKind::EmergencyAlert)
        .await
        .is_empty());

    assert_eq!(queue.remove_operation(a.id).await.unwrap(), Some(a.clone()));
    assert_eq!(queue.remove_operation(a.id).await.unwrap(), None);
    assert_eq!(queue.pending_count().await, 2);
    assert_eq!(queue.get(a.id).await, None);

    queue.clear_queue().await.unwrap();
    assert_eq!(queue.pending_count().await, 0);
}

// ── Mutable fields ──────────────────────────────────────────────

#[tokio::test]
async fn retry_count_is_capped() {
    let (queue, clock, _store) = open_queue(test_config()).await;
    let op = queue
        .add_operation(OperationKind::SendMessage, json!({}))
        .await
        .unwrap();

    for expected in 1..=3 {
        clock.advance(Duration::from_secs(1));
        let updated = queue.increment_retry_count(op.id).await.unwrap();
        assert_eq!(updated.retry_count, expected);
        assert_eq!(updated.last_attempt_at, Some(clock.now()));
    }

    let err = queue.increment_retry_count(op.id).await.unwrap_err();
    assert!(matches!(err, SyncError::MaxRetriesExceeded { attempts: 3 }));
    assert_eq!(queue.get(op.id).await.unwrap().retry_count, 3);
}

#[tokio::test]
async fn increment_on_missing_operation_fails() {
    let (queue, _clock, _store) = open_queue(test_config()).await;
    let missing = OperationId::new();
    let err = queue.increment_retry_count(missing).await.unwrap_err();
    assert!(matches!(err, SyncError::OperationNotFound(id) if id == missing));
}

#[tokio::test]
async fn update_operation_touches_only_mutable_fields() {
    let (queue, _clock, _store) = open_queue(test_config()).await;
    let op = queue
        .add_operation(OperationKind::CreateCaseNote, json!({ "case_id": "c1" }))
        .await
        .unwrap();

    let updated = queue
        .update_operation(
            op.id,
            OperationPatch {
                retry_count: Some(2),
                last_attempt_at: Some(Timestamp::from_millis(99)),
                last_error: Some(Some("boom".into())),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.retry_count, 2);
    assert_eq!(updated.last_attempt_at, Some(Timestamp::from_millis(99)));
    assert_eq!(updated.last_error.as_deref(), Some("boom"));
    assert_eq!(updated.id, op.id);
    assert_eq!(updated.data, op.data);
    assert_eq!(updated.priority, op.priority);
    assert_eq!(updated.enqueued_at, op.enqueued_at);

    let cleared = queue
        .update_operation(
            op.id,
            OperationPatch {
                last_error: Some(None),
                ..OperationPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cleared.last_error, None);
    assert_eq!(cleared.retry_count, 2);
}

#[tokio::test]
async fn retry_count_never_decreases_or_exceeds_max() {
    let (queue, _clock, _store) = open_queue(test_config()).await;
    let op = queue
        .add_operation(OperationKind::SendMessage, json!({}))
        .await
        .unwrap();
    queue.increment_retry_count(op.id).await.unwrap();

    let down = OperationPatch {
        retry_count: Some(0),
        ..OperationPatch::default()
    };
    assert!(matches!(
        queue.update_operation(op.id, down).await.unwrap_err(),
        SyncError::InvalidUpdate(_)
    ));

    let over = OperationPatch {
        retry_count: Some(4),
        ..OperationPatch::default()
    };
    assert!(matches!(
        queue.update_operation(op.id, over).await.unwrap_err(),
        SyncError::InvalidUpdate(_)
    ));
    assert_eq!(queue.get(op.id).await.unwrap().retry_count, 1);
}

#[test]
fn patch_from_json_rejects_immutable_fields() {
    for field in ["id", "type", "data", "enqueued_at", "priority", "sequence"] {
        let mut partial = Map::new();
        partial.insert(field.to_string(), Value::from(1));
        let err = OperationPatch::from_json(&partial).unwrap_err();
        assert!(
            matches!(&err, SyncError::ImmutableField(name) if name == field),
            "{field}: {err}"
        );
    }

    let unknown = json!({ "colour": "red" });
    assert!(matches!(
        OperationPatch::from_json(unknown.as_object().unwrap()).unwrap_err(),
        SyncError::InvalidUpdate(_)
    ));
}

#[test]
fn patch_from_json_reads_mutable_fields() {
    let partial = json!({ "retry_count": 2, "last_attempt_at": 50, "last_error": null });
    let patch = OperationPatch::from_json(partial.as_object().unwrap()).unwrap();
    assert_eq!(
        patch,
        OperationPatch {
            retry_count: Some(2),
            last_attempt_at: Some(Timestamp::from_millis(50)),
            last_error: Some(None),
        }
    );
}

// ── Backoff ─────────────────────────────────────────────────────

#[test]
fn next_attempt_follows_backoff_table() {
    let delays = [
        Duration::from_millis(1_000),
        Duration::from_millis(5_000),
        Duration::from_millis(15_000),
    ];
    let mut pending = op(1, 0, 0);
    assert_eq!(pending.next_attempt_at(&delays), None);
    assert!(pending.is_due(Timestamp::EPOCH, &delays));

    pending.last_attempt_at = Some(Timestamp::from_millis(100));
    for (retry_count, expected) in [(1, 1_100), (2, 5_100), (3, 15_100), (7, 15_100)] {
        pending.retry_count = retry_count;
        assert_eq!(
            pending.next_attempt_at(&delays),
            Some(Timestamp::from_millis(expected))
        );
        assert!(!pending.is_due(Timestamp::from_millis(expected - 1), &delays));
        assert!(pending.is_due(Timestamp::from_millis(expected), &delays));
    }
}

// ── Persistence ─────────────────────────────────────────────────

#[tokio::test]
async fn reopen_recovers_exact_pending_set() {
    let config = test_config();
    let store = memory_store(&config);
    let clock = Arc::new(ManualClock::new(START));
    let config = Arc::new(config);

    let queue = SyncQueue::open(store.clone(), config.clone(), clock.clone())
        .await
        .unwrap();
    let a = queue
        .add_operation(OperationKind::SendMessage, json!({ "n": 1 }))
        .await
        .unwrap();
    let b = queue
        .add_operation(OperationKind::UploadEvidence, json!({ "n": 2 }))
        .await
        .unwrap();
    queue.increment_retry_count(a.id).await.unwrap();
    let expected = queue.get_queue().await;
    drop(queue);

    let reopened = SyncQueue::open(store, config, clock).await.unwrap();
    assert_eq!(reopened.get_queue().await, expected);

    // New operations continue the insertion sequence.
    let c = reopened
        .add_operation(OperationKind::SendMessage, json!({ "n": 3 }))
        .await
        .unwrap();
    assert!(c.sequence > b.sequence);
}

#[tokio::test]
async fn queue_is_encrypted_at_rest() {
    let config = test_config();
    let backend = Arc::new(MemoryBackend::new());
    let store = store_on(backend.clone(), &config);
    let queue = SyncQueue::open(store, Arc::new(config), Arc::new(ManualClock::new(START)))
        .await
        .unwrap();
    queue
        .add_operation(OperationKind::CreateIncident, json!({ "title": "confidential" }))
        .await
        .unwrap();

    let keys = backend.keys().unwrap();
    assert_eq!(keys.len(), 1);
    let raw = backend.get(&keys[0]).unwrap().unwrap();
    let needle = b"confidential";
    assert!(!raw.windows(needle.len()).any(|w| w == needle));
}

#[tokio::test]
async fn failed_persist_leaves_queue_unchanged() {
    let config = test_config();
    let backend = Arc::new(FlakyBackend::default());
    let store = store_on(backend.clone(), &config);
    let queue = SyncQueue::open(store, Arc::new(config), Arc::new(ManualClock::new(START)))
        .await
        .unwrap();
    let op = queue
        .add_operation(OperationKind::SendMessage, json!({}))
        .await
        .unwrap();

    backend.set_failing(true);
    assert!(matches!(
        queue.remove_operation(op.id).await.unwrap_err(),
        SyncError::Storage(_)
    ));
    assert!(matches!(
        queue.increment_retry_count(op.id).await.unwrap_err(),
        SyncError::Storage(_)
    ));
    assert_eq!(queue.get_queue().await, vec![op.clone()]);

    backend.set_failing(false);
    let reloaded = queue.reload().await.unwrap();
    assert_eq!(reloaded, 1);
    assert_eq!(queue.get(op.id).await, Some(op));
}

#[tokio::test]
async fn duplicate_ids_in_store_are_collapsed() {
    let config = test_config();
    let store = memory_store(&config);
    let dup = op(1, 0, 0);
    store
        .set_json(StorageKey::SyncQueue, &vec![dup.clone(), dup.clone()])
        .unwrap();

    let queue = SyncQueue::open(store, Arc::new(config), Arc::new(ManualClock::new(START)))
        .await
        .unwrap();
    assert_eq!(queue.get_queue().await, vec![dup]);
}

#[tokio::test]
async fn restore_rejects_duplicate_ids() {
    let (queue, _clock, _store) = open_queue(test_config()).await;
    let op = queue
        .add_operation(OperationKind::SendMessage, json!({}))
        .await
        .unwrap();
    let err = queue.restore_operation(op).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidUpdate(_)));
    assert_eq!(queue.pending_count().await, 1);
}

#[test]
fn operation_wire_format() {
    let pending = op(4, 1_000, 3);
    let value = serde_json::to_value(&pending).unwrap();
    assert_eq!(value["type"], "SEND_MESSAGE");
    assert_eq!(value["enqueued_at"], 1_000);
    assert_eq!(value["priority"], 4);
    assert!(value.get("last_error").is_none());
}
