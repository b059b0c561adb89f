#![allow(dead_code)]

use async_trait::async_trait;
use haven_crypto::{KeyEncryptor, StoreKey};
use haven_store::{
    EncryptedStore, KeyValueBackend, MemoryBackend, StorageError, StorageResult,
};
use haven_sync::dispatch::mock::MockDispatcher;
use haven_sync::{
    HavenConfig, ManualClock, NetworkMonitor, PendingOperation, RawConnectivity, SyncHooks,
    SyncOrchestrator, TransportType,
};
use haven_types::{OperationId, Timestamp};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const START: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// Routes engine logs to the test output. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn memory_store(config: &HavenConfig) -> Arc<EncryptedStore> {
    store_on(Arc::new(MemoryBackend::new()), config)
}

pub fn store_on(backend: Arc<dyn KeyValueBackend>, config: &HavenConfig) -> Arc<EncryptedStore> {
    Arc::new(
        EncryptedStore::open(
            backend,
            Arc::new(KeyEncryptor::new(StoreKey::from_bytes([7u8; 32]))),
            config.store_options(),
        )
        .unwrap(),
    )
}

/// Config with the background timer off, so tests drive drains explicitly.
pub fn test_config() -> HavenConfig {
    let mut config = HavenConfig::default();
    config.sync.background.enabled = false;
    config
}

/// Records what the orchestrator hands to the host.
#[derive(Default)]
pub struct RecordingHooks {
    pub invalidated: Mutex<Vec<Vec<String>>>,
    pub resolved: Mutex<Vec<(OperationId, Value)>>,
}

#[async_trait]
impl SyncHooks for RecordingHooks {
    async fn invalidate(&self, keys: &[String]) {
        self.invalidated.lock().unwrap().push(keys.to_vec());
    }

    async fn apply_resolved(&self, operation: &PendingOperation, resolved: &Value) {
        self.resolved
            .lock()
            .unwrap()
            .push((operation.id, resolved.clone()));
    }
}

/// A backend whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    pub fail_writes: AtomicBool,
    write_budget: Mutex<Option<usize>>,
}

impl FlakyBackend {
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Lets `writes` more writes through, then fails every one after.
    pub fn fail_after(&self, writes: usize) {
        *self.write_budget.lock().unwrap() = Some(writes);
    }

    fn write_allowed(&self) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            return false;
        }
        match self.write_budget.lock().unwrap().as_mut() {
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
            None => true,
        }
    }
}

impl KeyValueBackend for FlakyBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        if !self.write_allowed() {
            return Err(StorageError::InvalidData("disk full".into()));
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        self.inner.remove(key)
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        self.inner.keys()
    }
}

pub struct Harness {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub dispatcher: Arc<MockDispatcher>,
    pub network: Arc<NetworkMonitor>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<EncryptedStore>,
    pub hooks: Arc<RecordingHooks>,
}

impl Harness {
    pub async fn new(config: HavenConfig) -> Self {
        let store = memory_store(&config);
        Self::with_store(config, store).await
    }

    pub async fn with_store(config: HavenConfig, store: Arc<EncryptedStore>) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(START));
        let network = Arc::new(NetworkMonitor::new(clock.clone()));
        let dispatcher = Arc::new(MockDispatcher::new());
        let hooks = Arc::new(RecordingHooks::default());
        let orchestrator = SyncOrchestrator::builder(
            Arc::new(config),
            store.clone(),
            network.clone(),
            dispatcher.clone(),
        )
        .hooks(hooks.clone())
        .clock(clock.clone())
        .build()
        .await
        .unwrap();

        Self {
            orchestrator,
            dispatcher,
            network,
            clock,
            store,
            hooks,
        }
    }

    pub async fn go_online(&self) {
        self.network
            .handle_event(RawConnectivity::connected(TransportType::Wifi))
            .await;
    }

    pub async fn go_offline(&self) {
        self.network
            .handle_event(RawConnectivity::disconnected())
            .await;
    }
}
