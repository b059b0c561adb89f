//! Network Monitor.
//!
//! Turns raw platform connectivity signals into a [`NetworkState`] and
//! publishes it to subscribers and a `watch` channel. The monitor never
//! decides whether the device is "online"; consumers derive that from the
//! state with [`NetworkState::is_online`].

use crate::clock::Clock;
use crate::observer::{ObserverList, SubscriptionId};
use crate::persist::blocking;
use async_trait::async_trait;
use haven_store::{EncryptedStore, StorageKey};
use haven_types::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Physical transport reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    None,
    Unknown,
    Wifi,
    Ethernet,
    Cellular,
    Bluetooth,
    Vpn,
    Other,
}

/// Generation hint for cellular links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellularGeneration {
    #[serde(rename = "2g")]
    G2,
    #[serde(rename = "3g")]
    G3,
    #[serde(rename = "4g")]
    G4,
    #[serde(rename = "5g")]
    G5,
}

/// Coarse link quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    #[default]
    Unknown,
    Poor,
    Moderate,
    Good,
    Excellent,
}

impl QualityTier {
    fn rank(self) -> Option<u8> {
        match self {
            Self::Unknown => None,
            Self::Poor => Some(0),
            Self::Moderate => Some(1),
            Self::Good => Some(2),
            Self::Excellent => Some(3),
        }
    }

    /// Whether this tier satisfies `minimum`. An unknown tier on either
    /// side always passes.
    pub fn meets(self, minimum: QualityTier) -> bool {
        match (self.rank(), minimum.rank()) {
            (Some(have), Some(need)) => have >= need,
            _ => true,
        }
    }
}

/// One raw connectivity event from the platform layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawConnectivity {
    pub is_connected: bool,
    /// `None` while the platform has not probed reachability yet.
    pub is_internet_reachable: Option<bool>,
    pub transport: TransportType,
    pub cellular_generation: Option<CellularGeneration>,
}

impl RawConnectivity {
    pub fn disconnected() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: Some(false),
            transport: TransportType::None,
            cellular_generation: None,
        }
    }

    pub fn connected(transport: TransportType) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: Some(true),
            transport,
            cellular_generation: None,
        }
    }
}

/// Classified network state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub is_connected: bool,
    pub is_internet_reachable: Option<bool>,
    pub transport_type: TransportType,
    pub quality: QualityTier,
}

impl NetworkState {
    /// State assumed before the first platform event.
    pub fn disconnected() -> Self {
        Self::classify(&RawConnectivity::disconnected())
    }

    pub fn classify(raw: &RawConnectivity) -> Self {
        let quality = if !raw.is_connected {
            QualityTier::Poor
        } else {
            match raw.transport {
                TransportType::Ethernet | TransportType::Wifi => QualityTier::Excellent,
                TransportType::Cellular => match raw.cellular_generation {
                    Some(CellularGeneration::G2) => QualityTier::Poor,
                    Some(CellularGeneration::G3) => QualityTier::Moderate,
                    Some(CellularGeneration::G4) => QualityTier::Good,
                    Some(CellularGeneration::G5) => QualityTier::Excellent,
                    None => QualityTier::Moderate,
                },
                _ => QualityTier::Unknown,
            }
        };
        Self {
            is_connected: raw.is_connected,
            is_internet_reachable: raw.is_internet_reachable,
            transport_type: raw.transport,
            quality,
        }
    }

    /// Connected, and reachability is either confirmed or not yet known.
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable != Some(false)
    }

    /// Online and at least `minimum` quality.
    pub fn is_usable(&self, minimum: QualityTier) -> bool {
        self.is_online() && self.quality.meets(minimum)
    }
}

/// Platform seam for the eager connectivity fetch at startup.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn fetch(&self) -> RawConnectivity;
}

/// Tracks the current [`NetworkState`] and fans it out.
pub struct NetworkMonitor {
    clock: Arc<dyn Clock>,
    state: watch::Sender<NetworkState>,
    observers: ObserverList<NetworkState>,
    started_at: Timestamp,
    last_online: Mutex<Option<Timestamp>>,
    store: Option<Arc<EncryptedStore>>,
}

impl NetworkMonitor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (state, _) = watch::channel(NetworkState::disconnected());
        let started_at = clock.now();
        Self {
            clock,
            state,
            observers: ObserverList::new(),
            started_at,
            last_online: Mutex::new(None),
            store: None,
        }
    }

    /// Persists every new state under the `network_state` key.
    pub fn with_store(mut self, store: Arc<EncryptedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Performs the eager fetch and publishes its result.
    pub async fn start(&self, probe: &dyn ConnectivityProbe) -> NetworkState {
        let raw = probe.fetch().await;
        self.handle_event(raw).await
    }

    /// Fetches from `probe` now and then every `every`, publishing each
    /// result. Hosts pass `network.polling_interval`. Dropping the handle
    /// stops polling.
    pub fn spawn_polling(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        every: Duration,
    ) -> PollingHandle {
        let monitor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let raw = probe.fetch().await;
                monitor.handle_event(raw).await;
            }
        });
        debug!(interval_ms = every.as_millis() as u64, "connectivity polling started");
        PollingHandle { task }
    }

    /// Reclassifies a platform event and notifies subscribers.
    ///
    /// Rapid flaps are not deduplicated: every event is published.
    pub async fn handle_event(&self, raw: RawConnectivity) -> NetworkState {
        let state = NetworkState::classify(&raw);
        let was_online = self.state.borrow().is_online();
        let now_online = state.is_online();

        // Going offline also counts as the last moment seen online.
        if now_online || was_online {
            *self.last_online.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(self.clock.now());
        }
        if was_online != now_online {
            info!(
                transport = ?state.transport_type,
                quality = ?state.quality,
                "network is now {}",
                if now_online { "online" } else { "offline" }
            );
        } else {
            debug!(transport = ?state.transport_type, quality = ?state.quality, "network event");
        }

        self.state.send_replace(state.clone());
        self.observers.notify(&state);
        self.persist(&state).await;
        state
    }

    async fn persist(&self, state: &NetworkState) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = state.clone();
        let saved = blocking(store, move |store| {
            store.set_json(StorageKey::NetworkState, &snapshot)
        })
        .await;
        if let Err(e) = saved {
            warn!("Failed to persist network state: {}", e);
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&NetworkState) + Send + Sync + 'static,
    {
        self.observers.add(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.remove(id)
    }

    pub fn current_state(&self) -> NetworkState {
        self.state.borrow().clone()
    }

    /// A receiver that observes every published state.
    pub fn watch(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online()
    }

    pub fn last_online_at(&self) -> Option<Timestamp> {
        *self.last_online.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How long the device has been offline, or `None` while online.
    ///
    /// A device never seen online counts from monitor creation.
    pub fn offline_for(&self) -> Option<Duration> {
        if self.is_online() {
            return None;
        }
        let since = self.last_online_at().unwrap_or(self.started_at);
        Some(self.clock.now().saturating_duration_since(since))
    }
}

/// Owns a polling task started by [`NetworkMonitor::spawn_polling`].
pub struct PollingHandle {
    task: JoinHandle<()>,
}

impl PollingHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
