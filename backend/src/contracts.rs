//! Thin interfaces to everything this server treats as an external
//! collaborator: the device registry, persistence, broadcaster, notifier,
//! and clock. Production deployments wire these to the relational store,
//! the WebSocket hub, and the push-notification sender; this crate ships
//! in-memory reference adapters so the ingest core runs standalone and is
//! testable without any of that.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::codec::{AlarmFields, GpsFields, LbsFields, Protocol, StatusFields};

/// A record accepted by the ingest pipeline, ready for persistence and fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub imei: String,
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub raw_hex: String,
    pub gps: Option<GpsFields>,
    pub lbs: Option<LbsFields>,
    pub status: Option<StatusFields>,
    pub alarm: Option<AlarmFields>,
    /// Per-IMEI monotonic counter assigned at persist time so a downstream
    /// consumer can detect gaps. Purely additive; not part of any invariant.
    pub sequence: u64,
    /// Set only on the synthetic records the liveness monitor broadcasts
    /// (§4.3.3). `None` for every record that actually reaches
    /// `Persistence::insert_record`; the monitor's events go to the
    /// broadcaster only and must never be persisted.
    pub derived_status: Option<LivenessStatus>,
}

impl PersistedRecord {
    pub fn latitude(&self) -> Option<f64> {
        self.gps.map(|g| g.latitude)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.gps.map(|g| g.longitude)
    }

    pub fn speed(&self) -> Option<u8> {
        self.gps.map(|g| g.speed)
    }
}

/// Derived, non-persisted status reflecting how stale a device's last
/// record is (§4.3.3). Never written through `Persistence::insert_record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessStatus {
    Active,
    Stopped,
    Inactive,
    NoData,
}

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("external collaborator error: {0}")]
    External(String),
}

/// Whether a terminal identifier is known to the fleet management system.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn is_registered(&self, imei: &str) -> bool;
}

/// Durable storage for accepted records.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_record(&self, record: PersistedRecord) -> Result<(), ContractError>;
    async fn latest_for(&self, imei: &str) -> Result<Option<PersistedRecord>, ContractError>;
    async fn latest_valid_location_for(
        &self,
        imei: &str,
    ) -> Result<Option<PersistedRecord>, ContractError>;
}

/// Best-effort, non-blocking fan-out of accepted records to live consumers.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, record: &PersistedRecord);
}

/// Synchronous hook invoked before persistence; may call out to a remote
/// notification service. Timeouts are the adapter's responsibility.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn on_record(&self, record: &PersistedRecord) -> Result<(), ContractError>;
}

/// All timestamps in the core flow through here so tests can control time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// In-memory [`DeviceRegistry`] backed by a fixed allow-list, seeded at
/// startup. Real deployments replace this with a query against the
/// relational fleet store; this adapter exists so the ingest core can run
/// and be tested without one.
pub struct StaticDeviceRegistry {
    allowed: DashMap<String, ()>,
}

impl StaticDeviceRegistry {
    pub fn new(imeis: impl IntoIterator<Item = String>) -> Self {
        let allowed = DashMap::new();
        for imei in imeis {
            allowed.insert(imei, ());
        }
        Self { allowed }
    }

    pub fn allow(&self, imei: impl Into<String>) {
        self.allowed.insert(imei.into(), ());
    }
}

#[async_trait]
impl DeviceRegistry for StaticDeviceRegistry {
    async fn is_registered(&self, imei: &str) -> bool {
        self.allowed.contains_key(imei)
    }
}

/// In-memory [`Persistence`] adapter: keeps every record plus a per-IMEI
/// "latest" index. Intended for tests and for running this server without a
/// database attached; swap for a real store in production.
#[derive(Default)]
pub struct InMemoryPersistence {
    latest: DashMap<String, PersistedRecord>,
    latest_valid_location: DashMap<String, PersistedRecord>,
    all: DashMap<String, Vec<PersistedRecord>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history_for(&self, imei: &str) -> Vec<PersistedRecord> {
        self.all.get(imei).map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn insert_record(&self, record: PersistedRecord) -> Result<(), ContractError> {
        self.latest.insert(record.imei.clone(), record.clone());
        if record.latitude().is_some() && record.longitude().is_some() {
            self.latest_valid_location
                .insert(record.imei.clone(), record.clone());
        }
        self.all.entry(record.imei.clone()).or_default().push(record);
        Ok(())
    }

    async fn latest_for(&self, imei: &str) -> Result<Option<PersistedRecord>, ContractError> {
        Ok(self.latest.get(imei).map(|r| r.clone()))
    }

    async fn latest_valid_location_for(
        &self,
        imei: &str,
    ) -> Result<Option<PersistedRecord>, ContractError> {
        Ok(self.latest_valid_location.get(imei).map(|r| r.clone()))
    }
}

/// In-memory [`Broadcaster`] that just counts publishes; a real deployment
/// fans these out over the WebSocket hub.
pub struct CountingBroadcaster {
    pub published: std::sync::atomic::AtomicU64,
}

impl Default for CountingBroadcaster {
    fn default() -> Self {
        Self {
            published: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl Broadcaster for CountingBroadcaster {
    fn publish(&self, _record: &PersistedRecord) {
        self.published
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// In-memory [`Notifier`] that always succeeds; a real deployment wires this
/// to SMS/push delivery. `fail_next` lets tests force the failure branch of
/// the notifier-before-persist policy.
#[derive(Default)]
pub struct NoopNotifier {
    pub fail_next: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl Notifier for NoopNotifier {
    async fn on_record(&self, _record: &PersistedRecord) -> Result<(), ContractError> {
        if self
            .fail_next
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(ContractError::External("notifier forced failure".into()));
        }
        Ok(())
    }
}

/// Wall-clock [`Clock`] plus a millisecond epoch helper shared by the
/// reference adapters above.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Bundles every contract behind `Arc` so it can be cloned freely into each
/// session task.
#[derive(Clone)]
pub struct Contracts {
    pub registry: Arc<dyn DeviceRegistry>,
    pub persistence: Arc<dyn Persistence>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}
