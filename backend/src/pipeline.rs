//! Ingest pipeline (§4.3): validation, dedup, smoothing, and
//! notify-before-persist ordering for the packets a session hands off once
//! its IMEI is bound. LOGIN never reaches here — the session handler acts
//! on it directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::codec::{AlarmFields, DecodedPacket, GpsFields, LbsFields, Protocol, StatusFields};
use crate::config::Settings;
use crate::contracts::{Contracts, LivenessStatus, PersistedRecord};
use crate::error::RejectReason;
use crate::metrics::Metrics;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two lat/lng points, in meters.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (lat1, lng1, lat2, lng2) = (
        lat1.to_radians(),
        lng1.to_radians(),
        lat2.to_radians(),
        lng2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

#[derive(Clone, Copy)]
struct GpsCacheEntry {
    lat: f64,
    lng: f64,
    speed: u8,
    course: u16,
    touched_at: DateTime<Utc>,
}

#[derive(Clone, Copy)]
struct StatusCacheEntry {
    ignition_on: bool,
    persisted_at: DateTime<Utc>,
    touched_at: DateTime<Utc>,
}

/// Per-IMEI smoothing/dedup state, bounded by the same janitor sweep the
/// liveness monitor runs on (`prune_stale`); authoritative state still
/// lives behind `Persistence`, this is a speed cache seeded from it lazily.
pub struct IngestPipeline {
    contracts: Contracts,
    metrics: Arc<Metrics>,
    settings: Settings,
    gps_cache: DashMap<String, GpsCacheEntry>,
    status_cache: DashMap<String, StatusCacheEntry>,
    sequence: DashMap<String, AtomicU64>,
}

impl IngestPipeline {
    pub fn new(contracts: Contracts, metrics: Arc<Metrics>, settings: Settings) -> Self {
        Self {
            contracts,
            metrics,
            settings,
            gps_cache: DashMap::new(),
            status_cache: DashMap::new(),
            sequence: DashMap::new(),
        }
    }

    fn next_sequence(&self, imei: &str) -> u64 {
        self.sequence
            .entry(imei.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    /// Drop cache entries untouched for longer than `older_than`, run by the
    /// liveness task on its own scan cadence (§5's ambient addition).
    pub fn prune_stale(&self, older_than: Duration, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::from_std(older_than).unwrap_or_default();
        self.gps_cache.retain(|_, e| e.touched_at > cutoff);
        self.status_cache.retain(|_, e| e.touched_at > cutoff);
    }

    /// Entry point: classify and dispatch one authorized packet (§4.3).
    pub async fn process(&self, imei: &str, packet: &DecodedPacket) {
        match packet.protocol {
            Protocol::Login => {
                // Handled by the session handler only; never reaches here.
            }
            Protocol::GpsLbs | Protocol::GpsLbsStatus | Protocol::GpsLbsData | Protocol::GpsLbsStatusA0 => {
                self.handle_gps(imei, packet).await;
            }
            Protocol::StatusInfo | Protocol::Heartbeat => {
                self.handle_status(imei, packet).await;
            }
            Protocol::AlarmData => {
                self.handle_alarm(imei, packet).await;
            }
            Protocol::StringInfo | Protocol::Other(_) => {
                // No pipeline action for reserved/unclassified opcodes (§4.3).
            }
        }
    }

    async fn handle_gps(&self, imei: &str, packet: &DecodedPacket) {
        let Some(gps) = packet.gps else {
            self.reject(imei, RejectReason::MissingCoordinates);
            return;
        };

        if self.settings.region_validation_enabled {
            let in_region = gps.latitude >= self.settings.region_lat_min
                && gps.latitude <= self.settings.region_lat_max
                && gps.longitude >= self.settings.region_lng_min
                && gps.longitude <= self.settings.region_lng_max;
            if !in_region {
                self.metrics.gps_rejected_region();
                self.reject(imei, RejectReason::OutOfRegion);
                return;
            }
        }

        if gps.satellites < 1 {
            self.metrics.gps_rejected_satellites();
            self.reject(imei, RejectReason::NoSatelliteFix);
            return;
        }

        if !gps.positioned && gps.satellites < 2 {
            self.metrics.gps_rejected_satellites();
            self.reject(imei, RejectReason::UnpositionedLowSatellites);
            return;
        } else if !gps.positioned {
            info!(imei, "gps accepted with degraded fix (unpositioned, satellites >= 2)");
        }

        let prev = self.previous_location(imei, &gps).await;

        if let Some(prev) = prev {
            let distance = haversine_m(prev.lat, prev.lng, gps.latitude, gps.longitude);
            if distance < self.settings.duplicate_radius_m {
                self.metrics.gps_rejected_duplicate();
                self.reject(imei, RejectReason::DuplicateWithinRadius);
                return;
            }
            if distance > self.settings.erratic_jump_km * 1000.0 {
                self.metrics.gps_rejected_erratic();
                self.reject(imei, RejectReason::ErraticJump);
                return;
            }
        }

        let (lat, lng) = if self.settings.smoothing_enabled {
            match prev {
                Some(prev) => {
                    let w = self.settings.smoothing_weight;
                    (w * gps.latitude + (1.0 - w) * prev.lat, w * gps.longitude + (1.0 - w) * prev.lng)
                }
                None => (gps.latitude, gps.longitude),
            }
        } else {
            (gps.latitude, gps.longitude)
        };

        let mut smoothed = gps;
        smoothed.latitude = lat;
        smoothed.longitude = lng;

        let record = self.build_record(imei, packet, Some(smoothed), packet.lbs, packet.status, None);

        // Notify-before-persist, log-and-continue on failure (§4.3.1).
        if let Err(e) = self.contracts.notifier.on_record(&record).await {
            self.metrics.notifier_failure();
            warn!(imei, error = %e, "gps notifier failed, persisting anyway");
        }

        if let Err(e) = self.contracts.persistence.insert_record(record.clone()).await {
            warn!(imei, error = %e, "gps persist failed");
            return;
        }
        self.metrics.gps_persisted();
        self.gps_cache.insert(
            imei.to_string(),
            GpsCacheEntry {
                lat,
                lng,
                speed: smoothed.speed,
                course: smoothed.course,
                touched_at: self.contracts.clock.now(),
            },
        );
        self.contracts.broadcaster.publish(&record);
    }

    async fn previous_location(&self, imei: &str, _gps: &GpsFields) -> Option<GpsCacheEntry> {
        if let Some(e) = self.gps_cache.get(imei) {
            return Some(*e);
        }
        let record = self.contracts.persistence.latest_valid_location_for(imei).await.ok().flatten()?;
        let g = record.gps?;
        let entry = GpsCacheEntry {
            lat: g.latitude,
            lng: g.longitude,
            speed: g.speed,
            course: g.course,
            touched_at: self.contracts.clock.now(),
        };
        self.gps_cache.insert(imei.to_string(), entry);
        Some(entry)
    }

    async fn handle_status(&self, imei: &str, packet: &DecodedPacket) {
        let Some(status) = packet.status else {
            return;
        };
        let now = self.contracts.clock.now();

        if let Some(cached) = self.status_cache.get(imei).map(|e| *e) {
            let unchanged = cached.ignition_on == (status.ignition == crate::codec::IgnitionState::On);
            let age = now.signed_duration_since(cached.persisted_at);
            if age < chrono::Duration::seconds(60) && unchanged {
                self.metrics.status_deduped();
                self.reject(imei, RejectReason::StatusUnchanged);
                return;
            }
        }

        let (gps, lbs) = if packet.gps.is_none() {
            // Coordinate carry-forward (§4.3.2 step 2).
            match self.contracts.persistence.latest_valid_location_for(imei).await {
                Ok(Some(prev)) => (prev.gps, prev.lbs),
                _ => (None, None),
            }
        } else {
            (packet.gps, packet.lbs)
        };

        let record = self.build_record(imei, packet, gps, lbs, Some(status), None);

        // Notify-then-persist, but here a notifier failure blocks persist
        // (§4.3.2 step 3 — the stricter of the two policies, kept as specified
        // rather than unified with the GPS path's log-and-continue behavior).
        if let Err(e) = self.contracts.notifier.on_record(&record).await {
            self.metrics.notifier_failure();
            warn!(imei, error = %e, "status notifier failed, persist withheld");
            return;
        }

        if let Err(e) = self.contracts.persistence.insert_record(record.clone()).await {
            warn!(imei, error = %e, "status persist failed");
            return;
        }
        self.metrics.status_persisted();
        self.status_cache.insert(
            imei.to_string(),
            StatusCacheEntry {
                ignition_on: status.ignition == crate::codec::IgnitionState::On,
                persisted_at: now,
                touched_at: now,
            },
        );
        self.contracts.broadcaster.publish(&record);
    }

    async fn handle_alarm(&self, imei: &str, packet: &DecodedPacket) {
        let status = packet.status;
        let now = self.contracts.clock.now();

        let (gps, lbs) = if packet.gps.is_none() {
            match self.contracts.persistence.latest_valid_location_for(imei).await {
                Ok(Some(prev)) => (prev.gps, prev.lbs),
                _ => (None, None),
            }
        } else {
            (packet.gps, packet.lbs)
        };

        let record = self.build_record(imei, packet, gps, lbs, status, packet.alarm);
        self.metrics.alarm_raised();

        // "Notification always attempted" (§4.3): never short-circuited by
        // the status-duplicate-suppression check. Follows the STATUS
        // policy otherwise — notifier failure blocks persist.
        if let Err(e) = self.contracts.notifier.on_record(&record).await {
            self.metrics.notifier_failure();
            warn!(imei, error = %e, "alarm notifier failed, persist withheld");
            return;
        }

        if let Err(e) = self.contracts.persistence.insert_record(record.clone()).await {
            warn!(imei, error = %e, "alarm persist failed");
            return;
        }
        if let Some(status) = status {
            self.status_cache.insert(
                imei.to_string(),
                StatusCacheEntry {
                    ignition_on: status.ignition == crate::codec::IgnitionState::On,
                    persisted_at: now,
                    touched_at: now,
                },
            );
        }
        self.contracts.broadcaster.publish(&record);
    }

    fn build_record(
        &self,
        imei: &str,
        packet: &DecodedPacket,
        gps: Option<GpsFields>,
        lbs: Option<LbsFields>,
        status: Option<StatusFields>,
        alarm: Option<AlarmFields>,
    ) -> PersistedRecord {
        PersistedRecord {
            imei: imei.to_string(),
            timestamp: self.contracts.clock.now(),
            protocol: packet.protocol,
            raw_hex: hex_encode(&packet.raw),
            gps,
            lbs,
            status,
            alarm,
            sequence: self.next_sequence(imei),
            derived_status: None,
        }
    }

    fn reject(&self, imei: &str, reason: RejectReason) {
        info!(imei, %reason, "packet rejected by ingest pipeline");
    }

    pub fn contracts(&self) -> &Contracts {
        &self.contracts
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

fn hex_encode(b: &[u8]) -> String {
    b.iter().map(|x| format!("{:02x}", x)).collect()
}

/// A synthesized, non-persisted liveness event (§4.3.3), built by the
/// liveness monitor from a device's most recent persisted record.
pub fn synthesize_liveness_event(
    imei: &str,
    last: Option<&PersistedRecord>,
    delta: chrono::Duration,
    settings: &Settings,
    now: DateTime<Utc>,
) -> PersistedRecord {
    let inactive = chrono::Duration::from_std(settings.inactivity_threshold).unwrap_or_default();
    let stopped_window = chrono::Duration::from_std(settings.stopped_window).unwrap_or_default();

    let Some(last) = last else {
        return PersistedRecord {
            imei: imei.to_string(),
            timestamp: now,
            protocol: Protocol::Other(0),
            raw_hex: String::new(),
            gps: None,
            lbs: None,
            status: None,
            alarm: None,
            sequence: 0,
            derived_status: Some(LivenessStatus::NoData),
        };
    };

    if delta > inactive {
        let mut rec = last.clone();
        rec.timestamp = now;
        rec.derived_status = Some(LivenessStatus::Inactive);
        return rec;
    }

    if delta > stopped_window {
        let moving = last.gps.map(|g| g.speed > 0).unwrap_or(false);
        if moving {
            let mut rec = last.clone();
            rec.timestamp = now;
            if let Some(gps) = rec.gps.as_mut() {
                gps.speed = 0;
            }
            if let Some(status) = rec.status.as_mut() {
                status.ignition = crate::codec::IgnitionState::Off;
            }
            rec.derived_status = Some(LivenessStatus::Stopped);
            return rec;
        }
        let mut rec = last.clone();
        rec.timestamp = now;
        rec.derived_status = Some(LivenessStatus::Active);
        return rec;
    }

    let mut rec = last.clone();
    rec.timestamp = now;
    rec.derived_status = Some(LivenessStatus::Active);
    rec
}
