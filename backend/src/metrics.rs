//! Process-wide counters, exposed via `/metrics`: one `AtomicU64` per
//! event, `Relaxed` ordering throughout since these are observational, not
//! synchronizing.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub struct Metrics {
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub logins_accepted: AtomicU64,
    pub logins_rejected: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub frames_framing_error: AtomicU64,
    pub frames_crc_error: AtomicU64,
    pub frames_decode_error: AtomicU64,
    pub gps_persisted: AtomicU64,
    pub gps_rejected_region: AtomicU64,
    pub gps_rejected_duplicate: AtomicU64,
    pub gps_rejected_erratic: AtomicU64,
    pub gps_rejected_satellites: AtomicU64,
    pub status_persisted: AtomicU64,
    pub status_deduped: AtomicU64,
    pub alarms_raised: AtomicU64,
    pub notifier_failures: AtomicU64,
    pub downlink_sent: AtomicU64,
    pub downlink_timeouts: AtomicU64,
    pub downlink_not_connected: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            logins_accepted: AtomicU64::new(0),
            logins_rejected: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_framing_error: AtomicU64::new(0),
            frames_crc_error: AtomicU64::new(0),
            frames_decode_error: AtomicU64::new(0),
            gps_persisted: AtomicU64::new(0),
            gps_rejected_region: AtomicU64::new(0),
            gps_rejected_duplicate: AtomicU64::new(0),
            gps_rejected_erratic: AtomicU64::new(0),
            gps_rejected_satellites: AtomicU64::new(0),
            status_persisted: AtomicU64::new(0),
            status_deduped: AtomicU64::new(0),
            alarms_raised: AtomicU64::new(0),
            notifier_failures: AtomicU64::new(0),
            downlink_sent: AtomicU64::new(0),
            downlink_timeouts: AtomicU64::new(0),
            downlink_not_connected: AtomicU64::new(0),
        }
    }
}

macro_rules! inc {
    ($field:expr) => {
        $field.fetch_add(1, Ordering::Relaxed)
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        inc!(self.sessions_opened);
    }
    pub fn session_closed(&self) {
        inc!(self.sessions_closed);
    }
    pub fn login_accepted(&self) {
        inc!(self.logins_accepted);
    }
    pub fn login_rejected(&self) {
        inc!(self.logins_rejected);
    }
    pub fn frame_decoded(&self) {
        inc!(self.frames_decoded);
    }
    pub fn frame_framing_error(&self) {
        inc!(self.frames_framing_error);
    }
    pub fn frame_crc_error(&self) {
        inc!(self.frames_crc_error);
    }
    pub fn frame_decode_error(&self) {
        inc!(self.frames_decode_error);
    }
    pub fn gps_persisted(&self) {
        inc!(self.gps_persisted);
    }
    pub fn gps_rejected_region(&self) {
        inc!(self.gps_rejected_region);
    }
    pub fn gps_rejected_duplicate(&self) {
        inc!(self.gps_rejected_duplicate);
    }
    pub fn gps_rejected_erratic(&self) {
        inc!(self.gps_rejected_erratic);
    }
    pub fn gps_rejected_satellites(&self) {
        inc!(self.gps_rejected_satellites);
    }
    pub fn status_persisted(&self) {
        inc!(self.status_persisted);
    }
    pub fn status_deduped(&self) {
        inc!(self.status_deduped);
    }
    pub fn alarm_raised(&self) {
        inc!(self.alarms_raised);
    }
    pub fn notifier_failure(&self) {
        inc!(self.notifier_failures);
    }
    pub fn downlink_sent(&self) {
        inc!(self.downlink_sent);
    }
    pub fn downlink_timeout(&self) {
        inc!(self.downlink_timeouts);
    }
    pub fn downlink_not_connected(&self) {
        inc!(self.downlink_not_connected);
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    sessions_opened: u64,
    sessions_closed: u64,
    logins_accepted: u64,
    logins_rejected: u64,
    frames_decoded: u64,
    frames_framing_error: u64,
    frames_crc_error: u64,
    frames_decode_error: u64,
    gps_persisted: u64,
    gps_rejected_region: u64,
    gps_rejected_duplicate: u64,
    gps_rejected_erratic: u64,
    gps_rejected_satellites: u64,
    status_persisted: u64,
    status_deduped: u64,
    alarms_raised: u64,
    notifier_failures: u64,
    downlink_sent: u64,
    downlink_timeouts: u64,
    downlink_not_connected: u64,
    registered_devices: usize,
}

impl Metrics {
    pub fn snapshot(&self, registered_devices: usize) -> MetricsSnapshot {
        let l = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            sessions_opened: l(&self.sessions_opened),
            sessions_closed: l(&self.sessions_closed),
            logins_accepted: l(&self.logins_accepted),
            logins_rejected: l(&self.logins_rejected),
            frames_decoded: l(&self.frames_decoded),
            frames_framing_error: l(&self.frames_framing_error),
            frames_crc_error: l(&self.frames_crc_error),
            frames_decode_error: l(&self.frames_decode_error),
            gps_persisted: l(&self.gps_persisted),
            gps_rejected_region: l(&self.gps_rejected_region),
            gps_rejected_duplicate: l(&self.gps_rejected_duplicate),
            gps_rejected_erratic: l(&self.gps_rejected_erratic),
            gps_rejected_satellites: l(&self.gps_rejected_satellites),
            status_persisted: l(&self.status_persisted),
            status_deduped: l(&self.status_deduped),
            alarms_raised: l(&self.alarms_raised),
            notifier_failures: l(&self.notifier_failures),
            downlink_sent: l(&self.downlink_sent),
            downlink_timeouts: l(&self.downlink_timeouts),
            downlink_not_connected: l(&self.downlink_not_connected),
            registered_devices,
        }
    }
}
