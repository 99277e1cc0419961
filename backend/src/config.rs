//! Environment-driven configuration (§4.8). Every tunable is loaded with the
//! same `std::env::var(...).ok().and_then(|v| v.parse().ok()).unwrap_or(default)`
//! idiom — an invalid value falls back to the default rather than panicking,
//! since a fat-fingered env var must not take the whole fleet offline.

use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_port: u16,
    pub read_timeout: Duration,
    pub liveness_scan_period: Duration,
    pub inactivity_threshold: Duration,
    pub stopped_window: Duration,
    pub duplicate_radius_m: f64,
    pub erratic_jump_km: f64,
    pub smoothing_weight: f64,
    pub smoothing_enabled: bool,
    pub region_validation_enabled: bool,
    pub region_lat_min: f64,
    pub region_lat_max: f64,
    pub region_lng_min: f64,
    pub region_lng_max: f64,
    pub downlink_timeout: Duration,
    pub http_port: u16,
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_port: 5000,
            read_timeout: Duration::from_secs(30),
            liveness_scan_period: Duration::from_secs(30),
            inactivity_threshold: Duration::from_secs(1800),
            stopped_window: Duration::from_secs(300),
            duplicate_radius_m: 1.0,
            erratic_jump_km: 50.0,
            smoothing_weight: 0.95,
            smoothing_enabled: true,
            region_validation_enabled: true,
            region_lat_min: 25.0,
            region_lat_max: 31.5,
            region_lng_min: 79.0,
            region_lng_max: 89.5,
            downlink_timeout: Duration::from_secs(10),
            http_port: 8081,
            log_json: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            listen_port: env_or("GT06_PORT", d.listen_port),
            read_timeout: Duration::from_secs(env_or("GT06_READ_TIMEOUT_SECS", d.read_timeout.as_secs())),
            liveness_scan_period: Duration::from_secs(env_or(
                "GT06_LIVENESS_PERIOD_SECS",
                d.liveness_scan_period.as_secs(),
            )),
            inactivity_threshold: Duration::from_secs(env_or(
                "GT06_INACTIVE_SECS",
                d.inactivity_threshold.as_secs(),
            )),
            stopped_window: Duration::from_secs(env_or("GT06_STOPPED_WINDOW_SECS", d.stopped_window.as_secs())),
            duplicate_radius_m: env_or("GT06_DUP_RADIUS_M", d.duplicate_radius_m),
            erratic_jump_km: env_or("GT06_ERRATIC_KM", d.erratic_jump_km),
            smoothing_weight: env_or("GT06_SMOOTHING_WEIGHT", d.smoothing_weight),
            smoothing_enabled: env_or("GT06_SMOOTHING_ENABLED", d.smoothing_enabled),
            region_validation_enabled: env_or("GT06_REGION_VALIDATION", d.region_validation_enabled),
            region_lat_min: env_or("GT06_REGION_LAT_MIN", d.region_lat_min),
            region_lat_max: env_or("GT06_REGION_LAT_MAX", d.region_lat_max),
            region_lng_min: env_or("GT06_REGION_LNG_MIN", d.region_lng_min),
            region_lng_max: env_or("GT06_REGION_LNG_MAX", d.region_lng_max),
            downlink_timeout: Duration::from_secs(env_or("GT06_CMD_TIMEOUT_SECS", d.downlink_timeout.as_secs())),
            http_port: env_or("GT06_HTTP_PORT", d.http_port),
            log_json: env_or("GT06_LOG_JSON", d.log_json),
        }
    }
}
