//! Liveness monitor (§4.3.3): a single background task that periodically
//! derives each registered device's active/stopped/inactive/no-data status
//! from its most recent persisted record and broadcasts it. These events
//! are never persisted — see `PersistedRecord::derived_status`.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::pipeline::{synthesize_liveness_event, IngestPipeline};
use crate::registry::ConnectionRegistry;

/// Runs until `shutdown` is dropped or fires, ticking every
/// `settings.liveness_scan_period`. Also sweeps the pipeline's bounded
/// smoothing/dedup cache on the same cadence (§5's ambient addition).
pub async fn run(
    registry: Arc<ConnectionRegistry>,
    pipeline: Arc<IngestPipeline>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = pipeline.settings().liveness_scan_period;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("liveness monitor stopping");
                    return;
                }
            }
        }

        let now = pipeline.contracts().clock.now();
        let devices = registry.list_registered();
        for imei in devices {
            let last = match pipeline.contracts().persistence.latest_for(&imei).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(imei = %imei, error = %e, "liveness scan: persistence lookup failed");
                    continue;
                }
            };
            let delta = match &last {
                Some(r) => now.signed_duration_since(r.timestamp),
                None => chrono::Duration::zero(),
            };
            let event =
                synthesize_liveness_event(&imei, last.as_ref(), delta, pipeline.settings(), now);
            pipeline.contracts().broadcaster.publish(&event);
        }

        pipeline.prune_stale(pipeline.settings().inactivity_threshold, now);
    }
}
