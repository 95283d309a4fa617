//! Interval-scheduled handlers.
//!
//! Jobs with the same interval share one loop and run one after another on every tick.
//! Loops for different intervals run independently.

use crate::config::CronConfig;
use crate::error::{EmulatorError, EmulatorResult};
use crate::lambda::{invoke, Handler, InvocationContext, Resolver};
use crate::shutdown::Shutdown;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Converts `10ms`, `5s`, `3m`, `2h` or a bare `500` into milliseconds.
/// A zero interval is rejected, it would make the group loop spin.
pub fn parse_interval(interval: &str) -> EmulatorResult<u64> {
    let invalid = || EmulatorError::InvalidIntervalFormat(interval.to_owned());

    // `ms` must be checked before `s` and `m`
    let (digits, multiplier) = if let Some(v) = interval.strip_suffix("ms") {
        (v, 1)
    } else if let Some(v) = interval.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = interval.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = interval.strip_suffix('h') {
        (v, 3_600_000)
    } else {
        (interval, 1)
    };

    // u64::from_str accepts a leading `+`, which is not a valid interval
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    digits
        .parse::<u64>()
        .ok()
        .and_then(|v| v.checked_mul(multiplier))
        .filter(|v| *v > 0)
        .ok_or_else(invalid)
}

/// Handlers sharing the same interval.
#[derive(Clone)]
pub struct CronGroup {
    pub interval_ms: u64,
    pub handlers: Vec<Arc<dyn Handler>>,
}

/// Resolves the cron jobs and groups them by their interval in milliseconds, so `60s` and `1m` end up together.
/// Jobs that cannot be resolved or have an invalid interval are logged and skipped.
pub fn group_jobs(jobs: &[CronConfig], resolver: &dyn Resolver) -> Vec<CronGroup> {
    let mut groups: BTreeMap<u64, Vec<Arc<dyn Handler>>> = BTreeMap::new();

    for job in jobs {
        let interval_ms = match parse_interval(&job.interval) {
            Ok(v) => v,
            Err(e) => {
                error!("Cron job {} skipped: {e}", job.handler.display_name());
                continue;
            }
        };

        match resolver.resolve(&job.handler) {
            Ok(handler) => {
                info!("Bound {} to cron every {}", handler.name(), job.interval);
                groups.entry(interval_ms).or_default().push(handler);
            }
            Err(e) => error!("Cron job {} failed to load: {e}", job.handler.display_name()),
        }
    }

    groups
        .into_iter()
        .map(|(interval_ms, handlers)| CronGroup { interval_ms, handlers })
        .collect()
}

/// Runs all jobs of the group, then sleeps for the interval, until shut down.
/// A failing job is logged and does not affect the other jobs.
pub async fn run_group(group: CronGroup, timeout: Option<Duration>, mut shutdown: Shutdown) {
    let interval = Duration::from_millis(group.interval_ms);

    while !shutdown.is_stopped() {
        for handler in &group.handlers {
            match invoke(handler, json!({}), InvocationContext::cron(), timeout).await {
                Ok(_) => info!("CRON: invoked {}", handler.name()),
                Err(e) => warn!("CRON: {e}"),
            }
        }

        shutdown.sleep(interval).await;
    }

    info!("CRON: {}ms loop stopped", group.interval_ms);
}

/// Starts one background task per group.
pub fn spawn_groups(groups: Vec<CronGroup>, timeout: Option<Duration>, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
    groups
        .into_iter()
        .map(|group| {
            info!(
                "CRON: starting {}ms loop with {} job(s)",
                group.interval_ms,
                group.handlers.len()
            );
            tokio::spawn(run_group(group, timeout, shutdown.clone()))
        })
        .collect()
}
