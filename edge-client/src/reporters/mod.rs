//! Timers that report node state to the central server.

pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod system;

use std::future::Future;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::types::HealthStatus;

pub use health::{CentralProbe, Connectivity, ConnectivityProbe, HealthInputs, HealthMonitor};
pub use heartbeat::HeartbeatReporter;
pub use metrics::MetricsReporter;
pub use system::{
    local_capabilities, LoadMeter, LoadSampler, RequestCounters, RequestGuard, SystemSampler,
    SystemSnapshot,
};

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Sent,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReporterEvent {
    HealthStatusChanged {
        previous: Option<HealthStatus>,
        current: HealthStatus,
        score: u8,
    },
}

/// Run `tick` every `period` until `cancel` fires. Each tick gets its own
/// task; the first one fires after one full period.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        info!("Starting {} loop (every {:?})", name, period);

        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    running.spawn(tick());
                }
                Some(joined) = running.join_next() => {
                    if let Err(e) = joined {
                        error!("{} tick aborted: {}", name, e);
                    }
                }
            }
        }

        running.abort_all();
        while running.join_next().await.is_some() {}
        debug!("{} loop stopped", name);
    })
}
