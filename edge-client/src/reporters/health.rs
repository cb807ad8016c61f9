use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{LoadSampler, ReporterEvent, SystemSnapshot};
use crate::config_sync::ConfigStore;
use crate::error::SamplingError;
use crate::net::{health_check, safe_ws_send, SocketSink};
use crate::types::{
    message_types, now_rfc3339, Envelope, HealthCheck, HealthCheckResult, HealthChecks,
    HealthStatus,
};

/// Percent thresholds at which a gauge turns warning / unhealthy.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub warning: f64,
    pub unhealthy: f64,
}

pub const CPU_THRESHOLDS: Thresholds = Thresholds {
    warning: 70.0,
    unhealthy: 90.0,
};
pub const MEMORY_THRESHOLDS: Thresholds = Thresholds {
    warning: 80.0,
    unhealthy: 95.0,
};
pub const DISK_THRESHOLDS: Thresholds = Thresholds {
    warning: 85.0,
    unhealthy: 95.0,
};

pub fn classify(value: f64, thresholds: Thresholds) -> HealthStatus {
    if value >= thresholds.unhealthy {
        HealthStatus::Unhealthy
    } else if value >= thresholds.warning {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

/// 100, minus 10 per warning and 25 per unhealthy check, floored at 0.
pub fn score_checks(statuses: &[HealthStatus]) -> u8 {
    let penalty: u32 = statuses
        .iter()
        .map(|s| match s {
            HealthStatus::Healthy => 0,
            HealthStatus::Warning => 10,
            HealthStatus::Unhealthy => 25,
        })
        .sum();
    100u32.saturating_sub(penalty) as u8
}

pub fn status_for_score(score: u8) -> HealthStatus {
    if score >= 80 {
        HealthStatus::Healthy
    } else if score >= 50 {
        HealthStatus::Warning
    } else {
        HealthStatus::Unhealthy
    }
}

/// How well the node can reach the central server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    HttpOnly,
    Unreachable,
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Connectivity;
}

/// Connected when the control channel is open, otherwise falls back to the
/// central server's HTTP health endpoint.
pub struct CentralProbe {
    sink: Arc<dyn SocketSink>,
    http: Client,
    base_url: String,
}

impl CentralProbe {
    pub fn new(sink: Arc<dyn SocketSink>, http: Client, base_url: String) -> Self {
        Self {
            sink,
            http,
            base_url,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for CentralProbe {
    async fn probe(&self) -> Connectivity {
        if self.sink.is_open() {
            Connectivity::Connected
        } else if health_check(&self.http, &self.base_url).await {
            Connectivity::HttpOnly
        } else {
            Connectivity::Unreachable
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub snapshot: SystemSnapshot,
    pub connectivity: Connectivity,
    pub enabled_services: usize,
}

fn gauge(name: &str, value: f32, thresholds: Thresholds) -> HealthCheck {
    let value = f64::from(value);
    HealthCheck {
        status: classify(value, thresholds),
        value: Some(value),
        message: format!("{} usage {:.1}%", name, value),
    }
}

/// Score the five sub-checks.
pub fn evaluate(inputs: &HealthInputs) -> (HealthStatus, u8, HealthChecks) {
    let network = match inputs.connectivity {
        Connectivity::Connected => HealthCheck {
            status: HealthStatus::Healthy,
            value: None,
            message: "control channel connected".to_string(),
        },
        Connectivity::HttpOnly => HealthCheck {
            status: HealthStatus::Warning,
            value: None,
            message: "control channel down, central server reachable over HTTP".to_string(),
        },
        Connectivity::Unreachable => HealthCheck {
            status: HealthStatus::Unhealthy,
            value: None,
            message: "central server unreachable".to_string(),
        },
    };

    let services = if inputs.enabled_services > 0 {
        HealthCheck {
            status: HealthStatus::Healthy,
            value: Some(inputs.enabled_services as f64),
            message: format!("{} AI service(s) enabled", inputs.enabled_services),
        }
    } else {
        HealthCheck {
            status: HealthStatus::Warning,
            value: Some(0.0),
            message: "no AI services enabled".to_string(),
        }
    };

    let checks = HealthChecks {
        cpu: gauge("CPU", inputs.snapshot.cpu_usage, CPU_THRESHOLDS),
        memory: gauge("Memory", inputs.snapshot.memory_usage, MEMORY_THRESHOLDS),
        network,
        disk: gauge("Disk", inputs.snapshot.disk_usage, DISK_THRESHOLDS),
        services,
    };

    let score = score_checks(&checks.statuses());
    (status_for_score(score), score, checks)
}

pub struct HealthMonitor {
    node_id: String,
    sampler: Arc<dyn LoadSampler>,
    probe: Arc<dyn ConnectivityProbe>,
    config: ConfigStore,
    sink: Arc<dyn SocketSink>,
    events: mpsc::Sender<ReporterEvent>,
    latest: watch::Sender<Option<HealthCheckResult>>,
}

impl HealthMonitor {
    pub fn new(
        node_id: String,
        sampler: Arc<dyn LoadSampler>,
        probe: Arc<dyn ConnectivityProbe>,
        config: ConfigStore,
        sink: Arc<dyn SocketSink>,
        events: mpsc::Sender<ReporterEvent>,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            node_id,
            sampler,
            probe,
            config,
            sink,
            events,
            latest,
        }
    }

    pub fn latest(&self) -> Option<HealthCheckResult> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<HealthCheckResult>> {
        self.latest.subscribe()
    }

    /// Run every check, remember the result, and report it if connected.
    pub async fn run_check(&self) -> Result<HealthCheckResult, SamplingError> {
        let inputs = HealthInputs {
            snapshot: self.sampler.sample().await?,
            connectivity: self.probe.probe().await,
            enabled_services: self.config.enabled_service_count(),
        };

        let (status, score, checks) = evaluate(&inputs);
        let result = HealthCheckResult {
            node_id: self.node_id.clone(),
            timestamp: now_rfc3339(),
            status,
            score,
            checks,
        };

        let previous = self
            .latest
            .send_replace(Some(result.clone()))
            .map(|r| r.status);

        if previous != Some(status) {
            info!(
                "Health status changed: {:?} -> {} (score={})",
                previous, status, score
            );
            let event = ReporterEvent::HealthStatusChanged {
                previous,
                current: status,
                score,
            };
            if self.events.try_send(event).is_err() {
                debug!("Health status event dropped");
            }
        }

        if safe_ws_send(
            self.sink.as_ref(),
            &Envelope::new(message_types::HEALTH_REPORT, &result),
        ) {
            debug!("Health report sent: status={}, score={}", status, score);
        } else {
            debug!("Health report not sent: control channel not connected");
        }

        Ok(result)
    }

    pub async fn tick(&self) {
        if let Err(e) = self.run_check().await {
            warn!("Health check failed: {}", e);
        }
    }
}
