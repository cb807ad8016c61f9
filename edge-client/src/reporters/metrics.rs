use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::{LoadMeter, LoadSampler, RequestCounters, TickOutcome};
use crate::central_client::CentralClient;
use crate::crypto::TokenIssuer;
use crate::error::MetricsError;
use crate::net::SocketSink;
use crate::types::{now_rfc3339, MetricsReport, UsageStats};

/// Usage records held while uploads keep failing.
pub const MAX_BUFFERED_USAGE: usize = 10_000;

struct Pending {
    usage_rx: mpsc::Receiver<UsageStats>,
    buffer: VecDeque<UsageStats>,
    dropped: u64,
}

impl Pending {
    fn drain(&mut self, capacity: usize) {
        while let Ok(stats) = self.usage_rx.try_recv() {
            self.buffer.push_back(stats);
        }
        while self.buffer.len() > capacity {
            self.buffer.pop_front();
            self.dropped += 1;
        }
    }
}

/// Uploads system load and proxy usage to the central server.
pub struct MetricsReporter {
    central: Arc<CentralClient>,
    issuer: TokenIssuer,
    sampler: Arc<dyn LoadSampler>,
    meter: LoadMeter,
    sink: Arc<dyn SocketSink>,
    retention_hours: u64,
    capacity: usize,
    pending: Mutex<Pending>,
}

impl MetricsReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        central: Arc<CentralClient>,
        issuer: TokenIssuer,
        sampler: Arc<dyn LoadSampler>,
        counters: RequestCounters,
        sink: Arc<dyn SocketSink>,
        retention_hours: u64,
        usage_rx: mpsc::Receiver<UsageStats>,
    ) -> Self {
        Self {
            central,
            issuer,
            sampler,
            meter: counters.meter(),
            sink,
            retention_hours,
            capacity: MAX_BUFFERED_USAGE,
            pending: Mutex::new(Pending {
                usage_rx,
                buffer: VecDeque::new(),
                dropped: 0,
            }),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Usage records not yet uploaded.
    pub async fn pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        pending.drain(self.capacity);
        pending.buffer.len()
    }

    pub async fn tick(&self) -> TickOutcome {
        if !self.sink.is_open() {
            debug!("Skipping metrics upload: control channel not connected");
            return TickOutcome::Skipped;
        }

        let mut pending = self.pending.lock().await;
        match self.upload(&mut pending).await {
            Ok(count) => {
                debug!("Metrics uploaded ({} usage record(s))", count);
                TickOutcome::Sent
            }
            Err(e) => {
                warn!(
                    "Metrics upload failed, keeping {} usage record(s): {}",
                    pending.buffer.len(),
                    e
                );
                TickOutcome::Failed
            }
        }
    }

    /// Upload whatever is pending, connected or not. Used at shutdown.
    pub async fn flush(&self) -> Result<usize, MetricsError> {
        let mut pending = self.pending.lock().await;
        pending.drain(self.capacity);
        if pending.buffer.is_empty() {
            return Ok(0);
        }

        let count = self.upload(&mut pending).await?;
        info!("Flushed {} usage record(s)", count);
        Ok(count)
    }

    async fn upload(&self, pending: &mut Pending) -> Result<usize, MetricsError> {
        pending.drain(self.capacity);
        if pending.dropped > 0 {
            warn!(
                "Metrics buffer full, dropped {} oldest usage record(s)",
                pending.dropped
            );
            pending.dropped = 0;
        }

        let snapshot = self.sampler.sample().await?;
        let report = MetricsReport {
            node_id: self.issuer.node_id().to_string(),
            timestamp: now_rfc3339(),
            retention_hours: self.retention_hours,
            system: self.meter.load(&snapshot),
            disk_usage: snapshot.disk_usage,
            usage: pending.buffer.iter().cloned().collect(),
        };

        let token = self.issuer.issue()?;
        self.central.upload_metrics(&token, &report).await?;

        let count = pending.buffer.len();
        pending.buffer.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;
    use crate::net::RetryPolicy;
    use crate::reporters::testing::{snapshot, FixedSampler, RecordingSink};
    use serde_json::{json, Value};
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn usage(id: &str) -> UsageStats {
        UsageStats {
            request_id: id.to_string(),
            node_id: "node-1".to_string(),
            service: "claude-main".to_string(),
            model: "claude-3-haiku".to_string(),
            success: true,
            response_time_ms: 120,
            input_tokens: Some(10),
            output_tokens: Some(20),
            error_kind: None,
            timestamp: now_rfc3339(),
        }
    }

    fn reporter(
        server: &MockServer,
        sink: Arc<RecordingSink>,
    ) -> (MetricsReporter, mpsc::Sender<UsageStats>) {
        let central = CentralClient::new(
            &server.uri(),
            Duration::from_secs(5),
            RetryPolicy::new(1, Duration::ZERO),
        )
        .unwrap();
        let issuer = TokenIssuer::new(
            Arc::new(test_keys().clone()),
            "node-1".to_string(),
            "edge".to_string(),
            "1h".to_string(),
        );
        let (tx, rx) = mpsc::channel(64);

        let reporter = MetricsReporter::new(
            Arc::new(central),
            issuer,
            Arc::new(FixedSampler(snapshot(20.0, 30.0, 40.0))),
            RequestCounters::default(),
            sink,
            24,
            rx,
        );
        (reporter, tx)
    }

    async fn uploaded_ids(server: &MockServer) -> Vec<Vec<String>> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|req| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                body["usage"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|u| u["requestId"].as_str().unwrap().to_string())
                    .collect()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_tick_uploads_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/metrics"))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({
                "nodeId": "node-1",
                "retentionHours": 24,
                "diskUsage": 40.0
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let (reporter, usage_tx) = reporter(&server, Arc::new(RecordingSink::open()));
        usage_tx.send(usage("r1")).await.unwrap();
        usage_tx.send(usage("r2")).await.unwrap();

        assert_eq!(reporter.tick().await, TickOutcome::Sent);
        assert_eq!(reporter.pending().await, 0);
        assert_eq!(uploaded_ids(&server).await, vec![vec!["r1", "r2"]]);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/metrics"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/metrics"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (reporter, usage_tx) = reporter(&server, Arc::new(RecordingSink::open()));
        usage_tx.send(usage("r1")).await.unwrap();

        assert_eq!(reporter.tick().await, TickOutcome::Failed);
        assert_eq!(reporter.pending().await, 1);

        usage_tx.send(usage("r2")).await.unwrap();
        assert_eq!(reporter.tick().await, TickOutcome::Sent);
        assert_eq!(reporter.pending().await, 0);

        let ids = uploaded_ids(&server).await;
        assert_eq!(ids[1], vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_buffer_drops_oldest_when_full() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/metrics"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (reporter, usage_tx) = reporter(&server, Arc::new(RecordingSink::open()));
        let reporter = reporter.with_capacity(3);
        for id in ["r0", "r1", "r2", "r3", "r4"] {
            usage_tx.send(usage(id)).await.unwrap();
        }

        assert_eq!(reporter.pending().await, 3);
        assert_eq!(reporter.tick().await, TickOutcome::Sent);
        assert_eq!(uploaded_ids(&server).await, vec![vec!["r2", "r3", "r4"]]);
    }

    #[tokio::test]
    async fn test_tick_skipped_when_disconnected_but_flush_uploads() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/metrics"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (reporter, usage_tx) = reporter(&server, Arc::new(RecordingSink::default()));
        usage_tx.send(usage("r1")).await.unwrap();

        assert_eq!(reporter.tick().await, TickOutcome::Skipped);
        assert_eq!(reporter.flush().await.unwrap(), 1);
        // Nothing left: no second request.
        assert_eq!(reporter.flush().await.unwrap(), 0);
    }
}
