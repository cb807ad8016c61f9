use std::sync::Arc;

use tracing::{debug, warn};

use super::{LoadMeter, LoadSampler, RequestCounters, TickOutcome};
use crate::net::{safe_ws_send, SocketSink};
use crate::types::{message_types, now_rfc3339, Envelope, HeartbeatData, NodeStatus};

pub struct HeartbeatReporter {
    node_id: String,
    max_connections: u32,
    sampler: Arc<dyn LoadSampler>,
    meter: LoadMeter,
    sink: Arc<dyn SocketSink>,
}

impl HeartbeatReporter {
    pub fn new(
        node_id: String,
        max_connections: u32,
        sampler: Arc<dyn LoadSampler>,
        counters: RequestCounters,
        sink: Arc<dyn SocketSink>,
    ) -> Self {
        Self {
            node_id,
            max_connections,
            sampler,
            meter: counters.meter(),
            sink,
        }
    }

    /// Send one heartbeat. Does nothing while the control channel is down;
    /// missed beats are not queued.
    pub async fn tick(&self) -> TickOutcome {
        if !self.sink.is_open() {
            debug!("Skipping heartbeat: control channel not connected");
            return TickOutcome::Skipped;
        }

        let snapshot = match self.sampler.sample().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to sample load for heartbeat: {}", e);
                return TickOutcome::Failed;
            }
        };

        let load = self.meter.load(&snapshot);
        let status = if load.active_connections >= u64::from(self.max_connections) {
            NodeStatus::Busy
        } else {
            NodeStatus::Online
        };

        let heartbeat = HeartbeatData {
            node_id: self.node_id.clone(),
            timestamp: now_rfc3339(),
            load,
            status: Some(status),
            metadata: None,
        };

        if safe_ws_send(self.sink.as_ref(), &Envelope::new(message_types::HEARTBEAT, heartbeat)) {
            debug!(
                "Heartbeat sent: cpu={:.1}%, memory={:.1}%, active={}",
                load.cpu_usage, load.memory_usage, load.active_connections
            );
            TickOutcome::Sent
        } else {
            TickOutcome::Failed
        }
    }
}
