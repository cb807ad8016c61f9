//! Wires every component together and owns their tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::central_client::CentralClient;
use crate::config::EdgeConfig;
use crate::config_sync::{ConfigStore, ConfigSyncer};
use crate::crypto::{ensure_key_pair, KeyPaths, NodeKeys};
use crate::net::{safe_ws_send, SocketSink};
use crate::proxy::{
    router, FixedWindowLimiter, LocalServer, ProxyService, ServerState, USAGE_CHANNEL_CAPACITY,
};
use crate::reporters::{
    local_capabilities, spawn_periodic, CentralProbe, HealthMonitor, HeartbeatReporter,
    LoadSampler, MetricsReporter, RequestCounters, ReporterEvent, SystemSampler,
};
use crate::session::{InboundMessage, NodeCommand, SessionEvent, SessionHandle, SessionManager};
use crate::types::{message_types, CommandResult, Envelope, HealthStatus, RegisterNodeRequest};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct EdgeClient {
    config: EdgeConfig,
}

impl EdgeClient {
    pub fn new(config: EdgeConfig) -> Self {
        Self { config }
    }

    /// Load keys, bind the local server, register, then start every task.
    /// Fails without leaving anything running if any step before the tasks
    /// start fails.
    pub async fn start(self) -> Result<RunningClient> {
        let config = self.config;

        let keys = Arc::new(load_keys(config.key_paths()).await?);

        let server = LocalServer::bind(config.server.bind, config.tls_paths().as_ref())
            .context("Failed to set up local server")?;
        let local_addr = server.local_addr()?;

        let central = Arc::new(
            CentralClient::new(&config.central.url, config.central_timeout(), config.central_retry())
                .context("Failed to create central server client")?,
        );

        let registration = RegisterNodeRequest {
            node_name: config.node_name()?,
            location: config.node.location.clone(),
            endpoint: config.endpoint(local_addr),
            capabilities: local_capabilities(config.node.network_mbps, config.node.max_connections),
        };
        info!(
            "Node configuration: name={}, location={}, endpoint={}, cpu_cores={}, memory_mb={}",
            registration.node_name,
            registration.location,
            registration.endpoint,
            registration.capabilities.cpu_cores,
            registration.capabilities.memory_mb
        );

        let (session_tx, session_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut session = SessionManager::new(
            config.session_settings()?,
            central.clone(),
            keys.clone(),
            registration,
            session_tx,
        );
        session
            .register_node()
            .await
            .context("Failed to register with central server")?;

        let issuer = session.token_issuer()?;
        let node_id = issuer.node_id().to_string();
        let handle = session.handle();
        let sink: Arc<dyn SocketSink> = Arc::new(handle.outbox().clone());

        let store = ConfigStore::default();
        let syncer = Arc::new(ConfigSyncer::new(central.clone(), issuer.clone(), store.clone()));
        if let Err(e) = syncer.sync().await {
            warn!("Initial config sync failed, continuing without config: {}", e);
        }

        let sampler: Arc<dyn LoadSampler> = Arc::new(SystemSampler::new());
        let counters = RequestCounters::default();
        let (reporter_tx, reporter_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let health = Arc::new(HealthMonitor::new(
            node_id.clone(),
            sampler.clone(),
            Arc::new(CentralProbe::new(
                sink.clone(),
                central.http().clone(),
                central.base_url().to_string(),
            )),
            store.clone(),
            sink.clone(),
            reporter_tx,
        ));
        let heartbeat = Arc::new(HeartbeatReporter::new(
            node_id.clone(),
            config.node.max_connections,
            sampler.clone(),
            counters.clone(),
            sink.clone(),
        ));

        let (usage_tx, usage_rx) = mpsc::channel(USAGE_CHANNEL_CAPACITY);
        let metrics = Arc::new(MetricsReporter::new(
            central.clone(),
            issuer,
            sampler,
            counters.clone(),
            sink,
            config.reporters.metrics_retention_hours,
            usage_rx,
        ));
        let proxy = Arc::new(
            ProxyService::new(node_id.clone(), store.clone(), config.proxy_settings(), usage_tx)
                .context("Failed to create proxy client")?,
        );

        let reporters_cancel = CancellationToken::new();
        let session_cancel = CancellationToken::new();
        let server_cancel = CancellationToken::new();

        let session_task = tokio::spawn(session.run(session_cancel.clone()));

        let dispatcher = Dispatcher {
            session: handle.clone(),
            store: store.clone(),
            syncer: syncer.clone(),
            health: health.clone(),
        };
        let dispatcher_task = tokio::spawn(dispatcher.run(
            session_rx,
            reporter_rx,
            session_cancel.clone(),
        ));

        let reporters = &config.reporters;
        let mut reporter_tasks = Vec::new();

        let hb = heartbeat.clone();
        reporter_tasks.push(spawn_periodic(
            "heartbeat",
            Duration::from_secs(reporters.heartbeat_interval_secs),
            reporters_cancel.clone(),
            move || {
                let hb = hb.clone();
                async move {
                    hb.tick().await;
                }
            },
        ));

        let hm = health.clone();
        reporter_tasks.push(spawn_periodic(
            "health check",
            Duration::from_secs(reporters.health_check_interval_secs),
            reporters_cancel.clone(),
            move || {
                let hm = hm.clone();
                async move { hm.tick().await }
            },
        ));

        let mr = metrics.clone();
        reporter_tasks.push(spawn_periodic(
            "metrics",
            Duration::from_secs(reporters.metrics_interval_secs),
            reporters_cancel.clone(),
            move || {
                let mr = mr.clone();
                async move {
                    mr.tick().await;
                }
            },
        ));

        let cs = syncer.clone();
        reporter_tasks.push(spawn_periodic(
            "config sync",
            Duration::from_secs(reporters.config_sync_interval_secs),
            reporters_cancel.clone(),
            move || {
                let cs = cs.clone();
                async move {
                    if let Err(e) = cs.sync().await {
                        warn!("Periodic config sync failed: {}", e);
                    }
                }
            },
        ));

        let state = ServerState {
            node_id: node_id.clone(),
            proxy,
            limiter: Arc::new(FixedWindowLimiter::new(
                Duration::from_secs(config.proxy.rate_limit_window_secs),
                config.proxy.rate_limit_max_requests,
            )),
            counters,
            config: store.clone(),
            session: handle.subscribe(),
            health: health.subscribe(),
        };
        let server_task = tokio::spawn(server.run(router(state), server_cancel.clone()));

        info!("Edge client started: node_id={}, local={}", node_id, local_addr);

        Ok(RunningClient {
            node_id,
            local_addr,
            session: handle,
            config: store,
            health,
            metrics,
            reporters_cancel,
            session_cancel,
            server_cancel,
            reporter_tasks,
            session_task,
            dispatcher_task,
            server_task,
        })
    }
}

pub struct RunningClient {
    node_id: String,
    local_addr: SocketAddr,
    session: SessionHandle,
    config: ConfigStore,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsReporter>,
    reporters_cancel: CancellationToken,
    session_cancel: CancellationToken,
    server_cancel: CancellationToken,
    reporter_tasks: Vec<JoinHandle<()>>,
    session_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
    server_task: JoinHandle<Result<()>>,
}

impl RunningClient {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Stop reporters, then the control channel, then flush pending metrics.
    /// Every task has finished when this returns.
    pub async fn stop(self) -> Result<()> {
        info!("Stopping edge client");

        self.reporters_cancel.cancel();
        for task in self.reporter_tasks {
            if let Err(e) = task.await {
                warn!("Reporter task ended abnormally: {}", e);
            }
        }

        self.session_cancel.cancel();
        if let Err(e) = self.session_task.await {
            warn!("Session task ended abnormally: {}", e);
        }
        if let Err(e) = self.dispatcher_task.await {
            warn!("Dispatcher task ended abnormally: {}", e);
        }

        match self.metrics.flush().await {
            Ok(0) => debug!("No pending metrics to flush"),
            Ok(count) => info!("Flushed {} usage record(s) at shutdown", count),
            Err(e) => warn!("Failed to flush metrics at shutdown: {}", e),
        }

        self.server_cancel.cancel();
        self.server_task
            .await
            .context("Local server task panicked")?
            .context("Local server failed")?;

        info!("Edge client stopped");
        Ok(())
    }
}

/// Single consumer of session and reporter events, so inbound control
/// messages are handled in arrival order.
struct Dispatcher {
    session: SessionHandle,
    store: ConfigStore,
    syncer: Arc<ConfigSyncer>,
    health: Arc<HealthMonitor>,
}

impl Dispatcher {
    async fn run(
        self,
        mut session_rx: mpsc::Receiver<SessionEvent>,
        mut reporter_rx: mpsc::Receiver<ReporterEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = session_rx.recv() => self.on_session_event(event).await,
                Some(event) = reporter_rx.recv() => self.on_reporter_event(event),
                else => break,
            }
        }
        debug!("Event dispatcher stopped");
    }

    async fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => info!("Control channel connected"),
            SessionEvent::Disconnected => warn!("Control channel disconnected"),
            SessionEvent::Offline { attempts } => error!(
                "Node is offline after {} failed reconnect attempt(s); reporters are idle until restart",
                attempts
            ),
            SessionEvent::Inbound(message) => self.on_message(message).await,
        }
    }

    async fn on_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::ConfigUpdate(update) => {
                self.store.apply(update);
            }
            InboundMessage::NodeCommand { id, command, .. } => {
                let result = self.on_command(&id, command).await;
                if !safe_ws_send(
                    self.session.outbox(),
                    &Envelope::new(message_types::COMMAND_RESULT, &result),
                ) {
                    debug!("Command result for {} not sent", id);
                }
            }
            InboundMessage::HealthCheckRequest { id } => {
                debug!("Remote health check requested ({})", id);
                self.health.tick().await;
            }
        }
    }

    async fn on_command(&self, id: &str, command: NodeCommand) -> CommandResult {
        info!("Received node command {} ({})", command.as_str(), id);

        let (success, message) = match command {
            NodeCommand::Restart => {
                if self.session.request_reconnect() {
                    (true, "reconnecting control channel".to_string())
                } else {
                    (false, "a reconnect is already pending".to_string())
                }
            }
            NodeCommand::UpdateConfig => match self.syncer.sync().await {
                Ok(true) => (true, "configuration updated".to_string()),
                Ok(false) => (true, "configuration already current".to_string()),
                Err(e) => (false, e.to_string()),
            },
            NodeCommand::HealthCheck => match self.health.run_check().await {
                Ok(result) => (true, format!("{} (score {})", result.status, result.score)),
                Err(e) => (false, e.to_string()),
            },
        };

        CommandResult {
            command_id: id.to_string(),
            command: command.as_str().to_string(),
            success,
            message,
        }
    }

    fn on_reporter_event(&self, event: ReporterEvent) {
        match event {
            ReporterEvent::HealthStatusChanged {
                previous,
                current,
                score,
            } => {
                if current == HealthStatus::Unhealthy {
                    warn!("Node is unhealthy (score={}, previous={:?})", score, previous);
                } else {
                    debug!("Health status now {} (score={})", current, score);
                }
            }
        }
    }
}

/// Load or generate the node keys on the blocking pool.
async fn load_keys(paths: KeyPaths) -> Result<NodeKeys> {
    tokio::task::spawn_blocking(move || ensure_key_pair(&paths))
        .await
        .context("Key loading task failed")?
        .context("Failed to load or create node keys")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn paths(dir: &tempfile::TempDir) -> KeyPaths {
        KeyPaths {
            private_key: dir.path().join("private.pem"),
            public_key: dir.path().join("public.pem"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_key_generation_leaves_runtime_responsive() {
        let dir = tempfile::tempdir().unwrap();
        let ticks = Arc::new(AtomicU32::new(0));

        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let keys = load_keys(paths(&dir)).await.unwrap();
        ticker.abort();

        assert!(ticks.load(Ordering::Relaxed) > 1);
        assert!(dir.path().join("private.pem").exists());

        let reloaded = load_keys(paths(&dir)).await.unwrap();
        assert_eq!(reloaded.public_pem(), keys.public_pem());
    }
}
