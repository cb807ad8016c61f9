//! Forwarding of AI requests to upstream providers.

pub mod providers;
pub mod rate_limit;
pub mod server;
pub mod tls;

use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config_sync::ConfigStore;
use crate::error::TransportError;
use crate::net::{request_with_retry, RetryPolicy};
use crate::types::{
    now_rfc3339, ConfigSync, KnownService, ProxyRequest, ProxyResponse, ServiceConfig,
    UsageErrorKind, UsageStats,
};

use providers::{build_call, parse_reply, Completion, Reply};

pub use rate_limit::FixedWindowLimiter;
pub use server::{router, LocalServer, ServerState};
pub use tls::TlsPaths;

/// Bound of the proxy → metrics usage channel.
pub const USAGE_CHANNEL_CAPACITY: usize = 10_000;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("service not configured: {0}")]
    NotConfigured(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("upstream timed out")]
    Timeout,

    #[error("upstream unreachable: {0}")]
    Network(String),

    #[error("upstream rate limited the request")]
    RateLimited,

    #[error("upstream rejected the request ({status}): {body}")]
    UpstreamClient { status: u16, body: String },

    #[error("upstream failed ({status}): {body}")]
    UpstreamServer { status: u16, body: String },

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl ProxyError {
    pub fn kind(&self) -> UsageErrorKind {
        match self {
            ProxyError::NotConfigured(_) => UsageErrorKind::NotConfigured,
            ProxyError::Rejected(_) => UsageErrorKind::Rejected,
            ProxyError::Timeout => UsageErrorKind::Timeout,
            ProxyError::Network(_) => UsageErrorKind::Network,
            ProxyError::RateLimited => UsageErrorKind::RateLimited,
            ProxyError::UpstreamClient { .. } => UsageErrorKind::UpstreamClient,
            ProxyError::UpstreamServer { .. } => UsageErrorKind::UpstreamServer,
            ProxyError::InvalidResponse(_) => UsageErrorKind::InvalidResponse,
        }
    }
}

impl From<TransportError> for ProxyError {
    fn from(e: TransportError) -> Self {
        if e.is_timeout() {
            return ProxyError::Timeout;
        }
        match e {
            TransportError::Status { status: 429, .. } => ProxyError::RateLimited,
            TransportError::Status { status, body } if status >= 500 => {
                ProxyError::UpstreamServer { status, body }
            }
            TransportError::Status { status, body } => ProxyError::UpstreamClient { status, body },
            TransportError::Network(e) => ProxyError::Network(e.to_string()),
            TransportError::Decode(msg) => ProxyError::InvalidResponse(msg),
            TransportError::ChannelClosed => ProxyError::Network("channel closed".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProxySettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

/// A resolved upstream with the limits that apply to one request.
struct Route {
    service: KnownService,
    model: String,
    max_tokens: Option<u32>,
}

pub struct ProxyService {
    node_id: String,
    http: Client,
    config: ConfigStore,
    retry: RetryPolicy,
    usage_tx: mpsc::Sender<UsageStats>,
}

impl ProxyService {
    pub fn new(
        node_id: String,
        config: ConfigStore,
        settings: ProxySettings,
        usage_tx: mpsc::Sender<UsageStats>,
    ) -> Result<Self, TransportError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .user_agent(format!("carpool-edge-client/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            node_id,
            http,
            config,
            retry: settings.retry,
            usage_tx,
        })
    }

    /// Forward one request. Never fails: upstream problems come back as
    /// `success: false`. Exactly one usage record is emitted per call.
    pub async fn handle(&self, req: ProxyRequest) -> ProxyResponse {
        let request_id = req
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let started = Instant::now();

        let outcome = match self.resolve(&req) {
            Ok(route) => self.forward(&req, &route).await.map(|reply| (route, reply)),
            Err(e) => Err(e),
        };
        let response_time_ms = started.elapsed().as_millis() as u64;

        let (response, usage) = match outcome {
            Ok((route, reply)) => {
                debug!(
                    "Proxied request {} to {} ({} ms)",
                    request_id,
                    route.service.settings().name,
                    response_time_ms
                );
                let usage = self.usage(
                    &request_id,
                    &route.service.settings().name,
                    &route.model,
                    response_time_ms,
                );
                let usage = UsageStats {
                    success: true,
                    input_tokens: reply.usage.map(|u| u.input_tokens),
                    output_tokens: reply.usage.map(|u| u.output_tokens),
                    ..usage
                };
                let response = ProxyResponse {
                    success: true,
                    request_id,
                    content: Some(reply.content),
                    usage: reply.usage,
                    error: None,
                    response_time_ms,
                };
                (response, usage)
            }
            Err(e) => {
                warn!("Proxy request {} failed: {}", request_id, e);
                let usage = UsageStats {
                    error_kind: Some(e.kind()),
                    ..self.usage(&request_id, &req.service, &req.model, response_time_ms)
                };
                let response = ProxyResponse {
                    success: false,
                    request_id,
                    content: None,
                    usage: None,
                    error: Some(e.to_string()),
                    response_time_ms,
                };
                (response, usage)
            }
        };

        if self.usage_tx.try_send(usage).is_err() {
            warn!("Usage record dropped: metrics channel full or closed");
        }
        response
    }

    fn usage(
        &self,
        request_id: &str,
        service: &str,
        model: &str,
        response_time_ms: u64,
    ) -> UsageStats {
        UsageStats {
            request_id: request_id.to_string(),
            node_id: self.node_id.clone(),
            service: service.to_string(),
            model: model.to_string(),
            success: false,
            response_time_ms,
            input_tokens: None,
            output_tokens: None,
            error_kind: None,
            timestamp: now_rfc3339(),
        }
    }

    fn resolve(&self, req: &ProxyRequest) -> Result<Route, ProxyError> {
        let config = self
            .config
            .current()
            .ok_or_else(|| ProxyError::NotConfigured("no configuration received yet".to_string()))?;
        resolve_route(&config, req)
    }

    async fn forward(&self, req: &ProxyRequest, route: &Route) -> Result<Reply, ProxyError> {
        let call = build_call(
            &route.service,
            &Completion {
                model: &route.model,
                messages: &req.messages,
                max_tokens: route.max_tokens,
                temperature: req.temperature,
            },
        );

        let resp = request_with_retry(self.retry, || {
            let mut builder = self.http.post(&call.url).json(&call.body);
            for (name, value) in &call.headers {
                builder = builder.header(*name, value);
            }
            builder.send()
        })
        .await?;

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProxyError::InvalidResponse(e.to_string()))?;
        parse_reply(&route.service, &body).map_err(ProxyError::InvalidResponse)
    }
}

fn resolve_route(config: &ConfigSync, req: &ProxyRequest) -> Result<Route, ProxyError> {
    let service_name = if req.service.is_empty() {
        config
            .routing_rules
            .iter()
            .find(|r| req.model.starts_with(&r.model_prefix))
            .map(|r| r.service.as_str())
            .ok_or_else(|| {
                ProxyError::NotConfigured(format!("no routing rule for model {:?}", req.model))
            })?
    } else {
        req.service.as_str()
    };

    let entry = config
        .enabled_services()
        .find(|s| s.name() == Some(service_name))
        .ok_or_else(|| ProxyError::NotConfigured(format!("{:?} is not enabled", service_name)))?;

    let service = match entry {
        ServiceConfig::Known(service) => service.clone(),
        ServiceConfig::Opaque(_) => {
            return Err(ProxyError::NotConfigured(format!(
                "{:?} uses an unsupported provider",
                service_name
            )))
        }
    };

    let settings = service.settings();
    let model = if req.model.is_empty() {
        settings.default_model.clone().ok_or_else(|| {
            ProxyError::Rejected(format!("no model given and {:?} has no default", service_name))
        })?
    } else {
        req.model.clone()
    };

    if config.security.blocked_models.iter().any(|m| *m == model) {
        info!("Rejecting request for blocked model {}", model);
        return Err(ProxyError::Rejected(format!("model {:?} is blocked", model)));
    }

    let max_tokens = req.max_tokens.or(settings.max_tokens);
    if let (Some(requested), Some(limit)) = (max_tokens, config.security.max_tokens_per_request) {
        if requested > limit {
            return Err(ProxyError::Rejected(format!(
                "max_tokens {} exceeds the limit of {}",
                requested, limit
            )));
        }
    }

    Ok(Route {
        service,
        model,
        max_tokens,
    })
}
