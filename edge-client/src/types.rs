use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

// ============================================================================
// Node Registration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub network_mbps: u32,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub node_name: String,
    pub location: String,
    pub endpoint: String,
    pub capabilities: Capabilities,
}

/// Envelope every central-server HTTP endpoint answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationData {
    pub node_id: String,
    /// Control channel URL assigned by the server, when it picks one.
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What the node holds after registering, for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAuth {
    pub node_id: String,
    pub node_name: String,
    pub ws_url: String,
    pub public_key: String,
}

// ============================================================================
// Control Channel
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub timestamp: String,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(kind: &str, data: T) -> Self {
        Self {
            kind: kind.to_string(),
            id: Uuid::new_v4().to_string(),
            timestamp: now_rfc3339(),
            data,
        }
    }
}

pub mod message_types {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const HEALTH_REPORT: &str = "health_report";
    pub const COMMAND_RESULT: &str = "command_result";
    pub const CONFIG_UPDATE: &str = "config_update";
    pub const NODE_COMMAND: &str = "node_command";
    pub const HEALTH_CHECK_REQUEST: &str = "health_check_request";
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemLoad {
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub active_connections: u64,
    pub requests_per_second: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Busy,
    Maintenance,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    pub node_id: String,
    pub timestamp: String,
    pub load: SystemLoad,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: String,
    pub command: String,
    pub success: bool,
    pub message: String,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthChecks {
    pub cpu: HealthCheck,
    pub memory: HealthCheck,
    pub network: HealthCheck,
    pub disk: HealthCheck,
    pub services: HealthCheck,
}

impl HealthChecks {
    pub fn statuses(&self) -> [HealthStatus; 5] {
        [
            self.cpu.status,
            self.memory.status,
            self.network.status,
            self.disk.status,
            self.services.status,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub node_id: String,
    pub timestamp: String,
    pub status: HealthStatus,
    pub score: u8,
    pub checks: HealthChecks,
}

// ============================================================================
// Config Sync
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSyncRequest {
    pub node_id: String,
    pub current_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSync {
    pub version: String,
    #[serde(default)]
    pub ai_services: Vec<ServiceConfig>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub security: SecuritySettings,
}

impl ConfigSync {
    pub fn enabled_services(&self) -> impl Iterator<Item = &ServiceConfig> {
        self.ai_services.iter().filter(|s| s.is_enabled())
    }
}

/// A provider the proxy knows how to talk to, or the raw JSON of one it
/// doesn't (kept so newer servers can add providers without breaking us).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceConfig {
    Known(KnownService),
    Opaque(Value),
}

impl ServiceConfig {
    pub fn name(&self) -> Option<&str> {
        match self {
            ServiceConfig::Known(service) => Some(&service.settings().name),
            ServiceConfig::Opaque(value) => value.get("name").and_then(Value::as_str),
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            ServiceConfig::Known(service) => service.settings().enabled,
            ServiceConfig::Opaque(value) => value
                .get("enabled")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        }
    }

    pub fn known(&self) -> Option<&KnownService> {
        match self {
            ServiceConfig::Known(service) => Some(service),
            ServiceConfig::Opaque(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KnownService {
    Claude(ProviderSettings),
    Gemini(ProviderSettings),
    Openai(ProviderSettings),
}

impl KnownService {
    pub fn settings(&self) -> &ProviderSettings {
        match self {
            KnownService::Claude(s) | KnownService::Gemini(s) | KnownService::Openai(s) => s,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            KnownService::Claude(_) => "claude",
            KnownService::Gemini(_) => "gemini",
            KnownService::Openai(_) => "openai",
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Send requests for models starting with `model_prefix` to `service`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub model_prefix: String,
    pub service: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySettings {
    #[serde(default)]
    pub max_tokens_per_request: Option<u32>,
    #[serde(default)]
    pub blocked_models: Vec<String>,
}

// ============================================================================
// Proxy
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub service: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub success: bool,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageErrorKind {
    Timeout,
    Network,
    RateLimited,
    UpstreamClient,
    UpstreamServer,
    NotConfigured,
    Rejected,
    InvalidResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub request_id: String,
    pub node_id: String,
    pub service: String,
    pub model: String,
    pub success: bool,
    pub response_time_ms: u64,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub error_kind: Option<UsageErrorKind>,
    pub timestamp: String,
}

// ============================================================================
// Metrics Upload
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub node_id: String,
    pub timestamp: String,
    pub retention_hours: u64,
    pub system: SystemLoad,
    pub disk_usage: f32,
    pub usage: Vec<UsageStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_configs_keep_unknown_providers() {
        let raw = json!([
            {"type": "claude", "name": "claude-main", "apiKey": "sk-1"},
            {"type": "mistral", "name": "mistral-eu", "endpoint": "https://example.test"},
            {"type": "gemini", "name": "gemini-off", "apiKey": "g-1", "enabled": false}
        ]);

        let services: Vec<ServiceConfig> = serde_json::from_value(raw).unwrap();

        assert_eq!(services[0].known().unwrap().provider_name(), "claude");
        assert!(services[0].is_enabled());
        assert!(matches!(services[1], ServiceConfig::Opaque(_)));
        assert_eq!(services[1].name(), Some("mistral-eu"));
        assert!(!services[2].is_enabled());

        // Opaque entries go back out unchanged.
        let round = serde_json::to_value(&services[1]).unwrap();
        assert_eq!(round["endpoint"], "https://example.test");
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new(message_types::HEARTBEAT, json!({"nodeId": "n1"}));
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["data"]["nodeId"], "n1");
        assert!(value["id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(value["timestamp"].as_str().is_some());
    }

    #[test]
    fn test_registration_response_without_data() {
        let resp: ApiResponse<RegistrationData> =
            serde_json::from_value(json!({"success": false, "error": "duplicate node"})).unwrap();

        assert!(!resp.success);
        assert!(resp.data.is_none());
        assert_eq!(resp.error.as_deref(), Some("duplicate node"));
    }
}
