use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{ConfigSyncError, SessionError, TransportError};
use crate::net::{request_with_retry, RetryPolicy};
use crate::types::{
    ApiResponse, ConfigSync, ConfigSyncRequest, MetricsReport, RegisterNodeRequest,
    RegistrationData,
};

pub const PUBLIC_KEY_HEADER: &str = "X-Node-Public-Key";

/// HTTP side of the central server API.
pub struct CentralClient {
    base_url: String,
    client: Client,
    retry: RetryPolicy,
}

impl CentralClient {
    pub fn new(base_url: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("carpool-edge-client/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    /// Register this node. `success: false` is a hard failure even on HTTP 200.
    pub async fn register_node(
        &self,
        req: &RegisterNodeRequest,
        public_key_b64: &str,
    ) -> Result<RegistrationData, SessionError> {
        let url = format!("{}/api/edge-nodes/register", self.base_url);
        info!("Registering node at {}", url);

        let resp = request_with_retry(self.retry, || {
            self.client
                .post(&url)
                .header(PUBLIC_KEY_HEADER, public_key_b64)
                .json(req)
                .send()
        })
        .await?;

        let body: ApiResponse<RegistrationData> = read_json(resp).await?;
        if !body.success {
            return Err(SessionError::RegistrationRejected(
                body.error.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        let data = body.data.ok_or_else(|| {
            SessionError::RegistrationRejected("response carried no node data".to_string())
        })?;
        if data.node_id.is_empty() {
            return Err(SessionError::RegistrationRejected(
                "response carried an empty nodeId".to_string(),
            ));
        }

        info!("Node registered: node_id={}", data.node_id);
        Ok(data)
    }

    /// Pull configuration newer than `current_version`; `None` when up to date.
    pub async fn sync_config(
        &self,
        token: &str,
        req: &ConfigSyncRequest,
    ) -> Result<Option<ConfigSync>, ConfigSyncError> {
        let url = format!("{}/api/edge-nodes/config/sync", self.base_url);
        debug!("Syncing config from {}", url);

        let resp = request_with_retry(self.retry, || {
            self.client.post(&url).bearer_auth(token).json(req).send()
        })
        .await?;

        let body: ApiResponse<ConfigSync> = read_json(resp).await?;
        if !body.success {
            return Err(ConfigSyncError::Rejected(
                body.error.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        Ok(body.data)
    }

    pub async fn upload_metrics(
        &self,
        token: &str,
        report: &MetricsReport,
    ) -> Result<(), TransportError> {
        let url = format!("{}/api/edge-nodes/metrics", self.base_url);
        debug!(
            "Uploading metrics to {} ({} usage record(s))",
            url,
            report.usage.len()
        );

        request_with_retry(self.retry, || {
            self.client.post(&url).bearer_auth(token).json(report).send()
        })
        .await?;

        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, TransportError> {
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Capabilities;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> CentralClient {
        CentralClient::new(
            &server.uri(),
            Duration::from_secs(5),
            RetryPolicy::new(3, Duration::from_millis(10)),
        )
        .unwrap()
    }

    fn registration() -> RegisterNodeRequest {
        RegisterNodeRequest {
            node_name: "edge-osaka".to_string(),
            location: "osaka".to_string(),
            endpoint: "http://10.0.0.5:8080".to_string(),
            capabilities: Capabilities {
                cpu_cores: 8,
                memory_mb: 16384,
                network_mbps: 1000,
                max_connections: 500,
            },
        }
    }

    #[tokio::test]
    async fn test_register_node_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/register"))
            .and(header(PUBLIC_KEY_HEADER, "cHVibGlj"))
            .and(body_partial_json(json!({
                "nodeName": "edge-osaka",
                "capabilities": {"cpuCores": 8, "maxConnections": 500}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"nodeId": "node-1", "wsUrl": "ws://central/ws", "region": "ap"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let data = client_for(&server)
            .register_node(&registration(), "cHVibGlj")
            .await
            .unwrap();

        assert_eq!(data.node_id, "node-1");
        assert_eq!(data.ws_url.as_deref(), Some("ws://central/ws"));
        assert_eq!(data.extra["region"], "ap");
    }

    #[tokio::test]
    async fn test_register_node_rejected_with_200() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "node name already taken"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .register_node(&registration(), "cHVibGlj")
            .await
            .unwrap_err();

        match err {
            SessionError::RegistrationRejected(reason) => {
                assert_eq!(reason, "node name already taken")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_node_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/register"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"nodeId": "node-2"}
            })))
            .mount(&server)
            .await;

        let data = client_for(&server)
            .register_node(&registration(), "cHVibGlj")
            .await
            .unwrap();

        assert_eq!(data.node_id, "node-2");
    }

    #[tokio::test]
    async fn test_sync_config_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/config/sync"))
            .and(header("authorization", "Bearer token-abc"))
            .and(body_partial_json(json!({"nodeId": "node-1", "currentVersion": null})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"version": "v3", "aiServices": []}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let req = ConfigSyncRequest {
            node_id: "node-1".to_string(),
            current_version: None,
        };
        let config = client_for(&server)
            .sync_config("token-abc", &req)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(config.version, "v3");
    }

    #[tokio::test]
    async fn test_sync_config_up_to_date() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/config/sync"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(&server)
            .await;

        let req = ConfigSyncRequest {
            node_id: "node-1".to_string(),
            current_version: Some("v3".to_string()),
        };
        let config = client_for(&server).sync_config("t", &req).await.unwrap();

        assert!(config.is_none());
    }
}
