use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::central_client::CentralClient;
use crate::crypto::TokenIssuer;
use crate::error::ConfigSyncError;
use crate::types::{ConfigSync, ConfigSyncRequest};

/// Latest configuration received from the central server.
///
/// Updates swap the whole snapshot, so readers see either the old or the new
/// version and never a mix. Versions are opaque strings; once a version has
/// been replaced it is never accepted again, so a late or replayed update
/// cannot roll the node back.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    inner: Arc<RwLock<Versions>>,
}

#[derive(Debug, Default)]
struct Versions {
    current: Option<Arc<ConfigSync>>,
    superseded: HashSet<String>,
}

impl ConfigStore {
    pub fn current(&self) -> Option<Arc<ConfigSync>> {
        self.inner.read().ok().and_then(|v| v.current.clone())
    }

    pub fn version(&self) -> Option<String> {
        self.current().map(|c| c.version.clone())
    }

    /// Replace the snapshot. Returns `false` when `update` carries the version
    /// already held or one that was replaced earlier.
    pub fn apply(&self, update: ConfigSync) -> bool {
        let Ok(mut versions) = self.inner.write() else {
            return false;
        };

        if versions
            .current
            .as_ref()
            .is_some_and(|c| c.version == update.version)
        {
            debug!("Config version {} already applied", update.version);
            return false;
        }
        if versions.superseded.contains(&update.version) {
            warn!(
                "Ignoring config version {}: it was already superseded",
                update.version
            );
            return false;
        }

        let previous = versions.current.as_ref().map(|c| c.version.clone());
        info!(
            "Applied config version {} (previous={:?}, services={})",
            update.version,
            previous,
            update.ai_services.len()
        );
        if let Some(previous) = previous {
            versions.superseded.insert(previous);
        }
        versions.current = Some(Arc::new(update));
        true
    }

    pub fn enabled_service_count(&self) -> usize {
        self.current()
            .map(|c| c.enabled_services().count())
            .unwrap_or(0)
    }
}

/// Pulls configuration over HTTP into a `ConfigStore`.
pub struct ConfigSyncer {
    central: Arc<CentralClient>,
    issuer: TokenIssuer,
    store: ConfigStore,
}

impl ConfigSyncer {
    pub fn new(central: Arc<CentralClient>, issuer: TokenIssuer, store: ConfigStore) -> Self {
        Self {
            central,
            issuer,
            store,
        }
    }

    /// Returns whether a newer version was applied.
    pub async fn sync(&self) -> Result<bool, ConfigSyncError> {
        let token = self.issuer.issue()?;
        let req = ConfigSyncRequest {
            node_id: self.issuer.node_id().to_string(),
            current_version: self.store.version(),
        };

        match self.central.sync_config(&token, &req).await? {
            Some(update) => Ok(self.store.apply(update)),
            None => {
                debug!("Config is up to date (version={:?})", req.current_version);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;
    use crate::net::RetryPolicy;
    use crate::types::{KnownService, ProviderSettings, ServiceConfig};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(version: &str, enabled: bool) -> ConfigSync {
        ConfigSync {
            version: version.to_string(),
            ai_services: vec![ServiceConfig::Known(KnownService::Claude(ProviderSettings {
                name: "claude-main".to_string(),
                api_key: "sk-test".to_string(),
                base_url: None,
                enabled,
                default_model: None,
                max_tokens: None,
            }))],
            routing_rules: Vec::new(),
            security: Default::default(),
        }
    }

    #[test]
    fn test_apply_replaces_snapshot() {
        let store = ConfigStore::default();
        assert!(store.version().is_none());

        assert!(store.apply(config("v1", true)));
        let before = store.current().unwrap();

        assert!(store.apply(config("v2", false)));
        assert_eq!(store.version().as_deref(), Some("v2"));
        assert_eq!(store.enabled_service_count(), 0);

        // Earlier readers keep their snapshot.
        assert_eq!(before.version, "v1");
    }

    #[test]
    fn test_same_version_is_ignored() {
        let store = ConfigStore::default();
        assert!(store.apply(config("v1", true)));
        assert!(!store.apply(config("v1", false)));
        assert_eq!(store.enabled_service_count(), 1);
    }

    #[test]
    fn test_superseded_version_is_not_reapplied() {
        let store = ConfigStore::default();
        assert!(store.apply(config("1", true)));
        assert!(store.apply(config("2", false)));

        assert!(!store.apply(config("1", true)));
        assert_eq!(store.version().as_deref(), Some("2"));
        assert_eq!(store.enabled_service_count(), 0);

        // Moving forward still works, and "2" is now off limits too.
        assert!(store.apply(config("3", true)));
        assert!(!store.apply(config("2", false)));
        assert_eq!(store.version().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_sync_reports_current_version() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/edge-nodes/config/sync"))
            .and(body_partial_json(json!({"nodeId": "node-9", "currentVersion": "v1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"version": "v2"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let central = Arc::new(
            CentralClient::new(
                &server.uri(),
                Duration::from_secs(5),
                RetryPolicy::new(1, Duration::ZERO),
            )
            .unwrap(),
        );
        let issuer = TokenIssuer::new(
            Arc::new(test_keys().clone()),
            "node-9".to_string(),
            "edge".to_string(),
            "1h".to_string(),
        );
        let store = ConfigStore::default();
        store.apply(config("v1", true));

        let syncer = ConfigSyncer::new(central, issuer, store.clone());

        assert!(syncer.sync().await.unwrap());
        assert_eq!(store.version().as_deref(), Some("v2"));
    }
}
