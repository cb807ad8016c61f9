use reqwest::Client;
use tracing::debug;

/// `GET {base_url}/health` answered with a success status.
pub async fn health_check(client: &Client, base_url: &str) -> bool {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    is_url_accessible(client, &url).await
}

/// Any success response counts; errors and non-success statuses do not.
pub async fn is_url_accessible(client: &Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            debug!("Probe of {} failed: {}", url, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_health_check_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = Client::new();
        assert!(health_check(&client, &format!("{}/", server.uri())).await);
    }

    #[tokio::test]
    async fn test_non_success_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = Client::new();
        assert!(!health_check(&client, &server.uri()).await);
        assert!(!is_url_accessible(&client, &format!("{}/anything", server.uri())).await);
    }

    #[tokio::test]
    async fn test_invalid_url_is_unreachable() {
        let client = Client::new();
        assert!(!is_url_accessible(&client, "not a url").await);
    }
}
