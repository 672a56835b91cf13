use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use tracing::debug;

use lisa_core::config::ProviderConfig;
use lisa_core::error::{LisaError, Result};
use lisa_core::traits::Provider;

/// Provider speaking JSON over HTTP: `POST endpoint` with the request body,
/// the JSON response body is the result.
pub struct HttpProvider {
    name: String,
    endpoint: String,
    health_endpoint: Option<String>,
    api_key: Option<String>,
    http: Client,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            health_endpoint: None,
            api_key: None,
            http: Client::new(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            LisaError::Config(format!("provider '{}' has no endpoint", config.name))
        })?;
        let mut provider = Self::new(config.name.clone(), endpoint);
        provider.health_endpoint = config.health_endpoint.clone();
        provider.api_key = config.api_key.clone();
        Ok(provider)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// 408, 429 and 5xx are worth retrying; any other non-success status means
/// the request itself is wrong.
pub fn classify_status(status: StatusCode, body: &str) -> LisaError {
    let message = format!("HTTP {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        LisaError::TransientBackend(message)
    } else {
        LisaError::PermanentBackend(message)
    }
}

fn classify_send_error(e: reqwest::Error) -> LisaError {
    if e.is_builder() {
        LisaError::PermanentBackend(e.to_string())
    } else {
        // Connection refused, reset, DNS and client timeouts.
        LisaError::TransientBackend(e.to_string())
    }
}

impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(&self, request: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let mut req = self.http.post(&self.endpoint).json(&request);
            if let Some(ref api_key) = self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req.send().await.map_err(classify_send_error)?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, &body));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| LisaError::PermanentBackend(format!("invalid JSON response: {}", e)))
        })
    }

    fn health_check(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let url = self.health_endpoint.as_deref().unwrap_or(&self.endpoint);
            debug!(provider = %self.name, url, "Probing provider health");
            let mut req = self.http.get(url);
            if let Some(ref api_key) = self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            let response = req.send().await.map_err(classify_send_error)?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(classify_status(response.status(), ""))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single canned HTTP response on a local port.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                        .map(|(_, v)| v.trim().parse::<usize>().unwrap_or(0))
                        .unwrap_or(0);
                    if buf.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}/complete", addr)
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_retryable());
        match classify_status(StatusCode::NOT_FOUND, "missing") {
            LisaError::PermanentBackend(msg) => assert!(msg.contains("missing")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let config = ProviderConfig::new("primary", 0);
        assert!(matches!(HttpProvider::from_config(&config), Err(LisaError::Config(_))));

        let mut config = ProviderConfig::new("primary", 0);
        config.endpoint = Some("http://localhost:1/complete".into());
        let provider = HttpProvider::from_config(&config).unwrap();
        assert_eq!(provider.name(), "primary");
        assert_eq!(provider.endpoint(), "http://localhost:1/complete");
    }

    #[tokio::test]
    async fn test_complete_returns_json_body() {
        let url = serve_once("200 OK", r#"{"text":"hello"}"#).await;
        let provider = HttpProvider::new("local", url).with_api_key("secret");
        let response = provider.complete(json!({"prompt": "hi"})).await.unwrap();
        assert_eq!(response["text"], "hello");
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let url = serve_once("503 Service Unavailable", r#"{"error":"overloaded"}"#).await;
        let provider = HttpProvider::new("local", url);
        let err = provider.complete(json!({})).await.unwrap_err();
        assert!(matches!(err, LisaError::TransientBackend(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let url = serve_once("400 Bad Request", r#"{"error":"bad"}"#).await;
        let provider = HttpProvider::new("local", url);
        let err = provider.complete(json!({})).await.unwrap_err();
        assert!(matches!(err, LisaError::PermanentBackend(_)), "got {:?}", err);
    }
}
