//! # Upstream Voice Service Client
//!
//! Provisions calls with the voice-AI service over REST, and opens the
//! per-call WebSocket the relay streams audio over.
//!
//! ## Provisioning request:
//! ```text
//! POST {api_base_url}/call
//! Authorization: Bearer {api_key}
//! {"assistantId": "...", "transport": {"provider": "vapi.websocket"}}
//! ```
//! A 2xx answer carries `id` and `transport.websocketCallUrl`.

use crate::config::UpstreamConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type UpstreamSink = SplitSink<UpstreamSocket, Message>;
pub type UpstreamStream = SplitStream<UpstreamSocket>;

/// A call the upstream has agreed to host.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedCall {
    /// Provider call id, when the provider returned one
    pub id: Option<String>,
    /// Per-call WebSocket endpoint (ws:// or wss://)
    pub websocket_url: String,
}

/// Something that can provision a streaming voice call.
#[async_trait]
pub trait VoiceProvider: Send + Sync {
    async fn create_call(&self, assistant_id: &str) -> AppResult<ProvisionedCall>;

    /// Whether credentials are present; used by health reporting.
    fn is_configured(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct CallResponse {
    id: Option<String>,
    transport: Option<CallTransport>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallTransport {
    websocket_call_url: Option<String>,
}

/// Longest upstream error body we copy into our own error messages.
const MAX_ERROR_BODY: usize = 500;

/// REST client for a Vapi-compatible service.
#[derive(Clone)]
pub struct VapiProvider {
    client: Client,
    api_base_url: String,
    api_key: Option<String>,
    transport_provider: String,
}

impl std::fmt::Debug for VapiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VapiProvider")
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("transport_provider", &self.transport_provider)
            .finish()
    }
}

impl VapiProvider {
    pub fn from_config(config: &UpstreamConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| AppError::ConfigurationError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            transport_provider: config.transport_provider.clone(),
        })
    }
}

#[async_trait]
impl VoiceProvider for VapiProvider {
    async fn create_call(&self, assistant_id: &str) -> AppResult<ProvisionedCall> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AppError::ConfigurationError("VAPI_API_KEY is not configured".to_string()))?;

        let url = format!("{}/call", self.api_base_url);
        debug!(url = %url, assistant_id = %assistant_id, "Provisioning upstream call");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&json!({
                "assistantId": assistant_id,
                "transport": { "provider": self.transport_provider },
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            warn!(status = %status, "Upstream refused call provisioning");
            return Err(map_status_error(status, &body));
        }

        let call: CallResponse = response.json().await?;
        let websocket_url = call
            .transport
            .and_then(|t| t.websocket_call_url)
            .ok_or_else(|| {
                AppError::ServiceUnavailable("upstream response did not include a websocket URL".to_string())
            })?;

        if !(websocket_url.starts_with("ws://") || websocket_url.starts_with("wss://")) {
            return Err(AppError::ServiceUnavailable(format!(
                "upstream returned a non-WebSocket websocket URL: {}",
                websocket_url
            )));
        }

        Ok(ProvisionedCall {
            id: call.id.filter(|id| !id.is_empty()),
            websocket_url,
        })
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

fn map_status_error(status: StatusCode, body: &str) -> AppError {
    if status.is_server_error() {
        AppError::ServiceUnavailable(format!("upstream returned {}: {}", status, body))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        AppError::ConfigurationError(format!("upstream rejected credentials ({}): {}", status, body))
    } else {
        AppError::ConfigurationError(format!("upstream rejected the call request ({}): {}", status, body))
    }
}

/// Open the per-call upstream WebSocket and split it into writer and reader halves.
pub async fn connect_upstream(url: &str, timeout: Duration) -> AppResult<(UpstreamSink, UpstreamStream)> {
    let (socket, response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| AppError::ServiceUnavailable(format!("upstream WebSocket handshake timed out after {:?}", timeout)))??;

    debug!(status = %response.status(), "Upstream WebSocket connected");
    Ok(socket.split())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(base: &str, key: Option<&str>) -> VapiProvider {
        let config = UpstreamConfig {
            api_base_url: base.to_string(),
            api_key: key.map(str::to_string),
            default_assistant_id: None,
            transport_provider: "vapi.websocket".to_string(),
            request_timeout_secs: 2,
            connect_timeout_secs: 1,
        };
        VapiProvider::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn test_create_call_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/call"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({
                "assistantId": "asst-1",
                "transport": {"provider": "vapi.websocket"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "call-123",
                "transport": {"websocketCallUrl": "wss://voice.test/call-123"}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let call = provider_for(&mock_server.uri(), Some("secret"))
            .create_call("asst-1")
            .await
            .unwrap();

        assert_eq!(call.id.as_deref(), Some("call-123"));
        assert_eq!(call.websocket_url, "wss://voice.test/call-123");
    }

    #[tokio::test]
    async fn test_create_call_server_error_is_unavailable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/call"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&mock_server)
            .await;

        let err = provider_for(&mock_server.uri(), Some("secret"))
            .create_call("asst-1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable(_)));
        assert!(err.message().contains("overloaded"));
    }

    #[tokio::test]
    async fn test_create_call_unauthorized_is_config_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/call"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Invalid key"))
            .mount(&mock_server)
            .await;

        let err = provider_for(&mock_server.uri(), Some("wrong"))
            .create_call("asst-1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_create_call_without_websocket_url() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/call"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "call-1", "transport": {}})))
            .mount(&mock_server)
            .await;

        let err = provider_for(&mock_server.uri(), Some("secret"))
            .create_call("asst-1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable(_)));
        assert!(err.message().contains("websocket URL"));
    }

    #[tokio::test]
    async fn test_create_call_rejects_http_scheme_url() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/call"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "call-1",
                "transport": {"websocketCallUrl": "https://voice.test/call-1"}
            })))
            .mount(&mock_server)
            .await;

        let err = provider_for(&mock_server.uri(), Some("secret"))
            .create_call("asst-1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_create_call_unreachable_host() {
        // Nothing listens on port 9 of localhost
        let err = provider_for("http://127.0.0.1:9", Some("secret"))
            .create_call("asst-1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_api_key_makes_no_request() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&mock_server)
            .await;

        let provider = provider_for(&mock_server.uri(), None);
        assert!(!provider.is_configured());
        let err = provider.create_call("asst-1").await.unwrap_err();
        assert!(matches!(err, AppError::ConfigurationError(_)));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status_error(StatusCode::BAD_GATEWAY, ""),
            AppError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            map_status_error(StatusCode::FORBIDDEN, ""),
            AppError::ConfigurationError(_)
        ));
        assert!(matches!(
            map_status_error(StatusCode::BAD_REQUEST, ""),
            AppError::ConfigurationError(_)
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let provider = provider_for("https://api.vapi.ai", Some("super-secret"));
        assert!(!format!("{:?}", provider).contains("super-secret"));
    }
}
