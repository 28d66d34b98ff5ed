//! # Configuration Management
//!
//! This module loads the relay's configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Well-known deployment variables (HOST, PORT, VAPI_API_KEY, VAPI_ASSISTANT_ID)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between Rust structs and TOML / environment data
//! - **derive macros**: Generate Debug, Clone, Serialize, Deserialize implementations
//! - **Option<T>**: Secrets and optional endpoints are simply absent when unset
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (PORT, VAPI_API_KEY, ...)
//! 2. Environment variables (APP_SERVER__PORT, APP_RELAY__MAX_CONCURRENT_SESSIONS, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: where the HTTP/WebSocket server listens
/// - `upstream`: how to reach the voice-AI service
/// - `relay`: limits and keep-alive for client connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream voice service settings.
///
/// ## Fields:
/// - `api_base_url`: REST base used to provision calls (`{base}/call`)
/// - `api_key`: Bearer token; never echoed back by the config endpoint
/// - `default_assistant_id`: Used when a session-start request names no assistant
/// - `transport_provider`: Transport requested from the service for the call
/// - `request_timeout_secs`: Budget for the provisioning request
/// - `connect_timeout_secs`: Budget for the upstream WebSocket handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub default_assistant_id: Option<String>,
    pub transport_provider: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

/// Relay behaviour for client connections.
///
/// ## Fields:
/// - `max_concurrent_sessions`: Upper bound on registered sessions (attached or not)
/// - `keepalive_interval_secs`: How often the relay pings each client socket
/// - `client_timeout_secs`: A client silent for longer than this is disconnected
/// - `session_ttl_secs`: Sessions never attached to a connection are swept after this
/// - `sweep_interval_secs`: How often the sweeper runs
/// - `public_ws_base`: Public `ws://` / `wss://` origin handed to clients; derived
///   from the incoming request when absent (useful behind a reverse proxy)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_concurrent_sessions: usize,
    pub keepalive_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub public_ws_base: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            upstream: UpstreamConfig {
                api_base_url: "https://api.vapi.ai".to_string(),
                api_key: None,
                default_assistant_id: None,
                transport_provider: "vapi.websocket".to_string(),
                request_timeout_secs: 30,
                connect_timeout_secs: 10,
            },
            relay: RelayConfig {
                max_concurrent_sessions: 100,
                keepalive_interval_secs: 20,
                client_timeout_secs: 60,
                session_ttl_secs: 300,
                sweep_interval_secs: 60,
                public_ws_base: None,
            },
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl RelayConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Apply the deployment variables the hosting platform and the voice
    ///    service dashboard hand out (HOST, PORT, VAPI_*)
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port (`__` separates sections,
    ///   single `_` stays part of the key)
    /// - `APP_RELAY__MAX_CONCURRENT_SESSIONS=20`: Override the session limit
    /// - `VAPI_API_KEY=...`: Upstream credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("VAPI_API_KEY", "upstream.api_key"),
            ("VAPI_ASSISTANT_ID", "upstream.default_assistant_id"),
            ("VAPI_API_BASE_URL", "upstream.api_base_url"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Session limit, keep-alive and timeouts are non-zero
    /// - The client timeout outlives at least one keep-alive round
    /// - The upstream API base is an http(s) URL
    /// - The public WebSocket base, when set, is a ws(s) URL
    ///
    /// A missing API key is *not* a validation failure: the server still starts
    /// (health reports it) and session start answers with a configuration error.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.relay.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.relay.keepalive_interval_secs == 0 || self.relay.client_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Keep-alive interval and client timeout must be greater than 0"));
        }

        if self.relay.client_timeout_secs <= self.relay.keepalive_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the keep-alive interval ({}s)",
                self.relay.client_timeout_secs,
                self.relay.keepalive_interval_secs
            ));
        }

        if self.relay.session_ttl_secs == 0 || self.relay.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("Session TTL and sweep interval must be greater than 0"));
        }

        if self.upstream.request_timeout_secs == 0 || self.upstream.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Upstream timeouts must be greater than 0"));
        }

        if !(self.upstream.api_base_url.starts_with("http://")
            || self.upstream.api_base_url.starts_with("https://"))
        {
            return Err(anyhow::anyhow!(
                "Upstream API base must be an http(s) URL, got '{}'",
                self.upstream.api_base_url
            ));
        }

        if let Some(base) = &self.relay.public_ws_base {
            if !(base.starts_with("ws://") || base.starts_with("wss://")) {
                return Err(anyhow::anyhow!("Public WebSocket base must be a ws(s) URL, got '{}'", base));
            }
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed, e.g.
    /// `{"relay": {"max_concurrent_sessions": 20}}`. The API key is deliberately
    /// not updatable at runtime; it comes from the environment only.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(upstream) = partial_config.get("upstream") {
            if let Some(base) = upstream.get("api_base_url").and_then(|v| v.as_str()) {
                self.upstream.api_base_url = base.to_string();
            }
            if let Some(assistant) = upstream.get("default_assistant_id").and_then(|v| v.as_str()) {
                self.upstream.default_assistant_id = Some(assistant.to_string());
            }
            if let Some(secs) = upstream.get("request_timeout_secs").and_then(|v| v.as_u64()) {
                self.upstream.request_timeout_secs = secs;
            }
            if let Some(secs) = upstream.get("connect_timeout_secs").and_then(|v| v.as_u64()) {
                self.upstream.connect_timeout_secs = secs;
            }
        }

        if let Some(relay) = partial_config.get("relay") {
            if let Some(sessions) = relay.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.relay.max_concurrent_sessions = sessions as usize;
            }
            if let Some(secs) = relay.get("keepalive_interval_secs").and_then(|v| v.as_u64()) {
                self.relay.keepalive_interval_secs = secs;
            }
            if let Some(secs) = relay.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                self.relay.client_timeout_secs = secs;
            }
            if let Some(secs) = relay.get("session_ttl_secs").and_then(|v| v.as_u64()) {
                self.relay.session_ttl_secs = secs;
            }
            if let Some(base) = relay.get("public_ws_base").and_then(|v| v.as_str()) {
                self.relay.public_ws_base = Some(base.to_string());
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert!(config.upstream.api_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.client_timeout_secs = config.relay.keepalive_interval_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstream.api_base_url = "ftp://api.example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.public_ws_base = Some("http://relay.example.com".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "relay": {"max_concurrent_sessions": 5}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.relay.max_concurrent_sessions, 5);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"relay": {"max_concurrent_sessions": 0}}"#).is_err());
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
    }

    #[test]
    fn test_config_update_ignores_api_key() {
        let mut config = AppConfig::default();
        config
            .update_from_json(r#"{"upstream": {"api_key": "leaked", "default_assistant_id": "asst"}}"#)
            .unwrap();
        assert!(config.upstream.api_key.is_none());
        assert_eq!(config.upstream.default_assistant_id.as_deref(), Some("asst"));
    }
}
