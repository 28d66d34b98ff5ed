//! # Session Service
//!
//! Turns a session-start request into a registered session: resolves the
//! assistant, provisions the call upstream and records the result.

use crate::error::{AppError, AppResult};
use crate::session::registry::{Session, SessionRegistry};
use crate::session::upstream::VoiceProvider;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of a successful session start.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedSession {
    pub session_id: String,
    pub upstream_endpoint: String,
}

#[derive(Clone)]
pub struct SessionService {
    provider: Arc<dyn VoiceProvider>,
    registry: SessionRegistry,
    default_assistant_id: Option<String>,
}

impl std::fmt::Debug for SessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService")
            .field("provider_configured", &self.provider.is_configured())
            .field("default_assistant_id", &self.default_assistant_id)
            .finish()
    }
}

impl SessionService {
    pub fn new(
        provider: Arc<dyn VoiceProvider>,
        registry: SessionRegistry,
        default_assistant_id: Option<String>,
    ) -> Self {
        Self {
            provider,
            registry,
            default_assistant_id,
        }
    }

    pub fn provider_configured(&self) -> bool {
        self.provider.is_configured()
    }

    /// Provision a new voice session.
    ///
    /// ## Steps:
    /// 1. Refuse early when no credentials are configured
    /// 2. Pick the requested assistant, falling back to the configured default
    /// 3. Reserve a registry slot, failing fast when the relay is full
    /// 4. Ask the upstream for a streaming call
    /// 5. Register the session under the upstream call id (or a fresh UUID)
    pub async fn start_session(&self, assistant_id: Option<String>) -> AppResult<StartedSession> {
        if !self.provider.is_configured() {
            return Err(AppError::ConfigurationError(
                "Upstream API key is not configured".to_string(),
            ));
        }

        let assistant_id = assistant_id
            .or_else(|| self.default_assistant_id.clone())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::InvalidRequest("assistant_id is required".to_string()))?;

        // Held across the provisioning call, released if it fails
        let slot = self.registry.reserve()?;

        let call = self.provider.create_call(&assistant_id).await.map_err(|e| {
            warn!(assistant_id = %assistant_id, error = %e, "Session provisioning failed");
            e
        })?;

        let session_id = call.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = Session::new(session_id.clone(), call.websocket_url.clone(), Some(assistant_id));
        if let Err(err) = slot.register(session) {
            warn!(session_id = %session_id, error = %err, "Provisioned call could not be registered and is orphaned upstream");
            return Err(err);
        }

        info!(session_id = %session_id, "Voice session started");
        Ok(StartedSession {
            session_id,
            upstream_endpoint: call.websocket_url,
        })
    }
}

/// Client-facing WebSocket URL for a session.
///
/// `public_base` wins when configured; otherwise the origin is rebuilt from the
/// request's scheme and host (`https` becomes `wss`).
pub fn streaming_endpoint(public_base: Option<&str>, scheme: &str, host: &str, session_id: &str) -> String {
    let base = match public_base {
        Some(base) => base.trim_end_matches('/').to_string(),
        None => {
            let ws_scheme = if scheme.eq_ignore_ascii_case("https") { "wss" } else { "ws" };
            format!("{}://{}", ws_scheme, host)
        }
    };
    format!("{}/chat/ws/{}", base, session_id)
}
