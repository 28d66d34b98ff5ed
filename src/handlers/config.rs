use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Public view of the configuration. The API key is reported as present or
/// absent, never echoed.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "upstream": {
            "api_base_url": config.upstream.api_base_url,
            "api_key": if config.upstream.api_key.is_some() { "<redacted>" } else { "<unset>" },
            "default_assistant_id": config.upstream.default_assistant_id,
            "transport_provider": config.upstream.transport_provider,
            "request_timeout_secs": config.upstream.request_timeout_secs,
            "connect_timeout_secs": config.upstream.connect_timeout_secs
        },
        "relay": {
            "max_concurrent_sessions": config.relay.max_concurrent_sessions,
            "keepalive_interval_secs": config.relay.keepalive_interval_secs,
            "client_timeout_secs": config.relay.client_timeout_secs,
            "session_ttl_secs": config.relay.session_ttl_secs,
            "sweep_interval_secs": config.relay.sweep_interval_secs,
            "public_ws_base": config.relay.public_ws_base
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::InvalidRequest(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::InvalidRequest)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
