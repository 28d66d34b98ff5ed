use crate::error::AppError;
use crate::middleware::RequestId;
use crate::session::streaming_endpoint;
use crate::state::AppState;
use actix_web::http::StatusCode;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    pub message: Option<String>,
    pub assistant_id: Option<String>,
}

/// Response body of every `/chat/*` endpoint, on success and on failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub success: bool,
    pub message: String,
    pub session_id: Option<String>,
    pub streaming_endpoint: Option<String>,
    pub error: Option<String>,
}

/// `AppError` rendered as a `ChatResponse` failure, keeping the error's status code.
#[derive(Debug)]
pub struct ChatError(pub AppError);

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<AppError> for ChatError {
    fn from(err: AppError) -> Self {
        ChatError(err)
    }
}

impl ResponseError for ChatError {
    fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.0.status_code()).json(ChatResponse {
            success: false,
            message: "Request failed".to_string(),
            session_id: None,
            streaming_endpoint: None,
            error: Some(self.0.to_string()),
        })
    }
}

/// JSON extractor config for the chat scope: malformed bodies become
/// `ChatResponse` failures with 400 instead of actix's plain-text error.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        ChatError(AppError::InvalidRequest(format!("Invalid request body: {}", err))).into()
    })
}

/// `POST /chat/start`: provision a voice session and tell the client where to stream.
pub async fn start_chat(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ChatRequest>,
) -> Result<HttpResponse, ChatError> {
    let request = body.into_inner();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let started = match state.sessions.start_session(request.assistant_id).await {
        Ok(started) => started,
        Err(err) => {
            state.record_session_failed();
            warn!(request_id = %request_id, error = %err, "Failed to start chat session");
            return Err(err.into());
        }
    };
    state.record_session_started();

    let public_base = state.get_config().relay.public_ws_base;
    let endpoint = {
        let conn = req.connection_info();
        streaming_endpoint(public_base.as_deref(), conn.scheme(), conn.host(), &started.session_id)
    };

    info!(
        request_id = %request_id,
        session_id = %started.session_id,
        streaming_endpoint = %endpoint,
        "Chat session started"
    );

    Ok(HttpResponse::Ok().json(ChatResponse {
        success: true,
        message: "Chat session started successfully".to_string(),
        session_id: Some(started.session_id),
        streaming_endpoint: Some(endpoint),
        error: None,
    }))
}

/// `POST /chat/text`: text-only echo, usable without the voice service.
pub async fn text_chat(body: web::Json<ChatRequest>) -> Result<HttpResponse, ChatError> {
    let message = body
        .into_inner()
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| AppError::InvalidRequest("Message is required".to_string()))?;

    Ok(HttpResponse::Ok().json(ChatResponse {
        success: true,
        message: format!("Echo: {}", message),
        session_id: None,
        streaming_endpoint: None,
        error: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};
    use serde_json::json;

    fn app_state(config: AppConfig) -> web::Data<AppState> {
        web::Data::new(AppState::new(config).unwrap())
    }

    macro_rules! chat_app {
        ($state:expr) => {
            test::init_service(
                App::new().app_data($state.clone()).service(
                    web::scope("/chat")
                        .app_data(json_config())
                        .route("/start", web::post().to(start_chat))
                        .route("/text", web::post().to(text_chat)),
                ),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_text_chat_echoes() {
        let state = app_state(AppConfig::default());
        let app = chat_app!(state);

        let req = test::TestRequest::post()
            .uri("/chat/text")
            .set_json(json!({"message": "hello"}))
            .to_request();
        let body: ChatResponse = test::call_and_read_body_json(&app, req).await;
        assert!(body.success);
        assert_eq!(body.message, "Echo: hello");
    }

    #[actix_web::test]
    async fn test_text_chat_requires_message() {
        let state = app_state(AppConfig::default());
        let app = chat_app!(state);

        let req = test::TestRequest::post()
            .uri("/chat/text")
            .set_json(json!({"message": "  "}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ChatResponse = test::read_body_json(resp).await;
        assert!(!body.success);
        assert!(body.error.unwrap().contains("Message is required"));
    }

    #[actix_web::test]
    async fn test_malformed_body_uses_chat_shape() {
        let state = app_state(AppConfig::default());
        let app = chat_app!(state);

        let req = test::TestRequest::post()
            .uri("/chat/start")
            .insert_header(("content-type", "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ChatResponse = test::read_body_json(resp).await;
        assert!(!body.success);
        assert!(body.session_id.is_none());
    }

    #[actix_web::test]
    async fn test_start_without_api_key_is_config_error() {
        let mut config = AppConfig::default();
        config.upstream.api_key = None;
        config.upstream.default_assistant_id = Some("asst".to_string());
        let state = app_state(config);
        let app = chat_app!(state);

        let req = test::TestRequest::post()
            .uri("/chat/start")
            .set_json(json!({}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ChatResponse = test::read_body_json(resp).await;
        assert!(!body.success);
        assert!(body.error.unwrap().starts_with("Configuration error"));
        assert_eq!(state.get_metrics_snapshot().sessions_failed, 1);
    }

    #[actix_web::test]
    async fn test_start_returns_streaming_endpoint() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/call"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "call-42",
                "transport": {"websocketCallUrl": "wss://voice.test/call-42"}
            })))
            .mount(&mock_server)
            .await;

        let mut config = AppConfig::default();
        config.upstream.api_base_url = mock_server.uri();
        config.upstream.api_key = Some("secret".to_string());
        let state = app_state(config);
        let app = chat_app!(state);

        let req = test::TestRequest::post()
            .uri("/chat/start")
            .insert_header(("host", "relay.test:8000"))
            .set_json(json!({"assistant_id": "asst-1"}))
            .to_request();
        let body: ChatResponse = test::call_and_read_body_json(&app, req).await;

        assert!(body.success);
        assert_eq!(body.session_id.as_deref(), Some("call-42"));
        assert_eq!(
            body.streaming_endpoint.as_deref(),
            Some("ws://relay.test:8000/chat/ws/call-42")
        );
        assert!(state.registry.get("call-42").is_some());
    }
}
