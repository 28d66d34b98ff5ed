use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /status`: server info and connected clients.
pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "running",
        "clients": state.lens.client_count(),
        "uptime": state.get_uptime_seconds(),
        "sessions": state.registry.session_count(),
        "active_pairs": state.registry.active_pair_count(),
        "training_step": state.lens.current_step()
    }))
}

/// `POST /clear-connections`: close every Snap Lens client.
pub async fn clear_connections(state: web::Data<AppState>) -> HttpResponse {
    let cleared = state.lens.clear();
    HttpResponse::Ok().json(json!({
        "message": format!("Cleared {} connections", cleared),
        "remaining_clients": state.lens.client_count()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_status_and_clear() {
        let state = web::Data::new(AppState::new(AppConfig::default()).unwrap());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/status", web::get().to(status))
                .route("/clear-connections", web::post().to(clear_connections)),
        )
        .await;

        let req = test::TestRequest::get().uri("/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["clients"], 0);
        assert_eq!(body["training_step"], 1);

        let req = test::TestRequest::post().uri("/clear-connections").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["message"], "Cleared 0 connections");
        assert_eq!(body["remaining_clients"], 0);
    }
}
