use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Voicebot relay is running",
        "status": "healthy"
    }))
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let memory_info = get_memory_info();
    let relay_status = get_relay_status(&state, &metrics);

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "sessions_started": metrics.sessions_started,
            "sessions_failed": metrics.sessions_failed,
            "active_pairs": metrics.active_pairs
        },
        "memory": memory_info,
        "upstream": get_upstream_status(&state, &config),
        "relay": relay_status
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "sessions": {
            "started": metrics.sessions_started,
            "failed": metrics.sessions_failed,
            "registered": state.registry.session_count(),
            "active_pairs": metrics.active_pairs
        },
        "relay": {
            "frames_to_upstream": metrics.frames_to_upstream,
            "bytes_to_upstream": metrics.bytes_to_upstream,
            "frames_to_client": metrics.frames_to_client,
            "bytes_to_client": metrics.bytes_to_client
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                let kb = || {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0)
                        * 1024
                };
                if line.starts_with("VmRSS:") {
                    vm_rss = kb();
                } else if line.starts_with("VmSize:") {
                    vm_size = kb();
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    let _ = pid;
    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

/// Whether the voice service can be used, without revealing credentials.
fn get_upstream_status(state: &AppState, config: &AppConfig) -> serde_json::Value {
    let api_key_configured = state.sessions.provider_configured();
    let assistant_configured = config
        .upstream
        .default_assistant_id
        .as_deref()
        .map(|id| !id.trim().is_empty())
        .unwrap_or(false);

    json!({
        "api_base_url": config.upstream.api_base_url,
        "api_key_configured": api_key_configured,
        "default_assistant_configured": assistant_configured,
        "status": if api_key_configured { "configured" } else { "missing_credentials" }
    })
}

fn get_relay_status(state: &AppState, metrics: &AppMetrics) -> serde_json::Value {
    let max_sessions = state.registry.max_sessions();
    let registered = state.registry.session_count();
    let session_usage = if max_sessions > 0 {
        registered as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "registered_sessions": registered,
        "active_pairs": metrics.active_pairs,
        "lens_clients": state.lens.client_count(),
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing relay.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
