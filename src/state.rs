//! # Application State Management
//!
//! Shared state that every HTTP handler and WebSocket actor can reach.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets many handlers and actors share ownership of the same data
//! - **Cleanup**: The data is dropped when the last reference goes away
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **parking_lot**: No lock poisoning, so reads and writes don't return `Result`
//!
//! ### Arc<RwLock<T>> Pattern
//! Thread-safe shared mutable state. Every lock here is held for a few
//! field updates and released before any `.await`.

use crate::config::AppConfig;
use crate::lens::LensHub;
use crate::session::{SessionRegistry, SessionService, VapiProvider};
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The main application state shared across all handlers and actors.
///
/// ## Thread Safety Pattern:
/// - `config` and `metrics` are behind `Arc<RwLock<_>>`
/// - `registry`, `sessions` and `lens` manage their own locking internally
/// - `start_time` never changes
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and relay counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Session id → session and active connection pair
    pub registry: SessionRegistry,

    /// Session-start operation
    pub sessions: SessionService,

    /// Snap Lens clients and training state
    pub lens: Arc<LensHub>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across requests and relayed connections.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: HTTP load and reliability
/// - **sessions_started / sessions_failed**: how often provisioning works
/// - **active_pairs**: current relay load, for capacity planning
/// - **frames_* / bytes_***: relay throughput per direction
/// - **endpoint_metrics**: per-route statistics keyed by route pattern
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub sessions_started: u64,
    pub sessions_failed: u64,
    pub active_pairs: u32,
    pub frames_to_upstream: u64,
    pub bytes_to_upstream: u64,
    pub frames_to_client: u64,
    pub bytes_to_client: u64,

    /// Key: "METHOD /route/{pattern}"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for one endpoint.
///
/// ## Derived values:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build the state from a validated configuration.
    ///
    /// ## What this does:
    /// 1. Creates the HTTP client for the upstream provisioning API
    /// 2. Creates the (empty) session registry with the configured limit
    /// 3. Wires the session service and the lens hub to the registry
    pub fn new(config: AppConfig) -> Result<Self> {
        let provider = VapiProvider::from_config(&config.upstream)?;
        let registry = SessionRegistry::new(config.relay.max_concurrent_sessions);
        let sessions = SessionService::new(
            Arc::new(provider),
            registry.clone(),
            config.upstream.default_assistant_id.clone(),
        );
        let lens = Arc::new(LensHub::new(registry.clone()));

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            sessions,
            lens,
            start_time: Instant::now(),
        })
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Limits baked into long-lived components at startup (the registry's
    /// session cap, the provider's credentials) keep their startup values.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write() = new_config;
        Ok(())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    /// Increment the total error counter (4xx and 5xx responses).
    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record metrics for a specific endpoint.
    ///
    /// The first request to an endpoint creates its entry with `or_default()`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_session_started(&self) {
        self.metrics.write().sessions_started += 1;
    }

    pub fn record_session_failed(&self) {
        self.metrics.write().sessions_failed += 1;
    }

    /// A connection pair attached to its session.
    pub fn pair_opened(&self) {
        self.metrics.write().active_pairs += 1;
    }

    /// A connection pair was released. Never goes below zero.
    pub fn pair_closed(&self) {
        let mut metrics = self.metrics.write();
        metrics.active_pairs = metrics.active_pairs.saturating_sub(1);
    }

    pub fn record_frame_to_upstream(&self, bytes: usize) {
        let mut metrics = self.metrics.write();
        metrics.frames_to_upstream += 1;
        metrics.bytes_to_upstream += bytes as u64;
    }

    pub fn record_frame_to_client(&self, bytes: usize) {
        let mut metrics = self.metrics.write();
        metrics.frames_to_client += 1;
        metrics.bytes_to_client += bytes as u64;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Cloning keeps the lock out of response serialisation.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
