//! # Application State Management
//!
//! State shared by every HTTP handler and WebSocket actor through `web::Data`.
//!
//! ## What lives here:
//! - **config**: the running configuration, replaceable at runtime
//! - **metrics**: HTTP request counters, updated by middleware on every request
//! - **pipeline**: the session pipeline (model, recurrent state, registry)
//! - **start_time**: for uptime reporting
//!
//! ## Locking:
//! Config and HTTP metrics use `std::sync::RwLock` because the middleware
//! touches them from synchronous code. The locks are held only for a copy or a
//! counter bump, never across an `.await`. A poisoned lock still holds valid
//! counters, so it is recovered instead of propagated.
//!
//! The pipeline manages its own async locks; it is shared through an `Arc`.

use crate::config::AppConfig;
use crate::pipeline::SessionPipeline;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP request metrics (constantly being updated by middleware)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// The streaming classification pipeline
    pub pipeline: Arc<SessionPipeline>,

    /// When the server started
    pub start_time: Instant,
}

/// Request counters collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of error responses since server start
    pub error_count: u64,

    /// WebSocket connections currently open
    pub active_connections: u32,

    /// WebSocket connections accepted since server start
    pub total_connections: u64,

    /// Per-route statistics keyed by `"METHOD /route/{pattern}"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
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

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Arc<SessionPipeline>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            pipeline,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Validate and install a new configuration, then push the live-tunable
    /// parts (fallback distribution, session TTL and limit, model load retry
    /// window) into the pipeline.
    ///
    /// Model settings other than `load_retry_secs` take effect on restart.
    pub async fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *write(&self.config) = new_config.clone();
        self.pipeline.apply_config(&new_config).await;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        write(&self.metrics).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        write(&self.metrics).error_count += 1;
    }

    /// Record one finished request for a route.
    ///
    /// The first time a route is seen, a zeroed `EndpointMetric` is created for it.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Called when a WebSocket connection is accepted.
    pub fn connection_opened(&self) {
        let mut metrics = write(&self.metrics);
        metrics.active_connections += 1;
        metrics.total_connections += 1;
    }

    /// Called when a WebSocket connection stops. Never drops below zero.
    pub fn connection_closed(&self) {
        let mut metrics = write(&self.metrics);
        metrics.active_connections = metrics.active_connections.saturating_sub(1);
    }

    /// Get a consistent copy of the current metrics.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        read(&self.metrics).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
