//! # Application State Management
//!
//! State shared by every admin HTTP handler and by the media bridge.
//!
//! ## What lives here:
//! - the runtime configuration (readable and partially updatable)
//! - HTTP request metrics collected by the metrics middleware
//! - the media [`Provider`], so handlers can find live streams
//! - the [`SessionManager`], so handlers can report on past and present calls
//!
//! ## Rust Concepts Used:
//! - **Arc<RwLock<T>>**: many handlers read the config and metrics, the
//!   middleware and the config endpoint write them
//! - **parking_lot::RwLock**: no lock poisoning, so reads and writes never
//!   return a `Result`

use crate::config::AppConfig;
use crate::media::Provider;
use crate::session::SessionManager;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state, cloned into every actix worker.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub provider: Arc<Provider>,
    pub sessions: Arc<SessionManager>,
    pub start_time: Instant,
}

/// Admin API request metrics.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Keyed by `"{METHOD} {route pattern}"`, e.g. `"GET /api/v1/streams/{stream_sid}"`.
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, provider: Arc<Provider>, sessions: Arc<SessionManager>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            provider,
            sessions,
            start_time: Instant::now(),
        }
    }

    /// Build state with a provider and session manager derived from `config`.
    pub fn from_config(config: AppConfig) -> Self {
        let provider = Provider::new(config.media.to_provider_config());
        let sessions = Arc::new(SessionManager::new(config.performance.max_concurrent_streams));
        Self::new(config, provider, sessions)
    }

    /// Copy of the current configuration; the lock is released on return.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration if it validates.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    /// Media streams currently held by the provider.
    pub fn live_streams(&self) -> usize {
        self.provider.live_count()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
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

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
