//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>>
//! - **Arc**: many handlers and actors hold the same state at once
//! - **RwLock**: many readers or one writer; `parking_lot`'s lock never poisons,
//!   so reads and writes need no `unwrap()`
//!
//! ### What lives here
//! - **config**: runtime-updatable settings; a call snapshots them when it starts
//! - **metrics**: HTTP counters plus per-call outcomes fed from finalize events
//! - **bridge**: the session registry and the realtime connector shared by all calls

use crate::call::{BridgeContext, BridgeSettings, FinalizeEvent, SessionRegistry};
use crate::config::AppConfig;
use crate::error::BridgeResult;
use crate::realtime::RealtimeConnector;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// The state shared across all request handlers.
///
/// ## Thread Safety Pattern:
/// Mutable data sits behind `Arc<RwLock<T>>`; the bridge context is
/// immutable and internally synchronized, so a plain `Arc` is enough.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and call metrics
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Registry, connector and finalize channel used by every call
    pub bridge: Arc<BridgeContext>,

    /// When the server started
    pub start_time: Instant,
}

/// Process-wide counters.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: HTTP load and reliability
/// - **calls_completed**: calls that reached `STREAMING` and then ended
/// - **calls_failed**: calls that ended before any audio was relayed
/// - **takeovers**: how often a human had to step in
/// - **frames_dropped**: overflow drops summed across both relay queues
/// - **endpoint_metrics**: keyed by route pattern so call ids do not each get an entry
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub takeovers: u64,
    pub frames_dropped: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint timing and error counts.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build the state and the receiving end of the finalize channel.
    ///
    /// The caller owns the receiver and decides what to do with finalized
    /// calls; in `main` a listener task logs them and calls `record_finalize`.
    pub fn new(
        config: AppConfig,
        connector: Arc<dyn RealtimeConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<FinalizeEvent>) {
        let (finalize_tx, finalize_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SessionRegistry::new(config.session.max_concurrent_calls));

        let state = Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            bridge: Arc::new(BridgeContext {
                registry,
                connector,
                finalize_tx,
            }),
            start_time: Instant::now(),
        };
        (state, finalize_rx)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.bridge.registry
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so readers never block writers
    /// for longer than a copy.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Settings for a call starting now.
    pub fn bridge_settings(&self) -> BridgeResult<BridgeSettings> {
        self.config.read().bridge_settings()
    }

    /// Apply a partial JSON update; the stored config is untouched on error.
    pub fn update_config(&self, json: &str) -> BridgeResult<AppConfig> {
        let mut config = self.config.write();
        config.update_from_json(json)?;
        Ok(config.clone())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record one request against its route pattern (e.g. `GET /api/v1/calls/{call_id}`).
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Fold a finished call into the counters.
    ///
    /// A call without frame statistics never reached `STREAMING`, so it
    /// counts as failed rather than completed.
    pub fn record_finalize(&self, event: &FinalizeEvent) {
        let mut metrics = self.metrics.write();
        match &event.frames {
            Some(frames) => {
                metrics.calls_completed += 1;
                metrics.frames_dropped += frames.to_ai.dropped + frames.to_telephony.dropped;
            }
            None => metrics.calls_failed += 1,
        }
        if event.takeover_occurred {
            metrics.takeovers += 1;
        }
    }

    /// Snapshot of current metrics; the lock is released before serialization.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
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

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::realtime::connector::testing::ScriptedConnector;
    use crate::transport::Link;

    /// State backed by a scripted connector; the returned receiver yields the
    /// service end of every AI link a call opens.
    pub fn test_state(config: AppConfig) -> (AppState, mpsc::UnboundedReceiver<Link>) {
        let (connector, peers) = ScriptedConnector::new(0);
        let (state, _finalize_rx) = AppState::new(config, Arc::new(connector));
        (state, peers)
    }
}
