//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Federation Metrics
    pub static ref ACTIVITIES_BUILT: IntCounterVec = IntCounterVec::new(
        Opts::new("tidecast_activities_built_total", "Total number of activities built locally"),
        &["kind"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("tidecast_activities_received_total", "Total number of activities received from remote actors"),
        &["kind"]
    ).expect("metric can be created");
    pub static ref INBOX_RESULTS: IntCounterVec = IntCounterVec::new(
        Opts::new("tidecast_inbox_results_total", "Inbox routing outcomes"),
        &["result"]
    ).expect("metric can be created");

    // Delivery Metrics
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidecast_delivery_attempts_total", "Delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPT_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "tidecast_delivery_attempt_duration_seconds",
            "Delivery attempt duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["outcome"]
    ).expect("metric can be created");
    // Key Cache Metrics
    pub static ref KEY_CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidecast_key_cache_hits_total", "Public key cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref KEY_CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidecast_key_cache_misses_total", "Public key cache misses"),
        &["cache_name"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidecast_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(ACTIVITIES_BUILT.clone()))
        .expect("ACTIVITIES_BUILT can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_RECEIVED.clone()))
        .expect("ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(INBOX_RESULTS.clone()))
        .expect("INBOX_RESULTS can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))
        .expect("DELIVERY_ATTEMPTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_ATTEMPT_DURATION_SECONDS.clone()))
        .expect("DELIVERY_ATTEMPT_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(KEY_CACHE_HITS_TOTAL.clone()))
        .expect("KEY_CACHE_HITS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(KEY_CACHE_MISSES_TOTAL.clone()))
        .expect("KEY_CACHE_MISSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
