//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Inbound
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("topicfed_activities_received_total", "Total number of activities accepted into the inbox"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref PIPELINE_RUNS: IntCounterVec = IntCounterVec::new(
        Opts::new("topicfed_pipeline_runs_total", "Pipeline runs by outcome"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref PIPELINE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "topicfed_pipeline_duration_seconds",
            "Time spent running the activity pipeline"
        ).buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["activity_type"]
    ).expect("metric can be created");

    // Outbound
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("topicfed_deliveries_total", "Total number of delivery attempts"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref QUARANTINED_DOMAINS: IntGauge = IntGauge::new(
        "topicfed_quarantined_domains",
        "Domains whose actors are currently marked unavailable"
    ).expect("metric can be created");

    // Graph resolution
    pub static ref IMPORTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("topicfed_imports_total", "Graph import units by kind and outcome"),
        &["kind", "outcome"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("topicfed_errors_total", "Total number of errors returned to clients"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(ACTIVITIES_RECEIVED.clone()))
        .expect("ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(PIPELINE_RUNS.clone()))
        .expect("PIPELINE_RUNS can be registered");
    REGISTRY
        .register(Box::new(PIPELINE_DURATION_SECONDS.clone()))
        .expect("PIPELINE_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(QUARANTINED_DOMAINS.clone()))
        .expect("QUARANTINED_DOMAINS can be registered");
    REGISTRY
        .register(Box::new(IMPORTS_TOTAL.clone()))
        .expect("IMPORTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
