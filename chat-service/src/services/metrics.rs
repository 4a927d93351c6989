//! Prometheus metrics for chat-service.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

static INIT_LOCK: Mutex<()> = Mutex::new(());

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Generation metrics
pub static GENERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static GENERATION_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static TOKENS_STREAMED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Model lifecycle metrics
pub static MODEL_LOADS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static MODEL_LOADED: OnceLock<IntGauge> = OnceLock::new();

// Deduplication metrics
pub static DEDUP_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Database metrics
pub static DB_OPERATION_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static DB_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Later calls are no-ops.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let generations = IntCounterVec::new(
        Opts::new("chat_generations_total", "Total generation calls"),
        &["model", "mode", "outcome"], // mode: stream, blocking
    )?;

    let generation_duration = HistogramVec::new(
        HistogramOpts::new(
            "chat_generation_duration_seconds",
            "Time the model was held for one generation",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["model", "mode"],
    )?;

    let tokens_streamed = IntCounterVec::new(
        Opts::new(
            "chat_tokens_streamed_total",
            "Text fragments relayed to streaming clients",
        ),
        &["model"],
    )?;

    let model_loads = IntCounterVec::new(
        Opts::new("chat_model_loads_total", "Backend load attempts"),
        &["model", "outcome"],
    )?;

    let model_loaded = IntGauge::new("chat_model_loaded", "1 while a backend is loaded")?;

    let dedup_decisions = IntCounterVec::new(
        Opts::new(
            "chat_dedup_decisions_total",
            "Assistant message log decisions by deciding tier",
        ),
        &["decision"], // message_id, memory, durable, inserted
    )?;

    let db_duration = HistogramVec::new(
        HistogramOpts::new(
            "db_operation_duration_seconds",
            "Database operation duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["operation"],
    )?;

    let db_errors = IntCounterVec::new(
        Opts::new("db_errors_total", "Total database errors"),
        &["operation"],
    )?;

    registry.register(Box::new(generations.clone()))?;
    registry.register(Box::new(generation_duration.clone()))?;
    registry.register(Box::new(tokens_streamed.clone()))?;
    registry.register(Box::new(model_loads.clone()))?;
    registry.register(Box::new(model_loaded.clone()))?;
    registry.register(Box::new(dedup_decisions.clone()))?;
    registry.register(Box::new(db_duration.clone()))?;
    registry.register(Box::new(db_errors.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = GENERATIONS_TOTAL.set(generations);
    let _ = GENERATION_DURATION_SECONDS.set(generation_duration);
    let _ = TOKENS_STREAMED_TOTAL.set(tokens_streamed);
    let _ = MODEL_LOADS_TOTAL.set(model_loads);
    let _ = MODEL_LOADED.set(model_loaded);
    let _ = DEDUP_DECISIONS_TOTAL.set(dedup_decisions);
    let _ = DB_OPERATION_DURATION_SECONDS.set(db_duration);
    let _ = DB_ERRORS_TOTAL.set(db_errors);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

// Helper functions for recording metrics

pub fn record_generation(model: &str, mode: &str, outcome: &str, duration_secs: f64) {
    if let Some(counter) = GENERATIONS_TOTAL.get() {
        counter.with_label_values(&[model, mode, outcome]).inc();
    }
    if let Some(histogram) = GENERATION_DURATION_SECONDS.get() {
        histogram
            .with_label_values(&[model, mode])
            .observe(duration_secs);
    }
}

pub fn record_tokens_streamed(model: &str, count: u64) {
    if let Some(counter) = TOKENS_STREAMED_TOTAL.get() {
        counter.with_label_values(&[model]).inc_by(count);
    }
}

/// Record a load attempt and update the loaded gauge.
pub fn record_model_load(model: &str, success: bool) {
    if let Some(counter) = MODEL_LOADS_TOTAL.get() {
        let outcome = if success { "success" } else { "failure" };
        counter.with_label_values(&[model, outcome]).inc();
    }
    if success {
        set_model_loaded(true);
    }
}

pub fn set_model_loaded(loaded: bool) {
    if let Some(gauge) = MODEL_LOADED.get() {
        gauge.set(i64::from(loaded));
    }
}

pub fn record_dedup_decision(decision: &str) {
    if let Some(counter) = DEDUP_DECISIONS_TOTAL.get() {
        counter.with_label_values(&[decision]).inc();
    }
}

/// Record database operation duration.
pub fn record_db_operation(operation: &str, duration_secs: f64) {
    if let Some(histogram) = DB_OPERATION_DURATION_SECONDS.get() {
        histogram
            .with_label_values(&[operation])
            .observe(duration_secs);
    }
}

/// Record a database error.
pub fn record_db_error(operation: &str) {
    if let Some(counter) = DB_ERRORS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}
