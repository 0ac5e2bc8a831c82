use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Metrics
pub static LOGINS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static TOKEN_REFRESH_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static EVENTS_PUBLISHED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static AUTHZ_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let metric = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Register the service counters. Recording before this call is a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let logins = counter(
        &registry,
        "identity_logins_total",
        "Completed login attempts by outcome",
        &["outcome"],
    )?;
    let refreshes = counter(
        &registry,
        "identity_token_refresh_total",
        "Refresh token presentations by outcome",
        &["outcome"],
    )?;
    let events = counter(
        &registry,
        "identity_events_published_total",
        "Domain event publish attempts",
        &["event_type", "outcome"],
    )?;
    let decisions = counter(
        &registry,
        "identity_authz_decisions_total",
        "Authorization decisions",
        &["decision"],
    )?;

    let _ = REGISTRY.set(registry);
    let _ = LOGINS_TOTAL.set(logins);
    let _ = TOKEN_REFRESH_TOTAL.set(refreshes);
    let _ = EVENTS_PUBLISHED_TOTAL.set(events);
    let _ = AUTHZ_DECISIONS_TOTAL.set(decisions);
    Ok(())
}

fn inc(metric: &OnceLock<IntCounterVec>, labels: &[&str]) {
    if let Some(counter) = metric.get() {
        counter.with_label_values(labels).inc();
    }
}

pub fn record_login(outcome: &str) {
    inc(&LOGINS_TOTAL, &[outcome]);
}

pub fn record_refresh(outcome: &str) {
    inc(&TOKEN_REFRESH_TOTAL, &[outcome]);
}

pub fn record_publish(event_type: &str, outcome: &str) {
    inc(&EVENTS_PUBLISHED_TOTAL, &[event_type, outcome]);
}

pub fn record_decision(decision: &str) {
    inc(&AUTHZ_DECISIONS_TOTAL, &[decision]);
}

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
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Metrics buffer is not valid UTF-8: {}", e);
        String::new()
    })
}
