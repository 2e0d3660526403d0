//! Structured logging setup (ambient addition, SPEC_FULL §2/§4.6).
//!
//! Mirrors the teacher's `tracing` + `tracing-subscriber` (`env-filter`,
//! `json`) combination. The coordinator's own tick/agent spans are built
//! with `tracing::info_span!` directly at the call site (see
//! `broker::Coordinator::tick`); this module only owns process-wide
//! subscriber init/teardown and a correlation-id helper for pairing a
//! request envelope with its response (§4.2).

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Install a JSON-structured `tracing` subscriber honoring `RUST_LOG`,
/// defaulting to `info`.
pub fn init_telemetry() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    tracing::info!("fleet-coordinator telemetry initialized");
    Ok(())
}

/// A correlation id suitable for tagging a set of related log lines
/// (not to be confused with a message envelope's `correlationId`,
/// which ties one `LOCK_RESPONSE` to its `LOCK_REQUEST`, §4.2).
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn shutdown_telemetry() {
    tracing::info!("fleet-coordinator telemetry shutdown");
}
