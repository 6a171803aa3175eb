//! Prometheus metrics exposition
//!
//! The pool crate records through the `metrics` facade:
//!
//! - `pool_selections_total` (counter): label `account`
//! - `pool_rate_limited_total` (counter): label `account`
//! - `pool_token_refresh_total` (counter): label `result`
//! - `pool_fallbacks_total` (counter)
//!
//! The service adds `admin_commands_total` (counter): labels `command`, `status`.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a handle for rendering.
///
/// Can only succeed once per process.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!(
        "pool_selections_total",
        "Accounts handed out for outbound requests"
    );
    metrics::describe_counter!(
        "pool_rate_limited_total",
        "Accounts parked after a provider rate limit"
    );
    metrics::describe_counter!(
        "pool_token_refresh_total",
        "Access token refresh attempts by result"
    );
    metrics::describe_counter!(
        "pool_fallbacks_total",
        "Requests served by a fallback account after a refresh failure"
    );
    metrics::describe_counter!("admin_commands_total", "Admin commands by outcome");
}

/// Record an admin command with its HTTP status.
pub fn record_command(command: &'static str, status: u16) {
    metrics::counter!("admin_commands_total", "command" => command, "status" => status.to_string())
        .increment(1);
}
