//! Proactive background token refresh
//!
//! Spawns a periodic task that refreshes access tokens approaching expiry so
//! the request path rarely has to wait on the token endpoint. Refreshes go
//! through the pool's token cache and therefore serialize with request-time
//! refreshes of the same account.

use std::sync::Arc;
use std::time::Duration;

use common::now_millis;
use tracing::debug;

use crate::pool::{PoolManager, RefreshSummary};

/// Spawn a background task that proactively refreshes expiring tokens.
///
/// Runs every `interval` and refreshes any token expiring within `threshold`.
/// Failures are recorded on the account and retried on the next tick.
pub fn spawn_refresh_task(
    manager: Arc<PoolManager>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; tokens were just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&manager, threshold).await;
        }
    })
}

/// Run one refresh pass over every account.
async fn refresh_cycle(manager: &PoolManager, threshold: Duration) -> RefreshSummary {
    let threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
    let summary = manager.refresh_expiring(now_millis(), threshold_ms).await;
    debug!(
        refreshed = summary.refreshed,
        failed = summary.failed,
        skipped = summary.skipped,
        "refresh cycle finished"
    );
    summary
}
