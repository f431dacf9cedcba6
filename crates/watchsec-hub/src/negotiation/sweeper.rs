//! Negotiation timeout task
//!
//! Periodically closes negotiations that have not reached a direct path
//! within the window. Each one is reported as failed to both sides and the
//! viewer continues on the relay.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;

/// Run the negotiation sweeper until cancelled.
///
/// # Arguments
///
/// * `coordinator` - Coordinator owning the pending negotiations
/// * `window` - How long a negotiation may stay unsettled
/// * `interval` - Time between checks
/// * `cancel` - Cancellation token for graceful shutdown
pub async fn run_negotiation_sweeper(
    coordinator: Arc<Coordinator>,
    window: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        "Starting negotiation sweeper (window: {:?}, check interval: {:?})",
        window,
        interval
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = coordinator.expire_negotiations(window).await;
                if expired > 0 {
                    tracing::info!("Fell back to relay for {} timed-out negotiations", expired);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Negotiation sweeper shutting down");
                break;
            }
        }
    }
}
