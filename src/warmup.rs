//! Warmup engine: volume planning, placement rescue, engagement and the account lifecycle.

pub mod content;
pub mod engagement;
pub mod engine;
pub mod folders;
pub mod locks;
pub mod metrics;
pub mod rescue;
pub mod state;
pub mod volume;

pub use engine::{CycleReport, CycleWarning, Engine, EngineSettings, WarmupStatus};
pub use state::AccountState;

use std::time::Duration;
use tokio::sync::watch;

/// Sleep for `delay` unless `shutdown` flips to `true` first. Returns `true`
/// when interrupted, immediately if shutdown was already requested.
pub(crate) async fn pause(shutdown: &watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    if delay.is_zero() {
        return false;
    }
    let mut shutdown = shutdown.clone();
    let stopped = async move {
        // A dropped sender never signals; sleep out the delay.
        if shutdown.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stopped => true,
    }
}
