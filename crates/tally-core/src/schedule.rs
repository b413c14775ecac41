//! Shared driver for the periodic background jobs.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Run `job` every `period` until `shutdown` flips to `true` or its sender is
/// dropped.
///
/// The first run happens immediately. A run that takes longer than `period`
/// pushes the next one back instead of bunching ticks up.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut timer = tokio::time::interval(period.max(Duration::from_millis(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(job = name, period_secs = period.as_secs_f64(), "periodic job started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = timer.tick() => {
                debug!(job = name, "tick");
                job().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(job = name, "periodic job stopped");
}
