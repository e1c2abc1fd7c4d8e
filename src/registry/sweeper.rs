//! Background idle sweep.

use std::sync::Weak;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::keyed::Registry;

/// Spawn the periodic eviction task.
///
/// The task holds only a weak handle, so it never keeps the registry alive;
/// it stops on its own once the registry is dropped or destroyed.
pub(crate) fn spawn(
    handle: &Handle,
    registry: Weak<Registry>,
    interval: Duration,
) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(registry) = registry.upgrade() else {
                break;
            };
            if registry.is_destroyed() {
                break;
            }

            let evicted = registry.evict_now();
            trace!(evicted = evicted, live = registry.len(), "Idle sweep finished");
        }

        debug!("Idle sweep stopped");
    })
}
