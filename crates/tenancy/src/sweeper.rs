//! Background reclamation of idle tenant handles.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::registry::RegistryInner;
use crate::{ConnectionFactory, DirectoryLookup};

/// Spawns the idle sweep loop.
///
/// The task holds only a weak reference, so it exits on the first tick
/// after the last registry clone is dropped.
pub(crate) fn spawn<D, F>(registry: Weak<RegistryInner<D, F>>, period: Duration) -> JoinHandle<()>
where
    D: DirectoryLookup,
    F: ConnectionFactory,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let Some(registry) = registry.upgrade() else {
                tracing::debug!("tenant registry dropped, idle sweeper exiting");
                break;
            };
            registry.sweep_idle().await;
        }
    })
}
