use std::time::Duration as StdDuration;

use skyaway_core::scheduler::watch_external_changes;
use skyaway_core::{EventManager, RescheduleSignal, Scheduler};
use tracing::info;

use super::{CmdResult, Context};

const DEFAULT_POLL: StdDuration = StdDuration::from_secs(5);
const DEFAULT_RETRY: StdDuration = StdDuration::from_secs(30);

/// Run the scheduler until Ctrl+C.
pub async fn run(ctx: &Context) -> CmdResult {
    let daemon = &ctx.config.daemon;
    let db = ctx.database()?.into_shared();
    let (announcer, delivery) = ctx.announcer();
    let signal = RescheduleSignal::new();
    let manager = EventManager::new(db.clone(), announcer, signal.clone());

    if let Some(event) = manager.current_event()? {
        info!(event_id = event.id, state = ?event.state(), "resuming current event");
    }

    let watcher = tokio::spawn(watch_external_changes(
        db,
        signal,
        daemon
            .poll_interval
            .get()
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_POLL),
    ));

    Scheduler::new(manager, ctx.config.event.announce_every)
        .with_retry_interval(daemon.retry_interval.get().unwrap_or(DEFAULT_RETRY))
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await;

    watcher.abort();
    if let Some(delivery) = delivery {
        let _ = delivery.await;
    }
    Ok(())
}
