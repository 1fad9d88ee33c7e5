//! Self-rescheduling timer loop.
//!
//! The loop keeps at most one pending wake-up. Each iteration reads the
//! current event, plans the single next action, and sleeps until it is due
//! or until a [`RescheduleSignal`] arrives. A signal drops the pending sleep
//! and plans again, so a stale timer never fires.
//!
//! ## Checkpoints
//!
//! With an announcement interval `every`, the loop wakes at the nearest
//! `deadline - k * every` (k >= 1) strictly after now to publish a reminder.
//! When no such point remains it wakes at the deadline itself and performs
//! the transition.
//!
//! Store reads and transitions run on tokio's blocking pool, since a
//! contended SQLite file can hold a call for up to the busy timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::announce::AnnouncementKind;
use crate::error::{CoreError, DatabaseError, Result};
use crate::event::{Event, EventState};
use crate::lifecycle::EventManager;
use crate::storage::SharedDatabase;
use crate::value::Duration;

/// Wakes the scheduler so that it re-reads state and replans.
///
/// Signals coalesce: any number of calls before the loop gets to run
/// result in a single replan.
#[derive(Debug, Clone, Default)]
pub struct RescheduleSignal(Arc<Notify>);

impl RescheduleSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reschedule(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    StartEvent,
    EndEvent,
    /// Reminder before a scheduled start.
    AnnounceStart,
    /// Reminder while a started event runs.
    AnnounceEnd,
}

/// The next wake-up: what to do, for which event, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub task: Task,
    pub event_id: i64,
    pub at: DateTime<Utc>,
}

/// Decide the next action for `event` as of `now`.
///
/// Returns `None` when there is nothing to wait for: no current event, or a
/// started event without a duration.
pub fn next_action(
    event: Option<&Event>,
    announce_every: Option<StdDuration>,
    now: DateTime<Utc>,
) -> Option<Plan> {
    let event = event?;
    let (deadline, primary, reminder) = match event.state() {
        EventState::Ended => return None,
        EventState::Scheduled => {
            // A scheduled row always carries its start; without one, start now.
            let deadline = event.scheduled_at.get().unwrap_or(now);
            let reminder = (!event.surprise).then_some(Task::AnnounceStart);
            (deadline, Task::StartEvent, reminder)
        }
        EventState::Started => (event.ends_at()?, Task::EndEvent, Some(Task::AnnounceEnd)),
    };

    let plan = |task, at| Plan {
        task,
        event_id: event.id,
        at,
    };

    let checkpoint = reminder
        .zip(announce_every.filter(|every| !every.is_zero()))
        .and_then(|(task, every)| Some((task, checkpoint(deadline, every, now)?)));

    Some(match checkpoint {
        Some((task, at)) => plan(task, at),
        None => plan(primary, deadline),
    })
}

/// Nearest `deadline - k * every` with k >= 1 that lies strictly after `now`.
///
/// That point is `now + ((until - 1ns) % every) + 1ns`, which needs no
/// multiplication by k.
fn checkpoint(deadline: DateTime<Utc>, every: StdDuration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let until = (deadline - now).to_std().ok()?.as_nanos();
    let every = every.as_nanos();
    if until <= every {
        return None;
    }
    let ahead = i64::try_from((until - 1) % every + 1).ok()?;
    now.checked_add_signed(chrono::Duration::nanoseconds(ahead))
}

pub struct Scheduler {
    manager: EventManager,
    signal: RescheduleSignal,
    announce_every: Option<StdDuration>,
    retry_interval: StdDuration,
}

impl Scheduler {
    pub fn new(manager: EventManager, announce_every: Duration) -> Self {
        Self {
            signal: manager.signal().clone(),
            manager,
            announce_every: announce_every.get(),
            retry_interval: StdDuration::from_secs(30),
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: StdDuration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Run forever.
    pub async fn run(self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(announce_every = ?self.announce_every, "scheduler started");

        loop {
            let (delay, plan) = match self.plan().await {
                Ok(Some(plan)) => {
                    debug!(?plan, "next wake-up");
                    let delay = (plan.at - self.manager.now()).to_std().unwrap_or_default();
                    (Some(delay), Some(plan))
                }
                Ok(None) => {
                    debug!("nothing to schedule");
                    (None, None)
                }
                Err(e) => {
                    error!("failed to read current event: {e}");
                    (Some(self.retry_interval), None)
                }
            };

            let due = tokio::select! {
                _ = sleep_for(delay) => true,
                _ = self.signal.notified() => false,
                _ = &mut shutdown => break,
            };
            if !due {
                debug!("rescheduling");
                continue;
            }

            let Some(plan) = plan else { continue };
            match self.perform(plan).await {
                Ok(()) => {}
                // Another writer got there first; replan.
                Err(e) if e.is_rejection() => debug!(?plan, "transition raced: {e}"),
                Err(e) => {
                    error!(?plan, "scheduled transition failed: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_interval) => {}
                        _ = self.signal.notified() => {}
                        _ = &mut shutdown => break,
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    async fn plan(&self) -> Result<Option<Plan>> {
        let manager = self.manager.clone();
        let every = self.announce_every;
        offload(move || {
            let event = manager.current_event()?;
            Ok(next_action(event.as_ref(), every, manager.now()))
        })
        .await
    }

    /// Carry out `plan` if the stored event still matches it.
    pub async fn perform(&self, plan: Plan) -> Result<()> {
        let manager = self.manager.clone();
        offload(move || perform(&manager, &plan)).await
    }
}

fn perform(manager: &EventManager, plan: &Plan) -> Result<()> {
    let Some(mut event) = manager.current_event()? else {
        debug!(?plan, "event is gone");
        return Ok(());
    };
    if event.id != plan.event_id {
        debug!(?plan, current = event.id, "event was replaced");
        return Ok(());
    }

    match (plan.task, event.state()) {
        (Task::StartEvent, EventState::Scheduled) => manager.start_event(&mut event),
        (Task::EndEvent, EventState::Started) => manager.end_event(&mut event),
        (Task::AnnounceStart, EventState::Scheduled) if !event.surprise => {
            manager.announce_event(AnnouncementKind::UpcomingStart, &event);
            Ok(())
        }
        (Task::AnnounceEnd, EventState::Started) => {
            manager.announce_event(AnnouncementKind::Ongoing, &event);
            Ok(())
        }
        (task, state) => {
            debug!(?task, ?state, "plan no longer applies");
            Ok(())
        }
    }
}

/// Run a blocking store call off the async workers.
async fn offload<T, F>(call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
}

/// Sleep for `delay`, or forever without one.
async fn sleep_for(delay: Option<StdDuration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}

/// Raise `signal` whenever another connection commits to the store.
///
/// Processes that share the database file cannot reach this process's
/// signal directly; polling `data_version` bridges the gap.
pub async fn watch_external_changes(db: SharedDatabase, signal: RescheduleSignal, poll_interval: StdDuration) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = None;

    loop {
        ticker.tick().await;
        let db = db.clone();
        let version = offload(move || {
            let db = db
                .lock()
                .map_err(|_| CoreError::Database(DatabaseError::Poisoned))?;
            db.data_version()
        })
        .await;
        match version {
            Ok(version) => {
                if last.is_some_and(|last| last != version) {
                    debug!(version, "external change detected");
                    signal.reschedule();
                }
                last = Some(version);
            }
            Err(CoreError::Database(DatabaseError::Poisoned)) => {
                warn!("database lock poisoned, stopping change watcher");
                return;
            }
            Err(e) => warn!("failed to poll data version: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announce::{Announcement, ChannelAnnouncer};
    use crate::clock::TokioClock;
    use crate::event::User;
    use crate::storage::Database;
    use crate::value::Timestamp;
    use chrono::TimeZone;
    use tokio::sync::mpsc::UnboundedReceiver;

    const MIN: StdDuration = StdDuration::from_secs(60);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 18, 0, 0).unwrap()
    }

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    fn scheduled(at: DateTime<Utc>, surprise: bool) -> Event {
        Event {
            id: 1,
            coins: 10,
            duration: Duration::from_mins(60),
            scheduled_at: Timestamp::at(at),
            started_at: Timestamp::NULL,
            ended_at: Timestamp::NULL,
            surprise,
        }
    }

    #[test]
    fn no_event_no_plan() {
        assert_eq!(next_action(None, Some(5 * MIN), t0()), None);
    }

    #[test]
    fn reminder_before_start() {
        let event = scheduled(t0() + minutes(10), false);
        let plan = next_action(Some(&event), Some(5 * MIN), t0()).unwrap();
        assert_eq!(plan.task, Task::AnnounceStart);
        assert_eq!(plan.at, t0() + minutes(5));

        // At the checkpoint itself the next stop is the start.
        let plan = next_action(Some(&event), Some(5 * MIN), plan.at).unwrap();
        assert_eq!(plan.task, Task::StartEvent);
        assert_eq!(plan.at, t0() + minutes(10));
    }

    #[test]
    fn reminder_picks_nearest_checkpoint() {
        let event = scheduled(t0() + minutes(12), false);
        let plan = next_action(Some(&event), Some(5 * MIN), t0()).unwrap();
        assert_eq!(plan.at, t0() + minutes(2));
    }

    #[test]
    fn fine_interval_over_long_wait() {
        let event = scheduled(t0() + chrono::Duration::days(60), false);
        let plan = next_action(Some(&event), Some(StdDuration::from_millis(1)), t0()).unwrap();
        assert_eq!(plan.task, Task::AnnounceStart);
        assert_eq!(plan.at, t0() + chrono::Duration::milliseconds(1));
    }

    #[test]
    fn surprise_events_skip_reminders() {
        let event = scheduled(t0() + minutes(10), true);
        let plan = next_action(Some(&event), Some(5 * MIN), t0()).unwrap();
        assert_eq!(plan.task, Task::StartEvent);
        assert_eq!(plan.at, t0() + minutes(10));
    }

    #[test]
    fn overdue_start_runs_immediately() {
        let event = scheduled(t0() - minutes(1), false);
        let plan = next_action(Some(&event), Some(5 * MIN), t0()).unwrap();
        assert_eq!(plan.task, Task::StartEvent);
        assert!(plan.at <= t0());
    }

    #[test]
    fn started_event_ends_after_duration() {
        let mut event = scheduled(t0(), false);
        event.started_at = Timestamp::at(t0());
        let plan = next_action(Some(&event), None, t0()).unwrap();
        assert_eq!(plan.task, Task::EndEvent);
        assert_eq!(plan.at, t0() + minutes(60));

        let plan = next_action(Some(&event), Some(StdDuration::ZERO), t0()).unwrap();
        assert_eq!(plan.task, Task::EndEvent);

        let plan = next_action(Some(&event), Some(20 * MIN), t0()).unwrap();
        assert_eq!(plan.task, Task::AnnounceEnd);
        assert_eq!(plan.at, t0() + minutes(20));
    }

    #[test]
    fn null_duration_has_no_end() {
        let mut event = scheduled(t0(), false);
        event.started_at = Timestamp::at(t0());
        event.duration = Duration::NULL;
        assert_eq!(next_action(Some(&event), Some(5 * MIN), t0()), None);
    }

    #[test]
    fn ended_event_has_no_plan() {
        let mut event = scheduled(t0(), false);
        event.ended_at = Timestamp::at(t0());
        assert_eq!(next_action(Some(&event), Some(5 * MIN), t0()), None);
    }

    fn setup() -> (EventManager, UnboundedReceiver<Announcement>) {
        let db = Database::open_memory().unwrap();
        for id in 1..=2 {
            let mut user = User::new(id, format!("user{id}"));
            user.enlisted = true;
            db.put_user(&user).unwrap();
        }
        let (announcer, rx) = ChannelAnnouncer::new();
        let manager = EventManager::new(db.into_shared(), Arc::new(announcer), RescheduleSignal::new())
            .with_clock(Arc::new(TokioClock::new()));
        (manager, rx)
    }

    async fn next_kind(rx: &mut UnboundedReceiver<Announcement>) -> (AnnouncementKind, Event) {
        let a = rx.recv().await.unwrap();
        (a.kind, a.event)
    }

    #[tokio::test(start_paused = true)]
    async fn runs_full_lifecycle_on_time() {
        let (manager, mut rx) = setup();
        let t = manager.now();
        manager
            .schedule_event(10, t + minutes(10), Duration::from_mins(20), false)
            .unwrap();
        tokio::spawn(Scheduler::new(manager.clone(), Duration::from_mins(5)).run());

        assert_eq!(next_kind(&mut rx).await.0, AnnouncementKind::Scheduled);
        assert_eq!(next_kind(&mut rx).await.0, AnnouncementKind::UpcomingStart);

        let (kind, started) = next_kind(&mut rx).await;
        assert_eq!(kind, AnnouncementKind::Started);
        let started_at = started.started_at.get().unwrap();
        assert!(started_at >= t + minutes(10) && started_at < t + minutes(10) + chrono::Duration::seconds(1));

        for _ in 0..3 {
            assert_eq!(next_kind(&mut rx).await.0, AnnouncementKind::Ongoing);
        }
        let (kind, ended) = next_kind(&mut rx).await;
        assert_eq!(kind, AnnouncementKind::Ended);
        assert!(ended.ended_at.get().unwrap() >= started_at + minutes(20));

        assert!(manager.current_event().unwrap().is_none());
        assert_eq!(manager.participants(ended.id).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_event_never_starts() {
        let (manager, mut rx) = setup();
        let t = manager.now();
        manager
            .schedule_event(10, t + minutes(10), Duration::from_mins(20), false)
            .unwrap();
        tokio::spawn(Scheduler::new(manager.clone(), Duration::from_mins(5)).run());

        tokio::time::sleep(2 * MIN).await;
        manager.cancel_scheduled_event().unwrap();
        tokio::time::sleep(60 * MIN).await;

        let mut kinds = Vec::new();
        while let Ok(a) = rx.try_recv() {
            kinds.push(a.kind);
        }
        assert_eq!(kinds, vec![AnnouncementKind::Scheduled, AnnouncementKind::Cancelled]);
        assert!(manager.current_event().unwrap().is_none());
        assert!(manager.last_event().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_stop_replaces_pending_end() {
        let (manager, mut rx) = setup();
        manager.start_new_event(10, Duration::from_mins(30)).unwrap();
        tokio::spawn(Scheduler::new(manager.clone(), Duration::NULL).run());

        tokio::time::sleep(5 * MIN).await;
        let stopped = manager.stop_event().unwrap();
        tokio::time::sleep(60 * MIN).await;

        let mut kinds = Vec::new();
        while let Ok(a) = rx.try_recv() {
            kinds.push(a.kind);
        }
        assert_eq!(kinds, vec![AnnouncementKind::Started, AnnouncementKind::Ended]);
        assert_eq!(manager.last_event().unwrap(), Some(stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn open_ended_event_keeps_running() {
        let (manager, mut rx) = setup();
        manager.start_new_event(10, Duration::NULL).unwrap();
        tokio::spawn(Scheduler::new(manager.clone(), Duration::from_mins(5)).run());

        tokio::time::sleep(600 * MIN).await;
        assert_eq!(next_kind(&mut rx).await.0, AnnouncementKind::Started);
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.current_event().unwrap().map(|e| e.state()), Some(EventState::Started));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_loop() {
        let (manager, _rx) = setup();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(Scheduler::new(manager, Duration::NULL).run_until(async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn watcher_signals_foreign_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skyaway.db");
        let watched = Database::open_at(&path).unwrap().into_shared();
        let mut writer = Database::open_at(&path).unwrap();
        let signal = RescheduleSignal::new();
        let watcher = tokio::spawn(watch_external_changes(
            watched,
            signal.clone(),
            StdDuration::from_millis(10),
        ));

        // Let the watcher record a baseline first.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        writer
            .schedule_event(5, Utc::now(), Duration::from_mins(5), false)
            .unwrap();
        let woke = tokio::time::timeout(StdDuration::from_secs(5), signal.notified()).await;
        assert!(woke.is_ok());
        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn signals_coalesce() {
        let signal = RescheduleSignal::new();
        signal.reschedule();
        signal.reschedule();
        signal.notified().await;
        let second = tokio::time::timeout(MIN, signal.notified()).await;
        assert!(second.is_err());
    }
}
