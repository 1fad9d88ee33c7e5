//! Event lifecycle manager.
//!
//! The only mutation surface for event state. Each transition commits to
//! the store first, then announces and asks the scheduler to recompute.
//!
//! ```ignore
//! let manager = EventManager::new(db, Arc::new(LogAnnouncer), signal.clone());
//! manager.schedule_event(100, start_at, Duration::from_mins(60), false)?;
//! // ... the scheduler promotes and ends it on time ...
//! let claim = manager.claim_coins(user_id)?;
//! ```

use std::sync::{Arc, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::announce::{Announcement, AnnouncementKind, Announcer};
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, DatabaseError, Result, ValidationError};
use crate::event::{Event, EventState, Participant};
use crate::scheduler::RescheduleSignal;
use crate::storage::{Database, SharedDatabase};
use crate::value::Duration;

/// Outcome of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claim {
    pub event_id: i64,
    pub user_id: i64,
    pub coins: u64,
    /// The claim left nothing to distribute and the event was closed.
    pub closed_event: bool,
}

#[derive(Clone)]
pub struct EventManager {
    db: SharedDatabase,
    announcer: Arc<dyn Announcer>,
    signal: RescheduleSignal,
    clock: Arc<dyn Clock>,
}

impl EventManager {
    pub fn new(db: SharedDatabase, announcer: Arc<dyn Announcer>, signal: RescheduleSignal) -> Self {
        Self {
            db,
            announcer,
            signal,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn signal(&self) -> &RescheduleSignal {
        &self.signal
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| CoreError::Database(DatabaseError::Poisoned))
    }

    fn announce(&self, kind: AnnouncementKind, event: &Event) {
        let announcement = Announcement::new(kind, event.clone());
        if let Err(e) = self.announcer.announce(&announcement) {
            warn!(event_id = event.id, ?kind, "failed to announce: {e}");
        }
    }

    /// Publish a reminder for `event` without touching its state.
    pub(crate) fn announce_event(&self, kind: AnnouncementKind, event: &Event) {
        self.announce(kind, event)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn current_event(&self) -> Result<Option<Event>> {
        self.lock()?.current_event()
    }

    pub fn last_event(&self) -> Result<Option<Event>> {
        self.lock()?.last_event()
    }

    pub fn event(&self, id: i64) -> Result<Option<Event>> {
        self.lock()?.event(id)
    }

    pub fn participants(&self, event_id: i64) -> Result<Vec<Participant>> {
        self.lock()?.participants(event_id)
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Create an event that starts at `start_at`.
    ///
    /// # Errors
    /// `EventExists` if a current event exists.
    pub fn schedule_event(
        &self,
        coins: u64,
        start_at: DateTime<Utc>,
        duration: Duration,
        surprise: bool,
    ) -> Result<Event> {
        validate(coins, start_at, duration)?;
        let event = self
            .lock()?
            .schedule_event(coins, start_at, duration, surprise)?;
        info!(event_id = event.id, coins, %start_at, surprise, "event scheduled");

        if !surprise {
            self.announce(AnnouncementKind::Scheduled, &event);
        }
        self.signal.reschedule();
        Ok(event)
    }

    /// Create an event that starts now, with its participants allocated.
    ///
    /// # Errors
    /// `EventExists` if a current event exists.
    pub fn start_new_event(&self, coins: u64, duration: Duration) -> Result<Event> {
        let now = self.now();
        validate(coins, now, duration)?;
        let event = self
            .lock()?
            .start_new_event(coins, duration, now, &mut rand::thread_rng())?;
        info!(event_id = event.id, coins, %duration, "event started");

        self.announce(AnnouncementKind::Started, &event);
        self.signal.reschedule();
        Ok(event)
    }

    /// Promote `event` from scheduled to started and allocate participants.
    ///
    /// # Errors
    /// `EventAlreadyStarted` if it has started, `EventAlreadyEnded` if it
    /// has ended.
    pub fn start_event(&self, event: &mut Event) -> Result<()> {
        let now = self.now();
        self.lock()?
            .start_event(event, now, &mut rand::thread_rng())?;
        info!(event_id = event.id, "scheduled event started");

        self.announce(AnnouncementKind::Started, event);
        self.signal.reschedule();
        Ok(())
    }

    /// Start the current event.
    ///
    /// # Errors
    /// `EventDoesNotExist` if there is no current event.
    pub fn start_current_event(&self) -> Result<Event> {
        let mut event = self.require_current()?;
        self.start_event(&mut event)?;
        Ok(event)
    }

    /// End `event`, whatever its state.
    ///
    /// # Errors
    /// `EventAlreadyEnded` if it has already ended.
    pub fn end_event(&self, event: &mut Event) -> Result<()> {
        let previous = event.state();
        let now = self.now();
        self.lock()?.end_event(event, now)?;
        info!(event_id = event.id, ?previous, "event ended");

        match previous {
            EventState::Started => self.announce(AnnouncementKind::Ended, event),
            EventState::Scheduled if !event.surprise => {
                self.announce(AnnouncementKind::Cancelled, event)
            }
            EventState::Scheduled => debug!(event_id = event.id, "surprise event cancelled quietly"),
            EventState::Ended => {}
        }
        self.signal.reschedule();
        Ok(())
    }

    /// Unconditionally end the current event.
    ///
    /// # Errors
    /// `EventDoesNotExist` if there is no current event.
    pub fn end_current_event(&self) -> Result<Event> {
        let mut event = self.require_current()?;
        match self.end_event(&mut event) {
            Ok(()) => Ok(event),
            // Someone else ended it between the read and the write.
            Err(CoreError::EventAlreadyEnded) => Err(CoreError::EventDoesNotExist),
            Err(e) => Err(e),
        }
    }

    /// End the current event if it has not started yet.
    ///
    /// # Errors
    /// `EventDoesNotExist` if there is none, `EventAlreadyStarted` if it
    /// is running (stop it instead).
    pub fn cancel_scheduled_event(&self) -> Result<Event> {
        let event = self.require_current()?;
        if event.state() == EventState::Started {
            return Err(CoreError::EventAlreadyStarted);
        }
        self.end_current_event()
    }

    /// End the current event if it is running.
    ///
    /// # Errors
    /// `EventDoesNotExist` if there is none, `EventNotStarted` if it is
    /// only scheduled (cancel it instead).
    pub fn stop_event(&self) -> Result<Event> {
        let event = self.require_current()?;
        if event.state() != EventState::Started {
            return Err(CoreError::EventNotStarted);
        }
        self.end_current_event()
    }

    /// End the current started event early when every coin has been claimed
    /// or nobody is left to claim. Returns the ended event, if any.
    ///
    /// # Errors
    /// `EventDoesNotExist` if there is no current event.
    pub fn end_current_event_if_needed(&self) -> Result<Option<Event>> {
        let now = self.now();
        let ended = {
            let mut db = self.lock()?;
            let mut event = db.current_event()?.ok_or(CoreError::EventDoesNotExist)?;
            if event.state() != EventState::Started {
                return Ok(None);
            }

            let coins = db.coins_unclaimed(&event)?;
            let claimers = db.claimers_left(&event)?;
            if coins > 0 && claimers > 0 {
                return Ok(None);
            }

            db.end_event(&mut event, now)?;
            info!(event_id = event.id, coins, claimers, "event ended early");
            event
        };

        self.announce(AnnouncementKind::Ended, &ended);
        self.signal.reschedule();
        Ok(Some(ended))
    }

    /// Re-send the announcement for the current event.
    pub fn announce_current_event(&self) -> Result<Event> {
        let event = self.require_current()?;
        self.announce(AnnouncementKind::Current, &event);
        Ok(event)
    }

    // ── Claims ───────────────────────────────────────────────────────

    /// Coins `user_id` may claim in the current started event.
    ///
    /// # Errors
    /// `EventDoesNotExist` / `EventNotStarted` without a running event,
    /// `NotParticipating` or `AlreadyClaimed` otherwise.
    pub fn coins_to_claim(&self, user_id: i64) -> Result<u64> {
        let db = self.lock()?;
        let event = running(db.current_event()?)?;
        db.get_coins_to_claim(user_id, event.id)
    }

    /// Claim the share of `user_id` in the current started event, then close
    /// the event if nothing is left to claim.
    pub fn claim_coins(&self, user_id: i64) -> Result<Claim> {
        let now = self.now();
        let (event, coins) = {
            let mut db = self.lock()?;
            let event = running(db.current_event()?)?;
            let coins = db.claim_coins(user_id, event.id, now)?;
            (event, coins)
        };
        info!(event_id = event.id, user_id, coins, "coins claimed");

        let closed_event = match self.end_current_event_if_needed() {
            Ok(ended) => ended.is_some(),
            Err(CoreError::EventDoesNotExist) => false,
            Err(e) => {
                warn!(event_id = event.id, "failed to check for early end: {e}");
                false
            }
        };

        Ok(Claim {
            event_id: event.id,
            user_id,
            coins,
            closed_event,
        })
    }

    fn require_current(&self) -> Result<Event> {
        self.current_event()?.ok_or(CoreError::EventDoesNotExist)
    }
}

fn running(event: Option<Event>) -> Result<Event> {
    let event = event.ok_or(CoreError::EventDoesNotExist)?;
    match event.state() {
        EventState::Started => Ok(event),
        _ => Err(CoreError::EventNotStarted),
    }
}

/// A pool must hold coins, and an event starting at `start` must be able to
/// end at a representable instant.
fn validate(coins: u64, start: DateTime<Utc>, duration: Duration) -> Result<()> {
    let invalid = |field: &str, message: &str| -> CoreError {
        ValidationError::InvalidValue {
            field: field.to_string(),
            message: message.to_string(),
        }
        .into()
    };

    if coins == 0 {
        return Err(invalid("coins", "the pool must contain at least one coin"));
    }
    let Some(length) = duration.get() else {
        return Ok(());
    };
    if length.is_zero() {
        return Err(invalid("duration", "event duration has to be positive"));
    }
    let end = chrono::Duration::from_std(length)
        .ok()
        .and_then(|length| start.checked_add_signed(length));
    if end.is_none() {
        return Err(invalid("duration", "event would end past the supported date range"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announce::ChannelAnnouncer;
    use crate::event::User;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn manager(users: i64) -> (EventManager, UnboundedReceiver<Announcement>) {
        let db = Database::open_memory().unwrap();
        for id in 1..=users {
            let mut user = User::new(id, format!("user{id}"));
            user.enlisted = true;
            db.put_user(&user).unwrap();
        }
        let (announcer, rx) = ChannelAnnouncer::new();
        let manager = EventManager::new(db.into_shared(), Arc::new(announcer), RescheduleSignal::new());
        (manager, rx)
    }

    fn titles(rx: &mut UnboundedReceiver<Announcement>) -> Vec<&'static str> {
        let mut titles = Vec::new();
        while let Ok(a) = rx.try_recv() {
            titles.push(a.title());
        }
        titles
    }

    #[test]
    fn schedule_rejects_second_event() {
        let (m, mut rx) = manager(1);
        let start = m.now() + chrono::Duration::minutes(10);
        m.schedule_event(10, start, Duration::from_mins(60), false).unwrap();
        assert!(matches!(
            m.schedule_event(10, start, Duration::from_mins(60), false),
            Err(CoreError::EventExists)
        ));
        assert!(matches!(
            m.start_new_event(10, Duration::from_mins(60)),
            Err(CoreError::EventExists)
        ));
        assert_eq!(titles(&mut rx), vec!["A new event has been scheduled!"]);
    }

    #[test]
    fn surprise_schedule_and_cancel_are_quiet() {
        let (m, mut rx) = manager(1);
        let start = m.now() + chrono::Duration::minutes(10);
        m.schedule_event(10, start, Duration::from_mins(60), true).unwrap();
        m.cancel_scheduled_event().unwrap();
        assert!(titles(&mut rx).is_empty());
        assert!(m.current_event().unwrap().is_none());
    }

    #[test]
    fn cancel_and_stop_guard_state() {
        let (m, mut rx) = manager(2);
        assert!(matches!(m.cancel_scheduled_event(), Err(CoreError::EventDoesNotExist)));
        assert!(matches!(m.stop_event(), Err(CoreError::EventDoesNotExist)));

        let start = m.now() + chrono::Duration::minutes(10);
        m.schedule_event(10, start, Duration::from_mins(60), false).unwrap();
        assert!(matches!(m.stop_event(), Err(CoreError::EventNotStarted)));
        m.cancel_scheduled_event().unwrap();

        m.start_new_event(10, Duration::from_mins(60)).unwrap();
        assert!(matches!(m.cancel_scheduled_event(), Err(CoreError::EventAlreadyStarted)));
        m.stop_event().unwrap();

        assert_eq!(
            titles(&mut rx),
            vec![
                "A new event has been scheduled!",
                "The scheduled event has been cancelled",
                "Event has started!",
                "Event has ended!",
            ]
        );
    }

    #[test]
    fn end_current_event_twice() {
        let (m, _rx) = manager(1);
        m.start_new_event(10, Duration::from_mins(60)).unwrap();
        let ended = m.end_current_event().unwrap();
        assert!(ended.ended_at.is_set());
        assert!(matches!(m.end_current_event(), Err(CoreError::EventDoesNotExist)));
    }

    #[test]
    fn promote_allocates_once() {
        let (m, mut rx) = manager(3);
        let start = m.now() + chrono::Duration::minutes(10);
        m.schedule_event(10, start, Duration::from_mins(60), false).unwrap();
        let started = m.start_current_event().unwrap();
        assert_eq!(started.state(), EventState::Started);
        assert!(matches!(m.start_current_event(), Err(CoreError::EventAlreadyStarted)));

        let participants = m.participants(started.id).unwrap();
        assert_eq!(participants.len(), 3);
        assert!(participants.iter().all(|p| p.coins == 3 || p.coins == 4));
        assert_eq!(
            titles(&mut rx),
            vec!["A new event has been scheduled!", "Event has started!"]
        );
    }

    #[test]
    fn validation_rejects_empty_pool() {
        let (m, _rx) = manager(1);
        assert!(matches!(
            m.start_new_event(0, Duration::from_mins(60)),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            m.start_new_event(5, Duration::from_secs(0)),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn validation_rejects_unrepresentable_end() {
        let (m, _rx) = manager(1);
        let huge = Duration::from_secs(3_000_000_000 * 3600);
        assert!(matches!(m.start_new_event(10, huge), Err(CoreError::Validation(_))));
        assert!(matches!(
            m.schedule_event(10, DateTime::<Utc>::MAX_UTC - chrono::Duration::hours(1), Duration::from_mins(120), false),
            Err(CoreError::Validation(_))
        ));
        assert!(m.current_event().unwrap().is_none());
    }

    #[test]
    fn claims_require_running_event() {
        let (m, _rx) = manager(2);
        assert!(matches!(m.coins_to_claim(1), Err(CoreError::EventDoesNotExist)));

        let start = m.now() + chrono::Duration::minutes(10);
        m.schedule_event(10, start, Duration::from_mins(60), false).unwrap();
        assert!(matches!(m.claim_coins(1), Err(CoreError::EventNotStarted)));
    }

    #[test]
    fn last_claim_closes_event() {
        let (m, mut rx) = manager(2);
        let event = m.start_new_event(10, Duration::from_mins(60)).unwrap();
        assert!(matches!(m.coins_to_claim(42), Err(CoreError::NotParticipating)));

        assert_eq!(m.coins_to_claim(1).unwrap(), 5);
        let first = m.claim_coins(1).unwrap();
        assert_eq!(first.coins, 5);
        assert!(!first.closed_event);
        assert!(matches!(m.claim_coins(1), Err(CoreError::AlreadyClaimed)));
        assert!(matches!(m.coins_to_claim(1), Err(CoreError::AlreadyClaimed)));

        let second = m.claim_coins(2).unwrap();
        assert!(second.closed_event);
        assert!(m.current_event().unwrap().is_none());
        assert_eq!(m.last_event().unwrap().map(|e| e.id), Some(event.id));
        assert_eq!(titles(&mut rx), vec!["Event has started!", "Event has ended!"]);
    }

    #[test]
    fn banned_after_allocation_forfeits_share() {
        let (m, _rx) = manager(2);
        m.start_new_event(10, Duration::from_mins(60)).unwrap();
        m.db.lock().unwrap().set_banned("user1", true).unwrap();

        assert!(matches!(m.coins_to_claim(1), Err(CoreError::NotParticipating)));
        assert!(matches!(m.claim_coins(1), Err(CoreError::NotParticipating)));

        // The banned share no longer keeps the event open.
        let claim = m.claim_coins(2).unwrap();
        assert_eq!(claim.coins, 5);
        assert!(claim.closed_event);
    }

    #[test]
    fn early_end_with_no_participants() {
        let (m, _rx) = manager(0);
        m.start_new_event(10, Duration::from_mins(60)).unwrap();
        let ended = m.end_current_event_if_needed().unwrap();
        assert!(ended.is_some());
        assert!(matches!(m.end_current_event_if_needed(), Err(CoreError::EventDoesNotExist)));
    }

    #[test]
    fn early_end_leaves_scheduled_events_alone() {
        let (m, _rx) = manager(0);
        let start = m.now() + chrono::Duration::minutes(10);
        m.schedule_event(10, start, Duration::from_mins(60), false).unwrap();
        assert!(m.end_current_event_if_needed().unwrap().is_none());
        assert!(m.current_event().unwrap().is_some());
    }

    #[test]
    fn announcement_failure_keeps_transition() {
        let (m, rx) = manager(1);
        drop(rx);
        let event = m.start_new_event(10, Duration::from_mins(60)).unwrap();
        assert_eq!(m.current_event().unwrap(), Some(event));
    }
}
