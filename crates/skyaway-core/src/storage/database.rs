//! SQLite-backed event store.
//!
//! Provides persistent storage for:
//! - Giveaway events and their lifecycle timestamps
//! - Participant shares and claims
//! - The user directory (see `users.rs`)
//!
//! Every mutation runs in an `IMMEDIATE` transaction and uses a conditional
//! write whose affected-row count decides success, so two writers can never
//! both pass the same guard.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::allocation::{self, Candidate};
use crate::error::{CoreError, DatabaseError, Result, StorageContext};
use crate::event::{Event, Participant};
use crate::value::{Duration, Timestamp};

use super::migrations;

const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// A participant may still claim only while their user is not banned.
const NOT_BANNED: &str =
    "NOT EXISTS (SELECT 1 FROM botuser WHERE botuser.id = participant.user_id AND botuser.banned = 1)";

/// Store handle shared between the scheduler and request handlers.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// SQLite database holding events, participants and users.
pub struct Database {
    pub(super) conn: Connection,
}

impl Database {
    /// Open (creating if needed) the database file at `path`.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: PathBuf::from(path),
            source,
        })?;
        Self::init(conn)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| DatabaseError::OpenFailed {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).during("configure busy timeout")?;
        conn.pragma_update(None, "foreign_keys", true)
            .during("enable foreign keys")?;
        migrations::migrate(&conn)
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// SQLite's `data_version`: changes whenever another connection commits.
    pub fn data_version(&self) -> Result<i64> {
        self.conn
            .query_row("PRAGMA data_version", [], |row| row.get(0))
            .during("read data version")
    }

    fn begin(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .during("begin transaction")
    }

    // ── Events ───────────────────────────────────────────────────────

    /// The event with `ended_at` unset, if any.
    pub fn current_event(&self) -> Result<Option<Event>> {
        select_current(&self.conn)
    }

    /// The most recent event that started and ended.
    pub fn last_event(&self) -> Result<Option<Event>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM event
                     WHERE ended_at IS NOT NULL AND started_at IS NOT NULL
                     ORDER BY id DESC LIMIT 1",
                    Event::COLUMNS
                ),
                [],
                Event::from_row,
            )
            .optional()
            .during("select last event")
    }

    pub fn event(&self, id: i64) -> Result<Option<Event>> {
        select_by_id(&self.conn, id)
    }

    /// Insert an event that starts at `start_at`. No participants yet.
    ///
    /// # Errors
    /// `EventExists` if a current event exists.
    pub fn schedule_event(
        &mut self,
        coins: u64,
        start_at: DateTime<Utc>,
        duration: Duration,
        surprise: bool,
    ) -> Result<Event> {
        let tx = self.begin()?;
        let id = insert_current(
            &tx,
            coins,
            duration,
            Timestamp::at(start_at),
            Timestamp::NULL,
            surprise,
        )?;
        let event = require(select_by_id(&tx, id)?)?;
        tx.commit().during("commit scheduled event")?;
        Ok(event)
    }

    /// Insert an event that starts at `now` and allocate its participants,
    /// all in one transaction.
    ///
    /// # Errors
    /// `EventExists` if a current event exists.
    pub fn start_new_event<R: Rng + ?Sized>(
        &mut self,
        coins: u64,
        duration: Duration,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<Event> {
        let tx = self.begin()?;
        let id = insert_current(&tx, coins, duration, Timestamp::NULL, Timestamp::at(now), true)?;
        let event = require(select_by_id(&tx, id)?)?;
        add_participants(&tx, &event, rng)?;
        tx.commit().during("commit started event")?;
        Ok(event)
    }

    /// Promote a scheduled event: set `started_at = now` and allocate its
    /// participants in one transaction.
    ///
    /// # Errors
    /// `EventAlreadyStarted` / `EventAlreadyEnded` if the stored event has
    /// moved on, `EventDoesNotExist` if it is gone.
    pub fn start_event<R: Rng + ?Sized>(
        &mut self,
        event: &mut Event,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<()> {
        if event.started_at.is_set() {
            return Err(CoreError::EventAlreadyStarted);
        }
        if event.ended_at.is_set() {
            return Err(CoreError::EventAlreadyEnded);
        }

        let started_at = Timestamp::at(now);
        let tx = self.begin()?;
        let updated = tx
            .execute(
                "UPDATE event SET started_at = ?1
                 WHERE id = ?2 AND started_at IS NULL AND ended_at IS NULL",
                params![started_at, event.id],
            )
            .during("update event start")?;
        if updated == 0 {
            return Err(match select_by_id(&tx, event.id)? {
                None => CoreError::EventDoesNotExist,
                Some(stored) if stored.ended_at.is_set() => CoreError::EventAlreadyEnded,
                Some(_) => CoreError::EventAlreadyStarted,
            });
        }

        let mut started = event.clone();
        started.started_at = started_at;
        add_participants(&tx, &started, rng)?;
        tx.commit().during("commit event start")?;

        *event = started;
        Ok(())
    }

    /// Set `ended_at = now`.
    ///
    /// # Errors
    /// `EventAlreadyEnded` if the event was already ended, `EventDoesNotExist`
    /// if it is gone.
    pub fn end_event(&mut self, event: &mut Event, now: DateTime<Utc>) -> Result<()> {
        if event.ended_at.is_set() {
            return Err(CoreError::EventAlreadyEnded);
        }

        let ended_at = Timestamp::at(now);
        let tx = self.begin()?;
        let updated = tx
            .execute(
                "UPDATE event SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
                params![ended_at, event.id],
            )
            .during("update event end")?;
        if updated == 0 {
            return Err(match select_by_id(&tx, event.id)? {
                None => CoreError::EventDoesNotExist,
                Some(_) => CoreError::EventAlreadyEnded,
            });
        }
        tx.commit().during("commit event end")?;

        event.ended_at = ended_at;
        Ok(())
    }

    // ── Participants ─────────────────────────────────────────────────

    pub fn participants(&self, event_id: i64) -> Result<Vec<Participant>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM participant WHERE event_id = ?1 ORDER BY user_id",
                Participant::COLUMNS
            ))
            .during("prepare participant query")?;
        let rows = stmt
            .query_map(params![event_id], Participant::from_row)
            .during("select participants")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .during("read participants")
    }

    pub fn coins_claimed(&self, event: &Event) -> Result<u64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(coins), 0) FROM participant
                 WHERE event_id = ?1 AND claimed_at IS NOT NULL",
                params![event.id],
                |row| row.get(0),
            )
            .during("count claimed coins")
    }

    /// Pool size minus what has been claimed, floored at zero.
    pub fn coins_unclaimed(&self, event: &Event) -> Result<u64> {
        Ok(event.coins.saturating_sub(self.coins_claimed(event)?))
    }

    /// Participants that have not claimed yet and still may.
    pub fn claimers_left(&self, event: &Event) -> Result<u64> {
        self.conn
            .query_row(
                &format!(
                    "SELECT COUNT(user_id) FROM participant
                     WHERE event_id = ?1 AND claimed_at IS NULL AND {NOT_BANNED}"
                ),
                params![event.id],
                |row| row.get(0),
            )
            .during("count claimers")
    }

    /// The coins `user_id` may still claim in `event_id`.
    ///
    /// # Errors
    /// `NotParticipating` if the user has no share or has been banned since
    /// allocation, `AlreadyClaimed` if it was claimed.
    pub fn get_coins_to_claim(&self, user_id: i64, event_id: i64) -> Result<u64> {
        let row: Option<(u64, Timestamp)> = self
            .conn
            .query_row(
                &format!(
                    "SELECT coins, claimed_at FROM participant
                     WHERE user_id = ?1 AND event_id = ?2 AND {NOT_BANNED}"
                ),
                params![user_id, event_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .during("select coins to claim")?;

        match row {
            None => Err(CoreError::NotParticipating),
            Some((_, claimed_at)) if claimed_at.is_set() => Err(CoreError::AlreadyClaimed),
            Some((coins, _)) => Ok(coins),
        }
    }

    /// Mark the share of `user_id` in `event_id` as claimed at `now` and
    /// return its coins. Only the first claim succeeds, and banned users
    /// count as not participating.
    pub fn claim_coins(&mut self, user_id: i64, event_id: i64, now: DateTime<Utc>) -> Result<u64> {
        let tx = self.begin()?;
        let updated = tx
            .execute(
                &format!(
                    "UPDATE participant SET claimed_at = ?1
                     WHERE user_id = ?2 AND event_id = ?3 AND claimed_at IS NULL AND {NOT_BANNED}"
                ),
                params![Timestamp::at(now), user_id, event_id],
            )
            .during("claim coins")?;

        let coins: Option<u64> = tx
            .query_row(
                &format!(
                    "SELECT coins FROM participant
                     WHERE user_id = ?1 AND event_id = ?2 AND {NOT_BANNED}"
                ),
                params![user_id, event_id],
                |row| row.get(0),
            )
            .optional()
            .during("select claimed coins")?;

        match (updated, coins) {
            (_, None) => Err(CoreError::NotParticipating),
            (0, Some(_)) => Err(CoreError::AlreadyClaimed),
            (_, Some(coins)) => {
                tx.commit().during("commit claim")?;
                Ok(coins)
            }
        }
    }
}

fn require(event: Option<Event>) -> Result<Event> {
    event.ok_or(CoreError::EventDoesNotExist)
}

fn select_current(conn: &Connection) -> Result<Option<Event>> {
    conn.query_row(
        &format!("SELECT {} FROM event WHERE ended_at IS NULL", Event::COLUMNS),
        [],
        Event::from_row,
    )
    .optional()
    .during("select current event")
}

fn select_by_id(conn: &Connection, id: i64) -> Result<Option<Event>> {
    conn.query_row(
        &format!("SELECT {} FROM event WHERE id = ?1", Event::COLUMNS),
        params![id],
        Event::from_row,
    )
    .optional()
    .during("select event")
}

/// Insert a new current event unless one already exists.
fn insert_current(
    tx: &Transaction<'_>,
    coins: u64,
    duration: Duration,
    scheduled_at: Timestamp,
    started_at: Timestamp,
    surprise: bool,
) -> Result<i64> {
    let inserted = tx
        .execute(
            "INSERT INTO event (coins, duration, scheduled_at, started_at, surprise)
             SELECT ?1, ?2, ?3, ?4, ?5
             WHERE NOT EXISTS (SELECT 1 FROM event WHERE ended_at IS NULL)",
            params![coins, duration, scheduled_at, started_at, surprise],
        )
        .during("insert event")?;
    if inserted == 0 {
        return Err(CoreError::EventExists);
    }
    Ok(tx.last_insert_rowid())
}

/// Allocate shares of `event` to every enlisted, non-banned user.
fn add_participants<R: Rng + ?Sized>(
    tx: &Transaction<'_>,
    event: &Event,
    rng: &mut R,
) -> Result<usize> {
    let candidates = {
        let mut stmt = tx
            .prepare("SELECT id, username FROM botuser WHERE banned = 0 AND enlisted = 1 ORDER BY id")
            .during("prepare eligible user query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Candidate {
                    user_id: row.get(0)?,
                    username: row.get(1)?,
                })
            })
            .during("select eligible users")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .during("read eligible users")?
    };

    let shares = allocation::allocate(event.coins, &candidates, rng);
    let mut stmt = tx
        .prepare(
            "INSERT INTO participant (event_id, user_id, username, coins)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .during("prepare participant insert")?;
    for share in &shares {
        stmt.execute(params![event.id, share.user_id, share.username, share.coins])
            .during("add participant")?;
    }
    Ok(shares.len())
}
