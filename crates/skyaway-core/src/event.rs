//! Giveaway records: events, their participants, and directory users.
//!
//! ## State Transitions
//!
//! ```text
//! Scheduled -> Started -> Ended
//!     \____________________/
//!           (cancelled)
//! ```

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::value::{Duration, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Scheduled,
    Started,
    Ended,
}

/// A giveaway campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub coins: u64,
    pub duration: Duration,
    pub scheduled_at: Timestamp,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub surprise: bool,
}

impl Event {
    pub(crate) const COLUMNS: &'static str =
        "id, coins, duration, scheduled_at, started_at, ended_at, surprise";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            coins: row.get(1)?,
            duration: row.get(2)?,
            scheduled_at: row.get(3)?,
            started_at: row.get(4)?,
            ended_at: row.get(5)?,
            surprise: row.get(6)?,
        })
    }

    pub fn state(&self) -> EventState {
        if self.ended_at.is_set() {
            EventState::Ended
        } else if self.started_at.is_set() {
            EventState::Started
        } else {
            EventState::Scheduled
        }
    }

    /// When a started event runs out of time. `None` for scheduled events,
    /// for events without a duration, and when the end is past the
    /// representable range.
    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        let started = self.started_at.get()?;
        started.checked_add_signed(self.duration.to_chrono()?)
    }
}

/// One user's share in one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub event_id: i64,
    pub user_id: i64,
    pub username: String,
    pub coins: u64,
    pub claimed_at: Timestamp,
}

impl Participant {
    pub(crate) const COLUMNS: &'static str = "event_id, user_id, username, coins, claimed_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            user_id: row.get(1)?,
            username: row.get(2)?,
            coins: row.get(3)?,
            claimed_at: row.get(4)?,
        })
    }

    pub fn has_claimed(&self) -> bool {
        self.claimed_at.is_set()
    }
}

/// A member of the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_name: String,
    pub enlisted: bool,
    pub banned: bool,
    pub admin: bool,
}

impl User {
    pub(crate) const COLUMNS: &'static str =
        "id, username, first_name, last_name, enlisted, banned, admin";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            enlisted: row.get(4)?,
            banned: row.get(5)?,
            admin: row.get(6)?,
        })
    }

    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.enlisted && !self.banned
    }

    /// Username (or id when hidden) followed by status tags.
    pub fn display_name(&self) -> String {
        let mut tags = Vec::new();
        if self.banned {
            tags.push("banned");
        }
        if self.admin {
            tags.push("admin");
        }

        let name = if self.username.is_empty() {
            self.id.to_string()
        } else {
            self.username.clone()
        };

        if tags.is_empty() {
            name
        } else {
            format!("{name} ({})", tags.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event() -> Event {
        Event {
            id: 1,
            coins: 100,
            duration: Duration::from_mins(60),
            scheduled_at: Timestamp::NULL,
            started_at: Timestamp::NULL,
            ended_at: Timestamp::NULL,
            surprise: false,
        }
    }

    #[test]
    fn state_follows_timestamps() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let mut e = event();
        e.scheduled_at = Timestamp::at(t);
        assert_eq!(e.state(), EventState::Scheduled);
        assert_eq!(e.ends_at(), None);

        e.started_at = Timestamp::at(t);
        assert_eq!(e.state(), EventState::Started);
        assert_eq!(e.ends_at(), Some(t + chrono::Duration::hours(1)));

        e.ended_at = Timestamp::at(t);
        assert_eq!(e.state(), EventState::Ended);
    }

    #[test]
    fn null_duration_never_ends_on_its_own() {
        let mut e = event();
        e.duration = Duration::NULL;
        e.started_at = Timestamp::at(Utc::now());
        assert_eq!(e.ends_at(), None);
    }

    #[test]
    fn unrepresentable_end_is_none() {
        let mut e = event();
        e.started_at = Timestamp::at(Utc::now());
        e.duration = Duration::from_secs(3_000_000_000 * 3600);
        assert_eq!(e.ends_at(), None);
    }

    #[test]
    fn display_name_tags() {
        let mut u = User::new(42, "");
        assert_eq!(u.display_name(), "42");
        u.username = "alice".into();
        u.banned = true;
        u.admin = true;
        assert_eq!(u.display_name(), "alice (banned, admin)");
    }
}
