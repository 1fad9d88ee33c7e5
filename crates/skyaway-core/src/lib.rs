//! # Skyaway Core Library
//!
//! This library runs time-boxed coin giveaways. An operator schedules an event
//! with a pool of coins; when it starts the pool is split among every enlisted,
//! non-banned user, each of whom may claim their share once before the event
//! ends.
//!
//! ## Architecture
//!
//! - **Lifecycle**: The only place event state changes. Commits first, then
//!   announces and wakes the scheduler
//! - **Scheduler**: A single-timer loop that starts and ends events on time and
//!   publishes periodic reminders
//! - **Storage**: SQLite persistence with guarded writes, TOML configuration
//! - **Announce**: Pluggable delivery of transition notices (log, channel, webhook)
//!
//! ## Key Components
//!
//! - [`EventManager`]: Lifecycle transitions and the claim protocol
//! - [`Scheduler`]: Timer loop driven by [`RescheduleSignal`]
//! - [`Database`]: Events, participants and the user directory
//! - [`Config`]: Application configuration management
//! - [`Announcer`]: Trait for announcement sinks

pub mod allocation;
pub mod announce;
pub mod clock;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod scheduler;
pub mod storage;
pub mod value;

pub use announce::{Announcement, AnnouncementKind, Announcer, ChannelAnnouncer, LogAnnouncer, WebhookAnnouncer};
pub use clock::{Clock, SystemClock, TokioClock};
pub use error::{AnnounceError, ConfigError, CoreError, DatabaseError, ValidationError};
pub use event::{Event, EventState, Participant, User};
pub use lifecycle::{Claim, EventManager};
pub use scheduler::{next_action, Plan, RescheduleSignal, Scheduler, Task};
pub use storage::{Config, Database, SharedDatabase};
pub use value::{Duration, Timestamp};
