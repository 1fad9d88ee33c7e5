//! Announcement hook -- tell the audience about event transitions.
//!
//! The lifecycle manager and the scheduler call [`Announcer::announce`]
//! after a transition has been committed. Delivery is fire-and-forget: a
//! failed announcement is logged by the caller and never undoes the
//! transition.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::AnnounceError;
use crate::event::Event;
use crate::value::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncementKind {
    /// A public event was scheduled.
    Scheduled,
    Started,
    Ended,
    /// A scheduled public event was cancelled before starting.
    Cancelled,
    /// Periodic reminder before a scheduled start.
    UpcomingStart,
    /// Periodic reminder while the event runs.
    Ongoing,
    /// Manual re-announcement of the current event.
    Current,
}

impl AnnouncementKind {
    pub fn title(&self) -> &'static str {
        match self {
            AnnouncementKind::Scheduled => "A new event has been scheduled!",
            AnnouncementKind::Started => "Event has started!",
            AnnouncementKind::Ended => "Event has ended!",
            AnnouncementKind::Cancelled => "The scheduled event has been cancelled",
            AnnouncementKind::UpcomingStart => "Event is scheduled",
            AnnouncementKind::Ongoing => "Event is ongoing",
            AnnouncementKind::Current => "Current event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Announcement {
    pub kind: AnnouncementKind,
    pub event: Event,
}

impl Announcement {
    pub fn new(kind: AnnouncementKind, event: Event) -> Self {
        Self { kind, event }
    }

    pub fn title(&self) -> &'static str {
        self.kind.title()
    }

    /// Plain-text body: title, pool size, start and duration lines.
    pub fn render(&self, now: DateTime<Utc>) -> String {
        let event = &self.event;
        let mut lines = vec![self.title().to_string(), format!("Coins: {}", event.coins)];

        if let Some(started) = event.started_at.get() {
            lines.push(format!(
                "Started: {} ({} ago)",
                started.format("%b %-d %Y, %H:%M:%S %z"),
                humanize(now - started)
            ));
        } else if let Some(scheduled) = event.scheduled_at.get() {
            lines.push(format!(
                "Will start: {} (in {})",
                scheduled.format("%b %-d %Y, %H:%M:%S %z"),
                humanize(scheduled - now)
            ));
        }

        match (event.ended_at.get(), event.ends_at()) {
            (Some(ended), _) => lines.push(format!(
                "Duration: {} (ended {} ago)",
                event.duration,
                humanize(now - ended)
            )),
            (None, Some(ends_at)) => lines.push(format!(
                "Duration: {} (ends in {})",
                event.duration,
                humanize(ends_at - now)
            )),
            (None, None) if !event.duration.is_null() => {
                lines.push(format!("Duration: {}", event.duration))
            }
            (None, None) => {}
        }

        lines.join("\n")
    }
}

/// Whole seconds of a chrono duration in canonical form; negative spans
/// count as zero.
fn humanize(span: chrono::Duration) -> String {
    Duration::from_secs(span.num_seconds().max(0) as u64).to_string()
}

/// Capability to publish announcements.
pub trait Announcer: Send + Sync {
    fn announce(&self, announcement: &Announcement) -> Result<(), AnnounceError>;
}

/// Writes announcements to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAnnouncer;

impl Announcer for LogAnnouncer {
    fn announce(&self, announcement: &Announcement) -> Result<(), AnnounceError> {
        info!(
            event_id = announcement.event.id,
            kind = ?announcement.kind,
            "{}",
            announcement.title()
        );
        Ok(())
    }
}

/// Forwards announcements to an async consumer such as [`WebhookAnnouncer::run`].
#[derive(Debug, Clone)]
pub struct ChannelAnnouncer {
    tx: mpsc::UnboundedSender<Announcement>,
}

impl ChannelAnnouncer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Announcement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Announcer for ChannelAnnouncer {
    fn announce(&self, announcement: &Announcement) -> Result<(), AnnounceError> {
        self.tx
            .send(announcement.clone())
            .map_err(|_| AnnounceError::ChannelClosed)
    }
}

/// Posts announcements as `{"content": "..."}` to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookAnnouncer {
    client: Client,
    url: String,
}

impl WebhookAnnouncer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub async fn post(&self, announcement: &Announcement) -> Result<(), AnnounceError> {
        let body = json!({
            "content": announcement.render(Utc::now()),
            "kind": announcement.kind,
            "event": announcement.event,
        });
        let resp = self.client.post(&self.url).json(&body).send().await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(AnnounceError::Rejected { status, body })
        }
    }

    /// Deliver announcements until every sender is dropped.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Announcement>) {
        while let Some(announcement) = rx.recv().await {
            if let Err(e) = self.post(&announcement).await {
                warn!(event_id = announcement.event.id, "failed to deliver announcement: {e}");
            }
        }
    }
}
