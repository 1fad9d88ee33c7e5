use chrono::{DateTime, Utc};
use clap::Subcommand;
use skyaway_core::{Duration, EventManager, Participant};

use super::{print_json, print_optional, CmdResult, Context};

#[derive(Subcommand)]
pub enum EventAction {
    /// Schedule an event
    Schedule {
        /// Coins in the pool
        coins: u64,
        /// Start time, RFC 3339 or an offset such as "+10m"
        start: String,
        /// Event duration, e.g. "1h30m" or "1.5" (hours)
        duration: Option<String>,
        /// Do not announce before the event starts
        #[arg(long)]
        surprise: bool,
    },
    /// Start an event right away
    Start {
        /// Coins in the pool
        coins: u64,
        /// Event duration, e.g. "1h30m" or "1.5" (hours)
        duration: Option<String>,
    },
    /// Stop the running event
    Stop,
    /// Cancel the scheduled event
    Cancel,
    /// Show the current event
    Current,
    /// Show the last finished event
    Last,
    /// Re-announce the current event
    Announce,
    /// List participants of an event
    Winners {
        /// "current", "last" or an event id
        #[arg(default_value = "current")]
        which: String,
    },
}

pub async fn run(action: EventAction, ctx: &Context) -> CmdResult {
    let session = ctx.session()?;
    let result = dispatch(action, &session.manager, ctx);
    session.finish().await;
    result
}

fn dispatch(action: EventAction, manager: &EventManager, ctx: &Context) -> CmdResult {
    match action {
        EventAction::Schedule {
            coins,
            start,
            duration,
            surprise,
        } => {
            let start_at = parse_start(&start, manager.now())?;
            let duration = duration_or_default(duration, ctx)?;
            let event = manager.schedule_event(coins, start_at, duration, surprise)?;
            print_json(&event)?;
        }
        EventAction::Start { coins, duration } => {
            let duration = duration_or_default(duration, ctx)?;
            let event = manager.start_new_event(coins, duration)?;
            print_json(&event)?;
        }
        EventAction::Stop => print_json(&manager.stop_event()?)?,
        EventAction::Cancel => print_json(&manager.cancel_scheduled_event()?)?,
        EventAction::Current => print_optional(manager.current_event()?.as_ref())?,
        EventAction::Last => print_optional(manager.last_event()?.as_ref())?,
        EventAction::Announce => print_json(&manager.announce_current_event()?)?,
        EventAction::Winners { which } => {
            let participants = winners(manager, &which)?;
            print_json(&participants)?;
        }
    }
    Ok(())
}

fn winners(manager: &EventManager, which: &str) -> Result<Vec<Participant>, Box<dyn std::error::Error>> {
    let event_id = match which {
        "current" => manager.current_event()?.map(|e| e.id),
        "last" => manager.last_event()?.map(|e| e.id),
        id => {
            let id = id.parse::<i64>().map_err(|_| format!("invalid event: {id}"))?;
            manager.event(id)?.map(|e| e.id)
        }
    };
    match event_id {
        Some(id) => Ok(manager.participants(id)?),
        None => Err(format!("no {which} event").into()),
    }
}

fn duration_or_default(duration: Option<String>, ctx: &Context) -> Result<Duration, Box<dyn std::error::Error>> {
    match duration {
        Some(text) => Ok(text.parse::<Duration>()?),
        None => Ok(ctx.config.event.default_duration),
    }
}

/// `+<duration>` is relative to `now`; anything else must be RFC 3339.
fn parse_start(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, Box<dyn std::error::Error>> {
    if let Some(offset) = text.strip_prefix('+') {
        let offset = offset
            .parse::<Duration>()?
            .to_chrono()
            .ok_or_else(|| format!("invalid offset: {text}"))?;
        return now
            .checked_add_signed(offset)
            .ok_or_else(|| format!("start is out of range: {text}").into());
    }
    Ok(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_start_accepts_offsets_and_rfc3339() {
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap();
        assert_eq!(parse_start("+10m", now).unwrap(), now + chrono::Duration::minutes(10));
        assert_eq!(
            parse_start("2026-04-01T12:00:00+02:00", now).unwrap(),
            Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).unwrap()
        );
        assert!(parse_start("tomorrow", now).is_err());
        assert!(parse_start("+3000000000000h", now).is_err());
    }
}
