pub mod claim;
pub mod config;
pub mod event;
pub mod run;
pub mod user;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use skyaway_core::{
    Announcer, ChannelAnnouncer, Config, CoreError, Database, EventManager, LogAnnouncer,
    RescheduleSignal, SharedDatabase, WebhookAnnouncer,
};
use tokio::task::JoinHandle;

pub type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Loaded configuration and where it came from.
pub struct Context {
    pub config: Config,
    pub config_path: PathBuf,
}

impl Context {
    pub fn load(path: Option<PathBuf>) -> Result<Self, CoreError> {
        let config_path = match path {
            Some(path) => path,
            None => Config::default_path()?,
        };
        let config = Config::load_from(&config_path)?;
        Ok(Self { config, config_path })
    }

    pub fn database(&self) -> Result<Database, CoreError> {
        Database::open_at(self.config.database_path()?)
    }

    /// Announcement sink per config, with the webhook delivery task if any.
    pub fn announcer(&self) -> (Arc<dyn Announcer>, Option<JoinHandle<()>>) {
        match &self.config.announce.webhook_url {
            Some(url) => {
                let (announcer, rx) = ChannelAnnouncer::new();
                let delivery = tokio::spawn(WebhookAnnouncer::new(url.as_str()).run(rx));
                (Arc::new(announcer), Some(delivery))
            }
            None => (Arc::new(LogAnnouncer), None),
        }
    }

    /// A manager for one command. Call [`Session::finish`] to flush
    /// announcements before exiting.
    pub fn session(&self) -> Result<Session, CoreError> {
        let db: SharedDatabase = self.database()?.into_shared();
        let (announcer, delivery) = self.announcer();
        Ok(Session {
            manager: EventManager::new(db, announcer, RescheduleSignal::new()),
            delivery,
        })
    }
}

pub struct Session {
    pub manager: EventManager,
    delivery: Option<JoinHandle<()>>,
}

impl Session {
    pub async fn finish(self) {
        let Session { manager, delivery } = self;
        drop(manager);
        if let Some(delivery) = delivery {
            let _ = delivery.await;
        }
    }
}

pub fn print_json(value: &impl serde::Serialize) -> CmdResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `null` when there is nothing to show.
pub fn print_optional(value: Option<&impl serde::Serialize>) -> CmdResult {
    match value {
        Some(value) => print_json(value),
        None => print_json(&Value::Null),
    }
}
