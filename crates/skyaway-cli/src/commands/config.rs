use clap::Subcommand;

use super::{print_json, CmdResult, Context};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key (e.g. "event.default_duration", "log.level")
        key: String,
    },
    /// Set a config value
    Set {
        /// Config key
        key: String,
        /// New value ("null" clears optional values)
        value: String,
    },
    /// Show the whole config
    Show,
}

pub fn run(action: ConfigAction, ctx: Context) -> CmdResult {
    let Context {
        mut config,
        config_path,
    } = ctx;
    match action {
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{value}"),
            None => return Err(format!("unknown key: {key}").into()),
        },
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save_to(&config_path)?;
            println!("ok");
        }
        ConfigAction::Show => print_json(&config)?,
    }
    Ok(())
}
