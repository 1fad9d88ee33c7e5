use clap::Subcommand;
use skyaway_core::User;

use super::{print_json, CmdResult, Context};

#[derive(Subcommand)]
pub enum UserAction {
    /// Add or update a user
    Add {
        /// User id
        id: i64,
        /// Username
        username: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        /// Enlist the user for future events
        #[arg(long)]
        enlist: bool,
        #[arg(long)]
        admin: bool,
    },
    /// Ban a user (by name or id)
    Ban { user: String },
    /// Lift a ban
    Unban { user: String },
    /// Enlist a user for future events
    Enlist { user: String },
    /// Withdraw a user from future events
    Delist { user: String },
    /// List users
    List {
        /// List banned users instead
        #[arg(long)]
        banned: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Count users
    Count {
        /// Count banned users instead
        #[arg(long)]
        banned: bool,
    },
}

pub fn run(action: UserAction, ctx: &Context) -> CmdResult {
    let db = ctx.database()?;
    match action {
        UserAction::Add {
            id,
            username,
            first_name,
            last_name,
            enlist,
            admin,
        } => {
            let user = User {
                id,
                username,
                first_name,
                last_name,
                enlisted: enlist,
                banned: false,
                admin,
            };
            db.put_user(&user)?;
            println!("User saved: {}", user.display_name());
        }
        UserAction::Ban { user } => {
            let user = db.set_banned(&user, true)?;
            println!("User banned: {}", user.display_name());
        }
        UserAction::Unban { user } => {
            let user = db.set_banned(&user, false)?;
            println!("User unbanned: {}", user.display_name());
        }
        UserAction::Enlist { user } => {
            let user = db.set_enlisted(&user, true)?;
            println!("User enlisted: {}", user.display_name());
        }
        UserAction::Delist { user } => {
            let user = db.set_enlisted(&user, false)?;
            println!("User delisted: {}", user.display_name());
        }
        UserAction::List { banned, json } => {
            let users = db.users(banned)?;
            if json {
                print_json(&users)?;
            } else {
                for user in &users {
                    let mark = if user.is_eligible() { "*" } else { " " };
                    println!("{mark} {}", user.display_name());
                }
            }
        }
        UserAction::Count { banned } => println!("{}", db.user_count(banned)?),
    }
    Ok(())
}
