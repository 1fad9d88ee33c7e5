use clap::Subcommand;

use super::{print_json, CmdResult, Context};

#[derive(Subcommand)]
pub enum ClaimAction {
    /// Show how many coins a user may claim
    Check {
        /// User id
        user_id: i64,
    },
    /// Claim a user's coins
    Take {
        /// User id
        user_id: i64,
    },
}

pub async fn run(action: ClaimAction, ctx: &Context) -> CmdResult {
    let session = ctx.session()?;
    let result: CmdResult = match action {
        ClaimAction::Check { user_id } => session
            .manager
            .coins_to_claim(user_id)
            .map(|coins| println!("{coins}"))
            .map_err(Into::into),
        ClaimAction::Take { user_id } => session
            .manager
            .claim_coins(user_id)
            .map_err(Into::into)
            .and_then(|claim| print_json(&claim)),
    };
    session.finish().await;
    result
}
