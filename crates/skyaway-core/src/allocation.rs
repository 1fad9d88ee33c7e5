//! Coin share computation for a starting event.
//!
//! Every eligible user receives `coins / n` plus a random bonus of zero or
//! one coin whenever the pool does not divide evenly. Bonuses are drawn
//! independently per user, so the shares approximate the pool rather than
//! partition it exactly: the total may differ from `coins` by up to one
//! coin per participant.

use rand::Rng;

/// A user eligible for allocation, as selected from the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub user_id: i64,
    pub username: String,
}

/// The coins one candidate is entitled to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub user_id: i64,
    pub username: String,
    pub coins: u64,
}

/// Splits `coins` among `candidates`. No candidates yields no shares.
pub fn allocate<R: Rng + ?Sized>(coins: u64, candidates: &[Candidate], rng: &mut R) -> Vec<Share> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let count = candidates.len() as u64;
    let base = coins / count;
    let uneven = coins % count != 0;

    candidates
        .iter()
        .map(|candidate| {
            let bonus = if uneven { rng.gen_range(0..=1) } else { 0 };
            Share {
                user_id: candidate.user_id,
                username: candidate.username.clone(),
                coins: base + bonus,
            }
        })
        .collect()
}
