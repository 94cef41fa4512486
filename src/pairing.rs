// Pairing Selector (C6): pick two eligible submissions whose pair has not
// played recently, or claim a queued game if one is waiting.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::db::Database;
use crate::error::ArenaError;

const MAX_PAIRING_TRIES: u32 = 200;

pub struct SelectedPair {
    pub game_id: i64,
    pub submission_ids: [i64; 2],
    /// True if this pair was generated fresh (the game row was just
    /// created as `playing`), false if it was claimed from the queue.
    pub freshly_generated: bool,
}

fn unordered(a: i64, b: i64) -> (i64, i64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Claim a queued game if one exists; otherwise generate a non-recent
/// random pairing from the eligible submission set and insert it as
/// `playing`.
pub async fn select_pair(db: &Database, lookback_seconds: i64, now: i64) -> Result<SelectedPair, ArenaError> {
    if let Some(claimed) = db.claim_queued_game().await? {
        return Ok(SelectedPair {
            game_id: claimed.game_id,
            submission_ids: claimed.submission_ids,
            freshly_generated: false,
        });
    }

    let eligible = db.list_latest_eligible_submissions().await?;
    if eligible.len() < 2 {
        return Err(ArenaError::PairingFailed(
            "fewer than two eligible submissions".to_string(),
        ));
    }

    let recent_games = db.list_recent_games(lookback_seconds, now).await?;
    let recent: HashSet<(i64, i64)> = recent_games
        .iter()
        .filter(|g| g.status != "queued")
        .map(|g| unordered(g.submission_ids[0], g.submission_ids[1]))
        .collect();

    let ids: Vec<i64> = eligible.iter().map(|s| s.id).collect();
    let mut rng = rand::thread_rng();

    for _ in 0..MAX_PAIRING_TRIES {
        let mut sample: Vec<i64> = ids.clone();
        sample.shuffle(&mut rng);
        let left = sample[0];
        let right = sample[rng.gen_range(1..sample.len())];
        if left == right {
            continue;
        }
        if !recent.contains(&unordered(left, right)) {
            let game_id = db.create_playing_game(left, right, now).await?;
            return Ok(SelectedPair {
                game_id,
                submission_ids: [left, right],
                freshly_generated: true,
            });
        }
    }

    Err(ArenaError::PairingFailed(
        "unable to generate non-recent pairing".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn seed_db() -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        for (name, id) in [("Alpha", 1), ("Bravo", 2), ("Charlie", 3)] {
            sqlx::query("INSERT INTO teams (id, name, team_captain_id, is_eligible) VALUES (?, ?, 1, TRUE)")
                .bind(id)
                .bind(name)
                .execute(db.pool())
                .await
                .unwrap();
            sqlx::query(
                "INSERT INTO submissions (id, team_id, version, status, created_at, data) VALUES (?, ?, 1, 'finished', 100, x'00')",
            )
            .bind(id)
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();
        }
        db
    }

    #[test]
    fn test_unordered_pair_is_order_independent() {
        assert_eq!(unordered(1, 2), unordered(2, 1));
    }

    #[tokio::test]
    async fn test_not_enough_eligible_submissions_is_hard_error() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let result = select_pair(&db, 3600, 1000).await;
        assert!(matches!(result, Err(ArenaError::PairingFailed(_))));
    }

    #[tokio::test]
    async fn test_select_pair_claims_queued_game_before_generating() {
        let db = seed_db().await;
        let queued_id = db.create_queued_game(1, 2, 500).await.unwrap();

        let selected = select_pair(&db, 3600, 1000).await.unwrap();
        assert_eq!(selected.game_id, queued_id);
        assert!(!selected.freshly_generated);
    }

    #[tokio::test]
    async fn test_select_pair_avoids_recent_games() {
        let db = seed_db().await;
        // Force the only non-recent pair to be (2, 3) by recording 1v2 and 1v3 as recent.
        let g1 = db.create_playing_game(1, 2, 990).await.unwrap();
        db.set_game_finished(g1, "won", "lost", 1, "http://log/1").await.unwrap();
        let g2 = db.create_playing_game(1, 3, 990).await.unwrap();
        db.set_game_finished(g2, "won", "lost", 1, "http://log/2").await.unwrap();

        let selected = select_pair(&db, 3600, 1000).await.unwrap();
        assert!(selected.freshly_generated);
        let mut ids = selected.submission_ids;
        ids.sort_unstable();
        assert_eq!(ids, [2, 3]);
    }
}
