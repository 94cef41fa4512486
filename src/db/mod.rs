// Database access layer: typed queries/updates against the
// teams/submissions/games/games_submissions tables. The only place SQL lives.

use sqlx::any::{AnyKind, AnyPoolOptions};
use sqlx::{AnyPool, Row};

use crate::error::{ArenaError, TransientError};

/// The BYE sentinel's id as it would appear if persisted to a DB row.
/// Never actually written — the bracket engine models BYE as `Side::Bye`
/// (see `bracket::Side`) precisely to avoid id collisions with this
/// sentinel; kept here only to document the external data model's -1
/// convention referenced in spec discussions of the submissions table.
pub const BYE_SUBMISSION_ID: i64 = -1;

#[derive(Debug, Clone)]
pub struct EligibleSubmission {
    pub id: i64,
    pub team_name: String,
    pub version: i64,
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub id: i64,
    pub team_name: String,
    pub version: i64,
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct GameSummary {
    pub id: i64,
    pub status: String,
    pub submission_ids: [i64; 2],
}

#[derive(Debug, Clone)]
pub struct GameRecord {
    pub id: i64,
    pub status: String,
    pub winner_id: Option<i64>,
    pub win_reason: Option<String>,
    pub lose_reason: Option<String>,
    pub log_url: Option<String>,
    pub submission_ids: [i64; 2],
}

#[derive(Debug, Clone)]
pub struct ClaimedGame {
    pub game_id: i64,
    pub submission_ids: [i64; 2],
}

#[derive(Debug, Clone)]
pub struct ReusableGame {
    pub id: i64,
    pub winner_id: Option<i64>,
    pub log_url: Option<String>,
    pub status: String,
}

pub struct Database {
    pool: AnyPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, ArenaError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(TransientError::from)?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    fn is_postgres(&self) -> bool {
        self.pool.any_kind() == AnyKind::Postgres
    }

    /// Raw pool access for test fixtures that need to seed `teams`/
    /// `submissions` rows — tables the arena only ever reads, never writes,
    /// so there is no repository method to insert them.
    #[cfg(test)]
    pub(crate) fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Insert one eligible team with one finished submission. Tables the
    /// arena never writes in production (they are owned by the submission
    /// database) but that integration tests need to seed to exercise
    /// `list_latest_eligible_submissions` and the pairing selector against
    /// a real `AnyPool` without reaching into crate-private internals. Gated
    /// behind `test-support` so it never ships in a production build.
    #[cfg(feature = "test-support")]
    pub async fn seed_team_with_submission(&self, team_id: i64, team_name: &str, submission_id: i64) -> Result<(), ArenaError> {
        sqlx::query("INSERT INTO teams (id, name, team_captain_id, is_eligible) VALUES (?, ?, 1, TRUE)")
            .bind(team_id)
            .bind(team_name)
            .execute(&self.pool)
            .await
            .map_err(TransientError::from)?;
        sqlx::query(
            "INSERT INTO submissions (id, team_id, version, status, created_at, data) VALUES (?, ?, 1, 'finished', 100, x'00')",
        )
        .bind(submission_id)
        .bind(team_id)
        .execute(&self.pool)
        .await
        .map_err(TransientError::from)?;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), ArenaError> {
        let pk = if self.is_postgres() {
            "id SERIAL PRIMARY KEY"
        } else {
            "id INTEGER PRIMARY KEY AUTOINCREMENT"
        };

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS teams (
                {pk},
                name TEXT NOT NULL,
                team_captain_id BIGINT,
                is_eligible BOOLEAN NOT NULL DEFAULT TRUE
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(TransientError::from)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS submissions (
                {pk},
                team_id BIGINT NOT NULL,
                version BIGINT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                created_at BIGINT NOT NULL,
                data BLOB,
                log_url TEXT
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(TransientError::from)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS games (
                {pk},
                status TEXT NOT NULL DEFAULT 'queued',
                winner_id BIGINT,
                win_reason TEXT,
                lose_reason TEXT,
                log_url TEXT,
                created_at BIGINT NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(TransientError::from)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS games_submissions (
                game_id BIGINT NOT NULL,
                submission_id BIGINT NOT NULL,
                output_url TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(TransientError::from)?;

        Ok(())
    }

    // ── Teams / Submissions ──────────────────────────────────────────

    /// Each eligible team's latest non-failed submission.
    pub async fn list_latest_eligible_submissions(
        &self,
    ) -> Result<Vec<EligibleSubmission>, ArenaError> {
        let rows = sqlx::query(
            "SELECT s.id, t.name, s.version, s.status, s.created_at
             FROM submissions s
             JOIN teams t ON t.id = s.team_id
             WHERE t.team_captain_id IS NOT NULL
               AND t.is_eligible = TRUE
               AND s.status <> 'failed'
               AND s.version = (
                   SELECT MAX(s2.version) FROM submissions s2
                   WHERE s2.team_id = s.team_id AND s2.status <> 'failed'
               )
             ORDER BY s.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(TransientError::from)?;

        Ok(rows
            .into_iter()
            .map(|r| EligibleSubmission {
                id: r.get::<i64, _>("id"),
                team_name: r.get::<String, _>("name"),
                version: r.get::<i64, _>("version"),
                status: r.get::<String, _>("status"),
                created_at: r.get::<i64, _>("created_at"),
            })
            .collect())
    }

    pub async fn list_all_submissions(&self) -> Result<Vec<SubmissionRecord>, ArenaError> {
        let rows = sqlx::query(
            "SELECT s.id, t.name, s.version, s.status, s.created_at
             FROM submissions s
             JOIN teams t ON t.id = s.team_id
             ORDER BY s.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(TransientError::from)?;

        Ok(rows
            .into_iter()
            .map(|r| SubmissionRecord {
                id: r.get::<i64, _>("id"),
                team_name: r.get::<String, _>("name"),
                version: r.get::<i64, _>("version"),
                status: r.get::<String, _>("status"),
                created_at: r.get::<i64, _>("created_at"),
            })
            .collect())
    }

    pub async fn load_submission_blob(&self, id: i64) -> Result<Vec<u8>, ArenaError> {
        let row = sqlx::query("SELECT data FROM submissions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(TransientError::from)?
            .ok_or_else(|| ArenaError::Structural(format!("submission {id} not found")))?;
        Ok(row.get::<Vec<u8>, _>("data"))
    }

    pub async fn set_submission_status(
        &self,
        id: i64,
        status: &str,
        log_url: Option<&str>,
    ) -> Result<(), ArenaError> {
        sqlx::query("UPDATE submissions SET status = ?, log_url = ? WHERE id = ?")
            .bind(status)
            .bind(log_url)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(TransientError::from)?;
        Ok(())
    }

    // ── Games ─────────────────────────────────────────────────────────

    pub async fn list_recent_games(&self, lookback_seconds: i64, now: i64) -> Result<Vec<GameSummary>, ArenaError> {
        let since = now - lookback_seconds;
        let rows = sqlx::query(
            "SELECT g.id, g.status, gs.submission_id
             FROM games g
             JOIN games_submissions gs ON gs.game_id = g.id
             WHERE g.created_at >= ?
             ORDER BY g.id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(TransientError::from)?;

        let mut by_game: std::collections::BTreeMap<i64, (String, Vec<i64>)> =
            std::collections::BTreeMap::new();
        for r in rows {
            let id: i64 = r.get("id");
            let status: String = r.get("status");
            let sub_id: i64 = r.get("submission_id");
            let entry = by_game.entry(id).or_insert_with(|| (status, Vec::new()));
            entry.1.push(sub_id);
        }

        Ok(by_game
            .into_iter()
            .filter_map(|(id, (status, subs))| {
                if subs.len() == 2 {
                    Some(GameSummary {
                        id,
                        status,
                        submission_ids: [subs[0], subs[1]],
                    })
                } else {
                    None
                }
            })
            .collect())
    }

    pub async fn get_game(&self, id: i64) -> Result<Option<GameRecord>, ArenaError> {
        let row = sqlx::query(
            "SELECT id, status, winner_id, win_reason, lose_reason, log_url FROM games WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(TransientError::from)?;

        let Some(row) = row else { return Ok(None) };

        let sub_rows = sqlx::query(
            "SELECT submission_id FROM games_submissions WHERE game_id = ? ORDER BY submission_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(TransientError::from)?;

        if sub_rows.len() != 2 {
            return Err(ArenaError::Structural(format!(
                "game {id} does not have exactly two games_submissions rows"
            )));
        }

        Ok(Some(GameRecord {
            id: row.get("id"),
            status: row.get("status"),
            winner_id: row.get("winner_id"),
            win_reason: row.get("win_reason"),
            lose_reason: row.get("lose_reason"),
            log_url: row.get("log_url"),
            submission_ids: [
                sub_rows[0].get::<i64, _>("submission_id"),
                sub_rows[1].get::<i64, _>("submission_id"),
            ],
        }))
    }

    /// Atomically pick the lowest-id queued game, flip it to playing, and
    /// return its pair of submission ids. Multiple runners racing this call
    /// never receive the same row.
    pub async fn claim_queued_game(&self) -> Result<Option<ClaimedGame>, ArenaError> {
        let mut tx = self.pool.begin().await.map_err(TransientError::from)?;

        let candidate: Option<i64> = if self.is_postgres() {
            sqlx::query(
                "SELECT id FROM games WHERE status = 'queued' ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED",
            )
            .fetch_optional(&mut *tx)
            .await
            .map_err(TransientError::from)?
            .map(|r| r.get::<i64, _>("id"))
        } else {
            sqlx::query("SELECT id FROM games WHERE status = 'queued' ORDER BY id LIMIT 1")
                .fetch_optional(&mut *tx)
                .await
                .map_err(TransientError::from)?
                .map(|r| r.get::<i64, _>("id"))
        };

        let Some(game_id) = candidate else {
            tx.commit().await.map_err(TransientError::from)?;
            return Ok(None);
        };

        let result = sqlx::query("UPDATE games SET status = 'playing' WHERE id = ? AND status = 'queued'")
            .bind(game_id)
            .execute(&mut *tx)
            .await
            .map_err(TransientError::from)?;

        if result.rows_affected() != 1 {
            // Another claimer won the race (non-postgres path, no row lock).
            tx.rollback().await.map_err(TransientError::from)?;
            return Ok(None);
        }

        let sub_rows = sqlx::query(
            "SELECT submission_id FROM games_submissions WHERE game_id = ? ORDER BY submission_id",
        )
        .bind(game_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(TransientError::from)?;

        tx.commit().await.map_err(TransientError::from)?;

        if sub_rows.len() != 2 {
            return Err(ArenaError::Structural(format!(
                "game {game_id} claimed without exactly two games_submissions rows"
            )));
        }

        Ok(Some(ClaimedGame {
            game_id,
            submission_ids: [
                sub_rows[0].get::<i64, _>("submission_id"),
                sub_rows[1].get::<i64, _>("submission_id"),
            ],
        }))
    }

    async fn insert_game(
        &self,
        status: &str,
        left: i64,
        right: i64,
        now: i64,
    ) -> Result<i64, ArenaError> {
        let mut tx = self.pool.begin().await.map_err(TransientError::from)?;

        let row = sqlx::query("INSERT INTO games (status, created_at) VALUES (?, ?) RETURNING id")
            .bind(status)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(TransientError::from)?;
        let game_id: i64 = row.get("id");

        for submission_id in [left, right] {
            sqlx::query("INSERT INTO games_submissions (game_id, submission_id) VALUES (?, ?)")
                .bind(game_id)
                .bind(submission_id)
                .execute(&mut *tx)
                .await
                .map_err(TransientError::from)?;
        }

        tx.commit().await.map_err(TransientError::from)?;
        Ok(game_id)
    }

    pub async fn create_playing_game(&self, left: i64, right: i64, now: i64) -> Result<i64, ArenaError> {
        self.insert_game("playing", left, right, now).await
    }

    pub async fn create_queued_game(&self, left: i64, right: i64, now: i64) -> Result<i64, ArenaError> {
        self.insert_game("queued", left, right, now).await
    }

    pub async fn set_game_finished(
        &self,
        id: i64,
        win_reason: &str,
        lose_reason: &str,
        winner_id: i64,
        log_url: &str,
    ) -> Result<(), ArenaError> {
        sqlx::query(
            "UPDATE games SET status = 'finished', win_reason = ?, lose_reason = ?, winner_id = ?, log_url = ? WHERE id = ?",
        )
        .bind(win_reason)
        .bind(lose_reason)
        .bind(winner_id)
        .bind(log_url)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(TransientError::from)?;
        Ok(())
    }

    pub async fn set_game_failed(&self, id: i64, reason: &str) -> Result<(), ArenaError> {
        sqlx::query(
            "UPDATE games SET status = 'failed', win_reason = ?, lose_reason = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(TransientError::from)?;
        Ok(())
    }

    pub async fn set_game_submission_output(
        &self,
        game_id: i64,
        submission_id: i64,
        url: &str,
    ) -> Result<(), ArenaError> {
        sqlx::query(
            "UPDATE games_submissions SET output_url = ? WHERE game_id = ? AND submission_id = ?",
        )
        .bind(url)
        .bind(game_id)
        .bind(submission_id)
        .execute(&self.pool)
        .await
        .map_err(TransientError::from)?;
        Ok(())
    }

    /// Highest-id finished game pairing exactly these two submissions,
    /// excluding any id already attached elsewhere in the bracket.
    pub async fn find_reusable_finished_game(
        &self,
        left: i64,
        right: i64,
        excluded_ids: &[i64],
    ) -> Result<Option<ReusableGame>, ArenaError> {
        let rows = sqlx::query(
            "SELECT g.id, g.status, g.winner_id, g.log_url, gs.submission_id
             FROM games g
             JOIN games_submissions gs ON gs.game_id = g.id
             WHERE g.status = 'finished'
             ORDER BY g.id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(TransientError::from)?;

        let mut by_game: std::collections::BTreeMap<i64, (String, Option<i64>, Option<String>, Vec<i64>)> =
            std::collections::BTreeMap::new();
        for r in rows {
            let id: i64 = r.get("id");
            let status: String = r.get("status");
            let winner_id: Option<i64> = r.get("winner_id");
            let log_url: Option<String> = r.get("log_url");
            let sub_id: i64 = r.get("submission_id");
            let entry = by_game
                .entry(id)
                .or_insert_with(|| (status, winner_id, log_url, Vec::new()));
            entry.3.push(sub_id);
        }

        let wanted = {
            let mut pair = [left, right];
            pair.sort_unstable();
            pair
        };

        let mut best: Option<i64> = None;
        let mut best_record: Option<ReusableGame> = None;
        for (id, (status, winner_id, log_url, mut subs)) in by_game {
            if excluded_ids.contains(&id) || subs.len() != 2 {
                continue;
            }
            subs.sort_unstable();
            if subs != wanted {
                continue;
            }
            if best.map_or(true, |b| id > b) {
                best = Some(id);
                best_record = Some(ReusableGame {
                    id,
                    winner_id,
                    log_url,
                    status,
                });
            }
        }

        Ok(best_record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        sqlx::query("INSERT INTO teams (name, team_captain_id, is_eligible) VALUES ('Alpha', 1, TRUE)")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO teams (name, team_captain_id, is_eligible) VALUES ('Bravo', 1, TRUE)")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO submissions (team_id, version, status, created_at, data) VALUES (1, 1, 'finished', 100, x'00')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO submissions (team_id, version, status, created_at, data) VALUES (2, 1, 'finished', 100, x'00')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_list_latest_eligible_submissions() {
        let db = test_db().await;
        let subs = db.list_latest_eligible_submissions().await.unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].team_name, "Alpha");
        assert_eq!(subs[1].team_name, "Bravo");
    }

    #[tokio::test]
    async fn test_newer_version_shadows_older() {
        let db = test_db().await;
        sqlx::query(
            "INSERT INTO submissions (team_id, version, status, created_at, data) VALUES (1, 2, 'finished', 200, x'00')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let subs = db.list_latest_eligible_submissions().await.unwrap();
        let alpha = subs.iter().find(|s| s.team_name == "Alpha").unwrap();
        assert_eq!(alpha.version, 2);
    }

    #[tokio::test]
    async fn test_failed_latest_does_not_shadow_prior_finished() {
        let db = test_db().await;
        sqlx::query(
            "INSERT INTO submissions (team_id, version, status, created_at, data) VALUES (1, 2, 'failed', 200, x'00')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let subs = db.list_latest_eligible_submissions().await.unwrap();
        let alpha = subs.iter().find(|s| s.team_name == "Alpha").unwrap();
        assert_eq!(alpha.version, 1);
    }

    #[tokio::test]
    async fn test_create_and_claim_queued_game() {
        let db = test_db().await;
        let id = db.create_queued_game(1, 2, 1000).await.unwrap();

        let claimed = db.claim_queued_game().await.unwrap().unwrap();
        assert_eq!(claimed.game_id, id);
        let mut ids = claimed.submission_ids;
        ids.sort_unstable();
        assert_eq!(ids, [1, 2]);

        assert!(db.claim_queued_game().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_distinct() {
        let db = std::sync::Arc::new(test_db().await);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(db.create_queued_game(1, 2, 1000).await.unwrap());
        }

        let mut handles = Vec::new();
        for _ in 0..5 {
            let db = db.clone();
            handles.push(tokio::spawn(async move { db.claim_queued_game().await.unwrap() }));
        }

        let mut claimed_ids = Vec::new();
        for h in handles {
            if let Some(c) = h.await.unwrap() {
                claimed_ids.push(c.game_id);
            }
        }
        claimed_ids.sort_unstable();
        let mut expected = ids;
        expected.sort_unstable();
        assert_eq!(claimed_ids, expected);
    }

    #[tokio::test]
    async fn test_set_game_finished_and_failed() {
        let db = test_db().await;
        let id = db.create_playing_game(1, 2, 1000).await.unwrap();
        db.set_game_finished(id, "won", "lost", 1, "http://log/1").await.unwrap();

        let game = db.get_game(id).await.unwrap().unwrap();
        assert_eq!(game.status, "finished");
        assert_eq!(game.winner_id, Some(1));

        let id2 = db.create_playing_game(1, 2, 1000).await.unwrap();
        db.set_game_failed(id2, "boom").await.unwrap();
        let game2 = db.get_game(id2).await.unwrap().unwrap();
        assert_eq!(game2.status, "failed");
        assert_eq!(game2.win_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_find_reusable_finished_game_excludes_and_orders() {
        let db = test_db().await;
        let id1 = db.create_playing_game(1, 2, 1000).await.unwrap();
        db.set_game_finished(id1, "won", "lost", 1, "http://log/1").await.unwrap();
        let id2 = db.create_playing_game(2, 1, 1100).await.unwrap();
        db.set_game_finished(id2, "won", "lost", 2, "http://log/2").await.unwrap();

        let found = db.find_reusable_finished_game(1, 2, &[]).await.unwrap().unwrap();
        assert_eq!(found.id, id2);

        let found_excl = db
            .find_reusable_finished_game(1, 2, &[id2])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found_excl.id, id1);

        assert!(db.find_reusable_finished_game(1, 99, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_recent_games_lookback() {
        let db = test_db().await;
        db.create_queued_game(1, 2, 1000).await.unwrap();
        db.create_queued_game(1, 2, 10).await.unwrap();

        let recent = db.list_recent_games(100, 1000).await.unwrap();
        assert_eq!(recent.len(), 1);
    }
}
