// Match Supervisor (C5): stand up a room, launch two client containers,
// wait with a hard timeout, gather logs, and finalise the game's DB rows.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{info, warn};

use crate::blob::BlobClient;
use crate::config::RunnerConfig;
use crate::container::{self, RunSpec, RunningContainer};
use crate::db::{Database, SubmissionRecord};
use crate::error::ArenaError;
use crate::gameserver::GameServerClient;
use crate::runner::ShutdownSignal;

const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(900);

pub struct PreparedSide {
    pub submission_id: i64,
    pub team_name: String,
}

/// Run one full match: create the room, launch both containers, supervise
/// to completion or timeout, upload artifacts, and record the final result.
pub async fn run_match(
    config: &RunnerConfig,
    db: &Database,
    gameserver: &GameServerClient,
    blob: &BlobClient,
    game_id: i64,
    sides: [PreparedSide; 2],
    shutdown: &ShutdownSignal,
) -> Result<(), ArenaError> {
    let session = format!("arena_{}_{}v{}", game_id, sides[0].submission_id, sides[1].submission_id);
    let password = random_password(16);

    gameserver
        .create_room(
            &config.game_name,
            &session,
            &password,
            [sides[0].team_name.clone(), sides[1].team_name.clone()],
        )
        .await?;

    let mut containers = Vec::with_capacity(2);
    for (i, side) in sides.iter().enumerate() {
        let stdout_path = config
            .logfile_path
            .join(format!("stdout_stderr_{}_{session}", side.submission_id));
        let container_name = format!("{}_for_{session}", side.submission_id);
        let args = vec![
            "--server".to_string(),
            config.endpoints.gameserver_host.clone(),
            "--port".to_string(),
            config.endpoints.gameserver_tcpport.to_string(),
            "--password".to_string(),
            password.clone(),
            "--name".to_string(),
            side.team_name.clone(),
            "--session".to_string(),
            session.clone(),
            "--index".to_string(),
            i.to_string(),
            config.game_name.clone(),
        ];
        let running = container::run_client(RunSpec {
            container_name: &container_name,
            image_tag: &container::image_tag(side.submission_id),
            cpu: &config.container_cpu,
            ram: &config.container_ram,
            args,
            stdout_path: &stdout_path,
        })
        .await?;
        containers.push((side.submission_id, running, stdout_path));
    }

    let wait_outcome =
        wait_for_clients_to_finish(&mut containers, Duration::from_secs(config.match_timeout), shutdown).await;

    for (_, running, _) in containers.iter_mut() {
        running.terminate_and_wait(TERMINATE_GRACE).await;
    }

    if let WaitOutcome::Cancelled = wait_outcome {
        warn!(game_id, "match cancelled by admin, containers terminated");
        return Err(ArenaError::MatchFailed {
            reason: "Cancelled by admin".to_string(),
        });
    }

    for (submission_id, _, stdout_path) in &containers {
        match blob
            .upload_file(stdout_path, &format!("stdout_{submission_id}_{session}"))
            .await
        {
            Ok(url) => {
                if let Err(e) = db.set_game_submission_output(game_id, *submission_id, &url).await {
                    warn!(game_id, submission_id, error = %e, "failed to record stdout url");
                }
            }
            Err(e) => warn!(game_id, submission_id, error = %e, "stdout upload failed"),
        }
    }

    let status = poll_match_status(
        gameserver,
        &config.game_name,
        &session,
        config.match_status_poll_tries,
        config.match_status_poll_base_seconds,
        shutdown,
    )
    .await?;

    let (winner_submission, win_reason, lose_reason) = resolve_winner(&status, &sides)?;

    let gamelog_filename = status.gamelog_filename.clone().ok_or_else(|| ArenaError::MatchFailed {
        reason: "match reported over without a gamelog filename".to_string(),
    })?;
    let local_gamelog = config.logfile_path.join(&gamelog_filename);
    gameserver.download_gamelog(&gamelog_filename, &local_gamelog).await?;
    let log_url = blob.upload_file(&local_gamelog, &gamelog_filename).await?;

    db.set_game_finished(game_id, &win_reason, &lose_reason, winner_submission, &log_url)
        .await?;

    info!(game_id, winner_submission, "match finished");
    Ok(())
}

enum WaitOutcome {
    Finished,
    Timeout,
    Cancelled,
}

async fn wait_for_clients_to_finish(
    containers: &mut [(i64, RunningContainer, PathBuf)],
    timeout: Duration,
    shutdown: &ShutdownSignal,
) -> WaitOutcome {
    let start = Instant::now();
    loop {
        if shutdown.is_escalated() {
            return WaitOutcome::Cancelled;
        }
        for (_, running, _) in containers.iter_mut() {
            if let Ok(Some(_)) = running.try_wait() {
                return WaitOutcome::Finished;
            }
        }
        if start.elapsed() >= timeout {
            return WaitOutcome::Timeout;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn poll_match_status(
    gameserver: &GameServerClient,
    game_name: &str,
    session: &str,
    tries: u32,
    base_seconds: f64,
    shutdown: &ShutdownSignal,
) -> Result<crate::gameserver::MatchStatus, ArenaError> {
    let mut remaining = tries;
    loop {
        if shutdown.is_escalated() {
            return Err(ArenaError::MatchFailed {
                reason: "Cancelled by admin".to_string(),
            });
        }
        let status = gameserver.get_match_status(game_name, session).await?;
        if status.is_over_with_log() {
            return Ok(status);
        }
        if remaining == 0 {
            return Err(ArenaError::MatchFailed {
                reason: "status poll exhausted retries waiting for gamelog".to_string(),
            });
        }
        let backoff = Duration::from_secs_f64(remaining as f64 * base_seconds);
        tokio::time::sleep(backoff).await;
        remaining -= 1;
    }
}

fn resolve_winner(
    status: &crate::gameserver::MatchStatus,
    sides: &[PreparedSide; 2],
) -> Result<(i64, String, String), ArenaError> {
    let winner = status.clients.iter().find(|c| c.won);
    let Some(winner) = winner else {
        return Err(ArenaError::MatchFailed {
            reason: "no client reported a win".to_string(),
        });
    };
    let loser = status.clients.iter().find(|c| c.lost);

    let winner_submission = sides
        .iter()
        .find(|s| s.team_name == winner.name)
        .map(|s| s.submission_id)
        .ok_or_else(|| ArenaError::Structural(format!("winner name '{}' not among paired submissions", winner.name)))?;

    let win_reason = winner.reason.clone();
    let lose_reason = loser.map(|c| c.reason.clone()).unwrap_or_default();

    Ok((winner_submission, win_reason, lose_reason))
}

fn random_password(len: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

impl PreparedSide {
    pub fn from_record(record: &SubmissionRecord) -> Self {
        PreparedSide {
            submission_id: record.id,
            team_name: record.team_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gameserver::ClientStatus;

    fn sides() -> [PreparedSide; 2] {
        [
            PreparedSide { submission_id: 10, team_name: "A".to_string() },
            PreparedSide { submission_id: 20, team_name: "B".to_string() },
        ]
    }

    #[test]
    fn test_random_password_length_and_alphabet() {
        let pw = random_password(16);
        assert_eq!(pw.len(), 16);
        assert!(pw.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn test_resolve_winner_maps_name_to_submission_id() {
        let status = crate::gameserver::MatchStatus {
            status: "over".to_string(),
            gamelog_filename: Some("x.json".to_string()),
            clients: vec![
                ClientStatus { name: "A".to_string(), won: true, lost: false, reason: "won".to_string() },
                ClientStatus { name: "B".to_string(), won: false, lost: true, reason: "lost".to_string() },
            ],
        };
        let (winner, win_reason, lose_reason) = resolve_winner(&status, &sides()).unwrap();
        assert_eq!(winner, 10);
        assert_eq!(win_reason, "won");
        assert_eq!(lose_reason, "lost");
    }

    #[test]
    fn test_resolve_winner_no_winner_is_match_failed() {
        let status = crate::gameserver::MatchStatus {
            status: "over".to_string(),
            gamelog_filename: Some("x.json".to_string()),
            clients: vec![
                ClientStatus { name: "A".to_string(), won: false, lost: false, reason: "".to_string() },
                ClientStatus { name: "B".to_string(), won: false, lost: false, reason: "".to_string() },
            ],
        };
        let result = resolve_winner(&status, &sides());
        assert!(matches!(result, Err(ArenaError::MatchFailed { .. })));
    }
}
