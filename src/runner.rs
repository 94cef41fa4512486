// Match Runner loop (C7): the outer loop composing the pairing selector,
// submission materialiser, and match supervisor, with retry/backoff and
// graceful shutdown.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::blob::BlobClient;
use crate::config::RunnerConfig;
use crate::db::Database;
use crate::error::ArenaError;
use crate::gameserver::GameServerClient;
use crate::materialiser::Materialiser;
use crate::metrics;
use crate::pairing;
use crate::supervisor::{self, PreparedSide};

const SHUTDOWN_REQUESTED: u8 = 1;
const SHUTDOWN_ESCALATED: u8 = 2;

/// Shared signal state observed by the run loop. A first interrupt requests
/// a graceful stop after the in-flight game finishes; a second escalates to
/// an immediate abort that marks the in-flight game failed.
#[derive(Clone)]
pub struct ShutdownSignal {
    state: Arc<AtomicU8>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        ShutdownSignal {
            state: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn request_stop(&self) -> u8 {
        let previous = self.state.load(Ordering::SeqCst);
        if previous == 0 {
            self.state.store(SHUTDOWN_REQUESTED, Ordering::SeqCst);
            SHUTDOWN_REQUESTED
        } else {
            self.state.store(SHUTDOWN_ESCALATED, Ordering::SeqCst);
            SHUTDOWN_ESCALATED
        }
    }

    pub fn is_requested(&self) -> bool {
        self.state.load(Ordering::SeqCst) != 0
    }

    pub fn is_escalated(&self) -> bool {
        self.state.load(Ordering::SeqCst) == SHUTDOWN_ESCALATED
    }

    /// Spawn a background task that listens for Ctrl-C and escalates the
    /// flag on repeated signals.
    pub fn install_ctrl_c_handler(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                let level = signal.request_stop();
                if level == SHUTDOWN_REQUESTED {
                    warn!("shutdown requested, finishing current game then exiting");
                } else {
                    warn!("second interrupt received, escalating to immediate shutdown");
                    return;
                }
            }
        });
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Runner {
    config: RunnerConfig,
    db: Database,
    gameserver: GameServerClient,
    blob: BlobClient,
    shutdown: ShutdownSignal,
}

impl Runner {
    pub fn new(config: RunnerConfig, db: Database, shutdown: ShutdownSignal) -> Self {
        let gameserver = GameServerClient::new(&config.endpoints);
        let blob = BlobClient::new(&config.endpoints);
        Runner {
            config,
            db,
            gameserver,
            blob,
            shutdown,
        }
    }

    /// Run iterations until told to stop: forever if `RUN_FOREVER`, else
    /// exactly once.
    pub async fn run(&self) {
        loop {
            if self.shutdown.is_requested() {
                info!("stopping before next iteration");
                return;
            }

            let outcome = self.run_one_iteration().await;
            if let Err((game_id, err)) = outcome {
                error!(error = %err, "iteration failed");
                metrics::GAMES_FAILED_TOTAL.inc();
                if let Some(game_id) = game_id {
                    let reason = match &err {
                        ArenaError::MatchFailed { reason } => reason.as_str(),
                        _ => "Arena failed to run game",
                    };
                    if let Err(e) = self.db.set_game_failed(game_id, reason).await {
                        error!(error = %e, "failed to mark game as failed after error");
                    }
                }
                if !self.config.run_forever {
                    return;
                }
                self.sleep_with_jitter().await;
                continue;
            }

            if !self.config.run_forever {
                return;
            }
        }
    }

    async fn sleep_with_jitter(&self) {
        let secs = rand::thread_rng().gen_range(15..=20);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    async fn run_one_iteration(&self) -> Result<(), (Option<i64>, ArenaError)> {
        let now = now_unix();

        let selected = pairing::select_pair(&self.db, self.config.lookback_seconds, now)
            .await
            .map_err(|e| (None, e))?;
        let game_id = selected.game_id;

        let materialiser = Materialiser::new(
            &self.db,
            &self.blob,
            self.config.submission_cache_path.clone(),
            self.config.dockerfile_path.clone(),
        );

        for submission_id in selected.submission_ids {
            materialiser
                .materialise(submission_id)
                .await
                .map_err(|e| (Some(game_id), e))?;
        }

        if self.shutdown.is_escalated() {
            return Err((
                Some(game_id),
                ArenaError::MatchFailed {
                    reason: "Cancelled by admin".to_string(),
                },
            ));
        }

        let all_submissions = self.db.list_all_submissions().await.map_err(|e| (Some(game_id), e))?;
        let mut sides = Vec::with_capacity(2);
        for submission_id in selected.submission_ids {
            let record = all_submissions
                .iter()
                .find(|s| s.id == submission_id)
                .ok_or_else(|| {
                    (
                        Some(game_id),
                        ArenaError::Structural(format!("submission {submission_id} vanished mid-iteration")),
                    )
                })?;
            sides.push(PreparedSide::from_record(record));
        }
        let sides: [PreparedSide; 2] = sides.try_into().map_err(|_| {
            (
                Some(game_id),
                ArenaError::Structural("expected exactly two prepared sides".to_string()),
            )
        })?;

        metrics::ACTIVE_GAMES.inc();
        let result = supervisor::run_match(
            &self.config,
            &self.db,
            &self.gameserver,
            &self.blob,
            game_id,
            sides,
            &self.shutdown,
        )
        .await;
        metrics::ACTIVE_GAMES.dec();

        result.map_err(|e| (Some(game_id), e))?;
        metrics::GAMES_COMPLETED_TOTAL.inc();
        Ok(())
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signal_escalation() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_requested());
        assert_eq!(signal.request_stop(), SHUTDOWN_REQUESTED);
        assert!(signal.is_requested());
        assert!(!signal.is_escalated());
        assert_eq!(signal.request_stop(), SHUTDOWN_ESCALATED);
        assert!(signal.is_escalated());
    }
}
