// Error taxonomy for the arena, per the error handling policy: transient
// errors are retried at game granularity, submission/game-fatal errors
// record their reason in the database and move on, structural errors are
// logged and surfaced, and fatal errors abort the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArenaError {
    /// A blip that should not fail the current match outright: a DB
    /// connection hiccup, an HTTP 5xx, a container engine hiccup.
    #[error("transient error: {0}")]
    Transient(#[from] TransientError),

    /// A submission could not be materialised into a runnable image.
    #[error("submission {submission_id} failed: {reason}")]
    SubmissionFailed { submission_id: i64, reason: String },

    /// The match itself could not be completed (room setup rejected, no
    /// client reported a win, status poll exhausted its retries).
    #[error("match failed: {reason}")]
    MatchFailed { reason: String },

    /// The pairing selector could not produce a pair to play.
    #[error("pairing failed: {0}")]
    PairingFailed(String),

    /// The bracket arrived at an impossible state (no pending matches and
    /// no available players).
    #[error("bracket structural error: {0}")]
    Structural(String),

    /// Unrecoverable at process level (e.g. the database is unreachable
    /// at startup).
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum TransientError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
