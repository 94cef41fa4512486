use std::time::Duration;

use arena::bracket::{Bracket, TickOutcome};
use arena::config::BracketConfig;
use arena::db::Database;
use arena::{admin, metrics};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt::init();
    metrics::register_metrics();

    let config = BracketConfig::load();

    let db = match Database::new(&config.endpoints.database_url).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize database");
            return std::process::ExitCode::FAILURE;
        }
    };

    admin::serve(config.admin_port).await;

    let eligible = match db.list_latest_eligible_submissions().await {
        Ok(subs) => subs,
        Err(e) => {
            tracing::error!(error = %e, "failed to load eligible submissions");
            return std::process::ExitCode::FAILURE;
        }
    };
    let ids: Vec<i64> = eligible.iter().map(|s| s.id).collect();

    tracing::info!(entrants = ids.len(), n_elimination = config.n_elimination, best_of = config.best_of, "bracket-engine starting");
    let mut bracket = Bracket::generate_initial_pairing(&ids, config.n_elimination, config.best_of);

    loop {
        let outcome = tokio::select! {
            outcome = tick(&mut bracket, &db, &config) => outcome,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupt received, writing final graph and exiting");
                write_dot(&bracket, &config).await;
                return std::process::ExitCode::SUCCESS;
            }
        };

        metrics::BRACKET_NODES_TOTAL.set(bracket.nodes.len() as i64);
        let decided = bracket.nodes.iter().filter(|n| n.winner.is_some() && n.loser.is_some()).count();
        metrics::BRACKET_DECIDED_TOTAL.set(decided as i64);

        if let TickOutcome::Complete { .. } = outcome {
            return std::process::ExitCode::SUCCESS;
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(config.refresh_seconds)) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupt received, writing final graph and exiting");
                write_dot(&bracket, &config).await;
                return std::process::ExitCode::SUCCESS;
            }
        }
    }
}

async fn tick(bracket: &mut Bracket, db: &Database, config: &BracketConfig) -> TickOutcome {
    if let Err(e) = bracket.refresh_game_statuses(db).await {
        tracing::error!(error = %e, "failed to refresh game statuses");
        return TickOutcome::InProgress;
    }

    if let Err(e) = bracket.declare_and_propagate_winners() {
        tracing::error!(error = %e, "failed to declare winners");
        return TickOutcome::InProgress;
    }

    let outcome = bracket.grow();
    match &outcome {
        TickOutcome::InProgress => {}
        TickOutcome::Complete { node, champion } => {
            tracing::info!(node = *node, champion = ?champion, "tournament complete");
            write_dot(bracket, config).await;
        }
        TickOutcome::Starvation { node } => {
            tracing::error!(node = *node, "bracket starved: no pending matches and no available players");
            write_dot(bracket, config).await;
        }
    }

    let now = now_unix();
    match bracket.enqueue_needed_games(db, config.reuse_old_games, now).await {
        Ok(created) if created > 0 => tracing::info!(created, "enqueued new games"),
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "failed to enqueue needed games"),
    }

    outcome
}

async fn write_dot(bracket: &Bracket, config: &BracketConfig) {
    let dot = bracket.to_dot();
    println!("{dot}");
    if let Err(e) = tokio::fs::write(&config.output_file, &dot).await {
        tracing::error!(error = %e, path = %config.output_file.display(), "failed to write bracket graph");
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
