use arena::config::RunnerConfig;
use arena::db::Database;
use arena::runner::{Runner, ShutdownSignal};
use arena::{admin, metrics};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt::init();
    metrics::register_metrics();

    let config = RunnerConfig::load();

    let db = match Database::new(&config.endpoints.database_url).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize database");
            return std::process::ExitCode::FAILURE;
        }
    };

    let shutdown = ShutdownSignal::new();
    shutdown.install_ctrl_c_handler();

    admin::serve(config.admin_port).await;

    tracing::info!(game = %config.game_name, run_forever = config.run_forever, "match-runner starting");
    let runner = Runner::new(config, db, shutdown);
    runner.run().await;

    tracing::info!("match-runner exiting");
    std::process::ExitCode::SUCCESS
}
