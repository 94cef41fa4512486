// Prometheus metrics definitions for the arena.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

static REGISTER_ONCE: Once = Once::new();

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Games currently in the `playing` state for this process (0 or 1).
    pub static ref ACTIVE_GAMES: IntGauge =
        IntGauge::new("arena_active_games", "Currently running games").unwrap();

    /// Games waiting in `queued` status.
    pub static ref GAME_QUEUE_DEPTH: IntGauge =
        IntGauge::new("arena_game_queue_depth", "Matches waiting to start").unwrap();

    /// Nodes currently tracked by the bracket engine.
    pub static ref BRACKET_NODES_TOTAL: IntGauge =
        IntGauge::new("arena_bracket_nodes_total", "Bracket nodes currently tracked").unwrap();

    /// Nodes that have reached a declared winner and loser.
    pub static ref BRACKET_DECIDED_TOTAL: IntGauge =
        IntGauge::new("arena_bracket_decided_total", "Bracket nodes with a declared winner").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Total games completed with status `finished`.
    pub static ref GAMES_COMPLETED_TOTAL: IntCounter =
        IntCounter::new("arena_games_completed_total", "Total games completed").unwrap();

    /// Total games that ended with status `failed`.
    pub static ref GAMES_FAILED_TOTAL: IntCounter =
        IntCounter::new("arena_games_failed_total", "Total games marked failed").unwrap();

    /// Total submissions that reached a `finished` build.
    pub static ref SUBMISSIONS_BUILT_TOTAL: IntCounter =
        IntCounter::new("arena_submissions_built_total", "Total submissions successfully built").unwrap();

    /// Total submissions that reached a `failed` build.
    pub static ref SUBMISSIONS_FAILED_TOTAL: IntCounter =
        IntCounter::new("arena_submissions_failed_total", "Total submissions that failed to build").unwrap();
}

/// Register all metrics with the custom registry. Idempotent and safe to
/// call from more than one binary/test entry point in the same process —
/// the actual registration only ever runs once.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(ACTIVE_GAMES.clone()),
            Box::new(GAME_QUEUE_DEPTH.clone()),
            Box::new(BRACKET_NODES_TOTAL.clone()),
            Box::new(BRACKET_DECIDED_TOTAL.clone()),
            Box::new(GAMES_COMPLETED_TOTAL.clone()),
            Box::new(GAMES_FAILED_TOTAL.clone()),
            Box::new(SUBMISSIONS_BUILT_TOTAL.clone()),
            Box::new(SUBMISSIONS_FAILED_TOTAL.clone()),
        ];

        for c in collectors {
            REGISTRY.register(c).expect("failed to register metric");
        }
    });
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics_returns_string() {
        register_metrics();
        let output = gather_metrics();
        assert!(output.is_empty() || output.contains("arena_"));
    }

    #[test]
    fn test_metric_increments() {
        ACTIVE_GAMES.set(1);
        assert_eq!(ACTIVE_GAMES.get(), 1);
        ACTIVE_GAMES.set(0);
        assert_eq!(ACTIVE_GAMES.get(), 0);

        GAME_QUEUE_DEPTH.set(3);
        assert_eq!(GAME_QUEUE_DEPTH.get(), 3);

        GAMES_COMPLETED_TOTAL.inc();
        GAMES_FAILED_TOTAL.inc();
        SUBMISSIONS_BUILT_TOTAL.inc();
        SUBMISSIONS_FAILED_TOTAL.inc();

        BRACKET_NODES_TOTAL.set(5);
        BRACKET_DECIDED_TOTAL.set(2);
    }
}
