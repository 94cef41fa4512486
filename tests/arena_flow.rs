// Integration tests exercising the pairing selector, repository, and
// bracket engine together against a real (in-memory sqlite) database,
// the way `headless_queue.rs` exercises the game engine against a real
// world and worker pool. These do not spin up containers or an HTTP game
// server — that external surface is covered by unit tests on the
// individual clients — but they drive the same state transitions the
// end-to-end scenarios in the spec describe.

use arena::bracket::{Bracket, Side, TickOutcome};
use arena::db::Database;
use arena::pairing;

async fn seeded_db(teams: &[(&str, i64)]) -> Database {
    sqlx::any::install_default_drivers();
    let db = Database::new("sqlite::memory:").await.unwrap();
    for (name, id) in teams {
        db.seed_team_with_submission(*id, name, *id).await.unwrap();
    }
    db
}

// Scenario 1: two submissions, no prior games -> a fresh `playing` game
// with exactly two games_submissions rows, resolvable to finished.
#[tokio::test]
async fn two_submissions_one_match() {
    let db = seeded_db(&[("A", 10), ("B", 20)]).await;

    let selected = pairing::select_pair(&db, 3600, 1000).await.unwrap();
    assert!(selected.freshly_generated);
    let mut ids = selected.submission_ids;
    ids.sort_unstable();
    assert_eq!(ids, [10, 20]);

    let game = db.get_game(selected.game_id).await.unwrap().unwrap();
    assert_eq!(game.status, "playing");

    db.set_game_finished(selected.game_id, "good moves", "bad moves", 10, "http://logs/1")
        .await
        .unwrap();
    let finished = db.get_game(selected.game_id).await.unwrap().unwrap();
    assert_eq!(finished.status, "finished");
    assert!(finished.submission_ids.contains(&finished.winner_id.unwrap()));
}

// Scenario 2: a pre-seeded queued game must be claimed in preference to
// generating a fresh pairing, and flipped atomically to `playing`.
#[tokio::test]
async fn queued_game_is_claimed_before_generating() {
    let db = seeded_db(&[("A", 10), ("B", 20)]).await;
    let queued_id = db.create_queued_game(10, 20, 500).await.unwrap();

    let selected = pairing::select_pair(&db, 3600, 1000).await.unwrap();
    assert_eq!(selected.game_id, queued_id);
    assert!(!selected.freshly_generated);

    let game = db.get_game(queued_id).await.unwrap().unwrap();
    assert_eq!(game.status, "playing");
}

// Scenario 5: three teams, N=1 (single elimination), BEST_OF=1. After
// A beats B and C beats D (D is BYE here, since n=3 pads to 4 leaves
// with one BYE), the bracket must grow exactly one new node pairing the
// two leaf winners, and terminate once that node is decided, with the
// losers sitting at losses=1 and therefore never re-paired.
#[tokio::test]
async fn three_team_single_elimination_terminates_with_one_survivor() {
    let mut bracket = Bracket::generate_initial_pairing(&[1, 2, 3], 1, 1);
    bracket.declare_and_propagate_winners().unwrap();

    let mut iterations = 0;
    loop {
        // There is no running match supervisor in this test, so stand in
        // for "BEST_OF=1 games actually being played" by directly deciding
        // any still-pending real-vs-real node, as bracket.rs's own
        // `test_three_team_single_elimination_terminates` unit test does.
        for idx in 0..bracket.nodes.len() {
            let node = &bracket.nodes[idx];
            if let (Some(Side::Real(a)), Some(Side::Real(b))) = (node.submissions()[0], node.submissions()[1]) {
                if node.winner.is_none() {
                    bracket.nodes[idx].winner = Some(Side::Real(a));
                    bracket.nodes[idx].loser = Some(Side::Real(b));
                }
            }
        }

        match bracket.grow() {
            TickOutcome::Complete { champion, .. } => {
                assert!(matches!(champion, Side::Real(_)));
                break;
            }
            TickOutcome::Starvation { .. } => panic!("bracket starved unexpectedly"),
            TickOutcome::InProgress => {
                bracket.declare_and_propagate_winners().unwrap();
            }
        }

        iterations += 1;
        assert!(iterations < 20, "bracket failed to converge");
    }
}

// Scenario 6: with REUSE_OLD_GAMES enabled, a prior finished head-to-head
// must be attached to the corresponding node instead of enqueuing a
// fresh duplicate game.
#[tokio::test]
async fn reuse_old_games_attaches_prior_result_without_duplicating() {
    let db = seeded_db(&[("A", 1), ("B", 2)]).await;
    let prior = db.create_playing_game(1, 2, 900).await.unwrap();
    db.set_game_finished(prior, "won", "lost", 1, "http://logs/prior").await.unwrap();

    let before = db.list_recent_games(10_000, 1_000).await.unwrap();
    assert_eq!(before.len(), 1);

    let reused = db.find_reusable_finished_game(1, 2, &[]).await.unwrap().unwrap();
    assert_eq!(reused.id, prior);
    assert_eq!(reused.winner_id, Some(1));

    // Excluding the prior game's id (as the bracket engine does once it is
    // already attached to a node) must not surface it again.
    assert!(db.find_reusable_finished_game(1, 2, &[prior]).await.unwrap().is_none());
}
