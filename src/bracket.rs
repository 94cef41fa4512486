// Bracket Engine (C8): online construction and advancement of an N-loss
// elimination bracket over a dynamic submission set. Nodes live in an
// arena (`Bracket::nodes`) and reference each other by index, never by
// owning reference, so the feeder/back-link graph never needs interior
// mutability or reference counting.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

use rand::seq::SliceRandom;
use tracing::{error, info, warn};

use crate::db::Database;
use crate::error::ArenaError;

/// A bracket entrant: either a real submission or the BYE sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Real(i64),
    Bye,
}

impl Side {
    pub fn submission_id(&self) -> Option<i64> {
        match self {
            Side::Real(id) => Some(*id),
            Side::Bye => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederKind {
    /// Carries the source node's winner into this node.
    Winner,
    /// Carries the source node's loser into this node (the "inverted" feeder).
    Loser,
}

#[derive(Debug, Clone, Copy)]
pub struct Feeder {
    pub source: usize,
    pub kind: FeederKind,
}

#[derive(Debug, Clone)]
struct CachedGame {
    id: i64,
    status: String,
    winner_id: Option<i64>,
    log_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: usize,
    /// Set only on leaf nodes: the two entrants assigned at construction.
    initial: Option<[Side; 2]>,
    /// Empty for leaf nodes; exactly two entries for every node the engine
    /// grows on its own.
    pub feeders: Vec<Feeder>,
    submissions: [Option<Side>; 2],
    games: Vec<CachedGame>,
    pub winner: Option<Side>,
    pub loser: Option<Side>,
    pub winner_child: Option<usize>,
    pub loser_child: Option<usize>,
}

impl Node {
    fn decided(&self) -> bool {
        self.winner.is_some() && self.loser.is_some()
    }

    /// The two entrants currently assigned to this node, once knowable
    /// (`None` until its feeders resolve). Exposed for callers that need
    /// to observe a node's pairing without reaching into crate internals.
    pub fn submissions(&self) -> [Option<Side>; 2] {
        self.submissions
    }
}

pub enum TickOutcome {
    InProgress,
    /// The tournament is complete; holds the node and side that survived.
    Complete { node: usize, champion: Side },
    /// No pending matches and no available players — an unexpected state.
    Starvation { node: usize },
}

pub struct Bracket {
    pub nodes: Vec<Node>,
    n_elimination: u32,
    best_of: u32,
}

#[derive(Clone, Copy)]
struct AvailableEndpoint {
    node: usize,
    kind: FeederKind,
    submission_id: i64,
    losses: u32,
    wins: u32,
}

impl Bracket {
    /// Build the initial leaf layer. `width = 2^(ceil(log2(n)) - 1)`; the
    /// submission list is shuffled and padded with BYE up to `2*width`.
    pub fn generate_initial_pairing(eligible_ids: &[i64], n_elimination: u32, best_of: u32) -> Self {
        let n = eligible_ids.len().max(1);
        let width = if n <= 1 {
            1
        } else {
            1usize << ((n as f64).log2().ceil() as u32 - 1).max(0)
        };
        let total_leaves = 2 * width;

        let mut shuffled: Vec<Side> = eligible_ids.iter().map(|id| Side::Real(*id)).collect();
        shuffled.shuffle(&mut rand::thread_rng());
        while shuffled.len() < total_leaves {
            shuffled.push(Side::Bye);
        }

        let mut nodes = Vec::with_capacity(width);
        for i in 0..width {
            let pair = [shuffled[i], shuffled[i + width]];
            nodes.push(Node {
                id: i,
                initial: Some(pair),
                feeders: Vec::new(),
                submissions: [Some(pair[0]), Some(pair[1])],
                games: Vec::new(),
                winner: None,
                loser: None,
                winner_child: None,
                loser_child: None,
            });
        }

        Bracket {
            nodes,
            n_elimination,
            best_of,
        }
    }

    /// Re-fetch status for every game attached to a not-yet-decided node.
    pub async fn refresh_game_statuses(&mut self, db: &Database) -> Result<(), ArenaError> {
        for node in &mut self.nodes {
            if node.decided() {
                continue;
            }
            for game in &mut node.games {
                if game.status == "finished" {
                    continue;
                }
                if let Some(record) = db.get_game(game.id).await? {
                    game.status = record.status;
                    game.winner_id = record.winner_id;
                    game.log_url = record.log_url;
                } else {
                    warn!(game_id = game.id, "bracket-attached game no longer found");
                }
            }
        }
        Ok(())
    }

    /// Recursively (post-order over `feeders` only — see design notes on
    /// why `inverted_feeders` are not walked; convergence relies on
    /// repeated ticks) recompute each node's submissions and, once both
    /// sides are knowable, its winner/loser.
    pub fn declare_and_propagate_winners(&mut self) -> Result<(), ArenaError> {
        let mut done = HashSet::new();
        for i in 0..self.nodes.len() {
            self.declare_node(i, &mut done)?;
        }
        Ok(())
    }

    fn declare_node(&mut self, idx: usize, done: &mut HashSet<usize>) -> Result<(), ArenaError> {
        if !done.insert(idx) {
            return Ok(());
        }
        if self.nodes[idx].decided() {
            return Ok(());
        }

        let feeder_sources: Vec<usize> = self.nodes[idx].feeders.iter().map(|f| f.source).collect();
        for src in feeder_sources {
            self.declare_node(src, done)?;
        }

        self.recompute_submissions(idx);

        let node = &self.nodes[idx];
        let (Some(left), Some(right)) = (node.submissions[0], node.submissions[1]) else {
            return Ok(());
        };

        match (left, right) {
            (Side::Bye, Side::Bye) => {
                let node = &mut self.nodes[idx];
                node.winner = Some(Side::Bye);
                node.loser = Some(Side::Bye);
            }
            (Side::Real(id), Side::Bye) => {
                let node = &mut self.nodes[idx];
                node.winner = Some(Side::Real(id));
                node.loser = Some(Side::Bye);
            }
            (Side::Bye, Side::Real(id)) => {
                let node = &mut self.nodes[idx];
                node.winner = Some(Side::Real(id));
                node.loser = Some(Side::Bye);
            }
            (Side::Real(a), Side::Real(b)) if a == b => {
                let node = &mut self.nodes[idx];
                node.winner = Some(Side::Real(a));
                node.loser = Some(Side::Real(a));
            }
            (Side::Real(a), Side::Real(b)) => {
                let threshold = self.best_of / 2;
                let mut wins_by_id: HashMap<i64, u32> = HashMap::new();
                for game in &self.nodes[idx].games {
                    if game.status == "finished" {
                        if let Some(winner_id) = game.winner_id {
                            *wins_by_id.entry(winner_id).or_insert(0) += 1;
                        }
                    }
                }

                let mut decided_winner = None;
                for (&winner_id, &count) in &wins_by_id {
                    if count > threshold {
                        decided_winner = Some(winner_id);
                        break;
                    }
                }

                if let Some(winner_id) = decided_winner {
                    let loser_id = if winner_id == a {
                        b
                    } else if winner_id == b {
                        a
                    } else {
                        error!(node = idx, winner_id, "declared winner matches neither paired submission");
                        return Err(ArenaError::Structural(format!(
                            "node {idx}: winner_id {winner_id} matches neither submission {a} nor {b}"
                        )));
                    };
                    let node = &mut self.nodes[idx];
                    node.winner = Some(Side::Real(winner_id));
                    node.loser = Some(Side::Real(loser_id));
                }
            }
        }

        Ok(())
    }

    fn recompute_submissions(&mut self, idx: usize) {
        if self.nodes[idx].initial.is_some() {
            return;
        }
        let feeders = self.nodes[idx].feeders.clone();
        let mut submissions = [None; 2];
        for (slot, feeder) in feeders.iter().enumerate().take(2) {
            let source = &self.nodes[feeder.source];
            submissions[slot] = match feeder.kind {
                FeederKind::Winner => source.winner,
                FeederKind::Loser => source.loser,
            };
        }
        self.nodes[idx].submissions = submissions;
    }

    fn wins_and_losses(&self) -> (HashMap<i64, u32>, HashMap<i64, u32>) {
        let mut wins = HashMap::new();
        let mut losses = HashMap::new();
        for node in &self.nodes {
            if let (Some(Side::Real(w)), Some(loser)) = (node.winner, node.loser) {
                *wins.entry(w).or_insert(0u32) += 1;
                if let Side::Real(l) = loser {
                    if l != w {
                        *losses.entry(l).or_insert(0u32) += 1;
                    }
                }
            }
        }
        (wins, losses)
    }

    fn available_endpoints(&self) -> Vec<AvailableEndpoint> {
        let (wins, losses) = self.wins_and_losses();
        let mut out = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if !node.decided() {
                continue;
            }
            if let Some(Side::Real(id)) = node.winner {
                if node.winner_child.is_none() {
                    out.push(AvailableEndpoint {
                        node: idx,
                        kind: FeederKind::Winner,
                        submission_id: id,
                        losses: *losses.get(&id).unwrap_or(&0),
                        wins: *wins.get(&id).unwrap_or(&0),
                    });
                }
            }
            if let Some(Side::Real(id)) = node.loser {
                let l = *losses.get(&id).unwrap_or(&0);
                if node.loser_child.is_none() && l < self.n_elimination {
                    out.push(AvailableEndpoint {
                        node: idx,
                        kind: FeederKind::Loser,
                        submission_id: id,
                        losses: l,
                        wins: *wins.get(&id).unwrap_or(&0),
                    });
                }
            }
        }
        out
    }

    /// Advance the bracket by at most one new layer of nodes. Returns
    /// whether the tournament is complete, starved, or still in progress.
    pub fn grow(&mut self) -> TickOutcome {
        let pending = self.nodes.iter().any(|n| !n.decided());
        let available = self.available_endpoints();

        if !pending && available.len() == 1 {
            let ep = available[0];
            info!(node = ep.node, submission_id = ep.submission_id, "tournament complete");
            return TickOutcome::Complete {
                node: ep.node,
                champion: Side::Real(ep.submission_id),
            };
        }

        if !pending && available.is_empty() {
            let last = self.nodes.len().saturating_sub(1);
            error!(node = last, "bracket starved: no pending matches and no available players");
            return TickOutcome::Starvation { node: last };
        }

        let pairs = Self::choose_pairs(&available);
        for (a, b) in pairs {
            self.create_child_node(a, b);
        }

        TickOutcome::InProgress
    }

    /// Pair available endpoints: first within strict `(losses, wins)`
    /// classes, then within `losses`-only classes, then within one class
    /// sorted by descending losses. Stops after the first grouping that
    /// produces any pair; consumes pairs via a step-of-two walk, leaving an
    /// odd tail for the next tick.
    fn choose_pairs(available: &[AvailableEndpoint]) -> Vec<(AvailableEndpoint, AvailableEndpoint)> {
        let by_losses_wins = Self::group_and_pair(available, |e| (e.losses, e.wins));
        if !by_losses_wins.is_empty() {
            return by_losses_wins;
        }

        let by_losses = Self::group_and_pair(available, |e| (e.losses, 0));
        if !by_losses.is_empty() {
            return by_losses;
        }

        let mut sorted: Vec<AvailableEndpoint> = available.to_vec();
        sorted.sort_by(|a, b| b.losses.cmp(&a.losses));
        Self::step_pair(&sorted)
    }

    fn group_and_pair(
        available: &[AvailableEndpoint],
        key: impl Fn(&AvailableEndpoint) -> (u32, u32),
    ) -> Vec<(AvailableEndpoint, AvailableEndpoint)> {
        let mut groups: BTreeMap<(u32, u32), Vec<AvailableEndpoint>> = BTreeMap::new();
        for ep in available {
            groups.entry(key(ep)).or_default().push(*ep);
        }
        for (_, group) in groups.iter().rev() {
            let pairs = Self::step_pair(group);
            if !pairs.is_empty() {
                return pairs;
            }
        }
        Vec::new()
    }

    fn step_pair(items: &[AvailableEndpoint]) -> Vec<(AvailableEndpoint, AvailableEndpoint)> {
        let mut pairs = Vec::new();
        let mut i = 0;
        while i + 1 < items.len() {
            pairs.push((items[i], items[i + 1]));
            i += 2;
        }
        pairs
    }

    fn create_child_node(&mut self, a: AvailableEndpoint, b: AvailableEndpoint) -> usize {
        let new_idx = self.nodes.len();
        self.nodes.push(Node {
            id: new_idx,
            initial: None,
            feeders: vec![
                Feeder { source: a.node, kind: a.kind },
                Feeder { source: b.node, kind: b.kind },
            ],
            submissions: [None, None],
            games: Vec::new(),
            winner: None,
            loser: None,
            winner_child: None,
            loser_child: None,
        });

        for ep in [a, b] {
            match ep.kind {
                FeederKind::Winner => self.nodes[ep.node].winner_child = Some(new_idx),
                FeederKind::Loser => self.nodes[ep.node].loser_child = Some(new_idx),
            }
        }

        new_idx
    }

    /// Create queued/reused games for every node that needs more of them
    /// to reach `BEST_OF`. Returns the number of games newly attached.
    pub async fn enqueue_needed_games(&mut self, db: &Database, reuse_old_games: bool, now: i64) -> Result<usize, ArenaError> {
        let already_attached: HashSet<i64> = self.nodes.iter().flat_map(|n| n.games.iter().map(|g| g.id)).collect();
        let mut created = 0;

        for idx in 0..self.nodes.len() {
            if self.nodes[idx].decided() {
                continue;
            }
            let (left, right) = match (self.nodes[idx].submissions[0], self.nodes[idx].submissions[1]) {
                (Some(Side::Real(l)), Some(Side::Real(r))) => (l, r),
                _ => continue,
            };

            let counts_toward_best_of =
                |status: &str| matches!(status, "finished" | "queued" | "playing");

            while self.nodes[idx]
                .games
                .iter()
                .filter(|g| counts_toward_best_of(&g.status))
                .count()
                < self.best_of as usize
            {
                let game_count = self.nodes[idx].games.len();
                let (first, second) = if game_count % 2 == 0 { (left, right) } else { (right, left) };

                let attached = if reuse_old_games {
                    let excluded: Vec<i64> = already_attached.iter().copied().collect();
                    db.find_reusable_finished_game(first, second, &excluded).await?
                } else {
                    None
                };

                let (game_id, status, winner_id, log_url) = if let Some(reused) = attached {
                    (reused.id, reused.status, reused.winner_id, reused.log_url)
                } else {
                    let game_id = db.create_queued_game(first, second, now).await?;
                    (game_id, "queued".to_string(), None, None)
                };

                self.nodes[idx].games.push(CachedGame { id: game_id, status, winner_id, log_url });
                created += 1;
            }
        }

        Ok(created)
    }

    /// Serialize the current bracket to a DOT graph. Feeder edges are
    /// solid, inverted feeders (loser-carrying) are dotted.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        out.push_str("digraph bracket {\n");
        for node in &self.nodes {
            let label = self.node_label(node);
            let _ = writeln!(out, "  n{} [label=\"{}\"];", node.id, escape_dot(&label));
        }
        for node in &self.nodes {
            for feeder in &node.feeders {
                let style = match feeder.kind {
                    FeederKind::Winner => "solid",
                    FeederKind::Loser => "dotted",
                };
                let _ = writeln!(out, "  n{} -> n{} [style={}];", feeder.source, node.id, style);
            }
        }
        out.push_str("}\n");
        out
    }

    fn node_label(&self, node: &Node) -> String {
        let side_label = |s: Option<Side>| match s {
            Some(Side::Real(id)) => id.to_string(),
            Some(Side::Bye) => "BYE".to_string(),
            None => "?".to_string(),
        };
        let left = side_label(node.submissions[0]);
        let right = side_label(node.submissions[1]);

        let wins_for = |id_str: &str| {
            node.games
                .iter()
                .filter(|g| g.winner_id.map(|w| w.to_string()) == Some(id_str.to_string()) && g.status == "finished")
                .count()
        };

        let mut label = format!(
            "{} vs {} ({}/{})({}/{})",
            left,
            right,
            wins_for(&left),
            self.best_of,
            wins_for(&right),
            self.best_of
        );

        if node.decided() {
            let winning_game = node
                .games
                .iter()
                .find(|g| g.status == "finished" && g.winner_id == node.winner.and_then(|w| w.submission_id()));
            if let Some(log_url) = winning_game.and_then(|g| g.log_url.as_deref()) {
                let _ = write!(label, " {log_url}");
            }
        }

        label
    }
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decide(bracket: &mut Bracket, idx: usize, winner: i64, loser: i64) {
        bracket.nodes[idx].winner = Some(Side::Real(winner));
        bracket.nodes[idx].loser = Some(Side::Real(loser));
    }

    #[test]
    fn test_generate_initial_pairing_pads_with_bye() {
        let bracket = Bracket::generate_initial_pairing(&[1, 2, 3], 1, 1);
        // n=3 -> width = 2^(ceil(log2(3)) - 1) = 2^(2-1) = 2, 4 leaves, one BYE
        assert_eq!(bracket.nodes.len(), 2);
        let total_slots: usize = bracket.nodes.iter().map(|n| n.submissions.iter().filter(|s| s.is_some()).count()).sum();
        assert_eq!(total_slots, 4);
        let byes = bracket
            .nodes
            .iter()
            .flat_map(|n| n.submissions.iter())
            .filter(|s| matches!(s, Some(Side::Bye)))
            .count();
        assert_eq!(byes, 1);
    }

    #[test]
    fn test_declare_bye_resolves_immediately() {
        let mut bracket = Bracket::generate_initial_pairing(&[1, 2, 3], 1, 1);
        bracket.declare_and_propagate_winners().unwrap();
        let bye_node = bracket
            .nodes
            .iter()
            .find(|n| n.submissions.contains(&Some(Side::Bye)))
            .unwrap();
        assert_eq!(bye_node.loser, Some(Side::Bye));
        assert!(matches!(bye_node.winner, Some(Side::Real(_))));
    }

    #[test]
    fn test_self_pairing_resolves_to_same_submission() {
        let mut bracket = Bracket {
            nodes: vec![
                Node {
                    id: 0,
                    initial: Some([Side::Real(1), Side::Bye]),
                    feeders: Vec::new(),
                    submissions: [Some(Side::Real(1)), Some(Side::Bye)],
                    games: Vec::new(),
                    winner: None,
                    loser: None,
                    winner_child: None,
                    loser_child: None,
                },
                Node {
                    id: 1,
                    initial: Some([Side::Real(1), Side::Bye]),
                    feeders: Vec::new(),
                    submissions: [Some(Side::Real(1)), Some(Side::Bye)],
                    games: Vec::new(),
                    winner: None,
                    loser: None,
                    winner_child: None,
                    loser_child: None,
                },
            ],
            n_elimination: 1,
            best_of: 1,
        };
        bracket.create_child_node(
            AvailableEndpoint { node: 0, kind: FeederKind::Winner, submission_id: 1, losses: 0, wins: 0 },
            AvailableEndpoint { node: 1, kind: FeederKind::Winner, submission_id: 1, losses: 0, wins: 0 },
        );
        bracket.declare_and_propagate_winners().unwrap();
        let final_node = bracket.nodes.last().unwrap();
        assert_eq!(final_node.winner, Some(Side::Real(1)));
        assert_eq!(final_node.loser, Some(Side::Real(1)));
    }

    #[test]
    fn test_three_team_single_elimination_terminates() {
        let mut bracket = Bracket::generate_initial_pairing(&[10, 20, 30], 1, 1);
        bracket.declare_and_propagate_winners().unwrap();

        // Finish off whichever nodes are still pending a real-vs-real decision.
        for idx in 0..bracket.nodes.len() {
            if !bracket.nodes[idx].decided() {
                if let (Some(Side::Real(a)), Some(Side::Real(b))) =
                    (bracket.nodes[idx].submissions[0], bracket.nodes[idx].submissions[1])
                {
                    decide(&mut bracket, idx, a, b);
                }
            }
        }

        loop {
            match bracket.grow() {
                TickOutcome::InProgress => {
                    bracket.declare_and_propagate_winners().unwrap();
                    for idx in 0..bracket.nodes.len() {
                        if !bracket.nodes[idx].decided() {
                            if let (Some(Side::Real(a)), Some(Side::Real(b))) =
                                (bracket.nodes[idx].submissions[0], bracket.nodes[idx].submissions[1])
                            {
                                decide(&mut bracket, idx, a, b);
                            }
                        }
                    }
                }
                TickOutcome::Complete { .. } => break,
                TickOutcome::Starvation { .. } => panic!("bracket starved unexpectedly"),
            }
        }
    }

    #[test]
    fn test_to_dot_declares_every_node() {
        let bracket = Bracket::generate_initial_pairing(&[1, 2], 1, 1);
        let dot = bracket.to_dot();
        assert!(dot.starts_with("digraph bracket {"));
        assert!(dot.contains("n0"));
    }
}
