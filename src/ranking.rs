//! Standings of a league.
//!
//! Every team gets points per match according to a [`PointsPolicy`]. A forfeit is a loss for the
//! forfeiting side, a double forfeit a loss for both. Matches without an outcome (never finished)
//! count for nothing.
//!
//! Standings are ordered by:
//! 1. points,
//! 2. head-to-head points among the teams tied on points,
//! 3. wins,
//! 4. score difference,
//! 5. team identifier (ascending), so the order is total.
//!
//! The input order of the matches never changes the result.

use std::{
    collections::{BTreeMap, HashSet},
    fmt::Display,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contest::{Match, Winner};

/// Points given for each result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsPolicy {
    /// Points for a win.
    pub win: i32,
    /// Points for a tie.
    pub tie: i32,
    /// Points for a loss (or forfeit).
    pub loss: i32,
}

impl Default for PointsPolicy {
    fn default() -> Self {
        PointsPolicy {
            win: 3,
            tie: 1,
            loss: 0,
        }
    }
}

/// Aggregated results of one team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    /// Team identifier.
    pub team: String,
    /// Matches with an outcome.
    pub played: u32,
    /// Number of wins.
    pub wins: u32,
    /// Number of ties.
    pub ties: u32,
    /// Number of losses, forfeits included.
    pub losses: u32,
    /// Total points.
    pub points: i64,
    /// Sum of score margins from this team's point of view.
    pub score_diff: i64,
}

impl Standing {
    fn new(team: &str) -> Standing {
        Standing {
            team: team.to_owned(),
            played: 0,
            wins: 0,
            ties: 0,
            losses: 0,
            points: 0,
            score_diff: 0,
        }
    }
}

impl Display for Standing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} pts (win: {}, tie: {}, loss: {}, diff: {})",
            self.team, self.points, self.wins, self.ties, self.losses, self.score_diff
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum GameResult {
    Win,
    Tie,
    Loss,
}

/// Red and blue results of a winner.
fn results(winner: Winner) -> (GameResult, GameResult) {
    match winner {
        Winner::Red => (GameResult::Win, GameResult::Loss),
        Winner::Blue => (GameResult::Loss, GameResult::Win),
        Winner::Tie => (GameResult::Tie, GameResult::Tie),
        Winner::Nobody => (GameResult::Loss, GameResult::Loss),
    }
}

/// Turns match outcomes into ordered standings.
#[derive(Debug, Clone, Default)]
pub struct RankingAggregator {
    policy: PointsPolicy,
}

impl RankingAggregator {
    /// Aggregator using `policy`.
    pub fn new(policy: PointsPolicy) -> RankingAggregator {
        RankingAggregator { policy }
    }

    fn points(&self, result: GameResult) -> i64 {
        i64::from(match result {
            GameResult::Win => self.policy.win,
            GameResult::Tie => self.policy.tie,
            GameResult::Loss => self.policy.loss,
        })
    }

    /// Standings of every team appearing in `matches`, best first.
    pub fn aggregate(&self, matches: &[Match]) -> Vec<Standing> {
        let mut table: BTreeMap<&str, Standing> = BTreeMap::new();
        for m in matches {
            table.entry(m.red.as_str()).or_insert_with(|| Standing::new(&m.red));
            table.entry(m.blue.as_str()).or_insert_with(|| Standing::new(&m.blue));
            let Some(outcome) = &m.outcome else {
                continue;
            };
            let (red_result, blue_result) = results(outcome.winner);
            for (team, result, margin) in [
                (&m.red, red_result, outcome.score),
                (&m.blue, blue_result, -outcome.score),
            ] {
                let points = self.points(result);
                if let Some(standing) = table.get_mut(team.as_str()) {
                    standing.played += 1;
                    standing.points += points;
                    standing.score_diff += i64::from(margin);
                    match result {
                        GameResult::Win => standing.wins += 1,
                        GameResult::Tie => standing.ties += 1,
                        GameResult::Loss => standing.losses += 1,
                    }
                }
            }
        }

        let mut standings = table.into_values().collect::<Vec<_>>();
        standings.sort_by(|a, b| b.points.cmp(&a.points).then_with(|| a.team.cmp(&b.team)));

        // break ties group by group
        let mut start = 0;
        while start < standings.len() {
            let points = standings[start].points;
            let end = standings[start..]
                .iter()
                .position(|s| s.points != points)
                .map_or(standings.len(), |offset| start + offset);
            if end - start > 1 {
                self.break_ties(&mut standings[start..end], matches);
            }
            start = end;
        }
        debug!(teams = standings.len(), "standings computed");
        standings
    }

    fn break_ties(&self, group: &mut [Standing], matches: &[Match]) {
        let members = group.iter().map(|s| s.team.clone()).collect::<HashSet<_>>();
        let mut head_to_head: BTreeMap<String, i64> = BTreeMap::new();
        for m in matches {
            if !(members.contains(&m.red) && members.contains(&m.blue)) {
                continue;
            }
            let Some(outcome) = &m.outcome else {
                continue;
            };
            let (red_result, blue_result) = results(outcome.winner);
            *head_to_head.entry(m.red.clone()).or_default() += self.points(red_result);
            *head_to_head.entry(m.blue.clone()).or_default() += self.points(blue_result);
        }
        let h2h = |team: &str| head_to_head.get(team).copied().unwrap_or(0);
        group.sort_by(|a, b| {
            h2h(&b.team)
                .cmp(&h2h(&a.team))
                .then(b.wins.cmp(&a.wins))
                .then(b.score_diff.cmp(&a.score_diff))
                .then_with(|| a.team.cmp(&b.team))
        });
    }
}

/// Position of `team` in `standings`, starting at 1.
pub fn rank_of(standings: &[Standing], team: &str) -> Option<usize> {
    standings.iter().position(|s| s.team == team).map(|i| i + 1)
}
