//! Match and contest run model.

use std::{fmt::Display, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{error::ContestError, layout::Layout};

/// Stable identity of a match across planning and resumed runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(String);

impl MatchId {
    /// Pure function of the ordered pair, the layout key and the league index.
    pub fn new(league: usize, red: &str, blue: &str, layout: &Layout) -> MatchId {
        MatchId(format!("L{league}/{red}-vs-{blue}/{}", layout.key()))
    }

    /// String form, usable in file names once sanitized.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system friendly version of the identity.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

impl Display for MatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Created by the planner, never dispatched.
    Planned,
    /// Holds a worker slot.
    Dispatched,
    /// The engine is running on the worker.
    Running,
    /// Terminal: an outcome was produced (possibly a game-fault forfeit).
    Completed,
    /// Terminal: retries exhausted.
    Failed,
}

impl MatchStatus {
    /// Completed or Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchStatus::Completed | MatchStatus::Failed)
    }
}

/// Who won a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    /// Red side won.
    Red,
    /// Blue side won.
    Blue,
    /// Draw.
    Tie,
    /// Both sides lost (double forfeit).
    Nobody,
}

/// Result of a finished match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutcome {
    /// Score from the red side point of view (positive: red ahead).
    pub score: i32,
    /// Winning side.
    pub winner: Winner,
    /// Red did not finish normally.
    pub red_forfeit: bool,
    /// Blue did not finish normally.
    pub blue_forfeit: bool,
    /// Why the match ended in a forfeit, if it did.
    pub fault: Option<String>,
}

impl MatchOutcome {
    /// A regular game result.
    pub fn played(score: i32) -> MatchOutcome {
        let winner = match score {
            s if s > 0 => Winner::Red,
            s if s < 0 => Winner::Blue,
            _ => Winner::Tie,
        };
        MatchOutcome {
            score,
            winner,
            red_forfeit: false,
            blue_forfeit: false,
            fault: None,
        }
    }

    /// Forfeit of one or both sides.
    pub fn forfeit(red: bool, blue: bool, reason: impl Into<String>) -> MatchOutcome {
        let winner = match (red, blue) {
            (true, false) => Winner::Blue,
            (false, true) => Winner::Red,
            (true, true) => Winner::Nobody,
            (false, false) => Winner::Tie,
        };
        MatchOutcome {
            score: 0,
            winner,
            red_forfeit: red,
            blue_forfeit: blue,
            fault: Some(reason.into()),
        }
    }

    /// Unresolved match scored as a draw.
    pub fn unresolved_tie(reason: impl Into<String>) -> MatchOutcome {
        MatchOutcome {
            fault: Some(reason.into()),
            ..MatchOutcome::played(0)
        }
    }
}

/// One game between two teams on one layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    /// Stable identity.
    pub id: MatchId,
    /// League (split) index.
    pub league: usize,
    /// Red team id.
    pub red: String,
    /// Blue team id.
    pub blue: String,
    /// Map played.
    pub layout: Layout,
    /// Step limit given to the engine.
    pub max_steps: u32,
    /// Current lifecycle status.
    pub status: MatchStatus,
    /// Number of dispatches so far.
    pub attempts: u32,
    /// Host of the current or last attempt.
    pub worker: Option<String>,
    /// Outcome, once terminal.
    pub outcome: Option<MatchOutcome>,
    /// Local copy of the engine log.
    pub log: Option<PathBuf>,
    /// Local copy of the replay.
    pub replay: Option<PathBuf>,
}

impl Match {
    /// A freshly planned match.
    pub fn new(league: usize, red: &str, blue: &str, layout: Layout, max_steps: u32) -> Match {
        Match {
            id: MatchId::new(league, red, blue, &layout),
            league,
            red: red.to_owned(),
            blue: blue.to_owned(),
            layout,
            max_steps,
            status: MatchStatus::Planned,
            attempts: 0,
            worker: None,
            outcome: None,
            log: None,
            replay: None,
        }
    }

    /// True if `team` plays in this match.
    pub fn involves(&self, team: &str) -> bool {
        self.red == team || self.blue == team
    }

    fn transition(&mut self, to: MatchStatus) -> Result<(), ContestError> {
        let allowed = match to {
            MatchStatus::Planned => false,
            MatchStatus::Dispatched => self.status == MatchStatus::Planned,
            MatchStatus::Running => self.status == MatchStatus::Dispatched,
            MatchStatus::Completed | MatchStatus::Failed => {
                matches!(self.status, MatchStatus::Dispatched | MatchStatus::Running)
            }
        };
        if !allowed {
            return Err(ContestError::IllegalTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Planned → Dispatched on `worker`.
    pub fn mark_dispatched(&mut self, worker: &str) -> Result<(), ContestError> {
        self.transition(MatchStatus::Dispatched)?;
        self.attempts += 1;
        self.worker = Some(worker.to_owned());
        Ok(())
    }

    /// Dispatched → Running.
    pub fn mark_running(&mut self) -> Result<(), ContestError> {
        self.transition(MatchStatus::Running)
    }

    /// → Completed with `outcome`.
    pub fn complete(&mut self, outcome: MatchOutcome) -> Result<(), ContestError> {
        self.transition(MatchStatus::Completed)?;
        self.outcome = Some(outcome);
        Ok(())
    }

    /// → Failed (terminal) with the outcome recorded for the failure.
    pub fn fail(&mut self, outcome: MatchOutcome) -> Result<(), ContestError> {
        self.transition(MatchStatus::Failed)?;
        self.outcome = Some(outcome);
        Ok(())
    }

    /// The only backward edge: a non-terminal attempt goes back to Dispatched on a new worker.
    pub fn retry(&mut self, worker: &str) -> Result<(), ContestError> {
        if self.status.is_terminal() || self.status == MatchStatus::Planned {
            return Err(ContestError::IllegalTransition {
                id: self.id.clone(),
                from: self.status,
                to: MatchStatus::Dispatched,
            });
        }
        self.status = MatchStatus::Dispatched;
        self.attempts += 1;
        self.worker = Some(worker.to_owned());
        Ok(())
    }

    /// Forget a prior run's unfinished attempt (no partial credit on resume).
    pub(crate) fn reset_unfinished(&mut self) {
        if self.status != MatchStatus::Completed {
            self.status = MatchStatus::Planned;
            self.attempts = 0;
            self.outcome = None;
            self.worker = None;
            self.log = None;
            self.replay = None;
        }
    }
}

impl Display for Match {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} VS {} @ {}]", self.red, self.blue, self.layout)
    }
}

/// Parameters that must be identical between a run and the manifest it resumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanParameters {
    /// Every team id of the roster, in roster order.
    pub teams: Vec<String>,
    /// Number of leagues.
    pub split_count: usize,
    /// Layout keys, in plan order.
    pub layouts: Vec<String>,
}

impl PlanParameters {
    /// Describes the first difference with `other`, if any.
    pub fn difference(&self, other: &PlanParameters) -> Option<String> {
        if self.teams != other.teams {
            return Some(format!("team roster {:?} vs {:?}", self.teams, other.teams));
        }
        if self.split_count != other.split_count {
            return Some(format!(
                "split count {} vs {}",
                self.split_count, other.split_count
            ));
        }
        if self.layouts != other.layouts {
            return Some(format!("layouts {:?} vs {:?}", self.layouts, other.layouts));
        }
        None
    }
}

/// Every match of one league for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestRun {
    /// Timestamp-based identifier of the contest.
    pub contest_id: String,
    /// League index.
    pub league: usize,
    /// Parameters the plan was built from.
    pub plan: PlanParameters,
    /// Matches in plan order.
    pub matches: Vec<Match>,
    /// Number of Completed or Failed matches.
    pub completed: usize,
}

impl ContestRun {
    /// New run over freshly planned matches.
    pub fn new(
        contest_id: impl Into<String>,
        league: usize,
        plan: PlanParameters,
        matches: Vec<Match>,
    ) -> ContestRun {
        let completed = matches.iter().filter(|m| m.status.is_terminal()).count();
        ContestRun {
            contest_id: contest_id.into(),
            league,
            plan,
            matches,
            completed,
        }
    }

    /// Match by identity.
    pub fn get(&self, id: &MatchId) -> Option<&Match> {
        self.matches.iter().find(|m| &m.id == id)
    }

    /// True once every match reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.matches.iter().all(|m| m.status.is_terminal())
    }

    /// Replaces the match with the same identity (appends if unknown). Keeps `completed` in sync.
    pub(crate) fn upsert(&mut self, updated: Match) {
        match self.matches.iter_mut().find(|m| m.id == updated.id) {
            Some(slot) => *slot = updated,
            None => self.matches.push(updated),
        }
        let completed = self.matches.iter().filter(|m| m.status.is_terminal()).count();
        // never goes down, even if a terminal match were overwritten
        self.completed = self.completed.max(completed);
    }
}
