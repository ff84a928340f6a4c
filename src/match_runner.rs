//! Runs one match on one worker session and reads its outcome.
//!
//! The engine is opaque: it is started from a command template and its combined output is the
//! match log. The outcome is read back from that log:
//!
//! - `Red agent crashed` / `Blue agent crashed`: game fault, the crashing side forfeits,
//! - `Tie game`: draw,
//! - `The Red team wins by N points` / `The Blue team wins by N points`: regular result.
//!
//! A log without any of those lines means the engine never finished the game, which is treated as
//! a connectivity fault (retryable).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{
    contest::{Match, MatchOutcome},
    error::ExecutionFault,
    execution::{ssh::quote, CancelToken, ExecutionProvider, Session},
    layout::{Layout, LayoutBundle},
    team::Team,
    worker_pool::Worker,
};

/// How the engine is shipped and started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local directory pushed to the worker as `engine/`. `None` if workers already have it.
    pub dir: Option<PathBuf>,
    /// Command template. Placeholders: `{red}`, `{blue}`, `{red_name}`, `{blue_name}`,
    /// `{layout}`, `{max_steps}`, `{replay}`.
    pub command: String,
    /// Name of the replay file the command writes in its working directory.
    pub replay_file: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            dir: None,
            command: "python3 engine/capture.py -r {red} -b {blue} --red-name {red_name} \
                      --blue-name {blue_name} -l {layout} -i {max_steps} -q --record {replay}"
                .to_owned(),
            replay_file: "game.replay".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Engine started with `command`, writing `replay_file`.
    pub fn new(command: impl Into<String>, replay_file: impl Into<String>) -> EngineConfig {
        EngineConfig {
            dir: None,
            command: command.into(),
            replay_file: replay_file.into(),
        }
    }

    /// Ships `dir` to every worker before each match.
    pub fn with_dir(self, dir: impl Into<PathBuf>) -> EngineConfig {
        EngineConfig {
            dir: Some(dir.into()),
            ..self
        }
    }

    fn render(&self, red: &Team, blue: &Team, layout_arg: &str, max_steps: u32) -> String {
        self.command
            .replace("{red_name}", &quote(&red.name))
            .replace("{blue_name}", &quote(&blue.name))
            .replace("{red}", &quote(&format!("teams/{}", red.remote_file_name())))
            .replace("{blue}", &quote(&format!("teams/{}", blue.remote_file_name())))
            .replace("{layout}", &quote(layout_arg))
            .replace("{max_steps}", &max_steps.to_string())
            .replace("{replay}", &quote(&self.replay_file))
    }
}

/// What one execution attempt left behind.
#[derive(Debug)]
pub struct MatchExecution {
    /// Outcome, or the fault that prevented one.
    pub result: Result<MatchOutcome, ExecutionFault>,
    /// Local engine log, if the engine was started.
    pub log: Option<PathBuf>,
    /// Local replay, if one was pulled.
    pub replay: Option<PathBuf>,
}

/// Everything a match attempt needs besides the match itself.
#[derive(Debug, Clone)]
pub struct MatchRunner {
    engine: EngineConfig,
    layouts: LayoutBundle,
    logs_dir: PathBuf,
    replays_dir: PathBuf,
    workspace_prefix: String,
}

impl MatchRunner {
    /// Runner writing logs and replays into the given directories.
    pub fn new(
        engine: EngineConfig,
        layouts: LayoutBundle,
        logs_dir: impl Into<PathBuf>,
        replays_dir: impl Into<PathBuf>,
        workspace_prefix: impl Into<String>,
    ) -> MatchRunner {
        MatchRunner {
            engine,
            layouts,
            logs_dir: logs_dir.into(),
            replays_dir: replays_dir.into(),
            workspace_prefix: workspace_prefix.into(),
        }
    }

    /// Directory receiving engine logs.
    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Directory receiving replays.
    pub fn replays_dir(&self) -> &Path {
        &self.replays_dir
    }

    /// Connects, pushes, runs, pulls and disconnects. The session is closed on every path.
    #[instrument(skip_all, fields(game = %game.id, worker = worker.hostname()))]
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        provider: &dyn ExecutionProvider,
        worker: &Worker,
        game: &Match,
        red: &Team,
        blue: &Team,
        timeout: std::time::Duration,
        cancel: &CancelToken,
    ) -> MatchExecution {
        let workspace = format!(
            "{}_{}_a{}",
            self.workspace_prefix,
            game.id.file_stem(),
            game.attempts
        );
        let mut session = match provider.connect(worker, &workspace) {
            Ok(session) => session,
            Err(fault) => {
                return MatchExecution {
                    result: Err(fault),
                    log: None,
                    replay: None,
                }
            }
        };

        let execution = self.run_in_session(session.as_mut(), game, red, blue, timeout, cancel);

        if let Err(e) = session.disconnect() {
            warn!("cleanup after {} failed: {e}", game.id);
        }
        execution
    }

    fn run_in_session(
        &self,
        session: &mut dyn Session,
        game: &Match,
        red: &Team,
        blue: &Team,
        timeout: std::time::Duration,
        cancel: &CancelToken,
    ) -> MatchExecution {
        let failed = |fault| MatchExecution {
            result: Err(fault),
            log: None,
            replay: None,
        };

        if let Some(dir) = &self.engine.dir {
            if let Err(fault) = session.push(dir, "engine") {
                return failed(fault);
            }
        }
        for team in [red, blue] {
            let remote = format!("teams/{}", team.remote_file_name());
            if let Err(fault) = session.push(&team.submission, &remote) {
                return failed(fault);
            }
        }

        let layout_arg = match &game.layout {
            Layout::Fixed { name } => match self.layouts.path_of(name) {
                Some(path) => {
                    let remote = format!("layouts/{name}.lay");
                    if let Err(fault) = session.push(&path, &remote) {
                        return failed(fault);
                    }
                    remote
                }
                None => name.clone(),
            },
            random @ Layout::Random { .. } => random.key(),
        };

        let command = self.engine.render(red, blue, &layout_arg, game.max_steps);
        debug!(command);

        let stem = game.id.file_stem();
        let log = self.logs_dir.join(format!("{stem}.log"));
        let code = match session.execute(&command, &log, timeout, cancel) {
            Ok(code) => code,
            Err(fault) => {
                return MatchExecution {
                    result: Err(fault),
                    log: Some(log),
                    replay: None,
                }
            }
        };

        let text = std::fs::read_to_string(&log).unwrap_or_default();
        let result = parse_outcome(&text, code);

        let replay = if result.is_ok() {
            let local = self.replays_dir.join(format!("{stem}.replay"));
            match session.pull(&self.engine.replay_file, &local) {
                Ok(()) => Some(local),
                Err(e) => {
                    warn!("no replay for {}: {e}", game.id);
                    None
                }
            }
        } else {
            None
        };

        MatchExecution {
            result,
            log: Some(log),
            replay,
        }
    }
}

/// Reads the outcome of a game from the engine output.
pub fn parse_outcome(log: &str, exit_code: i32) -> Result<MatchOutcome, ExecutionFault> {
    let red_crashed = log.contains("Red agent crashed");
    let blue_crashed = log.contains("Blue agent crashed");
    if red_crashed || blue_crashed {
        let detail = log
            .lines()
            .find(|l| l.contains("agent crashed"))
            .unwrap_or_default()
            .trim()
            .to_owned();
        return Err(ExecutionFault::Game {
            red_crashed,
            blue_crashed,
            detail,
        });
    }

    for line in log.lines().rev() {
        let line = line.trim();
        if line.starts_with("Tie game") {
            return Ok(MatchOutcome::played(0));
        }
        for (prefix, sign) in [("The Red team wins by ", 1), ("The Blue team wins by ", -1)] {
            if let Some(rest) = line.strip_prefix(prefix) {
                let points = rest
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse::<i32>().ok());
                if let Some(points) = points {
                    return Ok(MatchOutcome::played(sign * points.abs()));
                }
            }
        }
    }

    if exit_code != 0 {
        Err(ExecutionFault::Connectivity(format!(
            "engine exited with code {exit_code} without a result"
        )))
    } else {
        Err(ExecutionFault::Connectivity(
            "no result line in engine output".to_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contest::Winner;

    #[test]
    fn parses_results() {
        let red = parse_outcome("...\nThe Red team wins by 12 points.\n", 0).unwrap();
        assert_eq!(red.score, 12);
        assert_eq!(red.winner, Winner::Red);

        let blue = parse_outcome("The Blue team wins by 3 points.", 0).unwrap();
        assert_eq!(blue.score, -3);
        assert_eq!(blue.winner, Winner::Blue);

        let tie = parse_outcome("Tie game!", 0).unwrap();
        assert_eq!(tie.winner, Winner::Tie);
    }

    #[test]
    fn crashes_are_game_faults() {
        let fault = parse_outcome("Red agent crashed:\nTraceback...", 1).unwrap_err();
        assert_eq!(
            fault,
            ExecutionFault::Game {
                red_crashed: true,
                blue_crashed: false,
                detail: "Red agent crashed:".into()
            }
        );
        assert!(!fault.is_retryable());
    }

    #[test]
    fn missing_result_is_retryable() {
        assert!(parse_outcome("Loading...", 0).unwrap_err().is_retryable());
        assert!(parse_outcome("", 137).unwrap_err().is_retryable());
    }

    #[test]
    fn command_rendering() {
        let engine = EngineConfig::new(
            "run {red} {blue} {red_name} {layout} {max_steps} {replay}",
            "out.rep",
        );
        let red = Team::new("t1", "/subs/t1.zip").with_name("Team One");
        let blue = Team::new("t2", "/subs/t2");
        let cmd = engine.render(&red, &blue, "RANDOM4", 300);
        assert_eq!(
            cmd,
            "run 'teams/t1.zip' 'teams/t2' 'Team One' 'RANDOM4' 300 'out.rep'"
        );
    }
}
