//! Dispatch of a league's matches over the worker pool.
//!
//! One coordinating thread owns the queue and the [`ResultCollector`]. Each dispatched match runs
//! on its own thread, which holds the worker slot and reports back over a channel. The
//! coordinating thread blocks on that channel whenever nothing can be dispatched.
//!
//! ```text
//! Planned -> Dispatched -> Running -> Completed
//!                 ^            |  \-> Failed      (attempts exhausted)
//!                 \-- retry ---/                  (connectivity fault)
//! ```

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    collector::ResultCollector,
    configuration::{ContestConfig, ExecutionTimeout},
    contest::{Match, MatchId, MatchOutcome, MatchStatus, Winner},
    error::{ContestError, ExecutionFault},
    execution::{CancelToken, ExecutionProvider},
    match_runner::{MatchExecution, MatchRunner},
    team::Team,
    worker_pool::{SlotGuard, WorkerPool},
};

/// What a match gets once all its attempts failed on connectivity faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedRetryPolicy {
    /// Both sides forfeit (both lose).
    #[default]
    BothForfeit,
    /// Scored as a draw.
    Tie,
}

impl ExhaustedRetryPolicy {
    /// Outcome recorded for an exhausted match.
    pub fn outcome(self, reason: impl Into<String>) -> MatchOutcome {
        match self {
            ExhaustedRetryPolicy::BothForfeit => MatchOutcome::forfeit(true, true, reason),
            ExhaustedRetryPolicy::Tie => MatchOutcome::unresolved_tie(reason),
        }
    }
}

/// Counters of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Completed matches taken from the resume manifest.
    pub carried_over: usize,
    /// Dispatches, retries included.
    pub dispatched: usize,
    /// Matches that reached Completed in this run.
    pub completed: usize,
    /// Matches that reached Failed in this run.
    pub failed: usize,
    /// Attempts that ended in a connectivity fault and were queued again.
    pub retried: usize,
    /// Matches left non-terminal (cancellation).
    pub unfinished: usize,
    /// The run was cancelled before every match was terminal.
    pub cancelled: bool,
}

enum Report {
    Running(MatchId),
    Finished(MatchId, MatchExecution),
}

/// Reports the end of a match task, even if the task panics.
struct Task {
    id: MatchId,
    slot: Option<SlotGuard>,
    tx: Sender<Report>,
    reported: bool,
}

impl Task {
    fn running(&self) {
        let _ = self.tx.send(Report::Running(self.id.clone()));
    }

    fn finish(mut self, execution: MatchExecution) {
        // slot goes back before the coordinator hears about it
        drop(self.slot.take());
        self.reported = true;
        let _ = self.tx.send(Report::Finished(self.id.clone(), execution));
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if !self.reported {
            drop(self.slot.take());
            let _ = self.tx.send(Report::Finished(
                self.id.clone(),
                MatchExecution {
                    result: Err(ExecutionFault::Connectivity(
                        "match task panicked".to_owned(),
                    )),
                    log: None,
                    replay: None,
                },
            ));
        }
    }
}

/// Runs the queue of one league to completion (or cancellation).
pub struct Scheduler {
    runner: Arc<MatchRunner>,
    teams: Arc<HashMap<String, Team>>,
    max_attempts: u32,
    exhausted: ExhaustedRetryPolicy,
    timeouts: ExecutionTimeout,
    verbose: bool,
    cancel: CancelToken,
}

impl Scheduler {
    /// Scheduler running matches between `teams` with `runner`.
    pub fn new(runner: MatchRunner, teams: &[Team], config: &ContestConfig) -> Scheduler {
        Scheduler {
            runner: Arc::new(runner),
            teams: Arc::new(teams.iter().map(|t| (t.id.clone(), t.clone())).collect()),
            max_attempts: config.max_attempts.max(1),
            exhausted: config.exhausted_retry_policy,
            timeouts: config.timeouts(),
            verbose: config.verbose,
            cancel: CancelToken::new(),
        }
    }

    /// Uses an externally owned cancellation token.
    pub fn with_cancel_token(self, cancel: CancelToken) -> Scheduler {
        Scheduler { cancel, ..self }
    }

    /// Token stopping this scheduler. Clones share the same state.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs every match of `collector` that is not terminal.
    ///
    /// The collector holds the plan, already merged with the resume manifest if any (see
    /// [`ResultCollector::resume`]). Every status change is recorded before the next dispatch.
    ///
    /// If the run fails midway, the cancel token is forced and the in-flight matches are waited
    /// for before the error is returned; they stay non-terminal in the manifest.
    #[instrument(skip_all, fields(league = collector.run().league))]
    pub fn run(
        &self,
        pool: &WorkerPool,
        provider: Arc<dyn ExecutionProvider>,
        collector: &mut ResultCollector,
    ) -> Result<RunSummary, ContestError> {
        let mut summary = RunSummary {
            carried_over: collector
                .run()
                .matches
                .iter()
                .filter(|m| m.status == MatchStatus::Completed)
                .count(),
            ..Default::default()
        };

        let mut queue = VecDeque::new();
        for game in &collector.run().matches {
            for team in [&game.red, &game.blue] {
                if !self.teams.contains_key(team) {
                    return Err(ContestError::config(format!(
                        "match {} refers to unknown team '{team}'",
                        game.id
                    )));
                }
            }
            if !game.status.is_terminal() {
                queue.push_back(game.id.clone());
            }
        }
        // leftovers of an interrupted attempt start over
        for id in &queue {
            if let Some(game) = collector.run().get(id).filter(|m| m.status != MatchStatus::Planned)
            {
                let mut game = game.clone();
                game.reset_unfinished();
                collector.record(game)?;
            }
        }
        info!(
            queued = queue.len(),
            carried_over = summary.carried_over,
            capacity = pool.total_capacity(),
            "dispatch started"
        );

        let (tx, rx) = mpsc::channel();
        let mut running: Vec<MatchId> = vec![];
        let mut in_flight = 0usize;
        if self.verbose {
            disable_line_wrap();
        }

        let mut dispatch = || -> Result<(), ContestError> {
            loop {
                while !self.cancel.is_cancelled() {
                    let Some(id) = queue.front() else {
                        break;
                    };
                    let Some(game) = collector.run().get(id).cloned() else {
                        queue.pop_front();
                        continue;
                    };
                    let avoid = if game.attempts > 0 { game.worker.clone() } else { None };
                    let Some(slot) = pool.acquire_slot_avoiding(avoid.as_deref()) else {
                        trace!("no free slot");
                        break;
                    };
                    queue.pop_front();

                    let mut game = game;
                    let host = slot.worker().hostname().to_owned();
                    if game.status == MatchStatus::Planned {
                        game.mark_dispatched(&host)?;
                    } else {
                        game.retry(&host)?;
                    }
                    collector.update_status(&game)?;
                    debug!(game = %game.id, worker = host, attempt = game.attempts, "dispatched");
                    summary.dispatched += 1;
                    self.launch(game, slot, tx.clone(), Arc::clone(&provider))?;
                    in_flight += 1;
                }

                if in_flight == 0 {
                    if queue.is_empty() || self.cancel.is_cancelled() {
                        break;
                    }
                    // slots held outside of this run
                    pool.wait_for_release(Duration::from_secs(1));
                    continue;
                }

                // in_flight > 0 and we hold a sender: a report always comes
                let Ok(report) = rx.recv() else {
                    break;
                };
                match report {
                    Report::Running(id) => {
                        if let Some(game) = collector.run().get(&id).cloned() {
                            let mut game = game;
                            game.mark_running()?;
                            collector.update_status(&game)?;
                            running.push(id);
                            if self.verbose {
                                print_running_matches(&running);
                            }
                        }
                    }
                    Report::Finished(id, execution) => {
                        in_flight -= 1;
                        running.retain(|r| r != &id);
                        let Some(game) = collector.run().get(&id).cloned() else {
                            continue;
                        };
                        let retry = self.on_result(game, execution, collector, &mut summary)?;
                        if let Some(retry) = retry {
                            queue.push_back(retry);
                        }
                        if self.verbose && !running.is_empty() {
                            print_running_matches(&running);
                        }
                    }
                }
            }
            Ok(())
        };
        if let Err(e) = dispatch() {
            if in_flight > 0 {
                warn!(in_flight, "dispatch aborted, stopping in-flight matches: {e}");
                self.cancel.force_cancel();
                drain(&rx, in_flight);
            }
            if self.verbose {
                enable_line_wrap();
            }
            return Err(e);
        }

        if self.verbose {
            enable_line_wrap();
        }
        summary.unfinished = collector
            .run()
            .matches
            .iter()
            .filter(|m| !m.status.is_terminal())
            .count();
        summary.cancelled = self.cancel.is_cancelled() && summary.unfinished > 0;
        info!(?summary, "dispatch finished");
        Ok(summary)
    }

    /// Applies the retry policy. Returns the match to queue again, if any.
    fn on_result(
        &self,
        mut game: Match,
        execution: MatchExecution,
        collector: &mut ResultCollector,
        summary: &mut RunSummary,
    ) -> Result<Option<MatchId>, ContestError> {
        if execution.log.is_some() {
            game.log = execution.log;
        }
        game.replay = execution.replay;

        match execution.result {
            Ok(outcome) => {
                game.complete(outcome)?;
                summary.completed += 1;
            }
            Err(ExecutionFault::Game {
                red_crashed,
                blue_crashed,
                detail,
            }) => {
                warn!("{game}: game fault, {detail}");
                game.complete(MatchOutcome::forfeit(red_crashed, blue_crashed, detail))?;
                summary.completed += 1;
            }
            Err(ExecutionFault::Cancelled) => {
                info!("{game}: killed by cancellation");
                collector.record(game)?;
                return Ok(None);
            }
            Err(fault @ ExecutionFault::Connectivity(_)) => {
                if self.cancel.is_cancelled() {
                    info!("{game}: {fault}, not retried after cancellation");
                    collector.record(game)?;
                    return Ok(None);
                }
                if game.attempts < self.max_attempts {
                    warn!(
                        "{game}: {fault} on {}, attempt {}/{}",
                        game.worker.as_deref().unwrap_or("?"),
                        game.attempts,
                        self.max_attempts
                    );
                    summary.retried += 1;
                    let id = game.id.clone();
                    collector.record(game)?;
                    return Ok(Some(id));
                }
                warn!("{game}: {fault}, {} attempts exhausted", game.attempts);
                game.fail(self.exhausted.outcome(fault.to_string()))?;
                summary.failed += 1;
            }
        }

        if self.verbose {
            print_match_result(&game);
        }
        collector.record(game)?;
        Ok(None)
    }

    fn launch(
        &self,
        game: Match,
        slot: SlotGuard,
        tx: Sender<Report>,
        provider: Arc<dyn ExecutionProvider>,
    ) -> Result<(), ContestError> {
        let runner = Arc::clone(&self.runner);
        let teams = Arc::clone(&self.teams);
        let cancel = self.cancel.clone();
        let timeout = self.timeouts.for_steps(game.max_steps);
        let worker = slot.worker().clone();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());

        thread::Builder::new()
            .name(format!("match-{}", game.id.file_stem()))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let task = Task {
                        id: game.id.clone(),
                        slot: Some(slot),
                        tx,
                        reported: false,
                    };
                    task.running();
                    let execution = match (teams.get(&game.red), teams.get(&game.blue)) {
                        (Some(red), Some(blue)) => runner.run(
                            provider.as_ref(),
                            &worker,
                            &game,
                            red,
                            blue,
                            timeout,
                            &cancel,
                        ),
                        _ => MatchExecution {
                            result: Err(ExecutionFault::Connectivity(
                                "unknown team".to_owned(),
                            )),
                            log: None,
                            replay: None,
                        },
                    };
                    task.finish(execution);
                })
            })?;
        Ok(())
    }
}

/// Waits until `in_flight` match threads have reported their end, discarding the reports.
fn drain(rx: &Receiver<Report>, mut in_flight: usize) {
    while in_flight > 0 {
        match rx.recv() {
            Ok(Report::Finished(id, _)) => {
                debug!(game = %id, "stopped");
                in_flight -= 1;
            }
            Ok(Report::Running(_)) => {}
            Err(_) => break,
        }
    }
}

fn print_match_result(game: &Match) {
    let Some(outcome) = &game.outcome else {
        return;
    };
    let result = match outcome.winner {
        Winner::Red => format!("{} wins by {}", game.red, outcome.score),
        Winner::Blue => format!("{} wins by {}", game.blue, -outcome.score),
        Winner::Tie => "tie".to_owned(),
        Winner::Nobody => "both lose".to_owned(),
    };
    // clear line, green match, result, red fault, start of line
    println!(
        "\x1b[2K\x1b[32m{game}: \x1b[39m{result} \x1b[31m{}\x1b[39m\x1b[0G",
        outcome.fault.as_deref().unwrap_or_default()
    );
}

fn print_running_matches(running: &[MatchId]) {
    // clear, green, default, start of line
    print!(
        "\x1b[2K\x1b[32mRunning...:\x1b[39m {}\x1b[0G",
        running
            .iter()
            .map(MatchId::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn disable_line_wrap() {
    print!("\x1b[?7l");
}

fn enable_line_wrap() {
    print!("\x1b[?7h");
}
