//! A whole contest: roster, layouts, plan, then dispatch, ranking and archiving league by league.
//!
//! Leagues run one after the other over the same worker pool. A league is archived and ranked
//! only once every one of its matches is terminal; a cancelled run stops after the current
//! league, leaving its manifest behind for [`ContestRunner::run`] with a resume directory.
//! League working directories are removed at the very end, and only when their archives were
//! written somewhere else.
//!
//! Directory layout of a contest:
//!
//! ```text
//! <work_dir>/contest_<id>/
//!     config.json                 effective configuration
//!     league_<i>/manifest.json    resume state
//!     league_<i>/logs/            engine logs
//!     league_<i>/replays/         replays
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime};
use tracing::{info, instrument, warn, Level};

use crate::{
    archive::{ArchiveManager, ArchiveRecord, ArchiveSettings, RunArtifacts, Uploader},
    collector::{load_manifest, ResultCollector, MANIFEST_FILE},
    configuration::ContestConfig,
    contest::{ContestRun, PlanParameters},
    execution::{CancelToken, ExecutionProvider, LocalProvider, SshProvider},
    layout::{Layout, LayoutBundle},
    logger::{init_logger, LogSettings},
    match_runner::MatchRunner,
    planner::{League, MatchPlanner},
    ranking::{RankingAggregator, Standing},
    scheduler::{RunSummary, Scheduler},
    team::{collect_roster, Team, TeamRegistry},
    worker_pool::{load_workers, Worker, WorkerPool},
};

/// What a league hands over once it is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeagueReport {
    /// Contest identifier.
    pub contest_id: String,
    /// League index.
    pub league: usize,
    /// Final standings (partial if the league was cancelled).
    pub standings: Vec<Standing>,
    /// Archives, `None` if the league was cancelled.
    pub archive: Option<ArchiveRecord>,
    /// Dispatch counters.
    pub summary: RunSummary,
}

/// Runs a contest from its configuration.
pub struct ContestRunner {
    config: ContestConfig,
    pool: WorkerPool,
    provider: Arc<dyn ExecutionProvider>,
    archive: ArchiveManager,
    cancel: CancelToken,
}

impl ContestRunner {
    /// Runner over an explicit pool and provider.
    pub fn new(
        config: ContestConfig,
        pool: WorkerPool,
        provider: Arc<dyn ExecutionProvider>,
    ) -> ContestRunner {
        let archive = ArchiveManager::new(ArchiveSettings::from_config(&config), &config.upload_url);
        ContestRunner {
            config,
            pool,
            provider,
            archive,
            cancel: CancelToken::new(),
        }
    }

    /// Runner built from the configuration alone: SSH workers from `workers_file`, or the local
    /// host when no workers file is given.
    pub fn from_config(config: ContestConfig) -> anyhow::Result<ContestRunner> {
        let (workers, provider) = match &config.workers_file {
            Some(file) => (
                load_workers(file)?,
                Arc::new(SshProvider::default()) as Arc<dyn ExecutionProvider>,
            ),
            None => (
                vec![Worker::localhost()],
                Arc::new(LocalProvider::new(config.work_dir.join("sandbox")))
                    as Arc<dyn ExecutionProvider>,
            ),
        };
        let pool = WorkerPool::new(workers)?;
        Ok(ContestRunner::new(config, pool, provider))
    }

    /// Replaces the archive uploader.
    pub fn with_uploader(self, uploader: Arc<dyn Uploader>) -> ContestRunner {
        ContestRunner {
            archive: self.archive.with_uploader(uploader),
            ..self
        }
    }

    /// Uses an externally owned cancellation token.
    pub fn with_cancel_token(self, cancel: CancelToken) -> ContestRunner {
        ContestRunner { cancel, ..self }
    }

    /// Token stopping the contest.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Effective configuration.
    pub fn config(&self) -> &ContestConfig {
        &self.config
    }

    /// Runs (or resumes, when `resume_dir` is the directory of an interrupted contest) every
    /// league.
    #[instrument(skip(self))]
    pub fn run(&self, resume_dir: Option<&Path>) -> anyhow::Result<Vec<LeagueReport>> {
        let _logger = if self.config.log {
            Some(init_logger(&LogSettings {
                dir: self.config.work_dir.clone(),
                level: Level::TRACE,
            })?)
        } else {
            None
        };
        self.config.validate()?;

        let Some(teams_root) = &self.config.teams_root else {
            bail!("no teams directory configured");
        };
        let registry = match &self.config.team_names_file {
            Some(file) => Some(
                TeamRegistry::from_csv(file)?
                    .allow_non_registered(self.config.allow_non_registered_students),
            ),
            None => None,
        };
        let roster = collect_roster(
            teams_root,
            self.config.staff_teams_dir.as_deref(),
            registry.as_ref(),
        )?;

        let bundle = if self.config.fixed_layouts_dir.is_dir() {
            LayoutBundle::from_dir(&self.config.fixed_layouts_dir)?
        } else {
            warn!(
                "no layouts directory at {}",
                self.config.fixed_layouts_dir.display()
            );
            LayoutBundle::default()
        };
        let layouts = bundle.select(&self.config.layout_selection())?;

        let staff = roster
            .iter()
            .filter(|t| t.staff)
            .map(|t| t.id.clone())
            .collect::<Vec<_>>();
        let leagues = MatchPlanner::new(self.config.max_steps)
            .with_both_sides(self.config.play_both_sides)
            .plan(
                &roster,
                &layouts,
                self.config.split,
                &staff,
                self.config.staff_teams_vs_others_only,
            )?;
        let plan = PlanParameters {
            teams: roster.iter().map(|t| t.id.clone()).collect(),
            split_count: self.config.split,
            layouts: layouts.iter().map(Layout::key).collect(),
        };

        let (contest_id, contest_dir) = match resume_dir {
            Some(dir) => (resumed_contest_id(dir)?, dir.to_path_buf()),
            None => {
                let id = new_contest_id()?;
                let dir = self.config.work_dir.join(format!("contest_{id}"));
                (id, dir)
            }
        };
        std::fs::create_dir_all(&contest_dir)
            .with_context(|| format!("cannot create {}", contest_dir.display()))?;
        self.config.write_build_config(&contest_dir.join("config.json"))?;
        info!(contest_id, leagues = leagues.len(), "contest planned");

        let mut reports: Vec<LeagueReport> = vec![];
        for league in leagues {
            let resume = resume_dir.is_some();
            let report =
                self.run_league(&contest_id, &contest_dir, &plan, &bundle, league, resume)?;
            let cancelled = report.summary.cancelled;
            reports.push(report);
            if cancelled {
                warn!("contest cancelled, resume with {}", contest_dir.display());
                return Ok(reports);
            }
        }

        // manifests are only dropped once no league can be resumed any more
        for report in &reports {
            let Some(record) = &report.archive else {
                continue;
            };
            let run_dir = contest_dir.join(format!("league_{}", report.league));
            if let Err(e) = self.archive.clean_up(&run_dir, record) {
                warn!("{e}");
            }
        }
        Ok(reports)
    }

    fn run_league(
        &self,
        contest_id: &str,
        contest_dir: &Path,
        plan: &PlanParameters,
        bundle: &LayoutBundle,
        league: League,
        resume: bool,
    ) -> anyhow::Result<LeagueReport> {
        let run_dir = contest_dir.join(format!("league_{}", league.index));
        let logs_dir = run_dir.join("logs");
        let replays_dir = run_dir.join("replays");
        for dir in [&logs_dir, &replays_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }

        let planned = ContestRun::new(contest_id, league.index, plan.clone(), league.matches);
        let mut collector = if resume && run_dir.join(MANIFEST_FILE).is_file() {
            ResultCollector::resume(&run_dir, planned)?
        } else {
            ResultCollector::create(&run_dir, planned)?
        };

        let runner = MatchRunner::new(
            self.config.engine.clone(),
            bundle.clone(),
            &logs_dir,
            &replays_dir,
            format!("{contest_id}_L{}", league.index),
        );
        let scheduler = Scheduler::new(runner, &league.teams, &self.config)
            .with_cancel_token(self.cancel.clone());
        let summary = scheduler.run(&self.pool, Arc::clone(&self.provider), &mut collector)?;

        let run = collector.into_run();
        let standings = RankingAggregator::new(self.config.points).aggregate(&run.matches);
        if summary.cancelled {
            return Ok(LeagueReport {
                contest_id: contest_id.to_owned(),
                league: league.index,
                standings,
                archive: None,
                summary,
            });
        }

        print_standings(league.index, &league.teams, &standings, self.config.verbose);
        let record = self.archive.archive(
            &run,
            &standings,
            RunArtifacts {
                run_dir: &run_dir,
                logs_dir: &logs_dir,
                replays_dir: &replays_dir,
            },
        );

        Ok(LeagueReport {
            contest_id: contest_id.to_owned(),
            league: league.index,
            standings,
            archive: Some(record),
            summary,
        })
    }
}

fn new_contest_id() -> anyhow::Result<String> {
    let format = format_description!("[year]-[month]-[day]-[hour]-[minute]-[second]");
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    Ok(now.format(format)?)
}

/// Contest identifier of the first league manifest found in `dir`.
fn resumed_contest_id(dir: &Path) -> anyhow::Result<String> {
    let mut manifests = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read resume directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path().join(MANIFEST_FILE)))
        .filter(|path| path.is_file())
        .collect::<Vec<PathBuf>>();
    manifests.sort();
    let Some(first) = manifests.first() else {
        bail!("no league manifest in {}", dir.display());
    };
    Ok(load_manifest(first)?.contest_id)
}

fn print_standings(league: usize, teams: &[Team], standings: &[Standing], verbose: bool) {
    if !verbose {
        return;
    }
    println!("\x1b[2K\x1b[32mLeague {league}\x1b[39m");
    for (rank, standing) in standings.iter().enumerate() {
        let name = teams
            .iter()
            .find(|t| t.id == standing.team)
            .map(|t| t.to_string())
            .unwrap_or_else(|| standing.team.clone());
        println!(
            "{:>3}. {name}: {} pts ({}W {}T {}L, {:+})",
            rank + 1,
            standing.points,
            standing.wins,
            standing.ties,
            standing.losses,
            standing.score_diff
        );
    }
}
