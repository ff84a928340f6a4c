//! Result recording and the resume manifest.
//!
//! The collector owns the [`ContestRun`] of one league and mirrors it to
//! `<dir>/manifest.json` after every change. Writes go to a temporary file which is synced and
//! renamed over the manifest, so a crash leaves either the old or the new manifest, never a
//! truncated one.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use tracing::{info, instrument, trace, warn};

use crate::{
    contest::{ContestRun, Match, MatchStatus},
    error::ContestError,
};

/// File name of the manifest inside a league directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Records outcomes and keeps the manifest current.
#[derive(Debug)]
pub struct ResultCollector {
    dir: PathBuf,
    run: ContestRun,
}

impl ResultCollector {
    /// Starts a fresh run in `dir`, replacing any previous manifest.
    #[instrument(skip(dir, run), fields(contest = run.contest_id, league = run.league))]
    pub fn create(dir: impl Into<PathBuf>, run: ContestRun) -> Result<ResultCollector, ContestError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let collector = ResultCollector { dir, run };
        collector.persist()?;
        info!(matches = collector.run.matches.len(), "manifest created");
        Ok(collector)
    }

    /// Resumes the run whose manifest is in `dir`.
    ///
    /// `planned` is the run freshly planned from the current configuration. Its plan parameters
    /// must equal the manifest ones. Completed matches are carried over from the manifest, every
    /// other match starts again from scratch. The contest identifier of the manifest is kept.
    #[instrument(skip(dir, planned), fields(league = planned.league))]
    pub fn resume(
        dir: impl Into<PathBuf>,
        planned: ContestRun,
    ) -> Result<ResultCollector, ContestError> {
        let dir = dir.into();
        let prior = load_manifest(&dir.join(MANIFEST_FILE))?;
        if prior.league != planned.league {
            return Err(ContestError::ResumeMismatch(format!(
                "league {} vs {}",
                prior.league, planned.league
            )));
        }
        if let Some(difference) = prior.plan.difference(&planned.plan) {
            return Err(ContestError::ResumeMismatch(difference));
        }

        let mut carried = 0;
        let matches = planned
            .matches
            .into_iter()
            .map(|mut fresh| {
                if let Some(done) = prior
                    .get(&fresh.id)
                    .filter(|m| m.status == MatchStatus::Completed)
                {
                    carried += 1;
                    return done.clone();
                }
                fresh.reset_unfinished();
                fresh
            })
            .collect::<Vec<_>>();
        let dropped = prior
            .matches
            .iter()
            .filter(|m| !matches.iter().any(|n| n.id == m.id))
            .count();
        if dropped > 0 {
            warn!(dropped, "manifest matches absent from the current plan");
        }

        let run = ContestRun::new(prior.contest_id, planned.league, planned.plan, matches);
        let collector = ResultCollector { dir, run };
        collector.persist()?;
        info!(
            carried,
            remaining = collector.run.matches.len() - carried,
            "run resumed"
        );
        Ok(collector)
    }

    /// Records a match, overwriting any previous record with the same identity.
    ///
    /// A Completed match is never replaced by a non-terminal one.
    pub fn record(&mut self, game: Match) -> Result<(), ContestError> {
        if let Some(current) = self.run.get(&game.id) {
            if current.status == MatchStatus::Completed && !game.status.is_terminal() {
                warn!("ignoring stale update of completed match {}", game.id);
                return Ok(());
            }
            if current == &game {
                return Ok(());
            }
        }
        trace!(game = %game.id, status = ?game.status, "recorded");
        self.run.upsert(game);
        self.persist()
    }

    /// Persists a status change of `game`.
    pub fn update_status(&mut self, game: &Match) -> Result<(), ContestError> {
        self.record(game.clone())
    }

    /// Current state of the run.
    pub fn run(&self) -> &ContestRun {
        &self.run
    }

    /// Gives the run back.
    pub fn into_run(self) -> ContestRun {
        self.run
    }

    /// League directory holding the manifest.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    fn persist(&self) -> Result<(), ContestError> {
        let path = self.manifest_path();
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(&self.run)?;
        let mut file = File::create(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Reads a manifest written by a previous run.
pub fn load_manifest(path: &Path) -> Result<ContestRun, ContestError> {
    let text = fs::read_to_string(path).map_err(|e| {
        ContestError::ResumeMismatch(format!("no readable manifest at {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_str(&text)?)
}
