//! Contest configuration and its layering.
//!
//! Three layers are merged, later ones winning:
//!
//! 1. built-in defaults ([`ContestConfig::default`]),
//! 2. a JSON configuration file ([`ConfigOverrides::from_file`]),
//! 3. command line overrides (a [`ConfigOverrides`] filled by the caller).
//!
//! [`ContestConfig::layered`] is the pure merge function. After merging, `split = 0` is
//! normalised to one league and `upload_all` turns on both uploads.
//!
//! Every field of the file layer is optional; unknown keys are rejected so typos do not go
//! unnoticed.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    error::ContestError, layout::LayoutSelection, match_runner::EngineConfig,
    ranking::PointsPolicy, scheduler::ExhaustedRetryPolicy,
};

/// Effective configuration of a contest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContestConfig {
    /// Name of the organisation running the contest (reports only).
    pub organizer: String,
    /// Directory where contest runs, logs and replays are written.
    pub work_dir: PathBuf,
    /// Directory of team submissions.
    pub teams_root: Option<PathBuf>,
    /// Directory of staff submissions.
    pub staff_teams_dir: Option<PathBuf>,
    /// CSV with `STUDENT_ID` and `TEAM_NAME` columns mapping `<student no>_<timestamp>`
    /// submissions to teams.
    pub team_names_file: Option<PathBuf>,
    /// With `team_names_file`, students without a team still play under their student number.
    pub allow_non_registered_students: bool,
    /// Only play staff teams against the other teams.
    pub staff_teams_vs_others_only: bool,
    /// Number of leagues (0 means 1).
    pub split: usize,
    /// Play every pairing twice, once with each colour.
    pub play_both_sides: bool,
    /// Step limit of each game.
    pub max_steps: u32,
    /// Directory holding the fixed layouts (`*.lay`).
    pub fixed_layouts_dir: PathBuf,
    /// Number of fixed layouts.
    pub no_fixed_layouts: usize,
    /// Fixed layouts that must be played.
    pub fixed_layout_seeds: Vec<String>,
    /// Number of random layouts.
    pub no_random_layouts: usize,
    /// Random layout seeds that must be played.
    pub random_layout_seeds: Vec<u64>,
    /// Seed used to complete the layout selection.
    pub layout_seed: u64,
    /// JSON file describing the workers.
    pub workers_file: Option<PathBuf>,
    /// How the game engine is invoked.
    pub engine: EngineConfig,
    /// Attempts allowed per match before it is declared failed.
    pub max_attempts: u32,
    /// Outcome recorded when a match exhausts its attempts.
    pub exhausted_retry_policy: ExhaustedRetryPolicy,
    /// Fixed part of the execution deadline, in seconds.
    pub base_timeout_secs: u64,
    /// Deadline added per game step, in milliseconds.
    pub step_timeout_ms: u64,
    /// Where the stats file goes (default: the run directory).
    pub stats_archive_dir: Option<PathBuf>,
    /// Where the replays archive goes (default: the run directory).
    pub replays_archive_dir: Option<PathBuf>,
    /// Where the logs archive goes (default: the run directory).
    pub logs_archive_dir: Option<PathBuf>,
    /// gzip the logs archive (plain tar otherwise).
    pub compress_logs: bool,
    /// Put logs and replays in one archive.
    pub single_archive: bool,
    /// Upload the logs archive.
    pub upload_logs: bool,
    /// Upload the replays archive.
    pub upload_replays: bool,
    /// Remote store accepting `PUT <url>/<file name>`.
    pub upload_url: String,
    /// Points given per result.
    pub points: PointsPolicy,
    /// Print running matches on stdout.
    pub verbose: bool,
    /// Write a log file in the working directory.
    pub log: bool,
}

impl Default for ContestConfig {
    fn default() -> Self {
        ContestConfig {
            organizer: "Uni Pacman".to_owned(),
            work_dir: std::env::temp_dir().join("contest-cluster"),
            teams_root: None,
            staff_teams_dir: None,
            team_names_file: None,
            allow_non_registered_students: false,
            staff_teams_vs_others_only: false,
            split: 1,
            play_both_sides: false,
            max_steps: 1200,
            fixed_layouts_dir: PathBuf::from("layouts"),
            no_fixed_layouts: 3,
            fixed_layout_seeds: vec![],
            no_random_layouts: 3,
            random_layout_seeds: vec![],
            layout_seed: 0,
            workers_file: None,
            engine: EngineConfig::default(),
            max_attempts: 3,
            exhausted_retry_policy: ExhaustedRetryPolicy::BothForfeit,
            base_timeout_secs: 60,
            step_timeout_ms: 100,
            stats_archive_dir: None,
            replays_archive_dir: None,
            logs_archive_dir: None,
            compress_logs: false,
            single_archive: false,
            upload_logs: false,
            upload_replays: false,
            upload_url: "https://transfer.sh".to_owned(),
            points: PointsPolicy::default(),
            verbose: true,
            log: false,
        }
    }
}

/// Execution deadline of a match, saturating instead of overflowing on huge settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionTimeout {
    base: Duration,
    step_ms: u64,
}

impl ExecutionTimeout {
    /// Deadline for a match of `max_steps` steps.
    pub fn for_steps(&self, max_steps: u32) -> Duration {
        let steps = Duration::from_millis(self.step_ms.saturating_mul(u64::from(max_steps)));
        self.base.saturating_add(steps)
    }
}

/// One configuration layer: every field is optional and only set fields override.
///
/// Fields mirror [`ContestConfig`]; `upload_all` sets both upload flags.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub organizer: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub teams_root: Option<PathBuf>,
    pub staff_teams_dir: Option<PathBuf>,
    pub team_names_file: Option<PathBuf>,
    pub allow_non_registered_students: Option<bool>,
    pub staff_teams_vs_others_only: Option<bool>,
    pub split: Option<usize>,
    pub play_both_sides: Option<bool>,
    pub max_steps: Option<u32>,
    pub fixed_layouts_dir: Option<PathBuf>,
    pub no_fixed_layouts: Option<usize>,
    pub fixed_layout_seeds: Option<Vec<String>>,
    pub no_random_layouts: Option<usize>,
    pub random_layout_seeds: Option<Vec<u64>>,
    pub layout_seed: Option<u64>,
    pub workers_file: Option<PathBuf>,
    pub engine: Option<EngineConfig>,
    pub max_attempts: Option<u32>,
    pub exhausted_retry_policy: Option<ExhaustedRetryPolicy>,
    pub base_timeout_secs: Option<u64>,
    pub step_timeout_ms: Option<u64>,
    pub stats_archive_dir: Option<PathBuf>,
    pub replays_archive_dir: Option<PathBuf>,
    pub logs_archive_dir: Option<PathBuf>,
    pub compress_logs: Option<bool>,
    pub single_archive: Option<bool>,
    pub upload_logs: Option<bool>,
    pub upload_replays: Option<bool>,
    pub upload_all: Option<bool>,
    pub upload_url: Option<String>,
    pub points: Option<PointsPolicy>,
    pub verbose: Option<bool>,
    pub log: Option<bool>,
}

macro_rules! overlay {
    ($layer:ident => $base:ident; values: $($value:ident),*; options: $($option:ident),*) => {
        $(
            if let Some(v) = $layer.$value {
                $base.$value = v;
            }
        )*
        $(
            if let Some(v) = $layer.$option {
                $base.$option = Some(v);
            }
        )*
    };
}

impl ConfigOverrides {
    /// Reads a JSON configuration file as a layer.
    pub fn from_file(path: &Path) -> anyhow::Result<ConfigOverrides> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("configuration file {} not available", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("malformed configuration file {}", path.display()))
    }

    /// Applies the set fields of this layer on top of `base`.
    pub fn apply(self, mut base: ContestConfig) -> ContestConfig {
        let layer = self;
        overlay!(layer => base;
            values: organizer, work_dir, allow_non_registered_students,
                staff_teams_vs_others_only, split, play_both_sides, max_steps, fixed_layouts_dir, no_fixed_layouts, fixed_layout_seeds,
                no_random_layouts, random_layout_seeds, layout_seed, engine, max_attempts,
                exhausted_retry_policy, base_timeout_secs, step_timeout_ms, compress_logs,
                single_archive, upload_logs, upload_replays, upload_url, points, verbose, log;
            options: teams_root, staff_teams_dir, team_names_file, workers_file, stats_archive_dir,
                replays_archive_dir, logs_archive_dir
        );
        if layer.upload_all == Some(true) {
            base.upload_logs = true;
            base.upload_replays = true;
        }
        base
    }
}

impl ContestConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// defaults < `file` < `cli`, then normalisation.
    pub fn layered(file: Option<ConfigOverrides>, cli: ConfigOverrides) -> ContestConfig {
        let mut config = ContestConfig::default();
        if let Some(file) = file {
            config = file.apply(config);
        }
        config = cli.apply(config);
        if config.split == 0 {
            config.split = 1;
        }
        config
    }

    /// Rejects values no contest can run with.
    pub fn validate(&self) -> Result<(), ContestError> {
        if self.max_attempts == 0 {
            return Err(ContestError::config("max_attempts must be at least 1"));
        }
        if self.max_steps == 0 {
            return Err(ContestError::config("max_steps must be positive"));
        }
        if self.engine.command.trim().is_empty() {
            return Err(ContestError::config("engine command is empty"));
        }
        Ok(())
    }

    /// Deadline of one execution: base timeout plus a per-step allowance.
    pub fn execution_timeout(&self, max_steps: u32) -> Duration {
        self.timeouts().for_steps(max_steps)
    }

    /// The timeout settings alone, for components that outlive the configuration.
    pub fn timeouts(&self) -> ExecutionTimeout {
        ExecutionTimeout {
            base: Duration::from_secs(self.base_timeout_secs),
            step_ms: self.step_timeout_ms,
        }
    }

    /// Layout request derived from this configuration.
    pub fn layout_selection(&self) -> LayoutSelection {
        LayoutSelection {
            no_fixed_layouts: self.no_fixed_layouts,
            fixed_layout_seeds: self.fixed_layout_seeds.clone(),
            no_random_layouts: self.no_random_layouts,
            random_layout_seeds: self.random_layout_seeds.clone(),
            layout_seed: self.layout_seed,
        }
    }

    /// Dumps the effective configuration (sorted keys, pretty JSON).
    pub fn write_build_config(&self, path: &Path) -> anyhow::Result<()> {
        // serde_json::Value keeps object keys sorted
        let value = serde_json::to_value(self)?;
        let text = serde_json::to_string_pretty(&value)?;
        std::fs::write(path, text)
            .with_context(|| format!("cannot write configuration to {}", path.display()))
    }

    /// Enable or disable the progress line on stdout.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Sets the working directory.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Sets the number of leagues.
    pub fn with_split(mut self, split: usize) -> Self {
        self.split = split.max(1);
        self
    }

    /// Sets the engine invocation.
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the attempt limit per match.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the outcome recorded once retries are exhausted.
    pub fn with_exhausted_retry_policy(mut self, policy: ExhaustedRetryPolicy) -> Self {
        self.exhausted_retry_policy = policy;
        self
    }
}
