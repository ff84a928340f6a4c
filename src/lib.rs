//! # Contest Cluster
//!
//! Runs large all-against-all contests of two-player games between independently submitted
//! agents, spreading the matches over a pool of remote workers.
//!
//! It provides:
//! - Match plan generation: round-robin, split leagues, staff-versus-others, fixed and random
//!   layouts ([`MatchPlanner`](crate::planner::MatchPlanner))
//! - Capacity-bounded dispatch with retries, resume and cancellation
//!   ([`Scheduler`](crate::scheduler::Scheduler))
//! - Remote execution over SSH or on the local host ([`execution`])
//! - A crash-safe run manifest ([`ResultCollector`](crate::collector::ResultCollector))
//! - Logs and replays archives, stats file and optional upload ([`archive`])
//! - Standings with deterministic tie-breaks ([`RankingAggregator`](crate::ranking::RankingAggregator))
//!
//! The game engine is an opaque command, started once per match on a worker. Its output is the
//! match log and the outcome is read from it (see [`match_runner`]).
//!
//! # Documentation Overview
//!
//! - For the whole pipeline, see [`ContestRunner`](crate::contest_runner::ContestRunner).
//! - For the available options and how they are layered, see
//!   [`ContestConfig`](crate::configuration::ContestConfig).
//! - For the match lifecycle and the manifest model, see [`contest`].
//! - For plugging another transport, implement
//!   [`ExecutionProvider`](crate::execution::ExecutionProvider).
//!
//! # Usage Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use contest_cluster::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let file = ConfigOverrides::from_file(Path::new("contest.json"))?;
//!     let cli = ConfigOverrides {
//!         split: Some(2),
//!         ..Default::default()
//!     };
//!     let config = ContestConfig::layered(Some(file), cli);
//!
//!     let runner = ContestRunner::from_config(config)?;
//!     for report in runner.run(None)? {
//!         println!("league {}:", report.league);
//!         for standing in &report.standings {
//!             println!("  {standing}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Worker File
//!
//! ```json
//! {
//!     "workers": [
//!         { "hostname": "node1", "username": "contest", "password": "...", "no_cpu": 4 },
//!         { "hostname": "node2", "username": "contest", "private_key_file": "/keys/id_rsa",
//!           "private_key_password": null, "no_cpu": 8 }
//!     ]
//! }
//! ```
#![warn(missing_docs)]

pub use anyhow;

pub mod archive;
pub mod collector;
pub mod configuration;
pub mod contest;
pub mod contest_runner;
pub mod error;
pub mod execution;
pub mod layout;
pub mod logger;
pub mod match_runner;
pub mod planner;
pub mod ranking;
pub mod scheduler;
pub mod team;
pub mod worker_pool;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use contest_cluster::prelude::*;
/// ```
pub mod prelude {
    pub use crate::archive::{ArchiveManager, ArchiveRecord, HttpUploader, Location, Uploader};
    pub use crate::collector::ResultCollector;
    pub use crate::configuration::{ConfigOverrides, ContestConfig};
    pub use crate::contest::{ContestRun, Match, MatchId, MatchOutcome, MatchStatus, Winner};
    pub use crate::contest_runner::{ContestRunner, LeagueReport};
    pub use crate::error::{ArchiveFault, ContestError, ExecutionFault};
    pub use crate::execution::{
        CancelToken, ExecutionProvider, LocalProvider, Session, SshProvider,
    };
    pub use crate::layout::{Layout, LayoutBundle};
    pub use crate::match_runner::{EngineConfig, MatchRunner};
    pub use crate::planner::{League, MatchPlanner};
    pub use crate::ranking::{PointsPolicy, RankingAggregator, Standing};
    pub use crate::scheduler::{ExhaustedRetryPolicy, RunSummary, Scheduler};
    pub use crate::team::{Team, TeamRegistry};
    pub use crate::worker_pool::{Credentials, Worker, WorkerPool};
}
