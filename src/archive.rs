//! Packaging of a finished league: logs and replays tarballs, stats file, optional upload.
//!
//! Nothing here can fail a run. Every artifact is produced independently; a packaging or upload
//! failure is logged and the artifact is reported as missing (or as its local path, when only the
//! upload failed).

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    configuration::ContestConfig,
    contest::{ContestRun, MatchStatus, Winner},
    error::ArchiveFault,
    ranking::Standing,
};

/// Where an artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// File on the coordinating host.
    Local(PathBuf),
    /// Uploaded copy.
    Url(String),
}

/// Artifacts of one league. Each one is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// Stats JSON file.
    pub stats: Option<Location>,
    /// Replays bundle.
    pub replays: Option<Location>,
    /// Logs bundle (same as `replays` with a single archive).
    pub logs: Option<Location>,
}

/// Per-match line of the stats file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummary {
    /// Match identity.
    pub id: String,
    /// Red team.
    pub red: String,
    /// Blue team.
    pub blue: String,
    /// Layout key.
    pub layout: String,
    /// Final status.
    pub status: MatchStatus,
    /// Number of attempts.
    pub attempts: u32,
    /// Red-perspective score.
    pub score: Option<i32>,
    /// Winning side.
    pub winner: Option<Winner>,
    /// Forfeit reason.
    pub fault: Option<String>,
}

/// Content of `stats_<contest>_L<league>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestStats {
    /// Contest identifier.
    pub contest_id: String,
    /// League index.
    pub league: usize,
    /// Organizer name.
    pub organizer: String,
    /// Every team of the league.
    pub teams: Vec<String>,
    /// Layout keys.
    pub layouts: Vec<String>,
    /// Match results in plan order.
    pub matches: Vec<MatchSummary>,
    /// Ordered standings.
    pub standings: Vec<Standing>,
}

impl ContestStats {
    /// Stats of `run` with the given standings.
    pub fn new(run: &ContestRun, organizer: &str, standings: &[Standing]) -> ContestStats {
        let matches = run
            .matches
            .iter()
            .map(|m| MatchSummary {
                id: m.id.to_string(),
                red: m.red.clone(),
                blue: m.blue.clone(),
                layout: m.layout.key(),
                status: m.status,
                attempts: m.attempts,
                score: m.outcome.as_ref().map(|o| o.score),
                winner: m.outcome.as_ref().map(|o| o.winner),
                fault: m.outcome.as_ref().and_then(|o| o.fault.clone()),
            })
            .collect();
        ContestStats {
            contest_id: run.contest_id.clone(),
            league: run.league,
            organizer: organizer.to_owned(),
            teams: standings.iter().map(|s| s.team.clone()).collect(),
            layouts: run.plan.layouts.clone(),
            matches,
            standings: standings.to_vec(),
        }
    }
}

/// Remote store for archives.
pub trait Uploader: Send + Sync {
    /// Uploads `file` and returns the URL it can be fetched from.
    fn upload(&self, file: &Path) -> Result<String, ArchiveFault>;
}

/// Uploads with an HTTP `PUT <url>/<file name>`; the response body is the download URL.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    url: String,
    timeout: Duration,
}

impl HttpUploader {
    /// Uploader to `url`.
    pub fn new(url: impl Into<String>) -> HttpUploader {
        HttpUploader {
            url: url.into(),
            timeout: Duration::from_secs(600),
        }
    }

    /// Time allowed for one upload.
    pub fn with_timeout(self, timeout: Duration) -> HttpUploader {
        HttpUploader { timeout, ..self }
    }
}

impl Uploader for HttpUploader {
    fn upload(&self, file: &Path) -> Result<String, ArchiveFault> {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArchiveFault::Upload(format!("bad file name {}", file.display())))?;
        let body = File::open(file).map_err(|source| ArchiveFault::Packaging {
            what: file.display().to_string(),
            source,
        })?;
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ArchiveFault::Upload(e.to_string()))?;
        let response = client
            .put(format!("{}/{name}", self.url.trim_end_matches('/')))
            .body(body)
            .send()
            .map_err(|e| ArchiveFault::Upload(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveFault::Upload(format!("{name}: HTTP {status}")));
        }
        let url = response
            .text()
            .map_err(|e| ArchiveFault::Upload(e.to_string()))?;
        Ok(url.trim().to_owned())
    }
}

/// Archive options, usually taken from the contest configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSettings {
    /// Organizer name written in the stats.
    pub organizer: String,
    /// Destination of the stats file (`None`: the run directory).
    pub stats_dir: Option<PathBuf>,
    /// Destination of the replays archive.
    pub replays_dir: Option<PathBuf>,
    /// Destination of the logs archive.
    pub logs_dir: Option<PathBuf>,
    /// gzip the logs archive.
    pub compress_logs: bool,
    /// One archive for logs and replays.
    pub single_archive: bool,
    /// Upload the logs archive.
    pub upload_logs: bool,
    /// Upload the replays archive.
    pub upload_replays: bool,
}

impl ArchiveSettings {
    /// Settings of `config`.
    pub fn from_config(config: &ContestConfig) -> ArchiveSettings {
        ArchiveSettings {
            organizer: config.organizer.clone(),
            stats_dir: config.stats_archive_dir.clone(),
            replays_dir: config.replays_archive_dir.clone(),
            logs_dir: config.logs_archive_dir.clone(),
            compress_logs: config.compress_logs,
            single_archive: config.single_archive,
            upload_logs: config.upload_logs,
            upload_replays: config.upload_replays,
        }
    }
}

/// Directories produced by a league run.
#[derive(Debug, Clone, Copy)]
pub struct RunArtifacts<'a> {
    /// League working directory (manifest, default archive destination).
    pub run_dir: &'a Path,
    /// Engine logs.
    pub logs_dir: &'a Path,
    /// Replays.
    pub replays_dir: &'a Path,
}

/// Builds the archives of a league.
#[derive(Clone)]
pub struct ArchiveManager {
    settings: ArchiveSettings,
    uploader: Arc<dyn Uploader>,
}

impl ArchiveManager {
    /// Manager uploading to `upload_url` over HTTP.
    pub fn new(settings: ArchiveSettings, upload_url: &str) -> ArchiveManager {
        ArchiveManager {
            settings,
            uploader: Arc::new(HttpUploader::new(upload_url)),
        }
    }

    /// Replaces the uploader.
    pub fn with_uploader(self, uploader: Arc<dyn Uploader>) -> ArchiveManager {
        ArchiveManager { uploader, ..self }
    }

    /// Packages the artifacts of `run` and writes its stats.
    #[instrument(skip_all, fields(contest = run.contest_id, league = run.league))]
    pub fn archive(
        &self,
        run: &ContestRun,
        standings: &[Standing],
        artifacts: RunArtifacts<'_>,
    ) -> ArchiveRecord {
        let suffix = format!("{}_L{}", run.contest_id, run.league);
        let dest = |dir: &Option<PathBuf>| dir.clone().unwrap_or_else(|| artifacts.run_dir.into());
        let mut record = ArchiveRecord::default();

        let stats_path = dest(&self.settings.stats_dir).join(format!("stats_{suffix}.json"));
        let stats = ContestStats::new(run, &self.settings.organizer, standings);
        record.stats = self.keep_local("stats", write_stats(&stats, &stats_path), &stats_path);

        if self.settings.single_archive {
            let path = dest(&self.settings.logs_dir).join(format!("contest_{suffix}.tar.gz"));
            let built = write_tarball(
                &path,
                true,
                &[("logs", artifacts.logs_dir), ("replays", artifacts.replays_dir)],
            );
            let location = self.keep_local("contest archive", built, &path).map(|local| {
                self.maybe_upload(local, self.settings.upload_logs || self.settings.upload_replays)
            });
            record.logs = location.clone();
            record.replays = location;
        } else {
            let extension = if self.settings.compress_logs { "tar.gz" } else { "tar" };
            let logs = dest(&self.settings.logs_dir).join(format!("logs_{suffix}.{extension}"));
            let built = write_tarball(&logs, self.settings.compress_logs, &[(
                "logs",
                artifacts.logs_dir,
            )]);
            record.logs = self
                .keep_local("logs archive", built, &logs)
                .map(|local| self.maybe_upload(local, self.settings.upload_logs));

            let replays = dest(&self.settings.replays_dir).join(format!("replays_{suffix}.tar.gz"));
            let built = write_tarball(&replays, true, &[("replays", artifacts.replays_dir)]);
            record.replays = self
                .keep_local("replays archive", built, &replays)
                .map(|local| self.maybe_upload(local, self.settings.upload_replays));
        }

        info!(?record, "league archived");
        record
    }

    fn keep_local(
        &self,
        what: &str,
        built: Result<(), ArchiveFault>,
        path: &Path,
    ) -> Option<Location> {
        match built {
            Ok(()) => Some(Location::Local(path.to_path_buf())),
            Err(e) => {
                warn!("no {what}: {e}");
                None
            }
        }
    }

    fn maybe_upload(&self, local: Location, upload: bool) -> Location {
        let Location::Local(path) = &local else {
            return local;
        };
        if !upload {
            return local;
        }
        match self.uploader.upload(path) {
            Ok(url) => {
                info!("{} uploaded to {url}", path.display());
                Location::Url(url)
            }
            Err(e) => {
                warn!("keeping local copy {}: {e}", path.display());
                local
            }
        }
    }

    /// Removes the league working directory, unless an archive was written inside it.
    ///
    /// Returns true if the directory was removed.
    pub fn clean_up(&self, run_dir: &Path, record: &ArchiveRecord) -> Result<bool, ArchiveFault> {
        let inside = [&record.stats, &record.logs, &record.replays]
            .into_iter()
            .flatten()
            .any(|location| matches!(location, Location::Local(p) if p.starts_with(run_dir)));
        if inside {
            info!("keeping {}, it holds archives", run_dir.display());
            return Ok(false);
        }
        fs::remove_dir_all(run_dir).map_err(|source| ArchiveFault::Packaging {
            what: format!("clean up of {}", run_dir.display()),
            source,
        })?;
        Ok(true)
    }
}

fn write_stats(stats: &ContestStats, path: &Path) -> Result<(), ArchiveFault> {
    let packaging = |source: io::Error| ArchiveFault::Packaging {
        what: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(packaging)?;
    }
    let text = serde_json::to_string_pretty(stats).map_err(|e| packaging(e.into()))?;
    let mut file = File::create(path).map_err(packaging)?;
    file.write_all(text.as_bytes()).map_err(packaging)?;
    Ok(())
}

/// Tars each `(name, directory)` pair under `name/`. Missing directories are archived empty.
fn write_tarball(path: &Path, gzip: bool, content: &[(&str, &Path)]) -> Result<(), ArchiveFault> {
    let build = || -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        for (_, dir) in content {
            fs::create_dir_all(dir)?;
        }
        let file = File::create(path)?;
        if gzip {
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            for (name, dir) in content {
                builder.append_dir_all(name, dir)?;
            }
            builder.into_inner()?.finish()?.sync_all()
        } else {
            let mut builder = tar::Builder::new(file);
            for (name, dir) in content {
                builder.append_dir_all(name, dir)?;
            }
            builder.into_inner()?.sync_all()
        }
    };
    build().map_err(|source| ArchiveFault::Packaging {
        what: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Mutex};

    use flate2::read::GzDecoder;

    use super::*;
    use crate::{
        contest::{Match, MatchOutcome, PlanParameters},
        layout::Layout,
        ranking::RankingAggregator,
    };

    struct FakeUploader {
        fail: bool,
        uploaded: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl Uploader for FakeUploader {
        fn upload(&self, file: &Path) -> Result<String, ArchiveFault> {
            if self.fail {
                return Err(ArchiveFault::Upload("store unreachable".into()));
            }
            self.uploaded.lock().unwrap().push(file.to_path_buf());
            Ok(format!("https://store/{}", file.file_name().unwrap().to_string_lossy()))
        }
    }

    fn settings() -> ArchiveSettings {
        ArchiveSettings::from_config(&ContestConfig::default())
    }

    fn finished_run() -> ContestRun {
        let mut m = Match::new(0, "a", "b", Layout::fixed("jumbo"), 100);
        m.mark_dispatched("w").unwrap();
        m.complete(MatchOutcome::played(2)).unwrap();
        let plan = PlanParameters {
            teams: vec!["a".into(), "b".into()],
            split_count: 1,
            layouts: vec!["jumbo".into()],
        };
        ContestRun::new("c1", 0, plan, vec![m])
    }

    struct Dirs {
        _root: tempfile::TempDir,
        run: PathBuf,
        logs: PathBuf,
        replays: PathBuf,
    }

    impl Dirs {
        fn new() -> Dirs {
            let root = tempfile::tempdir().unwrap();
            let run = root.path().join("league_0");
            let logs = run.join("logs");
            let replays = run.join("replays");
            fs::create_dir_all(&logs).unwrap();
            fs::write(logs.join("m1.log"), "The Red team wins by 2 points.").unwrap();
            Dirs {
                _root: root,
                run,
                logs,
                replays,
            }
        }

        fn artifacts(&self) -> RunArtifacts<'_> {
            RunArtifacts {
                run_dir: &self.run,
                logs_dir: &self.logs,
                replays_dir: &self.replays,
            }
        }
    }

    fn entries<R: io::Read>(archive: R) -> BTreeSet<String> {
        tar::Archive::new(archive)
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn separate_archives_and_stats() {
        let dirs = Dirs::new();
        let run = finished_run();
        let standings = RankingAggregator::default().aggregate(&run.matches);
        let manager = ArchiveManager::new(settings(), "http://unused");
        let record = manager.archive(&run, &standings, dirs.artifacts());

        let logs = dirs.run.join("logs_c1_L0.tar");
        assert_eq!(record.logs, Some(Location::Local(logs.clone())));
        assert!(entries(File::open(&logs).unwrap()).contains("logs/m1.log"));

        let replays = dirs.run.join("replays_c1_L0.tar.gz");
        assert_eq!(record.replays, Some(Location::Local(replays.clone())));
        entries(GzDecoder::new(File::open(&replays).unwrap()));

        let stats_path = dirs.run.join("stats_c1_L0.json");
        let stats: ContestStats =
            serde_json::from_str(&fs::read_to_string(&stats_path).unwrap()).unwrap();
        assert_eq!(stats.matches[0].winner, Some(Winner::Red));
        assert_eq!(stats.standings[0].team, "a");
        assert_eq!(stats.organizer, "Uni Pacman");

        // archives live in the run dir, so it is kept
        assert!(!manager.clean_up(&dirs.run, &record).unwrap());
        assert!(dirs.run.exists());
    }

    #[test]
    fn single_compressed_archive_uploaded() {
        let dirs = Dirs::new();
        let uploaded = Arc::new(Mutex::new(vec![]));
        let out = tempfile::tempdir().unwrap();
        let settings = ArchiveSettings {
            single_archive: true,
            upload_logs: true,
            stats_dir: Some(out.path().into()),
            logs_dir: Some(out.path().into()),
            ..settings()
        };
        let manager = ArchiveManager::new(settings, "http://unused").with_uploader(Arc::new(
            FakeUploader {
                fail: false,
                uploaded: Arc::clone(&uploaded),
            },
        ));
        let run = finished_run();
        let record = manager.archive(&run, &[], dirs.artifacts());

        let url = Location::Url("https://store/contest_c1_L0.tar.gz".into());
        assert_eq!(record.logs, Some(url.clone()));
        assert_eq!(record.replays, Some(url));
        assert_eq!(uploaded.lock().unwrap().len(), 1);
        let archive = out.path().join("contest_c1_L0.tar.gz");
        let names = entries(GzDecoder::new(File::open(archive).unwrap()));
        assert!(names.contains("logs/m1.log"));

        assert!(manager.clean_up(&dirs.run, &record).unwrap());
        assert!(!dirs.run.exists());
    }

    #[test]
    fn failed_upload_keeps_local_path() {
        let dirs = Dirs::new();
        let settings = ArchiveSettings {
            upload_logs: true,
            upload_replays: true,
            compress_logs: true,
            ..settings()
        };
        let manager = ArchiveManager::new(settings, "http://unused").with_uploader(Arc::new(
            FakeUploader {
                fail: true,
                uploaded: Arc::default(),
            },
        ));
        let record = manager.archive(&finished_run(), &[], dirs.artifacts());
        assert_eq!(
            record.logs,
            Some(Location::Local(dirs.run.join("logs_c1_L0.tar.gz")))
        );
        assert!(matches!(record.replays, Some(Location::Local(_))));
        assert!(record.stats.is_some());
    }
}
