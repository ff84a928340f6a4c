//! Teams and roster discovery.
//!
//! A roster is built once, before planning, from one directory of student submissions and an
//! optional directory of staff submissions. Each entry of those directories is either a `.zip`
//! archive or a directory; its file stem becomes the team identifier.
//!
//! With a [`TeamRegistry`], student submissions are named `<student no>_<timestamp>` and are
//! grouped by the team the student is registered in. Only the latest submission of a team is
//! kept.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// One participating team. Immutable once the plan is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Team {
    /// Unique identifier, used in match identities.
    pub id: String,
    /// Display name used in reports.
    pub name: String,
    /// Zip archive or directory holding the agent code.
    pub submission: PathBuf,
    /// Staff (baseline) team.
    pub staff: bool,
}

impl Team {
    /// Creates a non-staff team whose display name is its identifier.
    pub fn new(id: impl Into<String>, submission: impl Into<PathBuf>) -> Team {
        let id = id.into();
        Team {
            name: id.clone(),
            id,
            submission: submission.into(),
            staff: false,
        }
    }

    /// Creates a staff team.
    pub fn staff(id: impl Into<String>, submission: impl Into<PathBuf>) -> Team {
        Team {
            staff: true,
            ..Team::new(id, submission)
        }
    }

    /// Sets the display name.
    pub fn with_name(self, name: impl Into<String>) -> Team {
        Team {
            name: name.into(),
            ..self
        }
    }

    /// File name the submission gets on a worker.
    pub fn remote_file_name(&self) -> String {
        match self.submission.extension().and_then(|e| e.to_str()) {
            Some("zip") => format!("{}.zip", self.id),
            _ => self.id.clone(),
        }
    }
}

impl Display for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.staff {
            write!(f, "{} (staff)", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// Which team each student belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeamRegistry {
    teams: HashMap<String, String>,
    allow_non_registered: bool,
}

#[derive(Debug, Deserialize)]
struct RegistryRow {
    #[serde(rename = "STUDENT_ID")]
    student_id: String,
    #[serde(rename = "TEAM_NAME")]
    team_name: String,
}

impl TeamRegistry {
    /// Reads a CSV holding (at least) the `STUDENT_ID` and `TEAM_NAME` columns.
    pub fn from_csv(path: &Path) -> anyhow::Result<TeamRegistry> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("cannot open team names file '{}'", path.display()))?;
        let mut teams = HashMap::new();
        for (line, row) in reader.deserialize::<RegistryRow>().enumerate() {
            let row = row.with_context(|| {
                format!("malformed team names file '{}', row {}", path.display(), line + 1)
            })?;
            if row.student_id.is_empty() || row.team_name.is_empty() {
                warn!("skipping incomplete row {} of '{}'", line + 1, path.display());
                continue;
            }
            teams.insert(row.student_id, row.team_name);
        }
        info!(students = teams.len(), "team names loaded");
        Ok(TeamRegistry {
            teams,
            allow_non_registered: false,
        })
    }

    /// Registry from `(student, team name)` pairs.
    pub fn from_pairs<I, S, T>(pairs: I) -> TeamRegistry
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        TeamRegistry {
            teams: pairs
                .into_iter()
                .map(|(s, t)| (s.into(), t.into()))
                .collect(),
            allow_non_registered: false,
        }
    }

    /// Lets students without a team play under their student number.
    pub fn allow_non_registered(self, allow: bool) -> TeamRegistry {
        TeamRegistry {
            allow_non_registered: allow,
            ..self
        }
    }

    /// Team name of `student`.
    pub fn team_of(&self, student: &str) -> Option<&str> {
        self.teams.get(student).map(String::as_str)
    }

    /// Turns `<student no>_<timestamp>` submissions into one team each, keeping the latest
    /// submission of every team.
    fn resolve(&self, submissions: Vec<Team>) -> Vec<Team> {
        let mut latest: BTreeMap<String, (String, Team)> = BTreeMap::new();
        for submission in submissions {
            let Some((student, timestamp)) = submission.id.split_once('_') else {
                warn!("'{}' is not named <student no>_<timestamp>", submission.id);
                continue;
            };
            let team = match self.team_of(student) {
                Some(name) => Team::new(team_id(name), submission.submission.clone()).with_name(name),
                None if self.allow_non_registered => {
                    Team::new(student, submission.submission.clone())
                }
                None => {
                    warn!("student {student} is not registered in any team");
                    continue;
                }
            };
            if let Some((seen, _)) = latest.get(&team.id) {
                if seen.as_str() >= timestamp {
                    debug!("older submission '{}' of {} ignored", submission.id, team.id);
                    continue;
                }
            }
            latest.insert(team.id.clone(), (timestamp.to_owned(), team));
        }
        latest.into_values().map(|(_, team)| team).collect()
    }
}

/// Identifier derived from a team name, usable in file names.
fn team_id(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Collects the roster: every submission of `teams_root`, plus staff submissions if given.
///
/// Entries are sorted by name so the roster order (and hence the plan) does not depend on the
/// file system. When `registry` is given, student submissions are mapped to their teams; staff
/// submissions are never mapped.
#[instrument(skip(registry))]
pub fn collect_roster(
    teams_root: &Path,
    staff_teams_dir: Option<&Path>,
    registry: Option<&TeamRegistry>,
) -> anyhow::Result<Vec<Team>> {
    let submissions = collect_dir(teams_root, false)?;
    let mut roster = match registry {
        Some(registry) => registry.resolve(submissions),
        None => submissions,
    };
    if let Some(staff_dir) = staff_teams_dir {
        roster.extend(collect_dir(staff_dir, true)?);
    }
    info!(teams = roster.len(), "roster collected");
    Ok(roster)
}

fn collect_dir(directory: &Path, staff: bool) -> anyhow::Result<Vec<Team>> {
    if !directory.is_dir() {
        bail!("'{}' is not a valid directory", directory.display());
    }

    let mut entries = std::fs::read_dir(directory)
        .with_context(|| format!("cannot read '{}'", directory.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    entries.sort();

    let mut teams = vec![];
    for path in entries {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            warn!("skipping non UTF-8 entry {:?}", path);
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        let id = if path.is_dir() {
            file_name.to_owned()
        } else if let Some(stem) = file_name.strip_suffix(".zip") {
            stem.to_owned()
        } else {
            warn!("Not a submission: '{file_name}'");
            continue;
        };

        let team = if staff {
            Team::staff(id, path.clone())
        } else {
            Team::new(id, path.clone())
        };
        teams.push(team);
    }
    Ok(teams)
}
