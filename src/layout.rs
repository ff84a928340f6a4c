//! Map layouts: fixed ones from a bundle directory, random ones from an integer seed.
//!
//! A layout is always reachable from its [`Layout::key`], so a plan (or a manifest) that only
//! stores keys can be replayed identically.

use std::{
    collections::BTreeSet,
    fmt::Display,
    path::{Path, PathBuf},
};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ContestError;

const RANDOM_PREFIX: &str = "RANDOM";
const LAYOUT_EXTENSION: &str = "lay";
const MAX_RANDOM_SEED: u64 = 9999;

/// A map configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layout {
    /// Named map from the bundle.
    Fixed {
        /// Bundle name, without extension.
        name: String,
    },
    /// Map generated by the engine from a seed.
    Random {
        /// Generator seed.
        seed: u64,
    },
}

impl Layout {
    /// Fixed layout by name.
    pub fn fixed(name: impl Into<String>) -> Layout {
        Layout::Fixed { name: name.into() }
    }

    /// Random layout by seed.
    pub fn random(seed: u64) -> Layout {
        Layout::Random { seed }
    }

    /// Deterministic key, also the argument handed to the engine.
    pub fn key(&self) -> String {
        match self {
            Layout::Fixed { name } => name.clone(),
            Layout::Random { seed } => format!("{RANDOM_PREFIX}{seed}"),
        }
    }

    /// Inverse of [`Layout::key`].
    pub fn from_key(key: &str) -> Layout {
        match key
            .strip_prefix(RANDOM_PREFIX)
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(seed) => Layout::Random { seed },
            None => Layout::Fixed {
                name: key.to_owned(),
            },
        }
    }

    fn is_reserved_name(name: &str) -> bool {
        matches!(Layout::from_key(name), Layout::Random { .. })
    }
}

impl Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Request for the layouts of a contest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSelection {
    /// Total number of fixed layouts.
    pub no_fixed_layouts: usize,
    /// Fixed layouts that must be included.
    pub fixed_layout_seeds: Vec<String>,
    /// Total number of random layouts.
    pub no_random_layouts: usize,
    /// Random seeds that must be included.
    pub random_layout_seeds: Vec<u64>,
    /// Seed of the generator used to fill the remaining slots.
    pub layout_seed: u64,
}

/// The bundle of fixed layouts available to the engine.
#[derive(Debug, Clone, Default)]
pub struct LayoutBundle {
    names: BTreeSet<String>,
    directory: Option<PathBuf>,
}

impl LayoutBundle {
    /// Bundle from an explicit list of names.
    pub fn from_names<I, S>(names: I) -> LayoutBundle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LayoutBundle {
            names: names.into_iter().map(Into::into).collect(),
            directory: None,
        }
    }

    /// Bundle made of every `*.lay` file of `directory`.
    pub fn from_dir(directory: &Path) -> Result<LayoutBundle, ContestError> {
        let read = std::fs::read_dir(directory).map_err(|e| {
            ContestError::config(format!(
                "cannot read layouts directory '{}': {e}",
                directory.display()
            ))
        })?;
        let names = read
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(LAYOUT_EXTENSION))
            .filter_map(|path| path.file_stem()?.to_str().map(str::to_owned))
            .collect::<BTreeSet<_>>();
        if let Some(name) = names.iter().find(|name| Layout::is_reserved_name(name)) {
            return Err(ContestError::config(format!(
                "fixed layout '{name}' clashes with the random layout key of the same name"
            )));
        }
        debug!(count = names.len(), "fixed layouts found");
        Ok(LayoutBundle {
            names,
            directory: Some(directory.to_path_buf()),
        })
    }

    /// Location of the layout file, if this bundle comes from a directory.
    pub fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.directory
            .as_ref()
            .map(|dir| dir.join(format!("{name}.{LAYOUT_EXTENSION}")))
    }

    /// Number of fixed layouts.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True if the bundle has no layout.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Picks the layouts of a contest. Same bundle and selection always give the same list.
    pub fn select(&self, selection: &LayoutSelection) -> Result<Vec<Layout>, ContestError> {
        let mut rng = StdRng::seed_from_u64(selection.layout_seed);
        let mut layouts = vec![];

        if let Some(name) = self.names.iter().find(|name| Layout::is_reserved_name(name)) {
            return Err(ContestError::config(format!(
                "fixed layout '{name}' clashes with the random layout key of the same name"
            )));
        }

        for name in &selection.fixed_layout_seeds {
            if !self.names.contains(name) {
                return Err(ContestError::config(format!(
                    "fixed layout '{name}' is not in the bundle"
                )));
            }
            let layout = Layout::fixed(name.as_str());
            if !layouts.contains(&layout) {
                layouts.push(layout);
            }
        }

        let missing_fixed = selection.no_fixed_layouts.saturating_sub(layouts.len());
        if missing_fixed > 0 {
            let mut candidates = self
                .names
                .iter()
                .filter(|name| !selection.fixed_layout_seeds.contains(name))
                .collect::<Vec<_>>();
            if candidates.len() < missing_fixed {
                return Err(ContestError::config(format!(
                    "{} fixed layouts requested but only {} available",
                    selection.no_fixed_layouts,
                    layouts.len() + candidates.len()
                )));
            }
            candidates.shuffle(&mut rng);
            layouts.extend(
                candidates
                    .into_iter()
                    .take(missing_fixed)
                    .map(|name| Layout::fixed(name.as_str())),
            );
        }

        let mut seeds = vec![];
        let mut taken = BTreeSet::new();
        for seed in &selection.random_layout_seeds {
            if taken.insert(*seed) {
                seeds.push(*seed);
            }
        }
        let outside_range = seeds
            .iter()
            .filter(|seed| !(1..=MAX_RANDOM_SEED).contains(*seed))
            .count();
        let available = MAX_RANDOM_SEED as usize + outside_range;
        if selection.no_random_layouts > available {
            return Err(ContestError::config(format!(
                "{} random layouts requested but only {available} distinct seeds available",
                selection.no_random_layouts
            )));
        }
        while seeds.len() < selection.no_random_layouts {
            let seed = rng.gen_range(1..=MAX_RANDOM_SEED);
            if taken.insert(seed) {
                seeds.push(seed);
            }
        }
        layouts.extend(seeds.into_iter().map(Layout::random));

        if layouts.is_empty() {
            return Err(ContestError::config("no layout selected"));
        }
        info!(layouts = ?layouts.iter().map(Layout::key).collect::<Vec<_>>());
        Ok(layouts)
    }
}
