use crate::{system::SystemIdentity, vcs::{GitRepo, VcsError}};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

// ten years of monthly partitions
const MONTHS_TO_SCAN: u32 = 120;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access results file '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse results file '{path}'")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode results")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Vcs(#[from] VcsError),
}

/// one measured benchmark inside a [`CommitResults`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Benchmark {
    pub name: String,
    /// wall time in seconds
    pub time: f64,
    /// count of prior measurements already folded into `time`
    #[serde(default, skip_serializing_if = "is_zero")]
    pub repeats: u32,
}

fn is_zero(repeats: &u32) -> bool {
    *repeats == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CommitResults {
    pub commit: String,
    pub commit_time: DateTime<Utc>,
    pub commit_description: String,
    pub benchmarks: Vec<Benchmark>,
}

impl CommitResults {
    pub fn find_benchmark(&self, name: &str) -> Option<&Benchmark> {
        self.benchmarks.iter().find(|b| b.name == name)
    }

    pub fn find_benchmark_mut(&mut self, name: &str) -> Option<&mut Benchmark> {
        self.benchmarks.iter_mut().find(|b| b.name == name)
    }

    /// keep benchmarks sorted by name
    pub fn sort(&mut self) {
        self.benchmarks.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// Historic per-system benchmark data, one partition per calendar month on
/// disk, concatenated into a single chronological view for analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HistoricResults {
    #[serde(default)]
    pub system: SystemIdentity,
    #[serde(default)]
    pub commits: Vec<CommitResults>,
}

impl HistoricResults {
    pub fn new(system: SystemIdentity) -> Self {
        Self {
            system,
            commits: Vec::new(),
        }
    }

    pub fn find_commit(&self, commit: &str) -> Option<&CommitResults> {
        self.commits.iter().find(|c| c.commit == commit)
    }

    /// keep commits in chronological order, ties broken by description
    pub fn sort(&mut self) {
        self.commits.sort_by(|a, b| {
            a.commit_time
                .cmp(&b.commit_time)
                .then_with(|| a.commit_description.cmp(&b.commit_description))
        });
    }

    /// Fold freshly measured results into the history.
    ///
    /// A commit already present has each incoming sample merged through
    /// incremental weighted averaging; samples are folded in, never
    /// overwritten wholesale. Unknown commits and unknown sample names are
    /// appended. Sort order is restored afterwards.
    pub fn merge(&mut self, incoming: CommitResults) {
        match self
            .commits
            .iter()
            .position(|c| c.commit == incoming.commit)
        {
            Some(index) => {
                let existing = &mut self.commits[index];

                for sample in incoming.benchmarks {
                    match existing.find_benchmark_mut(&sample.name) {
                        Some(merged) => {
                            merged.time = (merged.time * (merged.repeats + 1) as f64
                                + sample.time)
                                / (merged.repeats + 2) as f64;
                            merged.repeats += 1;
                        }
                        None => existing.benchmarks.push(sample),
                    }
                }

                existing.sort();
            }
            None => self.commits.push(incoming),
        }

        self.sort();
    }
}

/// Loads, merges and persists the historic results kept in the results
/// checkout, pushing every mutation through the version-control collaborator.
#[derive(Debug)]
pub struct ResultsStore {
    repo: GitRepo,
    dir: PathBuf,
    system: SystemIdentity,
}

impl ResultsStore {
    pub fn new(repo: GitRepo, system: SystemIdentity) -> Self {
        let dir = repo.dir().join("results");

        Self { repo, dir, system }
    }

    fn partition_path(&self, year: i32, month: u32) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        Ok(self.dir.join(partition_file_name(&self.system.id(), year, month)))
    }

    /// existing partitions for this system, newest month first
    fn partition_paths(&self, now: DateTime<Utc>) -> Result<Vec<PathBuf>, StoreError> {
        let mut year = now.year();
        let mut month = now.month();
        let mut paths = Vec::new();

        for _ in 0..MONTHS_TO_SCAN {
            let path = self.partition_path(year, month)?;
            if path.is_file() {
                paths.push(path);
            }

            month -= 1;
            if month == 0 {
                year -= 1;
                month = 12;
            }
        }

        Ok(paths)
    }

    /// fetch and check out the latest results, then build the full
    /// chronological view across all partitions
    pub fn load_view(&self) -> Result<HistoricResults, StoreError> {
        info!("syncing results repo...");
        self.repo.fetch_and_checkout_latest()?;

        let paths = self.partition_paths(Utc::now())?;

        Ok(load_files(&paths, &self.system))
    }

    /// Merge `results` into its month's partition and push the mutation.
    pub fn push_updated(&self, results: &CommitResults) -> Result<(), StoreError> {
        info!("syncing results repo...");
        self.repo.fetch_and_checkout_latest()?;

        let path =
            self.partition_path(results.commit_time.year(), results.commit_time.month())?;
        let mut history = match load_partition(&path, &self.system) {
            Ok(history) => history,
            Err(error) => {
                warn!(error = %error, "starting a fresh partition at {path:?}");
                HistoricResults::new(self.system.clone())
            }
        };

        history.merge(results.clone());

        let encoded = serde_json::to_string_pretty(&history)?;
        fs::write(&path, encoded).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;

        self.repo.add(&path)?;
        let abbrev = &results.commit[..results.commit.len().min(6)];
        let head = self
            .repo
            .commit(&format!("Add benchmark results for '{abbrev}'"))?;

        info!("pushing updated results to results repo...");
        self.repo.push(&head, self.repo.branch())?;

        Ok(())
    }
}

pub fn partition_file_name(system_id: &str, year: i32, month: u32) -> String {
    format!("{system_id}-{year:04}-{month:02}.json")
}

fn load_partition(path: &Path, system: &SystemIdentity) -> Result<HistoricResults, StoreError> {
    let contents = fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_owned(),
        source,
    })?;
    let history: HistoricResults =
        serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
            path: path.to_owned(),
            source,
        })?;

    if &history.system != system {
        // recorded on another machine; still merged, only flagged
        warn!(
            "results file {path:?} has different system information!\nfile: {:?}\nhost: {:?}",
            history.system, system
        );
    }

    Ok(history)
}

/// Concatenate all partitions into one chronological view.
///
/// A partition that fails to parse degrades to a warning so one corrupt file
/// cannot take the whole history down with it.
pub fn load_files(paths: &[PathBuf], system: &SystemIdentity) -> HistoricResults {
    let mut view = HistoricResults::new(system.clone());

    for path in paths {
        match load_partition(path, system) {
            Ok(partition) => view.commits.extend(partition.commits),
            Err(error) => warn!(error = %error, "skipping unreadable partition {path:?}"),
        }
    }

    view.sort();
    view
}
