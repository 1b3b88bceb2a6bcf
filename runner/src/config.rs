use crate::process::{self, CallError};
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::{self, File},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::error;

// commit all measuring starts from; history before this point is never touched
fn default_root_commit() -> String {
    "e72e42d9e0c851311512ca6da4d7b59f0bcc60d9".to_owned()
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("failed to read config file at '{path}'")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file")]
    Invalid(#[from] serde_yaml::Error),
    #[error("config failed validation")]
    FailedValidation,
    #[error("failed to find '{0}' on PATH")]
    MissingTool(String),
    #[error("failed to create directory '{path}'")]
    DirCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file not found")]
    FileNotFound,
    #[error("metadata not found")]
    MetadataNotFound(#[from] std::io::Error),
    #[error("no home directory to expand '~' with")]
    NoHomeDir,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// directory holding the source and results checkouts
    pub working_dir: PathBuf,
    #[serde(default = "default_root_commit")]
    pub root_commit: String,

    pub source: GitRemoteConfig,
    pub results: GitRemoteConfig,
    pub review: ReviewConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    // external contributor addresses trusted without a reviewer from the
    // trusted domain
    #[serde(default)]
    pub external_accounts: Vec<String>,

    #[serde(default = "default_repetitions")]
    pub benchmark_repetitions: usize,
    #[serde(default = "default_max_temp")]
    pub benchmark_max_temp: f32,
    /// sensor consulted before measuring, empty disables thermal gating
    #[serde(default)]
    pub cpu_temp_sensor: String,
    #[serde(default)]
    pub external_benchmark_corpus: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct GitRemoteConfig {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ReviewConfig {
    pub url: String,
    pub project: String,
    pub username: String,
    /// address the bot posts under, used to spot already-reported revisions
    pub email: String,
    pub password: String,
    #[serde(default = "default_trusted_domain")]
    pub trusted_domain: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    /// seconds for fetch/push/dependency synchronization
    #[serde(default = "default_timeout_secs")]
    pub sync: u64,
    #[serde(default = "default_timeout_secs")]
    pub build: u64,
    #[serde(default = "default_timeout_secs")]
    pub benchmark: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            sync: default_timeout_secs(),
            build: default_timeout_secs(),
            benchmark: default_timeout_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn sync(&self) -> Duration {
        Duration::from_secs(self.sync)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build)
    }

    pub fn benchmark(&self) -> Duration {
        Duration::from_secs(self.benchmark)
    }
}

fn default_branch() -> String {
    "main".to_owned()
}

fn default_trusted_domain() -> String {
    "google.com".to_owned()
}

fn default_timeout_secs() -> u64 {
    30 * 60
}

fn default_repetitions() -> usize {
    1
}

fn default_max_temp() -> f32 {
    50.0
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigErrors::Unreadable {
            path: path.to_owned(),
            source,
        })?;
        let mut config: Config = serde_yaml::from_str(&contents)?;

        config.working_dir = expand_home(&config.working_dir)?;

        if config.preflight_checks() {
            Err(ConfigErrors::FailedValidation)
        } else {
            Ok(config)
        }
    }

    /// validate everything at once so users get a complete picture
    fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        if self.benchmark_repetitions == 0 {
            error!("benchmark_repetitions cannot be 0, at least one measuring pass is needed");
            contains_error = true;
        }

        if self.benchmark_max_temp <= 0.0 {
            error!("benchmark_max_temp must be a positive temperature in celsius");
            contains_error = true;
        }

        for (name, remote) in [("source", &self.source), ("results", &self.results)] {
            if remote.url.is_empty() {
                error!("{name}.url cannot be empty");
                contains_error = true;
            }
        }

        if self.timeouts.sync == 0 || self.timeouts.build == 0 || self.timeouts.benchmark == 0 {
            error!("timeouts cannot be 0, external processes would be killed immediately");
            contains_error = true;
        }

        contains_error
    }

    /// create the working directory layout, returning the source, build and
    /// results directories
    pub fn make_working_dirs(&self) -> Result<WorkDirs, ConfigErrors> {
        let source = self.working_dir.join("source");
        let results = self.working_dir.join("results");

        for dir in [&self.working_dir, &source, &results] {
            fs::create_dir_all(dir).map_err(|source| ConfigErrors::DirCreation {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        Ok(WorkDirs {
            build: source.join("out"),
            source,
            results,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkDirs {
    pub source: PathBuf,
    pub build: PathBuf,
    pub results: PathBuf,
}

/// replace all occurrences of '~' with the user home directory
pub fn expand_home(path: &Path) -> Result<PathBuf, ConfigErrors> {
    let printable = path.to_string_lossy();

    if printable.contains('~') {
        let home = dirs::home_dir().ok_or(ConfigErrors::NoHomeDir)?;

        Ok(PathBuf::from(
            printable.replace('~', &home.to_string_lossy()),
        ))
    } else {
        Ok(path.to_owned())
    }
}

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

/// Immutable table of resolved executable paths, built once at startup.
///
/// Every external invocation goes through [`ToolLocator::run`], which wraps
/// the tool in `nice -20` so measuring is not starved by background load.
#[derive(Debug, Clone)]
pub struct ToolLocator {
    pub ccache: PathBuf,
    pub cmake: PathBuf,
    pub gclient: PathBuf,
    pub git: PathBuf,
    pub ninja: PathBuf,
    pub sensors: PathBuf,
    pub nice: PathBuf,
}

impl ToolLocator {
    pub fn locate() -> Result<Self, ConfigErrors> {
        Ok(Self {
            ccache: find_tool("ccache")?,
            cmake: find_tool("cmake")?,
            gclient: find_tool("gclient")?,
            git: find_tool("git")?,
            ninja: find_tool("ninja")?,
            sensors: find_tool("sensors")?,
            nice: find_tool("nice")?,
        })
    }

    pub fn run(
        &self,
        exe: &Path,
        args: &[String],
        dir: &Path,
        timeout: Duration,
    ) -> Result<String, CallError> {
        let mut full = Vec::with_capacity(args.len() + 3);
        full.push("-n".to_owned());
        full.push("-20".to_owned());
        full.push(exe.to_string_lossy().into_owned());
        full.extend_from_slice(args);

        process::call(&self.nice, &full, dir, timeout)
    }
}

fn find_tool(name: &str) -> Result<PathBuf, ConfigErrors> {
    let path = env::var_os("PATH").unwrap_or_default();

    for dir in env::split_paths(&path) {
        let candidate = dir.join(name);

        if check_executable(&candidate).unwrap_or(false) {
            return Ok(candidate);
        }
    }

    Err(ConfigErrors::MissingTool(name.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
working_dir: /tmp/benchwatch
source:
  url: https://example.com/project
results:
  url: https://example.com/project-results
review:
  url: https://review.example.com
  project: project
  username: bot
  email: bot@example.com
  password: secret
"#
    }

    #[test]
    fn defaults_are_applied() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();

        assert_eq!(config.source.branch, "main");
        assert_eq!(config.benchmark_repetitions, 1);
        assert_eq!(config.benchmark_max_temp, 50.0);
        assert_eq!(config.timeouts.sync(), Duration::from_secs(30 * 60));
        assert!(config.cpu_temp_sensor.is_empty());
        assert_eq!(config.review.trusted_domain, "google.com");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = format!("{}\nbogus_field: 1\n", minimal_yaml());

        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());
    }

    #[test]
    fn zero_repetitions_fail_preflight() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.benchmark_repetitions = 0;

        assert!(config.preflight_checks());
    }

    #[test]
    fn blocked_working_dir_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("wd");
        fs::write(&blocker, "").unwrap();

        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.working_dir = blocker.clone();

        let error = config.make_working_dirs().unwrap_err();
        assert!(matches!(error, ConfigErrors::DirCreation { path, .. } if path == blocker));
    }

    #[test]
    fn expand_home_leaves_absolute_paths_alone() {
        let path = PathBuf::from("/var/lib/benchwatch");

        assert_eq!(expand_home(&path).unwrap(), path);
    }
}
