use crate::{
    bench::{self, BenchParseError, Run, Sample},
    config::{Config, ToolLocator, WorkDirs},
    process::CallError,
    sensor,
    vcs::{GitRepo, VcsError},
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{info, warn};

// names probed for the freshly built measurement executable
const BENCHMARK_EXE_NAMES: [&str; 2] = ["benchmark_suite", "benchmark-suite"];

const SETTLE_POLL: Duration = Duration::from_secs(10);
const SETTLE_DEADLINE: Duration = Duration::from_secs(5 * 60);
// without a sensor a fixed cool-down has to do
const SETTLE_FALLBACK: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to build")]
    Build(#[source] CallError),
    #[error("failed to benchmark")]
    Measure(#[source] CallError),
    #[error("failed to parse benchmark output")]
    MeasureParse(#[from] BenchParseError),
    #[error("failed to find a benchmark executable under {0:?}")]
    MissingBenchmarkExe(PathBuf),
    #[error("failed to read the temperature sensor")]
    Sensor(#[source] CallError),
    #[error("failed to prepare the working tree")]
    Tree(#[source] std::io::Error),
    #[error(transparent)]
    Vcs(#[from] VcsError),
}

impl PipelineError {
    pub fn is_build_failure(&self) -> bool {
        matches!(self, Self::Build(_))
    }

    pub fn is_measurement_failure(&self) -> bool {
        matches!(
            self,
            Self::Measure(_) | Self::MeasureParse(_) | Self::MissingBenchmarkExe(_)
        )
    }
}

/// Drives checkout, dependency fetch, build, thermal settling and repeated
/// measurement for one commit, reducing the passes to their median.
///
/// Measurements are remembered for the lifetime of the process so a commit
/// serving as a comparison baseline is not rebuilt over and over.
pub struct Pipeline {
    cfg: Config,
    tools: ToolLocator,
    source: GitRepo,
    dirs: WorkDirs,
    cache: BTreeMap<String, Run>,
}

impl Pipeline {
    pub fn new(cfg: Config, tools: ToolLocator, source: GitRepo, dirs: WorkDirs) -> Self {
        Self {
            cfg,
            tools,
            source,
            dirs,
            cache: BTreeMap::new(),
        }
    }

    /// measure `hash`, reusing an earlier measurement from this process run
    /// when one exists
    pub fn benchmark_commit_cached(&mut self, hash: &str, desc: &str) -> Result<Run, PipelineError> {
        if let Some(cached) = self.cache.get(hash) {
            info!("reusing cached benchmark results of '{hash}'...");
            return Ok(cached.clone());
        }

        self.benchmark_commit(hash, desc)
    }

    /// check out, build and measure `hash`, filling the cache
    pub fn benchmark_commit(&mut self, hash: &str, desc: &str) -> Result<Run, PipelineError> {
        info!("checking out source at '{hash}': {desc}...");
        self.source.checkout_clean(hash)?;

        info!("fetching external dependencies...");
        self.fetch_deps()?;

        info!("building benchmark target...");
        self.build()?;

        self.wait_for_temps_to_settle()?;

        info!("benchmarking...");
        let run = self.repeated_runs()?;

        self.cache.insert(hash.to_owned(), run.clone());
        Ok(run)
    }

    // a missing dependency manifest is seeded from the checked-in template
    fn fetch_deps(&self) -> Result<(), PipelineError> {
        let manifest = self.dirs.source.join(".gclient");
        if !manifest.exists() {
            let template = self.dirs.source.join("scripts").join("standalone.gclient");
            fs::copy(&template, &manifest).map_err(PipelineError::Tree)?;
        }

        self.tools
            .run(
                &self.tools.gclient,
                &["sync".to_owned(), "--force".to_owned()],
                &self.dirs.source,
                self.cfg.timeouts.sync(),
            )
            .map_err(PipelineError::Build)?;

        Ok(())
    }

    fn build(&self) -> Result<(), PipelineError> {
        fs::create_dir_all(&self.dirs.build).map_err(PipelineError::Tree)?;

        // drop stale executables so a broken build can't measure an old binary
        for name in BENCHMARK_EXE_NAMES {
            let _ = fs::remove_file(self.dirs.build.join(name));
        }

        let args = vec![
            self.dirs.source.to_string_lossy().into_owned(),
            "-GNinja".to_owned(),
            "-DCMAKE_CXX_COMPILER_LAUNCHER=ccache".to_owned(),
            "-DCMAKE_BUILD_TYPE=Release".to_owned(),
            "-DBUILD_TESTS=0".to_owned(),
            "-DBUILD_SAMPLES=0".to_owned(),
            "-DBUILD_CMD_TOOLS=0".to_owned(),
            "-DBUILD_ALL_BACKENDS=1".to_owned(),
            "-DBUILD_BENCHMARKS=1".to_owned(),
            format!(
                "-DEXTERNAL_BENCHMARK_CORPUS_DIR={}",
                self.cfg.external_benchmark_corpus
            ),
        ];
        self.tools
            .run(&self.tools.cmake, &args, &self.dirs.build, self.cfg.timeouts.build())
            .map_err(PipelineError::Build)?;
        self.tools
            .run(&self.tools.ninja, &[], &self.dirs.build, self.cfg.timeouts.build())
            .map_err(PipelineError::Build)?;

        Ok(())
    }

    /// wait until the hottest sensor reading drops below the configured
    /// ceiling; best-effort, proceeds after a fixed deadline regardless
    fn wait_for_temps_to_settle(&self) -> Result<(), PipelineError> {
        if self.cfg.cpu_temp_sensor.is_empty() {
            thread::sleep(SETTLE_FALLBACK);
            return Ok(());
        }

        let start = Instant::now();
        loop {
            let temp = sensor::max_temp(&self.tools, &self.cfg.cpu_temp_sensor, &self.dirs.source)
                .map_err(PipelineError::Sensor)?;

            if temp < self.cfg.benchmark_max_temp {
                info!("temperatures settled. current: {temp}°C");
                return Ok(());
            }
            if start.elapsed() > SETTLE_DEADLINE {
                warn!("timeout waiting for temperatures to settle. current: {temp}°C");
                return Ok(());
            }

            info!(
                "waiting for temperatures to settle. current: {temp}°C, max: {}°C",
                self.cfg.benchmark_max_temp
            );
            thread::sleep(SETTLE_POLL);
        }
    }

    fn repeated_runs(&self) -> Result<Run, PipelineError> {
        let repetitions = self.cfg.benchmark_repetitions;
        let mut times: BTreeMap<String, Vec<Duration>> = BTreeMap::new();

        for pass in 0..repetitions {
            self.wait_for_temps_to_settle()?;
            info!("benchmark pass {}/{repetitions}...", pass + 1);

            let run = self.run_once()?;
            for sample in run.benchmarks {
                times.entry(sample.name).or_default().push(sample.duration);
            }
        }

        Ok(reduce_to_median(times))
    }

    fn run_once(&self) -> Result<Run, PipelineError> {
        let exe = find_benchmark_exe(&self.dirs.build)
            .ok_or_else(|| PipelineError::MissingBenchmarkExe(self.dirs.build.clone()))?;

        let output = self
            .tools
            .run(
                &exe,
                &[
                    "--benchmark_format=json".to_owned(),
                    "--benchmark_enable_random_interleaving=true".to_owned(),
                ],
                &self.dirs.build,
                self.cfg.timeouts.benchmark(),
            )
            .map_err(PipelineError::Measure)?;

        Ok(bench::parse(&output)?)
    }
}

fn find_benchmark_exe(build_dir: &Path) -> Option<PathBuf> {
    BENCHMARK_EXE_NAMES
        .iter()
        .map(|name| build_dir.join(name))
        .find(|path| path.is_file())
}

/// reduce each name's per-pass durations to their median
fn reduce_to_median(times: BTreeMap<String, Vec<Duration>>) -> Run {
    let benchmarks = times
        .into_iter()
        .filter(|(_, durations)| !durations.is_empty())
        .map(|(name, mut durations)| {
            durations.sort();

            Sample {
                duration: durations[durations.len() / 2],
                name,
            }
        })
        .collect();

    Run { benchmarks }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times(entries: &[(&str, &[u64])]) -> BTreeMap<String, Vec<Duration>> {
        entries
            .iter()
            .map(|(name, millis)| {
                (
                    (*name).to_owned(),
                    millis.iter().map(|ms| Duration::from_millis(*ms)).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn median_of_odd_pass_counts() {
        let run = reduce_to_median(times(&[("a", &[30, 10, 20])]));

        assert_eq!(run.benchmarks[0].duration, Duration::from_millis(20));
    }

    #[test]
    fn median_of_even_pass_counts_takes_the_upper() {
        let run = reduce_to_median(times(&[("a", &[10, 20, 30, 40])]));

        assert_eq!(run.benchmarks[0].duration, Duration::from_millis(30));
    }

    #[test]
    fn names_come_out_sorted() {
        let run = reduce_to_median(times(&[("z", &[1]), ("a", &[1]), ("m", &[1])]));

        let names: Vec<&str> = run.benchmarks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["a", "m", "z"]);
    }

    #[test]
    fn probes_both_executable_spellings() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_benchmark_exe(dir.path()), None);

        fs::write(dir.path().join("benchmark-suite"), "").unwrap();
        assert_eq!(
            find_benchmark_exe(dir.path()),
            Some(dir.path().join("benchmark-suite"))
        );
    }
}
