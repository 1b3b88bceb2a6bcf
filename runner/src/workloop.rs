use crate::{
    bench::Run,
    config::Config,
    diff::{self, DiffEntry},
    pipeline::{Pipeline, PipelineError},
    refine,
    review::{ChangeInfo, Notify, ReviewClient, ReviewError, select_candidate},
    store::{Benchmark, CommitResults, ResultsStore, StoreError},
    vcs::{CommitRef, GitRepo, VcsError},
};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{error, info, warn};

const IDLE_PAUSE: Duration = Duration::from_secs(5 * 60);
const ERROR_PAUSE: Duration = Duration::from_secs(10 * 60);
// backlog work per iteration is bounded so review candidates stay fresh
const BACKLOG_BUDGET: Duration = Duration::from_secs(15 * 60);

// report suppression thresholds
const MIN_DIFF: Duration = Duration::from_millis(1);
const MIN_REL_DIFF: f64 = 0.05;

#[derive(Debug, Error)]
pub enum WorkError {
    #[error(transparent)]
    Vcs(#[from] VcsError),
    #[error(transparent)]
    Review(#[from] ReviewError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// The bot's endless poll loop.
///
/// Each iteration does the most urgent piece of work it can find, in order:
/// report on an eligible open change, measure a commit from the historic
/// backlog, or re-measure the least confirmed historic result. An empty
/// iteration sleeps five minutes, a failed one ten.
pub struct WorkLoop {
    cfg: Config,
    source: GitRepo,
    store: ResultsStore,
    review: ReviewClient,
    pipeline: Pipeline,
    shutdown: Arc<AtomicBool>,
}

impl WorkLoop {
    pub fn new(
        cfg: Config,
        source: GitRepo,
        store: ResultsStore,
        review: ReviewClient,
        pipeline: Pipeline,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            source,
            store,
            review,
            pipeline,
            shutdown,
        }
    }

    pub fn run(&mut self) {
        while !self.stopping() {
            match self.iteration() {
                Ok(true) => {}
                Ok(false) => {
                    info!("nothing to do, sleeping...");
                    self.pause(IDLE_PAUSE);
                }
                Err(error) => {
                    error!(error = ?error, "iteration failed, backing off...");
                    self.pause(ERROR_PAUSE);
                }
            }
        }

        info!("shutting down");
    }

    /// one unit of work; `Ok(true)` when something was measured or posted
    fn iteration(&mut self) -> Result<bool, WorkError> {
        let changes = self.review.query_open_changes()?;
        let candidate = select_candidate(
            &changes,
            self.source.branch(),
            &self.cfg.review,
            &self.cfg.external_accounts,
        )
        .cloned();
        if let Some(change) = candidate {
            self.benchmark_review_change(&change)?;
            return Ok(true);
        }

        let head = self.source.fetch(self.source.branch())?;
        let history = self.source.log_range(&self.cfg.root_commit, &head)?;
        let view = self.store.load_view()?;

        let measured: HashSet<&str> = view.commits.iter().map(|c| c.commit.as_str()).collect();
        let backlog: Vec<&CommitRef> = history
            .iter()
            .filter(|commit| !measured.contains(commit.hash.as_str()))
            .collect();

        if !backlog.is_empty() {
            info!("{} commits awaiting benchmarking", backlog.len());

            let deadline = Instant::now() + BACKLOG_BUDGET;
            for commit in backlog {
                if self.stopping() || Instant::now() > deadline {
                    break;
                }
                self.benchmark_and_record(commit)?;
            }

            return Ok(true);
        }

        if let Some(target) = refine::select_refinement(&view) {
            info!(
                "re-measuring '{}' to refine its results: {}",
                target.commit, target.description
            );
            let commit = self.source.commit_at(&target.commit)?;
            self.benchmark_and_record(&commit)?;

            return Ok(true);
        }

        Ok(false)
    }

    /// Measure one historic commit and push the merged results.
    ///
    /// A pipeline failure records an empty result set so the commit leaves
    /// the backlog instead of being retried forever.
    fn benchmark_and_record(&mut self, commit: &CommitRef) -> Result<(), WorkError> {
        let run = match self.pipeline.benchmark_commit(&commit.hash, &commit.subject) {
            Ok(run) => run,
            Err(error) => {
                error!(error = ?error, "failed to benchmark '{}'", commit.hash);
                Default::default()
            }
        };

        self.store.push_updated(&to_commit_results(commit, run))?;
        Ok(())
    }

    /// measure the selected change against its parent and post the comparison
    fn benchmark_review_change(&mut self, change: &ChangeInfo) -> Result<(), WorkError> {
        let Some(current) = change.current() else {
            warn!("change '{}' lost its current revision", change.id);
            return Ok(());
        };
        let Some(parent) = current.commit.parents.first() else {
            warn!("change '{}' has no parent to compare against", change.id);
            return Ok(());
        };

        info!(
            "benchmarking change '{}' patchset {}: {}",
            change.id, current.number, change.subject
        );
        let hash = self.source.fetch(&current.ref_name)?;

        let run = match self.pipeline.benchmark_commit(&hash, &change.subject) {
            Ok(run) => run,
            Err(error) if error.is_build_failure() => {
                error!(error = ?error, "change '{}' failed to build", change.id);
                self.review.post_review(
                    &change.id,
                    &change.current_revision,
                    &failure_message(current.number, "build"),
                    Notify::Owner,
                )?;
                return Ok(());
            }
            Err(error) if error.is_measurement_failure() => {
                error!(error = ?error, "change '{}' failed to benchmark", change.id);
                self.review.post_review(
                    &change.id,
                    &change.current_revision,
                    &failure_message(current.number, "benchmark"),
                    Notify::Owner,
                )?;
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        // the change ref does not always bring its parent object along
        self.source.fetch(&parent.commit)?;

        let parent_desc = format!("[parent of {}] {}", abbrev(&hash), parent.subject);
        let baseline = self
            .pipeline
            .benchmark_commit_cached(&parent.commit, &parent_desc)?;

        let entries = diff::compare(&baseline.benchmarks, &run.benchmarks, MIN_DIFF, MIN_REL_DIFF);
        let (message, notify) = report_message(&entries, &parent.commit, current.number);

        self.review
            .post_review(&change.id, &change.current_revision, &message, notify)?;
        Ok(())
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    // sleep in short slices so a shutdown request is honored promptly
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline && !self.stopping() {
            thread::sleep(Duration::from_secs(1));
        }
    }
}

fn abbrev(hash: &str) -> &str {
    &hash[..hash.len().min(7)]
}

fn to_commit_results(commit: &CommitRef, run: Run) -> CommitResults {
    let mut results = CommitResults {
        commit: commit.hash.clone(),
        commit_time: commit.date,
        commit_description: commit.subject.clone(),
        benchmarks: run
            .benchmarks
            .into_iter()
            .map(|sample| Benchmark {
                name: sample.name,
                time: sample.duration.as_secs_f64(),
                repeats: 0,
            })
            .collect(),
    };

    results.sort();
    results
}

/// render the review message; reviewers are only notified when something
/// actually moved
fn report_message(entries: &[DiffEntry], parent: &str, patchset: i64) -> (String, Notify) {
    if entries.is_empty() {
        return (
            format!("no significant benchmark changes found for patchset {patchset}"),
            Notify::Owner,
        );
    }

    // only the table rows are subject to elision, the header lines stay
    let table = diff::format(entries, diff::Format::ALL);
    let lines: Vec<String> = table.lines().map(|line| format!("  {line}")).collect();
    let lines = diff::trim_lines(lines, diff::MAX_REPORT_LINES);

    let message = format!(
        "benchmark analysis:\n```\nA: parent change ({}) -> B: patchset {}\n\n{}\n```",
        abbrev(parent),
        patchset,
        lines.join("\n")
    );

    (message, Notify::OwnerReviewers)
}

fn failure_message(patchset: i64, stage: &str) -> String {
    format!("patchset {patchset} failed to {stage}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::Sample;
    use chrono::{TimeZone, Utc};

    #[test]
    fn recorded_results_are_sorted_by_name() {
        let commit = CommitRef {
            hash: "abc123".to_owned(),
            subject: "subject".to_owned(),
            date: Utc.timestamp_opt(100, 0).unwrap(),
        };
        let run = Run {
            benchmarks: vec![
                Sample {
                    name: "z".to_owned(),
                    duration: Duration::from_secs(1),
                },
                Sample {
                    name: "a".to_owned(),
                    duration: Duration::from_millis(500),
                },
            ],
        };

        let results = to_commit_results(&commit, run);

        assert_eq!(results.commit, "abc123");
        assert_eq!(results.benchmarks[0].name, "a");
        assert_eq!(results.benchmarks[0].time, 0.5);
        assert_eq!(results.benchmarks[1].name, "z");
        assert_eq!(results.benchmarks[1].repeats, 0);
    }

    #[test]
    fn empty_diff_reports_quietly_to_the_owner() {
        let (message, notify) = report_message(&[], "aaaabbbbcccc", 3);

        assert_eq!(
            message,
            "no significant benchmark changes found for patchset 3"
        );
        assert_eq!(notify, Notify::Owner);
    }

    #[test]
    fn regressions_notify_reviewers_with_a_table() {
        let entries = vec![DiffEntry {
            name: "ParseShader".to_owned(),
            time_a: Duration::from_millis(1000),
            time_b: Duration::from_millis(1200),
            delta: 0.2,
            percent_change: 1.2,
        }];

        let (message, notify) = report_message(&entries, "aaaabbbbcccc", 3);

        assert_eq!(notify, Notify::OwnerReviewers);
        assert!(message.starts_with(
            "benchmark analysis:\n```\nA: parent change (aaaabbb) -> B: patchset 3\n\n"
        ));
        assert!(message.contains("ParseShader"));
        assert!(message.contains("+20.0%"));
    }

    #[test]
    fn long_tables_elide_rows_but_not_the_header_lines() {
        let entries: Vec<DiffEntry> = (0..60)
            .map(|i| DiffEntry {
                name: format!("bench_{i:02}"),
                time_a: Duration::from_millis(100),
                time_b: Duration::from_millis(200),
                delta: 0.1,
                percent_change: 2.0,
            })
            .collect();

        let (message, _) = report_message(&entries, "aaaabbbbcccc", 1);

        assert!(message.contains("A: parent change (aaaabbb) -> B: patchset 1"));
        assert!(message.contains("... omitting 11 rows ..."));
    }

    #[test]
    fn failure_messages_name_the_patchset_first() {
        assert_eq!(failure_message(4, "build"), "patchset 4 failed to build");
        assert_eq!(
            failure_message(4, "benchmark"),
            "patchset 4 failed to benchmark"
        );
    }

    #[test]
    fn short_hashes_abbreviate_to_themselves() {
        assert_eq!(abbrev("abc"), "abc");
        assert_eq!(abbrev("abcdefghij"), "abcdefg");
    }
}
