use crate::store::HistoricResults;

/// historic commit picked for an extra measuring pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinementTarget {
    pub commit: String,
    pub description: String,
}

/// Pick the historic commit whose recorded values look least confirmed.
///
/// Each commit's samples are compared against the average of the same-named
/// samples of its chronological neighbors; the accumulated relative
/// disagreement is discounted by `2^repeats` so values already confirmed by
/// many merges fall to the back of the queue. Commits without any measured
/// sample are never candidates.
pub fn select_refinement(results: &HistoricResults) -> Option<RefinementTarget> {
    let commits = &results.commits;
    let mut best: Option<(RefinementTarget, f64)> = None;

    for (i, current) in commits.iter().enumerate() {
        // at either history boundary the neighbor degenerates to the commit
        // itself, contributing no disagreement
        let prev = &commits[i.saturating_sub(1)];
        let next = &commits[(i + 1).min(commits.len() - 1)];

        let mut divergence = 0.0;
        let mut count = 0usize;

        for sample in &current.benchmarks {
            if sample.time == 0.0 {
                continue;
            }

            let before = prev
                .find_benchmark(&sample.name)
                .map_or(sample.time, |b| b.time);
            let after = next
                .find_benchmark(&sample.name)
                .map_or(sample.time, |b| b.time);
            let expected = (before + after) / 2.0;
            let confidence = 2f64.powi(sample.repeats as i32);

            divergence += (expected - sample.time).abs() / (sample.time * confidence);
            count += 1;
        }

        if count == 0 {
            continue;
        }

        let divergence = divergence / count as f64;
        if best.as_ref().map_or(true, |(_, d)| divergence > *d) {
            best = Some((
                RefinementTarget {
                    commit: current.commit.clone(),
                    description: current
                        .commit_description
                        .lines()
                        .next()
                        .unwrap_or_default()
                        .to_owned(),
                },
                divergence,
            ));
        }
    }

    best.map(|(target, _)| target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Benchmark, CommitResults};
    use chrono::{TimeZone, Utc};

    fn commit(hash: &str, epoch: i64, samples: &[(&str, f64, u32)]) -> CommitResults {
        CommitResults {
            commit: hash.to_owned(),
            commit_time: Utc.timestamp_opt(epoch, 0).unwrap(),
            commit_description: format!("{hash} subject"),
            benchmarks: samples
                .iter()
                .map(|(name, time, repeats)| Benchmark {
                    name: (*name).to_owned(),
                    time: *time,
                    repeats: *repeats,
                })
                .collect(),
        }
    }

    fn view(commits: Vec<CommitResults>) -> HistoricResults {
        HistoricResults {
            system: Default::default(),
            commits,
        }
    }

    #[test]
    fn empty_history_yields_nothing() {
        assert_eq!(select_refinement(&view(Vec::new())), None);
    }

    #[test]
    fn commits_without_samples_are_never_selected() {
        let results = view(vec![commit("a", 1, &[]), commit("b", 2, &[("x", 0.0, 0)])]);

        assert_eq!(select_refinement(&results), None);
    }

    #[test]
    fn the_spike_in_a_smooth_sequence_is_selected() {
        let results = view(vec![
            commit("a", 1, &[("x", 1.00, 0)]),
            commit("b", 2, &[("x", 1.01, 0)]),
            commit("c", 3, &[("x", 1.30, 0)]),
            commit("d", 4, &[("x", 1.03, 0)]),
            commit("e", 5, &[("x", 1.04, 0)]),
        ]);

        let target = select_refinement(&results).unwrap();
        assert_eq!(target.commit, "c");
        assert_eq!(target.description, "c subject");
    }

    #[test]
    fn confirmed_values_are_discounted() {
        // two identical spikes, but the first was already re-measured five
        // times and should fall behind the unconfirmed one
        let results = view(vec![
            commit("c0", 1, &[("x", 1.0, 0)]),
            commit("s1", 2, &[("x", 1.2, 5)]),
            commit("c1", 3, &[("x", 1.0, 0)]),
            commit("c2", 4, &[("x", 1.0, 0)]),
            commit("s2", 5, &[("x", 1.2, 0)]),
            commit("c3", 6, &[("x", 1.0, 0)]),
        ]);

        let target = select_refinement(&results).unwrap();
        assert_eq!(target.commit, "s2");
    }

    #[test]
    fn descriptions_are_reduced_to_their_first_line() {
        let mut single = commit("a", 1, &[("x", 1.0, 0)]);
        single.commit_description = "headline\n\nbody text".to_owned();
        let results = view(vec![single]);

        assert_eq!(select_refinement(&results).unwrap().description, "headline");
    }
}
