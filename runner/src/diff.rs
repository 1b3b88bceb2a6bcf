use crate::bench::Sample;
use itertools::Itertools;
use std::{collections::BTreeMap, time::Duration};

/// cap on rendered report lines, the middle is elided beyond this
pub const MAX_REPORT_LINES: usize = 50;

/// Per-benchmark comparison between a baseline A and a candidate B.
///
/// Produced transiently for reporting, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub name: String,
    pub time_a: Duration,
    pub time_b: Duration,
    /// B - A in seconds, negative is an improvement
    pub delta: f64,
    /// B / A
    pub percent_change: f64,
}

/// column selection for [`format`]
#[derive(Debug, Clone, Copy)]
pub struct Format {
    pub name: bool,
    pub delta: bool,
    pub percent_change: bool,
    pub time_a: bool,
    pub time_b: bool,
}

impl Format {
    pub const ALL: Format = Format {
        name: true,
        delta: true,
        percent_change: true,
        time_a: true,
        time_b: true,
    };
}

/// Compare two named sample sets, reporting only meaningful movement.
///
/// An entry survives when its absolute delta reaches `min_diff` and its
/// relative change leaves the closed `[1 - min_rel_diff, 1 + min_rel_diff]`
/// band; everything else is treated as noise and suppressed.
pub fn compare(a: &[Sample], b: &[Sample], min_diff: Duration, min_rel_diff: f64) -> Vec<DiffEntry> {
    let baseline: BTreeMap<&str, Duration> = a
        .iter()
        .map(|sample| (sample.name.as_str(), sample.duration))
        .collect();

    let mut entries = Vec::new();
    for sample in b {
        let Some(&time_a) = baseline.get(sample.name.as_str()) else {
            continue;
        };

        let secs_a = time_a.as_secs_f64();
        let secs_b = sample.duration.as_secs_f64();
        let delta = secs_b - secs_a;

        if delta.abs() < min_diff.as_secs_f64() {
            continue;
        }

        let percent_change = if secs_a == 0.0 {
            f64::INFINITY
        } else {
            secs_b / secs_a
        };
        if percent_change >= 1.0 - min_rel_diff && percent_change <= 1.0 + min_rel_diff {
            continue;
        }

        entries.push(DiffEntry {
            name: sample.name.clone(),
            time_a,
            time_b: sample.duration,
            delta,
            percent_change,
        });
    }

    entries.sort_by(|x, y| x.name.cmp(&y.name));
    entries
}

/// render entries as an aligned plain-text table with the selected columns
pub fn format(entries: &[DiffEntry], format: Format) -> String {
    let mut rows = Vec::with_capacity(entries.len() + 1);

    let mut header = Vec::new();
    if format.name {
        header.push("benchmark".to_owned());
    }
    if format.delta {
        header.push("delta".to_owned());
    }
    if format.percent_change {
        header.push("change".to_owned());
    }
    if format.time_a {
        header.push("A".to_owned());
    }
    if format.time_b {
        header.push("B".to_owned());
    }
    rows.push(header);

    for entry in entries {
        let mut row = Vec::new();
        if format.name {
            row.push(entry.name.clone());
        }
        if format.delta {
            row.push(format_delta(entry.delta));
        }
        if format.percent_change {
            row.push(format!("{:+.1}%", (entry.percent_change - 1.0) * 100.0));
        }
        if format.time_a {
            row.push(format_duration(entry.time_a));
        }
        if format.time_b {
            row.push(format_duration(entry.time_b));
        }
        rows.push(row);
    }

    let columns = rows[0].len();
    let widths: Vec<usize> = (0..columns)
        .map(|i| rows.iter().map(|row| row[i].chars().count()).max().unwrap_or(0))
        .collect();

    rows.iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, cell)| format!("{cell:<width$}", width = widths[i]))
                .join("  ")
                .trim_end()
                .to_owned()
        })
        .join("\n")
}

/// keep the first and last halves of an over-long report, marking the elision
pub fn trim_lines(lines: Vec<String>, max: usize) -> Vec<String> {
    let n = lines.len();
    if n <= max {
        return lines;
    }

    let mut trimmed = Vec::with_capacity(max + 1);
    trimmed.extend_from_slice(&lines[..max / 2]);
    trimmed.push(format!("... omitting {} rows ...", n - max));
    trimmed.extend_from_slice(&lines[n - max / 2..]);
    trimmed
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();

    if secs >= 1.0 {
        format!("{secs:.3}s")
    } else if secs >= 1e-3 {
        format!("{:.3}ms", secs * 1e3)
    } else if secs >= 1e-6 {
        format!("{:.3}µs", secs * 1e6)
    } else {
        format!("{}ns", duration.as_nanos())
    }
}

fn format_delta(delta_secs: f64) -> String {
    let formatted = format_duration(Duration::from_secs_f64(delta_secs.abs()));

    if delta_secs < 0.0 {
        format!("-{formatted}")
    } else {
        format!("+{formatted}")
    }
}
