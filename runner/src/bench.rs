use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchParseError {
    #[error("benchmark output is not valid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported time unit '{0}'")]
    TimeUnit(String),
}

/// measured duration of a single named benchmark
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub name: String,
    pub duration: Duration,
}

/// one full pass of the benchmark executable
#[derive(Debug, Clone, Default)]
pub struct Run {
    pub benchmarks: Vec<Sample>,
}

#[derive(Deserialize)]
struct RawOutput {
    #[serde(default)]
    benchmarks: Vec<RawBenchmark>,
}

#[derive(Deserialize)]
struct RawBenchmark {
    name: String,
    real_time: f64,
    #[serde(default = "default_time_unit")]
    time_unit: String,
    #[serde(default)]
    run_type: String,
}

fn default_time_unit() -> String {
    "ns".to_owned()
}

/// Parse the machine-readable (`--benchmark_format=json`) output of the
/// benchmark executable into a [`Run`].
///
/// The captured output may carry warnings ahead of the json body, everything
/// before the first brace is skipped. Aggregate entries (mean/median rows
/// emitted by the harness itself) are dropped.
pub fn parse(output: &str) -> Result<Run, BenchParseError> {
    let body = match output.find('{') {
        Some(start) => &output[start..],
        None => output,
    };

    let raw: RawOutput = serde_json::from_str(body)?;

    let mut benchmarks = Vec::with_capacity(raw.benchmarks.len());
    for bench in raw.benchmarks {
        if bench.run_type == "aggregate" {
            continue;
        }

        let seconds = match bench.time_unit.as_str() {
            "ns" => bench.real_time * 1e-9,
            "us" => bench.real_time * 1e-6,
            "ms" => bench.real_time * 1e-3,
            "s" => bench.real_time,
            unit => return Err(BenchParseError::TimeUnit(unit.to_owned())),
        };

        benchmarks.push(Sample {
            name: bench.name,
            duration: Duration::from_secs_f64(seconds.max(0.0)),
        });
    }

    Ok(Run { benchmarks })
}
