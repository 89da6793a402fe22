use serde::Serialize;
use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use vgate_core::{Result, RunArtifacts, VerifyError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateTiming {
    pub gate: String,
    pub seconds: f64,
}

/// Reads every `<gate>.time` artifact in `run_dir`, slowest first.
pub fn collect_timings(run_dir: &Path) -> Result<Vec<GateTiming>> {
    let artifacts = RunArtifacts::open(run_dir)?;
    let entries = fs::read_dir(run_dir).map_err(|e| VerifyError::io(run_dir, e))?;
    let mut timings = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| VerifyError::io(run_dir, e))?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("time") {
            continue;
        }
        let Some(gate) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if gate.starts_with('.') {
            continue;
        }
        let elapsed = artifacts.read_elapsed(gate)?;
        timings.push(GateTiming {
            gate: gate.to_string(),
            seconds: elapsed.as_secs_f64(),
        });
    }
    sort_timings(&mut timings);
    Ok(timings)
}

/// Descending duration; equal durations fall back to gate name.
pub fn sort_timings(timings: &mut [GateTiming]) {
    timings.sort_by(|a, b| {
        b.seconds
            .partial_cmp(&a.seconds)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.gate.cmp(&b.gate))
    });
}

pub fn render_timing_table(timings: &[GateTiming]) -> String {
    let width = timings
        .iter()
        .map(|t| t.gate.len())
        .max()
        .unwrap_or(0)
        .max("gate".len());
    let mut out = format!("{:<width$}  {:>9}\n", "gate", "seconds", width = width);
    for t in timings {
        out.push_str(&format!(
            "{:<width$}  {:>9.3}\n",
            t.gate,
            t.seconds,
            width = width
        ));
    }
    let total: f64 = timings.iter().map(|t| t.seconds).sum();
    out.push_str(&format!(
        "{:<width$}  {:>9.3}\n",
        "total",
        total,
        width = width
    ));
    out
}
