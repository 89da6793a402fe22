pub mod config;
pub mod console;
pub mod job;
pub mod lock;
pub mod process;
pub mod shard;
pub mod signals;
pub mod table;
pub mod timing;
pub mod wave;

pub use config::{EngineConfig, Verbosity};
pub use console::Console;
pub use job::{run_job, ExecutionContext};
pub use lock::{lock_status, read_holder, LockAttempt, LockHolder, LockStatus, RunLock};
pub use shard::partition;
pub use table::{GateTable, IndexedGate};
pub use timing::{collect_timings, render_timing_table, GateTiming};
pub use wave::{partition_waves, Wave, WaveOutcome, WaveScheduler};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use vgate_core::{
    atomic_write_json_pretty, new_run_id, GateStatus, JobResult, Mode, Result, RunArtifacts,
    RunVerdict, VerifyError,
};

pub const SUMMARY_SCHEMA_VERSION: &str = "verify_summary_v1";

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub mode: Mode,
    pub verdict: RunVerdict,
    pub results: Vec<JobResult>,
    pub summary: Value,
}

impl RunReport {
    /// 0 on pass, 1 when a gate failed.
    pub fn exit_code(&self) -> u8 {
        if self.verdict.passed() {
            0
        } else {
            1
        }
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunReport),
    /// Another full run holds the lock; nothing was executed.
    Blocked(Option<LockHolder>),
}

#[derive(Debug, Clone)]
pub struct GateRunReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub result: JobResult,
}

pub fn artifacts_root(table: &GateTable, config: &EngineConfig) -> PathBuf {
    match &config.artifacts_root {
        Some(root) if root.is_absolute() => root.clone(),
        Some(root) => table.base_dir().join(root),
        None => table.base_dir().join(config::DEFAULT_ARTIFACTS_ROOT),
    }
}

/// Runs every gate active in `mode`. Full mode holds the run-scoped lock for
/// the whole run and lets sharded gates fan out; quick mode does neither.
/// A process that wants its gates taken down on SIGINT or SIGTERM calls
/// [`signals::install_shutdown_handler`] first.
pub fn run_verification(
    table: &GateTable,
    mode: Mode,
    config: &EngineConfig,
) -> Result<RunOutcome> {
    let _lock = match mode {
        Mode::Full => {
            let holder = LockHolder::current(&config.story_id);
            match RunLock::try_acquire(&config.lock_path, holder)? {
                LockAttempt::Acquired(lock) => Some(lock),
                LockAttempt::Blocked(holder) => return Ok(RunOutcome::Blocked(holder)),
            }
        }
        Mode::Quick => None,
    };

    let run_id = config.run_id.clone().unwrap_or_else(new_run_id);
    let artifacts = RunArtifacts::create(&artifacts_root(table, config), &run_id)?;
    let console = Console::new(config.verbosity);
    let gates = table.for_mode(mode);
    let cap = config.wave_jobs.max(1);
    console.run_started(&run_id, mode, gates.len(), gates.len().div_ceil(cap), cap);
    tracing::info!(
        run_id = %run_id,
        mode = %mode,
        gates = gates.len(),
        cap,
        "verification started"
    );

    let started_at = Utc::now();
    let shard_workers = (mode == Mode::Full).then_some(config.shard_workers);
    let outcome = WaveScheduler::new(table, &artifacts, console, cap)
        .keep_going(config.keep_going)
        .shard_workers(shard_workers)
        .run(&gates)?;
    let completed_at = Utc::now();

    let summary = summary_json(table, mode, &artifacts, &outcome, cap, started_at, completed_at);
    atomic_write_json_pretty(&artifacts.summary_path(), &summary)?;

    console.timings(&collect_timings(artifacts.run_dir())?);
    let failing_code = outcome
        .verdict
        .failing_gate
        .as_deref()
        .and_then(|g| outcome.result(g))
        .map(|r| r.exit_code);
    console.verdict(mode, &outcome.verdict, failing_code);
    tracing::info!(
        run_id = %run_id,
        passed = outcome.verdict.passed(),
        waves_launched = outcome.waves_launched,
        "verification finished"
    );

    Ok(RunOutcome::Completed(RunReport {
        run_id,
        run_dir: artifacts.run_dir().to_path_buf(),
        mode,
        verdict: outcome.verdict,
        results: outcome.results,
        summary,
    }))
}

/// Runs one gate on its own, with every failure side effect enabled. A sharded
/// gate still fans out over `config.shard_workers`.
pub fn run_single_gate(
    table: &GateTable,
    gate: &str,
    config: &EngineConfig,
) -> Result<GateRunReport> {
    let Some(indexed) = table.get(gate) else {
        return Err(VerifyError::config(format!("unknown gate '{}'", gate)));
    };
    let run_id = config.run_id.clone().unwrap_or_else(new_run_id);
    let artifacts = RunArtifacts::create(&artifacts_root(table, config), &run_id)?;
    Console::new(config.verbosity).run_id(&run_id);
    let ctx = ExecutionContext::standalone().with_shard_workers(Some(config.shard_workers));
    let result = run_job(table, indexed, &artifacts, &ctx)?;
    Ok(GateRunReport {
        run_id,
        run_dir: artifacts.run_dir().to_path_buf(),
        result,
    })
}

/// Resolves a past run directory: `run_id` under the artifacts root, or the
/// most recently modified run.
pub fn find_run_dir(root: &Path, run_id: Option<&str>) -> Result<PathBuf> {
    match run_id {
        Some(id) => {
            let dir = root.join(id);
            if !dir.is_dir() {
                return Err(VerifyError::MissingArtifact { path: dir });
            }
            Ok(dir)
        }
        None => vgate_core::latest_run_dir(root)?.ok_or_else(|| VerifyError::MissingArtifact {
            path: root.to_path_buf(),
        }),
    }
}

fn summary_json(
    table: &GateTable,
    mode: Mode,
    artifacts: &RunArtifacts,
    outcome: &WaveOutcome<'_>,
    cap: usize,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
) -> Value {
    let mut gates = Vec::new();
    for wave in &outcome.waves {
        for gate in &wave.gates {
            let entry = match outcome.result(&gate.spec.name) {
                Some(r) => json!({
                    "name": r.name,
                    "declared_index": r.declared_index,
                    "wave": wave.index,
                    "status": r.status().as_str(),
                    "exit_code": r.exit_code,
                    "elapsed_secs": r.elapsed.as_secs_f64(),
                }),
                None => json!({
                    "name": gate.spec.name,
                    "declared_index": gate.index,
                    "wave": wave.index,
                    "status": GateStatus::NotRun.as_str(),
                    "exit_code": Value::Null,
                    "elapsed_secs": Value::Null,
                }),
            };
            gates.push(entry);
        }
    }
    let waves: Vec<Value> = outcome
        .waves
        .iter()
        .map(|w| {
            json!({
                "index": w.index,
                "gates": w.gates.iter().map(|g| g.spec.name.as_str()).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({
        "schema_version": SUMMARY_SCHEMA_VERSION,
        "run_id": artifacts.run_id(),
        "mode": mode.as_str(),
        "started_at": started_at.to_rfc3339(),
        "completed_at": completed_at.to_rfc3339(),
        "table_digest": table.digest(mode),
        "wave_cap": cap,
        "waves": waves,
        "waves_launched": outcome.waves_launched,
        "verdict": {
            "overall_status": outcome.verdict.overall_status,
            "failing_gate": outcome.verdict.failing_gate,
            "failing_gate_rank": outcome.verdict.failing_gate_rank,
        },
        "gates": gates,
    })
}
