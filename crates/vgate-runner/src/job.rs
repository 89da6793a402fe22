use chrono::Utc;
use std::process::Command;
use std::time::Instant;

use vgate_core::{
    GateSpec, JobResult, Result, RunArtifacts, VerifyError, EXIT_MISSING_OUTPUTS,
    EXIT_SPAWN_FAILED,
};

use crate::config;
use crate::process::{group_command, run_logged, GateLog, ProcessOutcome};
use crate::shard;
use crate::table::{GateTable, IndexedGate};

/// Lines of a failing gate's log shown on the console.
pub const EXCERPT_LINES: usize = 40;

/// Id of the run a gate belongs to. A distinct name from the engine's own
/// run id override, so a gate that invokes vgate starts a fresh run.
pub const ENV_PARENT_RUN_ID: &str = "VGATE_PARENT_RUN_ID";
pub const ENV_RUN_DIR: &str = "VGATE_RUN_DIR";
pub const ENV_GATE: &str = "VGATE_GATE";

/// Side effects a job may perform on its own. A job running inside a wave has
/// all three suppressed so the scheduler alone reports the run's failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    pub suppress_excerpt: bool,
    pub suppress_marker_write: bool,
    pub suppress_timeout_exit: bool,
    /// Worker count for gates with a shard spec. `None` runs their plain command.
    pub shard_workers: Option<usize>,
}

impl ExecutionContext {
    pub fn standalone() -> Self {
        Self::default()
    }

    pub fn wave_child() -> Self {
        Self {
            suppress_excerpt: true,
            suppress_marker_write: true,
            suppress_timeout_exit: true,
            shard_workers: None,
        }
    }

    pub fn with_shard_workers(mut self, workers: Option<usize>) -> Self {
        self.shard_workers = workers;
        self
    }
}

/// Runs one gate to completion and records its `.log`, `.rc` and `.time`
/// artifacts. The returned result mirrors what was written.
pub fn run_job(
    table: &GateTable,
    gate: IndexedGate<'_>,
    artifacts: &RunArtifacts,
    ctx: &ExecutionContext,
) -> Result<JobResult> {
    let spec = gate.spec;
    let log_path = artifacts.log_path(&spec.name);
    let mut log = GateLog::create(&log_path)?;
    log.line(&format!("=== {} ===", spec.name))?;

    let cwd = table.resolve_cwd(spec);
    let started_at = Utc::now();
    let start = Instant::now();
    tracing::debug!(gate = %spec.name, cwd = %cwd.display(), "starting gate");

    let mut outcome = match (&spec.shard, ctx.shard_workers) {
        (Some(shard_spec), Some(workers)) => shard::run_sharded(
            spec, shard_spec, &cwd, artifacts, workers, &mut log,
        )?,
        _ => {
            let mut cmd = group_command(&spec.command, &cwd);
            apply_gate_env(&mut cmd, spec, artifacts);
            run_logged(cmd, &mut log, spec.timeout, EXIT_SPAWN_FAILED)?
        }
    };

    if outcome.code == 0 {
        let missing: Vec<String> = spec
            .expected_outputs
            .iter()
            .map(|p| cwd.join(p))
            .filter(|p| !p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if !missing.is_empty() {
            for path in &missing {
                log.line(&format!("ERROR: expected output missing: {}", path))?;
            }
            outcome = ProcessOutcome::exited(EXIT_MISSING_OUTPUTS);
        }
    }

    let elapsed = start.elapsed();
    artifacts.write_exit_code(&spec.name, outcome.code)?;
    artifacts.write_elapsed(&spec.name, elapsed)?;
    let result = JobResult {
        name: spec.name.clone(),
        declared_index: gate.index,
        exit_code: outcome.code,
        elapsed,
        log_path,
        started_at,
        completed_at: Utc::now(),
        timed_out: outcome.timed_out,
    };
    tracing::info!(
        gate = %result.name,
        exit_code = result.exit_code,
        elapsed_ms = elapsed.as_millis() as u64,
        timed_out = result.timed_out,
        "gate finished"
    );

    if !result.passed() {
        if !ctx.suppress_excerpt {
            print_failure_excerpt(artifacts, &result.name, result.exit_code)?;
        }
        if !ctx.suppress_marker_write {
            artifacts.write_first_failure(&result.name)?;
        }
        if result.timed_out && !ctx.suppress_timeout_exit {
            return Err(VerifyError::GateTimedOut {
                name: result.name.clone(),
            });
        }
    }
    Ok(result)
}

pub(crate) fn apply_gate_env(cmd: &mut Command, spec: &GateSpec, artifacts: &RunArtifacts) {
    cmd.env_remove(config::ENV_RUN_ID);
    cmd.env(ENV_PARENT_RUN_ID, artifacts.run_id());
    cmd.env(ENV_RUN_DIR, artifacts.run_dir());
    cmd.env(ENV_GATE, &spec.name);
    cmd.envs(&spec.env);
}

/// Prints the single authoritative failure report for `gate` to stderr.
pub fn print_failure_excerpt(artifacts: &RunArtifacts, gate: &str, exit_code: i32) -> Result<()> {
    let excerpt = artifacts.log_excerpt(gate, EXCERPT_LINES)?;
    eprintln!("FAIL: {} (rc={})", gate, exit_code);
    eprintln!("=== {} (last {} lines) ===", gate, EXCERPT_LINES);
    eprintln!("{}", excerpt);
    eprintln!("=== end {} ===", gate);
    eprintln!("log: {}", artifacts.log_path(gate).display());
    Ok(())
}
