use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use vgate_core::{
    atomic_write_bytes, ensure_dir, GateSpec, Result, RunArtifacts, ShardSpec, VerifyError,
    EXIT_SPAWN_FAILED, EXIT_TIMEOUT,
};

use crate::job::apply_gate_env;
use crate::process::{group_command, run_captured, run_logged, GateLog, ProcessOutcome};

pub const ENV_SHARD_INDEX: &str = "VGATE_SHARD_INDEX";
pub const ENV_SHARD_COUNT: &str = "VGATE_SHARD_COUNT";
pub const ENV_SHARD_IDS_FILE: &str = "VGATE_SHARD_IDS_FILE";
pub const ENV_SHARD_STATE: &str = "VGATE_SHARD_STATE";
pub const ENV_SHARD_STATUS: &str = "VGATE_SHARD_STATUS";

/// A worker command token that is exactly this expands to one argument per id.
pub const IDS_PLACEHOLDER: &str = "{ids}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub worker_id: usize,
    pub id_range: Range<usize>,
    pub ids_path: PathBuf,
    pub state_path: PathBuf,
    /// Left to the worker; the engine never writes it.
    pub status_path: PathBuf,
    /// Exit code the engine observed for the worker.
    pub rc_path: PathBuf,
    pub log_path: PathBuf,
}

impl Shard {
    fn new(dir: &Path, worker_id: usize, id_range: Range<usize>) -> Self {
        Self {
            worker_id,
            id_range,
            ids_path: dir.join(format!("shard_{}.ids", worker_id)),
            state_path: dir.join(format!("shard_{}.state", worker_id)),
            status_path: dir.join(format!("shard_{}.status", worker_id)),
            rc_path: dir.join(format!("shard_{}.rc", worker_id)),
            log_path: dir.join(format!("shard_{}.log", worker_id)),
        }
    }
}

/// Splits `total` items into contiguous chunks of `ceil(total / workers)`.
/// Empty chunks are dropped, so fewer than `workers` ranges may come back.
pub fn partition(total: usize, workers: usize) -> Vec<Range<usize>> {
    if total == 0 || workers == 0 {
        return Vec::new();
    }
    let chunk = total.div_ceil(workers);
    (0..workers)
        .map(|i| {
            let start = (i * chunk).min(total);
            let end = ((i + 1) * chunk).min(total);
            start..end
        })
        .filter(|r| !r.is_empty())
        .collect()
}

/// Runs a sharded gate: lists the work items, fans them out over `workers`
/// processes and waits for every one of them. The outcome is a pass only if
/// all workers exit 0; otherwise it carries the lowest-numbered failing
/// worker's code. `spec.timeout` bounds the listing and the workers together.
pub fn run_sharded(
    spec: &GateSpec,
    shard_spec: &ShardSpec,
    cwd: &Path,
    artifacts: &RunArtifacts,
    workers: usize,
    log: &mut GateLog,
) -> Result<ProcessOutcome> {
    let deadline = Instant::now() + spec.timeout;
    let dir = artifacts.shard_dir(&spec.name);
    ensure_dir(&dir)?;
    let run = ShardRun {
        spec,
        shard_spec,
        cwd,
        artifacts,
        dir: &dir,
        deadline,
    };
    let outcome = run.coordinate(workers, log);
    if let Err(e) = fs::remove_dir_all(&dir) {
        tracing::warn!(
            gate = %spec.name,
            dir = %dir.display(),
            "failed to remove shard dir: {}",
            e
        );
    }
    // Fails while another sharded gate still has its directory there.
    if let Some(parent) = dir.parent() {
        let _ = fs::remove_dir(parent);
    }
    outcome
}

/// One sharded gate execution. Every process it starts shares `deadline`.
struct ShardRun<'a> {
    spec: &'a GateSpec,
    shard_spec: &'a ShardSpec,
    cwd: &'a Path,
    artifacts: &'a RunArtifacts,
    dir: &'a Path,
    deadline: Instant,
}

impl ShardRun<'_> {
    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn coordinate(&self, workers: usize, log: &mut GateLog) -> Result<ProcessOutcome> {
        let ids = match self.discover_ids(log)? {
            Ok(ids) => ids,
            Err(listing) => return Ok(listing),
        };
        if ids.is_empty() {
            log.line("ERROR: no work items discovered")?;
            return Ok(ProcessOutcome::exited(1));
        }
        if self.remaining().is_zero() {
            log.line(&format!(
                "ERROR: timed out after {}s before workers started",
                self.spec.timeout.as_secs()
            ))?;
            return Ok(ProcessOutcome {
                code: EXIT_TIMEOUT,
                timed_out: true,
            });
        }

        let shards: Vec<Shard> = partition(ids.len(), workers)
            .into_iter()
            .enumerate()
            .map(|(worker_id, range)| Shard::new(self.dir, worker_id, range))
            .collect();
        let count = shards.len();
        log.line(&format!(
            "shard: {} work items across {} workers",
            ids.len(),
            count
        ))?;
        for shard in &shards {
            let mut body = ids[shard.id_range.clone()].join("\n");
            body.push('\n');
            atomic_write_bytes(&shard.ids_path, body.as_bytes())?;
            atomic_write_bytes(&shard.state_path, b"")?;
        }
        tracing::info!(
            gate = %self.spec.name,
            items = ids.len(),
            workers = count,
            "dispatching shards"
        );

        let budget = self.remaining();
        let joined: Vec<Result<ProcessOutcome>> = thread::scope(|scope| {
            let handles: Vec<_> = shards
                .iter()
                .map(|shard| {
                    let argv = worker_args(&self.shard_spec.worker_command, shard, count, &ids);
                    scope.spawn(move || self.run_worker(shard, count, &argv, budget))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        let mut outcomes = Vec::with_capacity(count);
        for result in joined {
            outcomes.push(result?);
        }

        for shard in &shards {
            log.line(&format!(
                "=== shard {}/{} ids [{}, {}) ===",
                shard.worker_id + 1,
                count,
                shard.id_range.start,
                shard.id_range.end
            ))?;
            let bytes =
                fs::read(&shard.log_path).map_err(|e| VerifyError::io(&shard.log_path, e))?;
            log.write_all(&bytes)?;
            if let Some(status) = read_worker_status(&shard.status_path)? {
                log.line(&format!("shard status: {}", status))?;
            }
        }

        let mut decisive: Option<ProcessOutcome> = None;
        for (shard, outcome) in shards.iter().zip(&outcomes) {
            let code = read_rc(&shard.rc_path)?;
            if code != 0 {
                log.line(&format!(
                    "FAIL: shard {}/{} (rc={})",
                    shard.worker_id + 1,
                    count,
                    code
                ))?;
                if decisive.is_none() {
                    decisive = Some(ProcessOutcome {
                        code,
                        timed_out: outcome.timed_out,
                    });
                }
            }
        }
        let outcome = decisive.unwrap_or_else(|| ProcessOutcome::exited(0));
        if outcome.timed_out {
            log.line(&format!(
                "ERROR: gate timed out after {}s",
                self.spec.timeout.as_secs()
            ))?;
        }
        Ok(outcome)
    }

    /// Runs the listing command. The inner `Err` carries the listing's own
    /// failure, which fails the gate.
    fn discover_ids(
        &self,
        log: &mut GateLog,
    ) -> Result<std::result::Result<Vec<String>, ProcessOutcome>> {
        log.line(&format!(
            "shard: listing work items: {}",
            self.shard_spec.list_command.join(" ")
        ))?;
        let listing_path = self.dir.join("listing.out");
        let listing =
            fs::File::create(&listing_path).map_err(|e| VerifyError::io(&listing_path, e))?;
        let mut cmd = group_command(&self.shard_spec.list_command, self.cwd);
        apply_gate_env(&mut cmd, self.spec, self.artifacts);
        let outcome = run_captured(cmd, listing, log, self.remaining(), EXIT_SPAWN_FAILED)?;
        if outcome.code != 0 {
            log.line(&format!(
                "ERROR: work item listing failed (rc={})",
                outcome.code
            ))?;
            return Ok(Err(outcome));
        }
        let raw =
            fs::read_to_string(&listing_path).map_err(|e| VerifyError::io(&listing_path, e))?;
        Ok(Ok(parse_ids(&raw)))
    }

    fn run_worker(
        &self,
        shard: &Shard,
        count: usize,
        argv: &[String],
        budget: Duration,
    ) -> Result<ProcessOutcome> {
        let mut log = GateLog::create(&shard.log_path)?;
        let mut cmd = group_command(argv, self.cwd);
        apply_gate_env(&mut cmd, self.spec, self.artifacts);
        cmd.env(ENV_SHARD_INDEX, shard.worker_id.to_string());
        cmd.env(ENV_SHARD_COUNT, count.to_string());
        cmd.env(ENV_SHARD_IDS_FILE, &shard.ids_path);
        cmd.env(ENV_SHARD_STATE, &shard.state_path);
        cmd.env(ENV_SHARD_STATUS, &shard.status_path);
        let outcome = run_logged(cmd, &mut log, budget, EXIT_SPAWN_FAILED)?;
        tracing::debug!(
            gate = %self.spec.name,
            worker = shard.worker_id,
            exit_code = outcome.code,
            "shard worker finished"
        );
        atomic_write_bytes(&shard.rc_path, format!("{}\n", outcome.code).as_bytes())?;
        Ok(outcome)
    }
}

/// What the worker left in its status file, if anything.
fn read_worker_status(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => Ok(Some(raw.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VerifyError::io(path, e)),
    }
}

fn read_rc(path: &Path) -> Result<i32> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(VerifyError::MissingArtifact {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(VerifyError::io(path, e)),
    };
    raw.trim()
        .parse::<i32>()
        .map_err(|e| VerifyError::MalformedArtifact {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

pub fn parse_ids(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expands the worker command template for one shard. Supported placeholders:
/// `{ids}` (whole token), `{ids_file}`, `{state_path}`, `{status_path}`,
/// `{shard_index}` and `{shard_count}`.
pub fn worker_args(
    template: &[String],
    shard: &Shard,
    count: usize,
    ids: &[String],
) -> Vec<String> {
    let mut argv = Vec::with_capacity(template.len() + shard.id_range.len());
    for token in template {
        if token == IDS_PLACEHOLDER {
            argv.extend(ids[shard.id_range.clone()].iter().cloned());
            continue;
        }
        let expanded = token
            .replace("{ids_file}", &shard.ids_path.to_string_lossy())
            .replace("{state_path}", &shard.state_path.to_string_lossy())
            .replace("{status_path}", &shard.status_path.to_string_lossy())
            .replace("{shard_index}", &shard.worker_id.to_string())
            .replace("{shard_count}", &count.to_string());
        argv.push(expanded);
    }
    argv
}
