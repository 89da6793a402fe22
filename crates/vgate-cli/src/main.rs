use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vgate_core::{JobResult, Mode, VerifyError};
use vgate_runner::table::DEFAULT_TABLE_FILE;
use vgate_runner::{
    EngineConfig, GateTable, LockHolder, LockStatus, RunOutcome, RunReport, Verbosity,
};

const EXIT_GATE_FAILED: u8 = 1;

#[derive(Parser)]
#[command(name = "vgate", version = "0.3.0", about = "Parallel verification gate runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "quick")]
    Quick,
    #[value(name = "full")]
    Full,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Quick => Mode::Quick,
            ModeArg::Full => Mode::Full,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VerbosityArg {
    #[value(name = "verbose")]
    Verbose,
    #[value(name = "quiet")]
    Quiet,
    #[value(name = "auto")]
    Auto,
}

impl From<VerbosityArg> for Verbosity {
    fn from(value: VerbosityArg) -> Self {
        match value {
            VerbosityArg::Verbose => Verbosity::Verbose,
            VerbosityArg::Quiet => Verbosity::Quiet,
            VerbosityArg::Auto => Verbosity::Auto,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run every gate active in a mode.
    Run {
        #[arg(value_enum)]
        mode: ModeArg,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        jobs: Option<usize>,
        #[arg(long)]
        shard_workers: Option<usize>,
        #[arg(long, value_enum)]
        verbosity: Option<VerbosityArg>,
        #[arg(long)]
        keep_going: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run a single gate on its own.
    Gate {
        name: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    List {
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Timings {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    LockStatus {
        #[arg(long)]
        json: bool,
    },
    ShardPlan {
        #[arg(long)]
        total: usize,
        #[arg(long)]
        workers: usize,
        #[arg(long)]
        json: bool,
    },
}

/// What a command produced: an optional JSON payload and the process exit code.
struct Finished {
    payload: Option<Value>,
    exit: u8,
}

impl Finished {
    fn ok() -> Self {
        Self {
            payload: None,
            exit: 0,
        }
    }

    fn json(payload: Value, exit: u8) -> Self {
        Self {
            payload: Some(payload),
            exit,
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(finished) => {
            if let Some(payload) = &finished.payload {
                emit_json(payload);
            }
            ExitCode::from(finished.exit)
        }
        Err(err) => {
            let (code, exit) = match err.downcast_ref::<VerifyError>() {
                Some(verify) => (verify.code(), verify.exit_code()),
                None => ("command_failed", 2),
            };
            if json_mode {
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
            } else {
                eprintln!("error: {:#}", err);
            }
            ExitCode::from(exit)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(command: Commands) -> Result<Finished> {
    match command {
        Commands::Run {
            mode,
            config,
            jobs,
            shard_workers,
            verbosity,
            keep_going,
            json,
        } => {
            let table = load_table(config.as_deref())?;
            let mut engine = EngineConfig::from_env()?;
            if let Some(jobs) = jobs {
                engine.set_wave_jobs(jobs)?;
            }
            if let Some(workers) = shard_workers {
                engine.set_shard_workers(workers)?;
            }
            if let Some(verbosity) = verbosity {
                engine.verbosity = verbosity.into();
            }
            if json {
                engine.verbosity = Verbosity::Silent;
            }
            engine.keep_going = keep_going;
            let mode: Mode = mode.into();
            vgate_runner::signals::install_shutdown_handler()?;
            match vgate_runner::run_verification(&table, mode, &engine)? {
                RunOutcome::Completed(report) => {
                    if json {
                        return Ok(Finished::json(
                            json!({
                                "ok": true,
                                "command": "run",
                                "run": run_report_to_json(&report),
                            }),
                            report.exit_code(),
                        ));
                    }
                    Ok(Finished {
                        payload: None,
                        exit: report.exit_code(),
                    })
                }
                RunOutcome::Blocked(holder) => {
                    let holder = holder
                        .map(|h| h.to_string())
                        .unwrap_or_else(|| "holder unknown".to_string());
                    Err(VerifyError::LockContention { holder }.into())
                }
            }
        }
        Commands::Gate { name, config, json } => {
            let table = load_table(config.as_deref())?;
            let mut engine = EngineConfig::from_env()?;
            if json {
                engine.verbosity = Verbosity::Silent;
            }
            vgate_runner::signals::install_shutdown_handler()?;
            let report = vgate_runner::run_single_gate(&table, &name, &engine)?;
            let exit = if report.result.passed() { 0 } else { EXIT_GATE_FAILED };
            if json {
                return Ok(Finished::json(
                    json!({
                        "ok": true,
                        "command": "gate",
                        "run_id": report.run_id,
                        "run_dir": report.run_dir.display().to_string(),
                        "gate": job_result_to_json(&report.result),
                    }),
                    exit,
                ));
            }
            println!(
                "{} {} (rc={}, {:.3}s)",
                report.result.status().as_str(),
                report.result.name,
                report.result.exit_code,
                report.result.elapsed.as_secs_f64()
            );
            Ok(Finished {
                payload: None,
                exit,
            })
        }
        Commands::List { mode, config, json } => {
            let table = load_table(config.as_deref())?;
            let rows: Vec<Value> = match mode {
                Some(mode) => table
                    .for_mode(mode.into())
                    .iter()
                    .map(|g| gate_row(g.index, g.spec))
                    .collect(),
                None => table
                    .gates()
                    .iter()
                    .enumerate()
                    .map(|(index, spec)| gate_row(index, spec))
                    .collect(),
            };
            if json {
                return Ok(Finished::json(
                    json!({
                        "ok": true,
                        "command": "list",
                        "mode": mode.map(|m| Mode::from(m).as_str()),
                        "gates": rows,
                    }),
                    0,
                ));
            }
            for row in &rows {
                println!(
                    "{:>3}  {:<24} {:<12} {}",
                    row["declared_index"],
                    row["name"].as_str().unwrap_or_default(),
                    row["modes"]
                        .as_array()
                        .map(|m| m
                            .iter()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .join(","))
                        .unwrap_or_default(),
                    if row["sharded"].as_bool().unwrap_or(false) {
                        "sharded"
                    } else {
                        ""
                    }
                );
            }
            Ok(Finished::ok())
        }
        Commands::Timings {
            run_id,
            config,
            json,
        } => {
            let table = load_table(config.as_deref())?;
            let engine = EngineConfig::from_env()?;
            let root = vgate_runner::artifacts_root(&table, &engine);
            let run_dir = vgate_runner::find_run_dir(&root, run_id.as_deref())?;
            let timings = vgate_runner::collect_timings(&run_dir)?;
            if json {
                return Ok(Finished::json(
                    json!({
                        "ok": true,
                        "command": "timings",
                        "run_dir": run_dir.display().to_string(),
                        "timings": timings,
                    }),
                    0,
                ));
            }
            println!("run_dir: {}", run_dir.display());
            print!("{}", vgate_runner::render_timing_table(&timings));
            Ok(Finished::ok())
        }
        Commands::LockStatus { json } => {
            let engine = EngineConfig::from_env()?;
            let status = vgate_runner::lock_status(&engine.lock_path)?;
            if json {
                let (state, holder): (&str, Option<&LockHolder>) = match &status {
                    LockStatus::Free => ("free", None),
                    LockStatus::Held(h) => ("held", Some(h)),
                    LockStatus::Stale(h) => ("stale", Some(h)),
                };
                return Ok(Finished::json(
                    json!({
                        "ok": true,
                        "command": "lock-status",
                        "lock_path": engine.lock_path.display().to_string(),
                        "state": state,
                        "holder": holder,
                    }),
                    0,
                ));
            }
            println!("lock_path: {}", engine.lock_path.display());
            match status {
                LockStatus::Free => println!("state: free"),
                LockStatus::Held(h) => println!("state: held by {}", h),
                LockStatus::Stale(h) => println!("state: stale (left by {})", h),
            }
            Ok(Finished::ok())
        }
        Commands::ShardPlan {
            total,
            workers,
            json,
        } => {
            if workers == 0 {
                return Err(VerifyError::config("--workers must be at least 1").into());
            }
            let ranges = vgate_runner::partition(total, workers);
            if json {
                let shards: Vec<Value> = ranges
                    .iter()
                    .enumerate()
                    .map(|(k, r)| json!({ "shard_index": k, "start": r.start, "end": r.end }))
                    .collect();
                return Ok(Finished::json(
                    json!({
                        "ok": true,
                        "command": "shard-plan",
                        "total": total,
                        "workers": workers,
                        "shards": shards,
                    }),
                    0,
                ));
            }
            for (k, r) in ranges.iter().enumerate() {
                println!("shard {}/{}: [{}, {})", k + 1, ranges.len(), r.start, r.end);
            }
            Ok(Finished::ok())
        }
    }
}

fn load_table(config: Option<&Path>) -> Result<GateTable> {
    let path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TABLE_FILE));
    let table = GateTable::load(&path)?;
    tracing::debug!(path = %path.display(), gates = table.gates().len(), "gate table loaded");
    Ok(table)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Gate { json, .. }
        | Commands::List { json, .. }
        | Commands::Timings { json, .. }
        | Commands::LockStatus { json }
        | Commands::ShardPlan { json, .. } => *json,
    }
}

fn gate_row(index: usize, spec: &vgate_core::GateSpec) -> Value {
    json!({
        "declared_index": index,
        "name": spec.name,
        "command": spec.command,
        "modes": spec.mode_tags.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
        "timeout_secs": spec.timeout.as_secs(),
        "sharded": spec.shard.is_some(),
    })
}

fn job_result_to_json(result: &JobResult) -> Value {
    json!({
        "name": result.name,
        "declared_index": result.declared_index,
        "status": result.status().as_str(),
        "exit_code": result.exit_code,
        "elapsed_secs": result.elapsed.as_secs_f64(),
        "log_path": result.log_path.display().to_string(),
    })
}

fn run_report_to_json(report: &RunReport) -> Value {
    json!({
        "run_id": report.run_id,
        "run_dir": report.run_dir.display().to_string(),
        "mode": report.mode.as_str(),
        "verdict": report.summary["verdict"],
        "gates": report.results.iter().map(job_result_to_json).collect::<Vec<_>>(),
        "summary_path": report.run_dir.join(vgate_core::SUMMARY_FILE).display().to_string(),
    })
}
