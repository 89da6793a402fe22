use std::io::IsTerminal;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;

use vgate_core::{Result, VerifyError};

/// Upper bound on concurrently running validator gates.
pub const WAVE_JOBS_CEILING: usize = 4;
/// Upper bound on concurrently running acceptance shard workers.
pub const SHARD_WORKERS_CEILING: usize = 8;

pub const DEFAULT_ARTIFACTS_ROOT: &str = "artifacts/verify";
pub const DEFAULT_LOCK_NAME: &str = "vgate-verify-full.lock";

pub const ENV_JOBS: &str = "VGATE_JOBS";
pub const ENV_SHARD_WORKERS: &str = "VGATE_SHARD_WORKERS";
pub const ENV_VERBOSITY: &str = "VGATE_VERBOSITY";
pub const ENV_ARTIFACTS_ROOT: &str = "VGATE_ARTIFACTS_ROOT";
pub const ENV_LOCK_PATH: &str = "VGATE_LOCK_PATH";
pub const ENV_RUN_ID: &str = "VGATE_RUN_ID";
pub const ENV_STORY_ID: &str = "VGATE_STORY_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Verbose,
    Quiet,
    Auto,
    /// No console output at all; used when stdout carries JSON.
    Silent,
}

impl Verbosity {
    /// `Auto` is verbose only when stdout is attached to a terminal.
    pub fn is_verbose(self) -> bool {
        match self {
            Self::Verbose => true,
            Self::Quiet | Self::Silent => false,
            Self::Auto => std::io::stdout().is_terminal(),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verbose => "verbose",
            Self::Quiet => "quiet",
            Self::Auto => "auto",
            Self::Silent => "silent",
        }
    }
}

impl FromStr for Verbosity {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "verbose" | "1" => Ok(Self::Verbose),
            "quiet" | "0" => Ok(Self::Quiet),
            "auto" | "" => Ok(Self::Auto),
            "silent" => Ok(Self::Silent),
            other => Err(VerifyError::config(format!(
                "{}: unknown verbosity '{}': expected verbose, quiet, auto or silent",
                ENV_VERBOSITY, other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub wave_jobs: usize,
    pub shard_workers: usize,
    pub verbosity: Verbosity,
    /// `None` resolves to `DEFAULT_ARTIFACTS_ROOT` under the gate table's directory.
    pub artifacts_root: Option<PathBuf>,
    pub lock_path: PathBuf,
    pub run_id: Option<String>,
    pub story_id: String,
    /// Keep launching waves after one fails.
    pub keep_going: bool,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parallelism = default_parallelism();
        let wave_jobs = match non_empty(lookup(ENV_JOBS)) {
            Some(raw) => parse_count(ENV_JOBS, &raw)?,
            None => parallelism,
        };
        let shard_workers = match non_empty(lookup(ENV_SHARD_WORKERS)) {
            Some(raw) => parse_count(ENV_SHARD_WORKERS, &raw)?,
            None => parallelism,
        };
        let verbosity = match non_empty(lookup(ENV_VERBOSITY)) {
            Some(raw) => raw.parse()?,
            None => Verbosity::Auto,
        };
        let lock_path = non_empty(lookup(ENV_LOCK_PATH))
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_LOCK_NAME));
        Ok(Self {
            wave_jobs: clip(wave_jobs, WAVE_JOBS_CEILING),
            shard_workers: clip(shard_workers, SHARD_WORKERS_CEILING),
            verbosity,
            artifacts_root: non_empty(lookup(ENV_ARTIFACTS_ROOT)).map(PathBuf::from),
            lock_path,
            run_id: non_empty(lookup(ENV_RUN_ID)),
            story_id: non_empty(lookup(ENV_STORY_ID)).unwrap_or_else(|| "unknown".to_string()),
            keep_going: false,
        })
    }

    pub fn set_wave_jobs(&mut self, jobs: usize) -> Result<()> {
        if jobs == 0 {
            return Err(VerifyError::config("--jobs must be at least 1"));
        }
        self.wave_jobs = clip(jobs, WAVE_JOBS_CEILING);
        Ok(())
    }

    pub fn set_shard_workers(&mut self, workers: usize) -> Result<()> {
        if workers == 0 {
            return Err(VerifyError::config("--shard-workers must be at least 1"));
        }
        self.shard_workers = clip(workers, SHARD_WORKERS_CEILING);
        Ok(())
    }
}

pub fn default_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn clip(requested: usize, ceiling: usize) -> usize {
    requested.clamp(1, ceiling)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_count(var: &str, raw: &str) -> Result<usize> {
    match raw.parse::<usize>() {
        Ok(0) => Err(VerifyError::config(format!("{} must be at least 1", var))),
        Ok(n) => Ok(n),
        Err(_) => Err(VerifyError::config(format!(
            "{} must be a positive integer (found '{}')",
            var, raw
        ))),
    }
}
