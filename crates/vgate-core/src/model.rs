use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::VerifyError;

/// Recorded when a gate is killed for exceeding its timeout. Matches the
/// convention of coreutils `timeout`.
pub const EXIT_TIMEOUT: i32 = 124;

/// Recorded when a gate exits 0 but leaves a declared output missing.
pub const EXIT_MISSING_OUTPUTS: i32 = 125;

/// Recorded when the gate's executable could not be spawned.
pub const EXIT_SPAWN_FAILED: i32 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Quick,
    Full,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Quick, Mode::Full];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "quick" => Ok(Self::Quick),
            "full" => Ok(Self::Full),
            other => Err(VerifyError::config(format!(
                "unknown mode '{}': expected quick or full",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardSpec {
    /// Prints one work-item id per stdout line.
    pub list_command: Vec<String>,
    /// Runs one chunk of ids; see the placeholder list in `vgate_runner::shard`.
    pub worker_command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSpec {
    pub name: String,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub mode_tags: BTreeSet<Mode>,
    pub expected_outputs: Vec<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub shard: Option<ShardSpec>,
}

impl GateSpec {
    pub fn runs_in(&self, mode: Mode) -> bool {
        self.mode_tags.contains(&mode)
    }

    /// Gate names become artifact file names, so they are kept to a
    /// conservative character set.
    pub fn validate_name(name: &str) -> Result<(), VerifyError> {
        if name.is_empty() {
            return Err(VerifyError::config("gate name cannot be empty"));
        }
        if name.starts_with('.') {
            return Err(VerifyError::config(format!(
                "gate name '{}' cannot start with '.'",
                name
            )));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || "._-".contains(*c)))
        {
            return Err(VerifyError::config(format!(
                "gate name '{}' contains unsupported character {:?}",
                name, bad
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "command": self.command,
            "cwd": self.cwd.as_ref().map(|p| p.display().to_string()),
            "timeout_secs": self.timeout.as_secs(),
            "modes": self.mode_tags.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
            "expected_outputs": self
                .expected_outputs
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>(),
            "env": self.env,
            "shard": self.shard.as_ref().map(|s| json!({
                "list_command": s.list_command,
                "worker_command": s.worker_command,
            })),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
    TimedOut,
    NotRun,
}

impl GateStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::NotRun => "not_run",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub name: String,
    pub declared_index: usize,
    pub exit_code: i32,
    pub elapsed: Duration,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub timed_out: bool,
}

impl JobResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    pub fn status(&self) -> GateStatus {
        if self.timed_out {
            GateStatus::TimedOut
        } else if self.passed() {
            GateStatus::Passed
        } else {
            GateStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunVerdict {
    pub overall_status: VerdictStatus,
    pub failing_gate: Option<String>,
    /// Declaration index of `failing_gate` within the full gate table.
    pub failing_gate_rank: Option<usize>,
}

impl RunVerdict {
    pub fn pass() -> Self {
        Self {
            overall_status: VerdictStatus::Pass,
            failing_gate: None,
            failing_gate_rank: None,
        }
    }

    pub fn fail(gate: &str, rank: usize) -> Self {
        Self {
            overall_status: VerdictStatus::Fail,
            failing_gate: Some(gate.to_string()),
            failing_gate_rank: Some(rank),
        }
    }

    pub fn passed(&self) -> bool {
        self.overall_status == VerdictStatus::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_its_token() {
        for mode in Mode::ALL {
            assert_eq!(mode.as_str().parse::<Mode>().expect("parse"), mode);
        }
        assert!("nightly".parse::<Mode>().is_err());
    }

    #[test]
    fn gate_names_are_restricted_to_file_safe_characters() {
        assert!(GateSpec::validate_name("schema_check-2.v1").is_ok());
        assert!(GateSpec::validate_name("").is_err());
        assert!(GateSpec::validate_name(".hidden").is_err());
        assert!(GateSpec::validate_name("a/b").is_err());
        assert!(GateSpec::validate_name("two words").is_err());
    }

    #[test]
    fn job_status_prefers_timeout_over_plain_failure() {
        let now = Utc::now();
        let mut result = JobResult {
            name: "lint".to_string(),
            declared_index: 0,
            exit_code: EXIT_TIMEOUT,
            elapsed: Duration::from_secs(1),
            log_path: PathBuf::from("lint.log"),
            started_at: now,
            completed_at: now,
            timed_out: true,
        };
        assert_eq!(result.status(), GateStatus::TimedOut);
        result.timed_out = false;
        assert_eq!(result.status(), GateStatus::Failed);
        result.exit_code = 0;
        assert_eq!(result.status(), GateStatus::Passed);
    }

    #[test]
    fn verdict_serializes_status_in_lowercase() {
        let value = serde_json::to_value(RunVerdict::fail("schema", 3)).expect("json");
        assert_eq!(value["overall_status"], "fail");
        assert_eq!(value["failing_gate"], "schema");
        assert_eq!(value["failing_gate_rank"], 3);
    }
}
