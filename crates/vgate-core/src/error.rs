use std::path::PathBuf;

use thiserror::Error;

/// Failures of the engine itself. A gate exiting nonzero is not one of these;
/// it is reported through `RunVerdict`.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The gate table or environment configuration is unusable.
    #[error("config error: {message}")]
    Config { message: String },

    /// A per-gate artifact that must exist after a job was not written.
    #[error("missing artifact: {}", .path.display())]
    MissingArtifact { path: PathBuf },

    /// An artifact exists but its contents cannot be parsed.
    #[error("malformed artifact {}: {detail}", .path.display())]
    MalformedArtifact { path: PathBuf, detail: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Another full run holds the machine-wide lock.
    #[error("full run already in progress ({holder})")]
    LockContention { holder: String },

    /// Raised only by a standalone job whose timeout exit is not suppressed.
    #[error("gate '{name}' timed out")]
    GateTimedOut { name: String },
}

impl VerifyError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code the CLI reports for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config { .. }
            | Self::MissingArtifact { .. }
            | Self::MalformedArtifact { .. }
            | Self::Io { .. } => 2,
            Self::LockContention { .. } => 3,
            Self::GateTimedOut { .. } => 124,
        }
    }

    /// Stable code used in JSON error payloads.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config_error",
            Self::MissingArtifact { .. } => "missing_artifact",
            Self::MalformedArtifact { .. } => "malformed_artifact",
            Self::Io { .. } => "io_error",
            Self::LockContention { .. } => "lock_contention",
            Self::GateTimedOut { .. } => "gate_timed_out",
        }
    }
}

pub type Result<T, E = VerifyError> = std::result::Result<T, E>;
