pub mod artifacts;
pub mod error;
pub mod model;

pub use artifacts::{latest_run_dir, new_run_id, RunArtifacts, FIRST_FAILURE_MARKER, SUMMARY_FILE};
pub use error::{Result, VerifyError};
pub use model::{
    GateSpec, GateStatus, JobResult, Mode, RunVerdict, ShardSpec, VerdictStatus,
    EXIT_MISSING_OUTPUTS, EXIT_SPAWN_FAILED, EXIT_TIMEOUT,
};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| VerifyError::io(path, e))
}

/// Writes through a sibling temp file and renames it into place, so readers
/// never observe a partially written artifact.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(VerifyError::io(path, e));
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| VerifyError::MalformedArtifact {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Object keys come out sorted because `serde_json::Map` is a `BTreeMap`
/// without the `preserve_order` feature.
pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}
