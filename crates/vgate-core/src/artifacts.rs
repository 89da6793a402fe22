use chrono::Utc;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, VerifyError};
use crate::{atomic_write_bytes, ensure_dir};

pub const FIRST_FAILURE_MARKER: &str = "first_failure";
pub const SUMMARY_FILE: &str = "summary.json";

pub fn new_run_id() -> String {
    format!(
        "{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        std::process::id()
    )
}

/// Most recently modified run directory under `root`, if any.
pub fn latest_run_dir(root: &Path) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(VerifyError::io(root, e)),
    };
    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map_err(|e| VerifyError::io(&path, e))?;
        let newer = match &best {
            Some((ts, p)) => modified > *ts || (modified == *ts && path > *p),
            None => true,
        };
        if newer {
            best = Some((modified, path));
        }
    }
    Ok(best.map(|(_, p)| p))
}

/// Per-run artifact tree. Every gate owns a disjoint set of paths, so
/// concurrently running gates never write the same file.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    run_id: String,
    run_dir: PathBuf,
}

impl RunArtifacts {
    pub fn create(root: &Path, run_id: &str) -> Result<Self> {
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
            return Err(VerifyError::config(format!("invalid run id '{}'", run_id)));
        }
        let run_dir = root.join(run_id);
        ensure_dir(&run_dir)?;
        let mut existing = fs::read_dir(&run_dir).map_err(|e| VerifyError::io(&run_dir, e))?;
        if existing.next().is_some() {
            return Err(VerifyError::config(format!(
                "run directory {} already contains artifacts",
                run_dir.display()
            )));
        }
        Ok(Self {
            run_id: run_id.to_string(),
            run_dir,
        })
    }

    pub fn open(run_dir: &Path) -> Result<Self> {
        if !run_dir.is_dir() {
            return Err(VerifyError::MissingArtifact {
                path: run_dir.to_path_buf(),
            });
        }
        let run_id = run_dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            run_id,
            run_dir: run_dir.to_path_buf(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn log_path(&self, gate: &str) -> PathBuf {
        self.run_dir.join(format!("{}.log", gate))
    }

    pub fn rc_path(&self, gate: &str) -> PathBuf {
        self.run_dir.join(format!("{}.rc", gate))
    }

    pub fn time_path(&self, gate: &str) -> PathBuf {
        self.run_dir.join(format!("{}.time", gate))
    }

    pub fn marker_path(&self) -> PathBuf {
        self.run_dir.join(FIRST_FAILURE_MARKER)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.run_dir.join(SUMMARY_FILE)
    }

    pub fn shard_dir(&self, gate: &str) -> PathBuf {
        self.run_dir.join("shards").join(gate)
    }

    pub fn write_exit_code(&self, gate: &str, code: i32) -> Result<()> {
        atomic_write_bytes(&self.rc_path(gate), format!("{}\n", code).as_bytes())
    }

    pub fn read_exit_code(&self, gate: &str) -> Result<i32> {
        let path = self.rc_path(gate);
        let raw = read_artifact(&path)?;
        raw.trim()
            .parse::<i32>()
            .map_err(|e| VerifyError::MalformedArtifact {
                path,
                detail: format!("expected integer exit code: {}", e),
            })
    }

    pub fn write_elapsed(&self, gate: &str, elapsed: Duration) -> Result<()> {
        atomic_write_bytes(
            &self.time_path(gate),
            format!("{:.3}\n", elapsed.as_secs_f64()).as_bytes(),
        )
    }

    pub fn read_elapsed(&self, gate: &str) -> Result<Duration> {
        let path = self.time_path(gate);
        let raw = read_artifact(&path)?;
        parse_seconds(&raw).ok_or_else(|| VerifyError::MalformedArtifact {
            path,
            detail: format!("expected seconds, found '{}'", raw.trim()),
        })
    }

    pub fn write_first_failure(&self, gate: &str) -> Result<()> {
        atomic_write_bytes(&self.marker_path(), format!("{}\n", gate).as_bytes())
    }

    pub fn read_first_failure(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.marker_path()) {
            Ok(raw) => {
                let name = raw.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VerifyError::io(self.marker_path(), e)),
        }
    }

    /// Last `max_lines` lines of a gate's log.
    pub fn log_excerpt(&self, gate: &str, max_lines: usize) -> Result<String> {
        let path = self.log_path(gate);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VerifyError::MissingArtifact { path })
            }
            Err(e) => return Err(VerifyError::io(path, e)),
        };
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        Ok(lines[start..].join("\n"))
    }
}

fn read_artifact(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(VerifyError::MissingArtifact {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(VerifyError::io(path, e)),
    }
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    let token = raw.split_whitespace().next()?;
    let secs = token.parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "vgate_artifacts_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    #[test]
    fn exit_code_and_elapsed_are_plain_text() {
        let root = temp_root("plain");
        let run = RunArtifacts::create(&root, "run_a").expect("create");
        run.write_exit_code("schema", 3).expect("rc");
        run.write_elapsed("schema", Duration::from_millis(1250))
            .expect("time");
        assert_eq!(fs::read_to_string(run.rc_path("schema")).unwrap(), "3\n");
        assert_eq!(
            fs::read_to_string(run.time_path("schema")).unwrap(),
            "1.250\n"
        );
        assert_eq!(run.read_exit_code("schema").expect("read rc"), 3);
        assert_eq!(
            run.read_elapsed("schema").expect("read time"),
            Duration::from_millis(1250)
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_and_garbled_exit_codes_are_distinct_errors() {
        let root = temp_root("missing");
        let run = RunArtifacts::create(&root, "run_b").expect("create");
        match run.read_exit_code("ghost") {
            Err(VerifyError::MissingArtifact { path }) => {
                assert!(path.ends_with("ghost.rc"))
            }
            other => panic!("expected missing artifact, got {:?}", other),
        }
        fs::write(run.rc_path("garbled"), "ok\n").expect("write");
        assert!(matches!(
            run.read_exit_code("garbled"),
            Err(VerifyError::MalformedArtifact { .. })
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn marker_is_absent_until_written() {
        let root = temp_root("marker");
        let run = RunArtifacts::create(&root, "run_c").expect("create");
        assert_eq!(run.read_first_failure().expect("read"), None);
        run.write_first_failure("lint").expect("write");
        assert_eq!(
            run.read_first_failure().expect("read"),
            Some("lint".to_string())
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn excerpt_keeps_only_the_tail() {
        let root = temp_root("excerpt");
        let run = RunArtifacts::create(&root, "run_d").expect("create");
        let body: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        fs::write(run.log_path("lint"), body).expect("write");
        assert_eq!(
            run.log_excerpt("lint", 3).expect("excerpt"),
            "line 8\nline 9\nline 10"
        );
        assert_eq!(run.log_excerpt("lint", 100).expect("excerpt").lines().count(), 10);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn run_ids_cannot_escape_the_root() {
        let root = temp_root("escape");
        assert!(RunArtifacts::create(&root, "../up").is_err());
        assert!(RunArtifacts::create(&root, "").is_err());
        assert!(RunArtifacts::create(&root, ".hidden").is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reusing_a_populated_run_id_is_refused() {
        let root = temp_root("reuse");
        let run = RunArtifacts::create(&root, "run_e").expect("create");
        run.write_exit_code("lint", 0).expect("rc");
        assert!(matches!(
            RunArtifacts::create(&root, "run_e"),
            Err(VerifyError::Config { .. })
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn latest_run_dir_is_none_for_missing_root() {
        let root = temp_root("latest").join("does_not_exist");
        assert_eq!(latest_run_dir(&root).expect("latest"), None);
    }
}
