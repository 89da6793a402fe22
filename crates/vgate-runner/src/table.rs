use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vgate_core::{canonical_json_digest, GateSpec, Mode, Result, ShardSpec, VerifyError};

pub const DEFAULT_TABLE_FILE: &str = "vgate.yaml";
pub const TABLE_VERSION: &str = "1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableFile {
    version: String,
    #[serde(default)]
    gates: Vec<GateEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GateEntry {
    name: String,
    command: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default)]
    modes: Option<Vec<Mode>>,
    #[serde(default)]
    expected_outputs: Vec<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    shard: Option<ShardSpec>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// A gate together with its position in the full table. The index is the
/// only tie-break used when several gates fail.
#[derive(Debug, Clone, Copy)]
pub struct IndexedGate<'a> {
    pub index: usize,
    pub spec: &'a GateSpec,
}

#[derive(Debug, Clone)]
pub struct GateTable {
    base_dir: PathBuf,
    gates: Vec<GateSpec>,
}

impl GateTable {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| VerifyError::io(path, e))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let base_dir = base_dir
            .canonicalize()
            .unwrap_or_else(|_| base_dir.to_path_buf());
        Self::from_yaml_str(&raw, &base_dir).map_err(|e| match e {
            VerifyError::Config { message } => {
                VerifyError::config(format!("{}: {}", path.display(), message))
            }
            other => other,
        })
    }

    pub fn from_yaml_str(raw: &str, base_dir: &Path) -> Result<Self> {
        let file: TableFile =
            serde_yaml::from_str(raw).map_err(|e| VerifyError::config(e.to_string()))?;
        if file.version != TABLE_VERSION {
            return Err(VerifyError::config(format!(
                "unsupported table version '{}' (expected '{}')",
                file.version, TABLE_VERSION
            )));
        }
        let gates = file
            .gates
            .into_iter()
            .map(|entry| {
                let mode_tags: BTreeSet<Mode> = match entry.modes {
                    Some(modes) => modes.into_iter().collect(),
                    None => Mode::ALL.into_iter().collect(),
                };
                GateSpec {
                    name: entry.name,
                    command: entry.command,
                    cwd: entry.cwd,
                    timeout: Duration::from_secs(entry.timeout_secs),
                    mode_tags,
                    expected_outputs: entry.expected_outputs,
                    env: entry.env,
                    shard: entry.shard,
                }
            })
            .collect();
        Self::new(base_dir, gates)
    }

    pub fn new(base_dir: &Path, gates: Vec<GateSpec>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for gate in &gates {
            GateSpec::validate_name(&gate.name)?;
            if !seen.insert(gate.name.as_str()) {
                return Err(VerifyError::config(format!(
                    "duplicate gate name '{}'",
                    gate.name
                )));
            }
            if gate.command.is_empty() || gate.command[0].trim().is_empty() {
                return Err(VerifyError::config(format!(
                    "gate '{}' has an empty command",
                    gate.name
                )));
            }
            if gate.timeout.is_zero() {
                return Err(VerifyError::config(format!(
                    "gate '{}' must have a timeout of at least 1 second",
                    gate.name
                )));
            }
            if gate.mode_tags.is_empty() {
                return Err(VerifyError::config(format!(
                    "gate '{}' is not enabled in any mode",
                    gate.name
                )));
            }
            if let Some(shard) = &gate.shard {
                if shard.list_command.is_empty() || shard.worker_command.is_empty() {
                    return Err(VerifyError::config(format!(
                        "gate '{}' has an empty shard list_command or worker_command",
                        gate.name
                    )));
                }
            }
        }
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            gates,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn gates(&self) -> &[GateSpec] {
        &self.gates
    }

    pub fn get(&self, name: &str) -> Option<IndexedGate<'_>> {
        self.gates
            .iter()
            .enumerate()
            .find(|(_, g)| g.name == name)
            .map(|(index, spec)| IndexedGate { index, spec })
    }

    /// Active gates for `mode`, in declared order.
    pub fn for_mode(&self, mode: Mode) -> Vec<IndexedGate<'_>> {
        self.gates
            .iter()
            .enumerate()
            .filter(|(_, g)| g.runs_in(mode))
            .map(|(index, spec)| IndexedGate { index, spec })
            .collect()
    }

    pub fn resolve_cwd(&self, gate: &GateSpec) -> PathBuf {
        match &gate.cwd {
            Some(cwd) if cwd.is_absolute() => cwd.clone(),
            Some(cwd) => self.base_dir.join(cwd),
            None => self.base_dir.clone(),
        }
    }

    /// Digest of the gates active in `mode`; identical tables give identical digests.
    pub fn digest(&self, mode: Mode) -> String {
        let active: Vec<Value> = self
            .for_mode(mode)
            .iter()
            .map(|g| g.spec.to_json())
            .collect();
        canonical_json_digest(&Value::Array(active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
version: '1'
gates:
  - name: schema
    command: [python3, scripts/check_schema.py]
    timeout_secs: 30
  - name: crossref
    command: [python3, scripts/check_contract_crossrefs.py]
    modes: [quick]
  - name: acceptance
    command: [cargo, test]
    modes: [full]
    cwd: rust
    shard:
      list_command: [cargo, test, --, --list]
      worker_command: [cargo, test, --, --exact, '{ids}']
";

    #[test]
    fn mode_filter_preserves_declared_indices() {
        let table = GateTable::from_yaml_str(SAMPLE, Path::new("/repo")).expect("table");
        let quick: Vec<(usize, &str)> = table
            .for_mode(Mode::Quick)
            .iter()
            .map(|g| (g.index, g.spec.name.as_str()))
            .collect();
        assert_eq!(quick, vec![(0, "schema"), (1, "crossref")]);
        let full: Vec<(usize, &str)> = table
            .for_mode(Mode::Full)
            .iter()
            .map(|g| (g.index, g.spec.name.as_str()))
            .collect();
        assert_eq!(full, vec![(0, "schema"), (2, "acceptance")]);
    }

    #[test]
    fn defaults_apply_to_omitted_fields() {
        let table = GateTable::from_yaml_str(SAMPLE, Path::new("/repo")).expect("table");
        let crossref = table.get("crossref").expect("gate").spec;
        assert_eq!(crossref.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        let schema = table.get("schema").expect("gate").spec;
        assert_eq!(schema.timeout, Duration::from_secs(30));
        assert!(schema.runs_in(Mode::Quick) && schema.runs_in(Mode::Full));
        assert_eq!(table.resolve_cwd(schema), PathBuf::from("/repo"));
        let acceptance = table.get("acceptance").expect("gate").spec;
        assert_eq!(table.resolve_cwd(acceptance), PathBuf::from("/repo/rust"));
        assert!(acceptance.shard.is_some());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let raw = "\
version: '1'
gates:
  - name: lint
    command: [echo, one]
  - name: lint
    command: [echo, two]
";
        let err = GateTable::from_yaml_str(raw, Path::new(".")).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate gate name 'lint'"), "{}", err);
    }

    #[test]
    fn invalid_entries_are_config_errors() {
        let cases = [
            "version: '1'\ngates:\n  - name: a\n    command: []\n",
            "version: '1'\ngates:\n  - name: a\n    command: [x]\n    timeout_secs: 0\n",
            "version: '1'\ngates:\n  - name: a\n    command: [x]\n    modes: []\n",
            "version: '1'\ngates:\n  - name: a/b\n    command: [x]\n",
            "version: '1'\ngates:\n  - name: a\n    command: [x]\n    retries: 3\n",
            "version: '2'\ngates: []\n",
            "version: '1'\ngates:\n  - name: a\n    command: [x]\n    shard:\n      list_command: []\n      worker_command: [y]\n",
        ];
        for raw in cases {
            match GateTable::from_yaml_str(raw, Path::new(".")) {
                Err(VerifyError::Config { .. }) => {}
                other => panic!("expected config error for {:?}, got {:?}", raw, other),
            }
        }
    }

    #[test]
    fn digest_is_stable_and_mode_scoped() {
        let a = GateTable::from_yaml_str(SAMPLE, Path::new("/repo")).expect("table");
        let b = GateTable::from_yaml_str(SAMPLE, Path::new("/elsewhere")).expect("table");
        assert_eq!(a.digest(Mode::Quick), b.digest(Mode::Quick));
        assert_ne!(a.digest(Mode::Quick), a.digest(Mode::Full));
    }
}
