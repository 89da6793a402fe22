use std::thread;

use vgate_core::{JobResult, Result, RunArtifacts, RunVerdict};

use crate::console::Console;
use crate::job::{print_failure_excerpt, run_job, ExecutionContext};
use crate::table::{GateTable, IndexedGate};

/// Consecutive gates that run concurrently.
#[derive(Debug, Clone)]
pub struct Wave<'a> {
    pub index: usize,
    pub gates: Vec<IndexedGate<'a>>,
}

/// Splits `gates` into consecutive waves of at most `cap` gates, keeping
/// declared order. A cap of 0 is treated as 1.
pub fn partition_waves<'a>(gates: &[IndexedGate<'a>], cap: usize) -> Vec<Wave<'a>> {
    gates
        .chunks(cap.max(1))
        .enumerate()
        .map(|(index, chunk)| Wave {
            index,
            gates: chunk.to_vec(),
        })
        .collect()
}

#[derive(Debug)]
pub struct WaveOutcome<'a> {
    pub verdict: RunVerdict,
    /// Results of every launched gate, in declared order.
    pub results: Vec<JobResult>,
    /// All planned waves, including any never launched.
    pub waves: Vec<Wave<'a>>,
    pub waves_launched: usize,
}

impl WaveOutcome<'_> {
    pub fn result(&self, gate: &str) -> Option<&JobResult> {
        self.results.iter().find(|r| r.name == gate)
    }
}

pub struct WaveScheduler<'a> {
    table: &'a GateTable,
    artifacts: &'a RunArtifacts,
    console: Console,
    cap: usize,
    keep_going: bool,
    shard_workers: Option<usize>,
}

impl<'a> WaveScheduler<'a> {
    pub fn new(
        table: &'a GateTable,
        artifacts: &'a RunArtifacts,
        console: Console,
        cap: usize,
    ) -> Self {
        Self {
            table,
            artifacts,
            console,
            cap: cap.max(1),
            keep_going: false,
            shard_workers: None,
        }
    }

    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn shard_workers(mut self, workers: Option<usize>) -> Self {
        self.shard_workers = workers;
        self
    }

    /// Runs `gates` wave by wave. The first failing wave decides the verdict;
    /// later waves are launched only with `keep_going`.
    pub fn run(&self, gates: &[IndexedGate<'a>]) -> Result<WaveOutcome<'a>> {
        let waves = partition_waves(gates, self.cap);
        let mut verdict = RunVerdict::pass();
        let mut results = Vec::with_capacity(gates.len());
        let mut waves_launched = 0;

        for wave in &waves {
            if !verdict.passed() && !self.keep_going {
                tracing::info!(wave = wave.index, "skipping wave after failure");
                continue;
            }
            waves_launched += 1;
            self.console.wave_started(wave, waves.len());
            tracing::info!(wave = wave.index, gates = wave.gates.len(), "wave started");

            let wave_results = self.run_wave(wave)?;
            for result in &wave_results {
                self.console.gate_finished(result);
            }
            results.extend(wave_results);

            let candidate = self.first_failure(wave)?;
            tracing::info!(
                wave = wave.index,
                failed = ?candidate.map(|(g, _)| &g.spec.name),
                "wave finished"
            );
            if let Some((gate, code)) = candidate {
                if verdict.passed() {
                    print_failure_excerpt(self.artifacts, &gate.spec.name, code)?;
                    self.artifacts.write_first_failure(&gate.spec.name)?;
                    verdict = RunVerdict::fail(&gate.spec.name, gate.index);
                }
            }
        }

        Ok(WaveOutcome {
            verdict,
            results,
            waves,
            waves_launched,
        })
    }

    fn run_wave(&self, wave: &Wave<'a>) -> Result<Vec<JobResult>> {
        let ctx = ExecutionContext::wave_child().with_shard_workers(self.shard_workers);
        let joined: Vec<Result<JobResult>> = thread::scope(|scope| {
            let handles: Vec<_> = wave
                .gates
                .iter()
                .map(|&gate| {
                    let ctx = &ctx;
                    scope.spawn(move || run_job(self.table, gate, self.artifacts, ctx))
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
        joined.into_iter().collect()
    }

    /// Re-reads each gate's `.rc` in declared order; the first nonzero code wins
    /// regardless of which gate finished first.
    fn first_failure(&self, wave: &Wave<'a>) -> Result<Option<(IndexedGate<'a>, i32)>> {
        for gate in &wave.gates {
            let code = self.artifacts.read_exit_code(&gate.spec.name)?;
            if code != 0 {
                return Ok(Some((*gate, code)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Verbosity;
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;
    use std::time::Duration;
    use vgate_core::{ensure_dir, GateSpec, Mode};

    fn gate(name: &str, script: &str) -> GateSpec {
        GateSpec {
            name: name.to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            cwd: None,
            timeout: Duration::from_secs(20),
            mode_tags: BTreeSet::from([Mode::Quick, Mode::Full]),
            expected_outputs: Vec::new(),
            env: BTreeMap::new(),
            shard: None,
        }
    }

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "vgate_wave_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    fn names<'a>(wave: &Wave<'a>) -> Vec<&'a str> {
        wave.gates.iter().map(|g| g.spec.name.as_str()).collect()
    }

    #[test]
    fn waves_are_consecutive_chunks() {
        let specs: Vec<GateSpec> = (0..9).map(|i| gate(&format!("g{}", i), "true")).collect();
        let table = GateTable::new(&std::env::temp_dir(), specs).expect("table");
        let gates = table.for_mode(Mode::Quick);
        let waves = partition_waves(&gates, 4);
        assert_eq!(
            waves.iter().map(|w| w.gates.len()).collect::<Vec<_>>(),
            vec![4, 4, 1]
        );
        assert_eq!(names(&waves[1]), vec!["g4", "g5", "g6", "g7"]);
        assert_eq!(waves[2].index, 2);
        assert_eq!(partition_waves(&gates, 0).len(), 9);
        assert!(partition_waves(&gates[..0], 4).is_empty());
    }

    #[test]
    fn lower_index_failure_wins_even_when_it_finishes_last() {
        let root = temp_root("order");
        let table = GateTable::new(
            &root,
            vec![
                gate("ok", "true"),
                gate("slow_fail", "sleep 1; exit 3"),
                gate("fast_fail", "exit 5"),
            ],
        )
        .expect("table");
        let artifacts = RunArtifacts::create(&root.join("runs"), "run_w").expect("artifacts");
        let scheduler = WaveScheduler::new(&table, &artifacts, Console::new(Verbosity::Quiet), 4);
        let outcome = scheduler.run(&table.for_mode(Mode::Quick)).expect("run");
        assert_eq!(outcome.verdict, RunVerdict::fail("slow_fail", 1));
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(
            artifacts.read_first_failure().expect("marker"),
            Some("slow_fail".to_string())
        );
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn failing_wave_stops_later_waves_unless_keep_going() {
        let root = temp_root("short");
        let specs = vec![gate("a", "exit 1"), gate("b", "true"), gate("c", "exit 2")];
        let table = GateTable::new(&root, specs).expect("table");
        let gates = table.for_mode(Mode::Quick);

        let artifacts = RunArtifacts::create(&root.join("runs"), "stop").expect("artifacts");
        let outcome = WaveScheduler::new(&table, &artifacts, Console::new(Verbosity::Quiet), 1)
            .run(&gates)
            .expect("run");
        assert_eq!(outcome.waves_launched, 1);
        assert_eq!(outcome.waves.len(), 3);
        assert_eq!(outcome.results.len(), 1);
        assert!(!artifacts.rc_path("b").exists());

        let artifacts = RunArtifacts::create(&root.join("runs"), "go").expect("artifacts");
        let outcome = WaveScheduler::new(&table, &artifacts, Console::new(Verbosity::Quiet), 1)
            .keep_going(true)
            .run(&gates)
            .expect("run");
        assert_eq!(outcome.waves_launched, 3);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.verdict, RunVerdict::fail("a", 0));
        assert_eq!(outcome.result("c").map(|r| r.exit_code), Some(2));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn all_passing_gates_give_a_pass_verdict() {
        let root = temp_root("pass");
        let specs = vec![gate("a", "true"), gate("b", "echo b")];
        let table = GateTable::new(&root, specs).expect("table");
        let artifacts = RunArtifacts::create(&root.join("runs"), "run_p").expect("artifacts");
        let outcome = WaveScheduler::new(&table, &artifacts, Console::new(Verbosity::Quiet), 4)
            .run(&table.for_mode(Mode::Full))
            .expect("run");
        assert!(outcome.verdict.passed());
        assert_eq!(artifacts.read_first_failure().expect("marker"), None);
        let _ = std::fs::remove_dir_all(root);
    }
}
