use vgate_core::{JobResult, Mode, RunVerdict};

use crate::config::Verbosity;
use crate::timing::{render_timing_table, GateTiming};
use crate::wave::Wave;

/// Human-facing run reporting on stdout. Quiet mode keeps only the run id and
/// the final verdict line; silent mode prints nothing.
#[derive(Debug, Clone, Copy)]
pub struct Console {
    verbose: bool,
    silent: bool,
}

impl Console {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbose: verbosity.is_verbose(),
            silent: verbosity == Verbosity::Silent,
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn run_id(&self, run_id: &str) {
        if !self.silent {
            println!("verify_run_id={}", run_id);
        }
    }

    pub fn run_started(&self, run_id: &str, mode: Mode, gates: usize, waves: usize, cap: usize) {
        self.run_id(run_id);
        if self.verbose {
            println!(
                "verify {}: {} gates in {} waves (cap {})",
                mode, gates, waves, cap
            );
        }
    }

    pub fn wave_started(&self, wave: &Wave<'_>, total: usize) {
        if !self.verbose {
            return;
        }
        let names: Vec<&str> = wave.gates.iter().map(|g| g.spec.name.as_str()).collect();
        println!("wave {}/{}: {}", wave.index + 1, total, names.join(", "));
    }

    pub fn gate_finished(&self, result: &JobResult) {
        if !self.verbose {
            return;
        }
        println!(
            "  {:<9} {} ({:.1}s)",
            result.status().as_str(),
            result.name,
            result.elapsed.as_secs_f64()
        );
    }

    pub fn timings(&self, timings: &[GateTiming]) {
        if self.verbose && !timings.is_empty() {
            print!("{}", render_timing_table(timings));
        }
    }

    pub fn verdict(&self, mode: Mode, verdict: &RunVerdict, exit_code: Option<i32>) {
        if self.silent {
            return;
        }
        match (&verdict.failing_gate, exit_code) {
            (Some(gate), Some(code)) => {
                println!("verify {} FAIL: first failing gate {} (rc={})", mode, gate, code)
            }
            (Some(gate), None) => println!("verify {} FAIL: first failing gate {}", mode, gate),
            (None, _) => println!("verify {} PASS", mode),
        }
    }
}
