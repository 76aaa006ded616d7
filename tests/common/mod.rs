//! Common utilities for isoprobe integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use isoprobe::backend::memory::{MemoryEngine, MemoryFactory};
use isoprobe::config::{RunnerConfig, TimingConfig};
use isoprobe::{IsolationLevel, MatrixReport, ProbeConfig, Runner, ScenarioKind, SessionFactory};

/// Timing short enough for tests but with windows wide enough that thread
/// start-up jitter stays well inside the verdict thresholds.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        stagger_ms: 20,
        writer_offset_ms: 60,
        dwell_ms: 300,
        contender_offset_ms: 60,
        hold_ms: 400,
        handshake: false,
    }
}

/// Default configuration with [`fast_timing`] and tight runner bounds.
pub fn fast_config() -> ProbeConfig {
    let mut config = ProbeConfig {
        timing: fast_timing(),
        runner: RunnerConfig {
            safety_margin_ms: 1_000,
            grace_ms: 500,
            rounds: 1,
        },
        ..ProbeConfig::default()
    };
    config.target.lock_wait_timeout_ms = 2_000;
    config
}

/// A fresh reference engine and a factory connected to it.
pub fn memory_target(config: &ProbeConfig) -> (Arc<MemoryEngine>, Arc<dyn SessionFactory>) {
    let engine = Arc::new(MemoryEngine::new(config.target.lock_wait_timeout()));
    let factory = MemoryFactory::new(Arc::clone(&engine), "memory");
    (engine, Arc::new(factory))
}

/// Runs the configured matrix against a fresh reference engine.
pub fn run_on_memory(config: ProbeConfig) -> (MatrixReport, Arc<MemoryEngine>) {
    config.validate().expect("test config must be valid");
    let (engine, factory) = memory_target(&config);
    let report = Runner::new(Arc::new(config), factory).run();
    (report, engine)
}

/// Prints a report the way the binary does, for `--nocapture` runs.
pub fn dump(report: &MatrixReport) {
    println!("{report}");
}

pub fn only(levels: &[IsolationLevel], scenarios: &[ScenarioKind]) -> ProbeConfig {
    ProbeConfig {
        levels: levels.to_vec(),
        scenarios: scenarios.to_vec(),
        ..fast_config()
    }
}
