//! Sequences the scenario matrix: levels outermost, then the catalog.
//!
//! For every (level, scenario) pair the runner resets the fixtures, starts
//! one worker per role on its own thread, and collects their observations
//! over a channel with a deadline. A worker that overruns is cancelled and
//! recorded as timed out; nothing a worker or the fixture does can stop the
//! matrix.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, RecvTimeoutError};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::ProbeConfig;
use crate::errors::ProbeError;
use crate::fixture::FixtureController;
use crate::interleave::{Clock, Handshake};
use crate::isolation::IsolationLevel;
use crate::observation::{Action, Observation};
use crate::report::{MatrixReport, Round};
use crate::scenario::{Expectation, Scenario, ScenarioKind};
use crate::session::{CancelSlot, SessionFactory, SessionProvider};
use crate::verdict::{Judge, Judgement, Verdict};
use crate::worker::Worker;

/// Result of one scenario execution at one level.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub round: usize,
    pub level: IsolationLevel,
    pub scenario: ScenarioKind,
    pub expectation: Expectation,
    pub verdict: Verdict,
    pub reason: String,
    pub fixture_error: Option<String>,
    /// One per role, leader first. Empty when the fixture failed.
    pub observations: Vec<Observation>,
    #[serde(rename = "elapsed_ms", serialize_with = "crate::observation::millis")]
    pub elapsed: Duration,
}

impl ScenarioOutcome {
    /// The verdict disagrees with the documented expectation.
    pub fn mismatch(&self) -> bool {
        self.verdict.contradicts(self.expectation)
    }
}

pub struct Runner {
    config: Arc<ProbeConfig>,
    provider: SessionProvider,
    fixture: FixtureController,
}

impl Runner {
    pub fn new(config: Arc<ProbeConfig>, factory: Arc<dyn SessionFactory>) -> Self {
        let provider = SessionProvider::new(factory);
        let fixture = FixtureController::new(provider.clone(), &config);
        Self {
            config,
            provider,
            fixture,
        }
    }

    /// Selected levels, weakest first.
    pub fn levels(&self) -> Vec<IsolationLevel> {
        let mut levels = self.config.levels.clone();
        levels.sort();
        levels.dedup();
        levels
    }

    /// Selected scenarios, in catalog order.
    pub fn scenarios(&self) -> Vec<&'static Scenario> {
        Scenario::catalog()
            .into_iter()
            .filter(|scenario| self.config.scenarios.contains(&scenario.kind))
            .collect()
    }

    /// Runs the whole matrix `runner.rounds` times.
    pub fn run(&self) -> MatrixReport {
        let rounds = (1..=self.config.runner.rounds.max(1))
            .map(|round| self.run_round(round))
            .collect();
        MatrixReport::new(self.provider.target(), rounds)
    }

    pub fn run_round(&self, round: usize) -> Round {
        info!("round {round} against {}", self.provider.target());
        let mut outcomes = Vec::new();
        for level in self.levels() {
            info!("=== {level} ===");
            for scenario in self.scenarios() {
                outcomes.push(self.run_scenario(round, level, scenario));
            }
        }
        Round {
            index: round,
            outcomes,
        }
    }

    pub fn run_scenario(
        &self,
        round: usize,
        level: IsolationLevel,
        scenario: &'static Scenario,
    ) -> ScenarioOutcome {
        let started = Instant::now();
        info!("--- {} at {} ---", scenario.name, level.slug());
        let expectation = scenario.expectation(level);

        let (judgement, observations, fixture_error) = match self.fixture.reset(scenario.kind) {
            Err(err) => {
                warn!("{} at {} skipped: {err}", scenario.name, level.slug());
                (Judgement::inconclusive(err.to_string()), Vec::new(), Some(err.to_string()))
            }
            Ok(()) => {
                let observations = self.execute(level, scenario);
                let config = &self.config;
                let judgement = Judge::new(&config.timing, &config.thresholds, &config.fixture)
                    .judge(scenario.kind, &observations);
                (judgement, observations, None)
            }
        };

        let outcome = ScenarioOutcome {
            round,
            level,
            scenario: scenario.kind,
            expectation,
            verdict: judgement.verdict,
            reason: judgement.reason,
            fixture_error,
            observations,
            elapsed: started.elapsed(),
        };
        if outcome.mismatch() {
            warn!(
                "{} at {}: {} ({}), documented: {}",
                scenario.name,
                level.slug(),
                outcome.verdict,
                outcome.reason,
                expectation
            );
        } else {
            info!(
                "{} at {}: {} ({})",
                scenario.name,
                level.slug(),
                outcome.verdict,
                outcome.reason
            );
        }
        outcome
    }

    /// Runs every role concurrently and returns their observations, leader
    /// first. Always returns one observation per role.
    fn execute(&self, level: IsolationLevel, scenario: &'static Scenario) -> Vec<Observation> {
        let timing = &self.config.timing;
        let budget = scenario.budget(timing, self.config.target.lock_wait_timeout());
        let allowed = budget + self.config.runner.safety_margin();
        let deadline = Instant::now() + allowed;
        let clock = Clock::start();
        let workers = scenario.roles.len();
        let cues = Handshake::group(timing.handshake, workers);
        let (tx, rx) = channel::bounded::<(usize, Observation)>(workers);

        let mut results: Vec<Option<Observation>> = vec![None; workers];
        let mut slots = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for (index, (role, cue)) in scenario.roles.iter().zip(cues).enumerate() {
            let slot = CancelSlot::new();
            let worker = Worker::new(
                role,
                level,
                self.provider.clone(),
                Arc::clone(&self.config),
                cue,
                slot.clone(),
                clock,
                budget,
            );
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", scenario.kind, index))
                .spawn(move || {
                    let observation = worker.run();
                    // The runner may have stopped listening after its grace.
                    let _ = tx.send((index, observation));
                });
            match spawned {
                Ok(handle) => handles.push((index, handle)),
                Err(err) => {
                    warn!("could not start {}: {err}", role.label);
                    let mut obs = Observation::new(role.label, level);
                    obs.record_failure(Action::Connect, &ProbeError::Io(err), Duration::ZERO);
                    results[index] = Some(obs);
                }
            }
            slots.push(slot);
        }
        drop(tx);

        let mut pending = handles.len();
        let mut overran = false;
        while pending > 0 {
            match rx.recv_deadline(deadline) {
                Ok((index, obs)) => {
                    results[index] = Some(obs);
                    pending -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    overran = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if overran {
            warn!(
                "{} at {} overran its {} ms budget, cancelling workers",
                scenario.name,
                level.slug(),
                allowed.as_millis()
            );
            for slot in &slots {
                slot.cancel();
            }
            let grace = Instant::now() + self.config.runner.grace();
            while pending > 0 {
                match rx.recv_deadline(grace) {
                    Ok((index, obs)) => {
                        results[index] = Some(obs);
                        pending -= 1;
                    }
                    Err(_) => break,
                }
            }
        }

        for (index, handle) in handles {
            if results[index].is_some() {
                if handle.join().is_err() {
                    warn!("worker thread {index} panicked after reporting");
                }
            } else {
                debug!("abandoning worker thread {index}");
            }
        }

        let ended = clock.since_start();
        results
            .into_iter()
            .zip(scenario.roles)
            .map(|(result, role)| {
                result.unwrap_or_else(|| {
                    let err = ProbeError::Timeout(format!(
                        "{} did not report within {} ms",
                        role.label,
                        allowed.as_millis()
                    ));
                    Observation::timed_out(role.label, level, ended, &err)
                })
            })
            .collect()
    }
}
