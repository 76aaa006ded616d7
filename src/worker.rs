//! One logical transaction of a scenario execution.
//!
//! A worker owns exactly one session for its whole life and is never reused:
//! every scenario execution at every level gets fresh workers, so no
//! session-level state leaks between runs.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::errors::Result;
use crate::interleave::{Clock, Handshake, pause, timed};
use crate::isolation::IsolationLevel;
use crate::observation::{Action, Observation, Probe, ProbeValue, Terminal};
use crate::scenario::{Role, Step};
use crate::session::{CancelSlot, Outcome, SessionGuard, SessionProvider, Statement};

/// Text of the row the phantom-read writer inserts.
const PHANTOM_TEXT: &str = "Phantom";

pub struct Worker {
    role: &'static Role,
    level: IsolationLevel,
    provider: SessionProvider,
    config: Arc<ProbeConfig>,
    handshake: Handshake,
    slot: CancelSlot,
    clock: Clock,
    cue_timeout: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: &'static Role,
        level: IsolationLevel,
        provider: SessionProvider,
        config: Arc<ProbeConfig>,
        handshake: Handshake,
        slot: CancelSlot,
        clock: Clock,
        cue_timeout: Duration,
    ) -> Self {
        Self {
            role,
            level,
            provider,
            config,
            handshake,
            slot,
            clock,
            cue_timeout,
        }
    }

    /// Runs the role's script to completion. Never fails: every error ends
    /// up as the observation's terminal state.
    pub fn run(self) -> Observation {
        let mut obs = Observation::new(self.role.label, self.level);
        let started = self.clock.since_start();
        let guard = match self.provider.open(self.level) {
            Ok(guard) => guard,
            Err(err) => {
                warn!("[{}] could not open session: {err}", self.role.label);
                let waited = self.clock.since_start().saturating_sub(started);
                obs.record_failure(Action::Connect, &err, waited);
                obs.ended_at = self.clock.since_start();
                return obs;
            }
        };
        if !self.slot.arm(guard.canceller()) {
            obs.ended_at = self.clock.since_start();
            return obs;
        }
        let mut guard = Some(guard);

        for step in self.role.steps {
            if !self.step(*step, &mut guard, &mut obs) {
                break;
            }
        }

        self.slot.disarm();
        if self.slot.is_cancelled() && !obs.is_complete() {
            obs.terminal = Terminal::TimedOut;
        } else if guard.is_some() && obs.failure().is_none() {
            // Script ended without a commit; dropping the guard rolls back.
            obs.terminal = Terminal::RolledBack;
        }
        drop(guard);
        obs.ended_at = self.clock.since_start();
        debug!("[{}] finished: {:?}", self.role.label, obs.terminal);
        obs
    }

    /// Executes one step. Returns `false` when the script must stop.
    fn step(&self, step: Step, guard: &mut Option<SessionGuard>, obs: &mut Observation) -> bool {
        let fixture = &self.config.fixture;
        match step {
            Step::Pause(delay) => {
                let completed = pause(delay.resolve(&self.config.timing), &self.slot);
                if !completed {
                    warn!("[{}] cancelled during {:?}", self.role.label, delay);
                }
                completed
            }
            Step::Signal => {
                self.handshake.signal();
                true
            }
            Step::AwaitCue => {
                if self.handshake.enabled()
                    && !self.handshake.await_cue(self.cue_timeout, &self.slot)
                {
                    if self.slot.is_cancelled() {
                        return false;
                    }
                    warn!(
                        "[{}] no cue from peer, continuing on delays alone",
                        self.role.label
                    );
                }
                true
            }
            Step::Read => self.probe(
                guard,
                obs,
                Action::Read,
                Statement::ReadText {
                    key: fixture.test_key.clone(),
                },
            ),
            Step::Count => self.probe(
                guard,
                obs,
                Action::Count,
                Statement::CountMarked {
                    marker: fixture.phantom_marker.clone(),
                },
            ),
            Step::Update(value) => self.probe(
                guard,
                obs,
                Action::Update,
                Statement::UpdateText {
                    key: fixture.test_key.clone(),
                    value: value.resolve(fixture).to_string(),
                },
            ),
            Step::Insert => self.probe(
                guard,
                obs,
                Action::Insert,
                Statement::InsertRow {
                    key: fixture.phantom_key.clone(),
                    text: PHANTOM_TEXT.to_string(),
                    marker: fixture.phantom_marker.clone(),
                },
            ),
            Step::Commit => self.finish(guard, obs, Action::Commit, SessionGuard::commit),
            Step::Rollback => self.finish(guard, obs, Action::Rollback, SessionGuard::rollback),
        }
    }

    fn probe(
        &self,
        guard: &mut Option<SessionGuard>,
        obs: &mut Observation,
        action: Action,
        statement: Statement,
    ) -> bool {
        let Some(session) = guard.as_mut() else {
            return false;
        };
        let at = self.clock.since_start();
        let (result, took) = timed(|| session.execute(&statement));
        match result {
            Ok(outcome) => {
                let value = match outcome {
                    Outcome::Text(text) => ProbeValue::Text(text),
                    Outcome::Count(n) => ProbeValue::Count(n),
                    Outcome::Affected(n) => ProbeValue::Affected(n),
                };
                let nth = obs.probes_of(action).count() + 1;
                info!(
                    "[{}] {} {}: {} ({} ms)",
                    self.role.label,
                    ordinal(nth),
                    statement.verb(),
                    describe(&value),
                    took.as_millis()
                );
                obs.probes.push(Probe {
                    action,
                    at,
                    took,
                    value,
                });
                true
            }
            Err(err) => {
                info!(
                    "[{}] {} failed after {} ms: {err}",
                    self.role.label,
                    statement.verb(),
                    took.as_millis()
                );
                obs.record_failure(action, &err, took);
                false
            }
        }
    }

    fn finish(
        &self,
        guard: &mut Option<SessionGuard>,
        obs: &mut Observation,
        action: Action,
        end: fn(SessionGuard) -> Result<()>,
    ) -> bool {
        let Some(session) = guard.take() else {
            return false;
        };
        let (result, took) = timed(|| end(session));
        match result {
            Ok(()) => {
                let (terminal, verb) = if action == Action::Commit {
                    (Terminal::Committed, "committed")
                } else {
                    (Terminal::RolledBack, "rolled back")
                };
                obs.terminal = terminal;
                info!("[{}] {verb} ({} ms)", self.role.label, took.as_millis());
            }
            Err(err) => {
                info!("[{}] {:?} failed: {err}", self.role.label, action);
                obs.record_failure(action, &err, took);
            }
        }
        false
    }
}

fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (1, 11) | (2, 12) | (3, 13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

fn describe(value: &ProbeValue) -> String {
    match value {
        ProbeValue::Text(Some(text)) => format!("'{text}'"),
        ProbeValue::Text(None) => "no row".to_string(),
        ProbeValue::Count(n) => format!("{n} row(s)"),
        ProbeValue::Affected(n) => format!("{n} row(s) affected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals() {
        let got: Vec<_> = [1, 2, 3, 4, 11, 12, 13, 21, 22, 101].map(ordinal).to_vec();
        assert_eq!(
            got,
            ["1st", "2nd", "3rd", "4th", "11th", "12th", "13th", "21st", "22nd", "101st"]
        );
    }

    #[test]
    fn describes_values() {
        assert_eq!(describe(&ProbeValue::Text(Some("x".into()))), "'x'");
        assert_eq!(describe(&ProbeValue::Text(None)), "no row");
        assert_eq!(describe(&ProbeValue::Count(2)), "2 row(s)");
    }
}
