//! Turns the observations of a scenario execution into a verdict.
//!
//! Everything here is a pure function of the observations and the tunable
//! thresholds. Timing-based checks (the blocked/unblocked split of
//! contended statements, the minimum dwell window) are heuristics: under heavy load
//! they can misclassify, and the thresholds exist so that can be tuned
//! rather than hard-coded.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{FixtureConfig, TimingConfig, VerdictThresholds};
use crate::errors::ErrorKind;
use crate::observation::{Action, Observation, Terminal};
use crate::scenario::{Expectation, ScenarioKind};

/// Members of the phantom set the fixture seeds before phantom-read.
const SEEDED_PHANTOMS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    AnomalyObserved,
    AnomalyAbsent,
    Inconclusive,
}

impl Verdict {
    /// Whether this verdict contradicts the documented expectation.
    /// Inconclusive runs contradict nothing.
    pub fn contradicts(self, expectation: Expectation) -> bool {
        matches!(
            (self, expectation),
            (Verdict::AnomalyObserved, Expectation::NoAnomaly)
                | (Verdict::AnomalyAbsent, Expectation::Anomaly)
        )
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::AnomalyObserved => "anomaly observed",
            Verdict::AnomalyAbsent => "anomaly absent",
            Verdict::Inconclusive => "inconclusive",
        })
    }
}

/// A verdict and the evidence behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Judgement {
    pub verdict: Verdict,
    pub reason: String,
}

impl Judgement {
    fn observed(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::AnomalyObserved,
            reason: reason.into(),
        }
    }

    fn absent(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::AnomalyAbsent,
            reason: reason.into(),
        }
    }

    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Inconclusive,
            reason: reason.into(),
        }
    }
}

pub struct Judge<'a> {
    timing: &'a TimingConfig,
    thresholds: &'a VerdictThresholds,
    fixture: &'a FixtureConfig,
}

impl<'a> Judge<'a> {
    pub fn new(
        timing: &'a TimingConfig,
        thresholds: &'a VerdictThresholds,
        fixture: &'a FixtureConfig,
    ) -> Self {
        Self {
            timing,
            thresholds,
            fixture,
        }
    }

    /// `observations` holds one entry per role of the scenario, leader
    /// first.
    pub fn judge(&self, kind: ScenarioKind, observations: &[Observation]) -> Judgement {
        let roles = kind.scenario().roles.len();
        if observations.len() != roles {
            return Judgement::inconclusive(format!(
                "expected {roles} observations, got {}",
                observations.len()
            ));
        }
        match (kind, observations) {
            (ScenarioKind::ReadRead, [a, b]) => self.read_read(a, b),
            (ScenarioKind::ReadWrite, [reader, writer]) => self.read_write(reader, writer),
            (ScenarioKind::WriteWrite, [holder, contender]) => self.write_write(holder, contender),
            (ScenarioKind::PhantomRead, [reader, writer]) => self.phantom_read(reader, writer),
            (ScenarioKind::DirtyRead, [writer, reader]) => self.dirty_read(writer, reader),
            (ScenarioKind::WriteQueue, [holder, first, second]) => {
                self.write_queue(holder, first, second)
            }
            (ScenarioKind::ReadQueue, [writer, first, second]) => {
                self.read_queue(writer, first, second)
            }
            _ => Judgement::inconclusive(format!("no rule for {roles} observations")),
        }
    }

    fn read_read(&self, a: &Observation, b: &Observation) -> Judgement {
        if let Some(j) = incomplete(a).or_else(|| incomplete(b)) {
            return j;
        }
        let slowest = a
            .probes_of(Action::Read)
            .chain(b.probes_of(Action::Read))
            .map(|probe| probe.took)
            .max();
        match slowest {
            None => Judgement::inconclusive("no read was recorded"),
            Some(took) if took >= self.thresholds.slow_read() => {
                Judgement::observed(format!("a plain read took {} ms", took.as_millis()))
            }
            Some(took) => Judgement::absent(format!(
                "both reads returned, slowest in {} ms",
                took.as_millis()
            )),
        }
    }

    fn read_write(&self, reader: &Observation, writer: &Observation) -> Judgement {
        if let Some(j) = incomplete(reader).or_else(|| incomplete(writer)) {
            return j;
        }
        if let Some(j) = self.short_window(reader, Action::Read) {
            return j;
        }
        match reader.texts().as_slice() {
            [first, second] if first == second => Judgement::absent(format!(
                "both reads returned {}",
                show(*first)
            )),
            [first, second] => Judgement::observed(format!(
                "1st read {}, 2nd read {}",
                show(*first),
                show(*second)
            )),
            other => Judgement::inconclusive(format!("expected 2 reads, got {}", other.len())),
        }
    }

    fn write_write(&self, holder: &Observation, contender: &Observation) -> Judgement {
        if let Some(j) = incomplete(holder) {
            return j;
        }
        let expected = self.timing.expected_block();
        let blocked_at = expected.mul_f64(self.thresholds.blocked_fraction);
        let unblocked_at = expected.mul_f64(self.thresholds.unblocked_fraction);

        let waited = match self.contended(contender, Action::Update, blocked_at) {
            Ok(Wait::Granted { took, .. }) => took,
            Ok(Wait::Rejected { waited, message }) => {
                return Judgement::absent(format!(
                    "contender waited {} ms and was rejected: {message}",
                    waited.as_millis()
                ));
            }
            Err(j) => return j,
        };
        if let Some(j) = self.short_hold(holder) {
            return j;
        }

        if waited >= blocked_at {
            Judgement::absent(format!(
                "contender blocked for {} ms (threshold {} ms)",
                waited.as_millis(),
                blocked_at.as_millis()
            ))
        } else if waited <= unblocked_at {
            Judgement::observed(format!(
                "contender returned in {} ms while the holder was uncommitted",
                waited.as_millis()
            ))
        } else {
            Judgement::inconclusive(format!(
                "contender waited {} ms, between {} and {} ms",
                waited.as_millis(),
                unblocked_at.as_millis(),
                blocked_at.as_millis()
            ))
        }
    }

    fn phantom_read(&self, reader: &Observation, writer: &Observation) -> Judgement {
        if let Some(j) = incomplete(reader) {
            return j;
        }
        let rejected = match writer.failure() {
            Some(failure)
                if failure.during == Action::Insert && failure.kind == ErrorKind::Statement =>
            {
                Some(failure.message.as_str())
            }
            _ => None,
        };
        if rejected.is_none() {
            if let Some(j) = incomplete(writer) {
                return j;
            }
        }
        if let Some(j) = self.short_window(reader, Action::Count) {
            return j;
        }
        match (reader.counts().as_slice(), rejected) {
            ([first, ..], _) if *first != SEEDED_PHANTOMS => Judgement::inconclusive(format!(
                "1st count {first}, expected {SEEDED_PHANTOMS} seeded row"
            )),
            ([first, second], Some(message)) if first == second => {
                Judgement::absent(format!("insert rejected: {message}"))
            }
            ([first, second], _) if first == second => {
                Judgement::absent(format!("both counts returned {first}"))
            }
            ([first, second], _) => {
                Judgement::observed(format!("1st count {first}, 2nd count {second}"))
            }
            (other, _) => {
                Judgement::inconclusive(format!("expected 2 counts, got {}", other.len()))
            }
        }
    }

    fn dirty_read(&self, writer: &Observation, reader: &Observation) -> Judgement {
        if let Some(j) = incomplete(writer).or_else(|| incomplete(reader)) {
            return j;
        }
        let (Some(update), Some(read)) = (
            writer.probes_of(Action::Update).next(),
            reader.probes_of(Action::Read).next(),
        ) else {
            return Judgement::inconclusive("missing update or read");
        };
        if read.at < update.ended_at() {
            return Judgement::inconclusive("read started before the dirty write completed");
        }
        let dirty = self.fixture.dirty_value.as_str();
        match reader.texts().first().copied().flatten() {
            Some(text) if text == dirty => Judgement::observed(format!(
                "reader saw uncommitted '{text}' after {} ms",
                read.took.as_millis()
            )),
            seen => Judgement::absent(format!(
                "reader saw {} after {} ms",
                show(seen),
                read.took.as_millis()
            )),
        }
    }

    /// Two writers queue behind the holder. Prevention means both waited
    /// for the holder and the later one was served after the earlier one.
    fn write_queue(&self, holder: &Observation, b: &Observation, c: &Observation) -> Judgement {
        if let Some(j) = incomplete(holder) {
            return j;
        }
        let first = self.timing.expected_block();
        let second = self.timing.expected_queued_block();
        let b_wait = match self.contended(b, Action::Update, self.blocked_at(first)) {
            Ok(wait) => wait,
            Err(j) => return j,
        };
        let c_wait = match self.contended(c, Action::Update, self.blocked_at(second)) {
            Ok(wait) => wait,
            Err(j) => return j,
        };
        if let Some(j) = self.short_hold(holder) {
            return j;
        }

        match (self.classify(&b_wait, first), self.classify(&c_wait, second)) {
            (Blocking::Blocked, Blocking::Blocked) => match (b_wait.done_at(), c_wait.done_at()) {
                (Some(b_done), Some(c_done)) if c_done < b_done => {
                    Judgement::inconclusive(format!(
                        "{} overtook {}: served at {} ms, {} at {} ms",
                        c.role,
                        b.role,
                        c_done.as_millis(),
                        b.role,
                        b_done.as_millis()
                    ))
                }
                _ => Judgement::absent(format!(
                    "{} waited {} ms, {} queued behind it for {} ms",
                    b.role,
                    b_wait.waited().as_millis(),
                    c.role,
                    c_wait.waited().as_millis()
                )),
            },
            (Blocking::Free, Blocking::Free) => Judgement::observed(format!(
                "{} and {} returned in {} and {} ms while the holder was uncommitted",
                b.role,
                c.role,
                b_wait.waited().as_millis(),
                c_wait.waited().as_millis()
            )),
            _ => Judgement::inconclusive(format!(
                "{} waited {} ms, {} waited {} ms",
                b.role,
                b_wait.waited().as_millis(),
                c.role,
                c_wait.waited().as_millis()
            )),
        }
    }

    /// Two readers arrive while the writer holds an uncommitted update.
    fn read_queue(&self, writer: &Observation, b: &Observation, c: &Observation) -> Judgement {
        if let Some(j) = incomplete(writer) {
            return j;
        }
        let first = self.timing.expected_block();
        let second = self.timing.expected_queued_block();
        let b_wait = match self.contended(b, Action::Read, self.blocked_at(first)) {
            Ok(wait) => wait,
            Err(j) => return j,
        };
        let c_wait = match self.contended(c, Action::Read, self.blocked_at(second)) {
            Ok(wait) => wait,
            Err(j) => return j,
        };
        if let Some(j) = self.short_hold(writer) {
            return j;
        }

        match (self.classify(&b_wait, first), self.classify(&c_wait, second)) {
            (Blocking::Blocked, Blocking::Blocked) => Judgement::absent(format!(
                "both readers waited for the writer, {} and {} ms",
                b_wait.waited().as_millis(),
                c_wait.waited().as_millis()
            )),
            (Blocking::Free, Blocking::Free) => Judgement::observed(format!(
                "both readers returned in {} and {} ms while the writer was uncommitted",
                b_wait.waited().as_millis(),
                c_wait.waited().as_millis()
            )),
            _ => Judgement::inconclusive(format!(
                "{} waited {} ms, {} waited {} ms",
                b.role,
                b_wait.waited().as_millis(),
                c.role,
                c_wait.waited().as_millis()
            )),
        }
    }

    fn blocked_at(&self, expected: Duration) -> Duration {
        expected.mul_f64(self.thresholds.blocked_fraction)
    }

    /// How long a contended statement of `action` waited. A statement
    /// rejected only after waiting at least `blocked_at` still counts as
    /// blocked.
    fn contended(
        &self,
        obs: &Observation,
        action: Action,
        blocked_at: Duration,
    ) -> Result<Wait, Judgement> {
        match (&obs.terminal, obs.probes_of(action).next()) {
            (Terminal::Committed, Some(probe)) => Ok(Wait::Granted {
                took: probe.took,
                done_at: probe.ended_at(),
            }),
            (Terminal::Errored(failure), _)
                if failure.during == action
                    && failure.kind == ErrorKind::Statement
                    && failure.waited >= blocked_at =>
            {
                Ok(Wait::Rejected {
                    waited: failure.waited,
                    message: failure.message.clone(),
                })
            }
            _ => Err(incomplete(obs).unwrap_or_else(|| {
                Judgement::inconclusive(format!("{} recorded no {:?}", obs.role, action))
            })),
        }
    }

    fn classify(&self, wait: &Wait, expected: Duration) -> Blocking {
        let waited = wait.waited();
        if matches!(wait, Wait::Rejected { .. }) || waited >= self.blocked_at(expected) {
            Blocking::Blocked
        } else if waited <= expected.mul_f64(self.thresholds.unblocked_fraction) {
            Blocking::Free
        } else {
            Blocking::Ambiguous
        }
    }

    /// Inconclusive when the holder committed well before its hold window
    /// ran out.
    fn short_hold(&self, holder: &Observation) -> Option<Judgement> {
        let held = holder
            .probes_of(Action::Update)
            .next()
            .map(|update| holder.ended_at.saturating_sub(update.ended_at()));
        let floor = self.timing.hold().mul_f64(self.thresholds.min_window_fraction);
        match held {
            Some(held) if held >= floor => None,
            Some(held) => Some(Judgement::inconclusive(format!(
                "{} kept its write open for only {} ms",
                holder.role,
                held.as_millis()
            ))),
            None => Some(Judgement::inconclusive(format!(
                "{} recorded no update",
                holder.role
            ))),
        }
    }

    /// Inconclusive when a reader's observations were closer together than
    /// the dwell window allows.
    fn short_window(&self, reader: &Observation, action: Action) -> Option<Judgement> {
        let floor = self.timing.dwell().mul_f64(self.thresholds.min_window_fraction);
        match reader.window(action) {
            Some(window) if window >= floor => None,
            Some(window) => Some(Judgement::inconclusive(format!(
                "observation window {} ms shorter than {} ms",
                window.as_millis(),
                floor.as_millis()
            ))),
            None => None,
        }
    }
}

enum Wait {
    Granted { took: Duration, done_at: Duration },
    Rejected { waited: Duration, message: String },
}

impl Wait {
    fn waited(&self) -> Duration {
        match self {
            Wait::Granted { took, .. } => *took,
            Wait::Rejected { waited, .. } => *waited,
        }
    }

    fn done_at(&self) -> Option<Duration> {
        match self {
            Wait::Granted { done_at, .. } => Some(*done_at),
            Wait::Rejected { .. } => None,
        }
    }
}

enum Blocking {
    Blocked,
    Free,
    Ambiguous,
}

/// Inconclusive judgement for a worker that did not finish its transaction.
fn incomplete(obs: &Observation) -> Option<Judgement> {
    match &obs.terminal {
        Terminal::Committed | Terminal::RolledBack => None,
        Terminal::TimedOut => Some(Judgement::inconclusive(format!(
            "{} timed out",
            obs.role
        ))),
        Terminal::Errored(failure) if failure.kind == ErrorKind::Timeout => Some(
            Judgement::inconclusive(format!("{} timed out: {}", obs.role, failure.message)),
        ),
        Terminal::Errored(failure) => Some(Judgement::inconclusive(format!(
            "{} failed during {:?}: {}",
            obs.role, failure.during, failure.message
        ))),
    }
}

fn show(text: Option<&str>) -> String {
    match text {
        Some(text) => format!("'{text}'"),
        None => "no row".to_string(),
    }
}
