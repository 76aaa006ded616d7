use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::errors::{ErrorKind, ProbeError};
use crate::isolation::IsolationLevel;

pub(crate) fn millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_micros() as f64 / 1_000.0)
}

/// Statement class a probe or failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Connect,
    Read,
    Count,
    Update,
    Insert,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeValue {
    Text(Option<String>),
    Count(u64),
    Affected(usize),
}

/// One timed statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Probe {
    pub action: Action,
    /// Offset of the statement's start from the scenario start.
    #[serde(rename = "at_ms", serialize_with = "millis")]
    pub at: Duration,
    /// Wall-clock duration of the statement, lock waits included.
    #[serde(rename = "took_ms", serialize_with = "millis")]
    pub took: Duration,
    pub value: ProbeValue,
}

impl Probe {
    pub fn ended_at(&self) -> Duration {
        self.at + self.took
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    pub during: Action,
    /// How long the failing statement ran before it returned.
    #[serde(rename = "waited_ms", serialize_with = "millis")]
    pub waited: Duration,
}

/// How a worker's transaction ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Terminal {
    Committed,
    RolledBack,
    Errored(Failure),
    /// Cancelled by the runner while the worker was still running.
    TimedOut,
}

/// Everything one worker saw during one scenario execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub role: String,
    pub level: IsolationLevel,
    pub probes: Vec<Probe>,
    pub terminal: Terminal,
    /// Offset from the scenario start at which the transaction ended.
    #[serde(rename = "ended_at_ms", serialize_with = "millis")]
    pub ended_at: Duration,
}

impl Observation {
    pub fn new(role: impl Into<String>, level: IsolationLevel) -> Self {
        Self {
            role: role.into(),
            level,
            probes: Vec::new(),
            terminal: Terminal::TimedOut,
            ended_at: Duration::ZERO,
        }
    }

    /// Stand-in for a worker that never reported. The failure is charged
    /// to the commit the worker never reached.
    pub fn timed_out(
        role: impl Into<String>,
        level: IsolationLevel,
        ended_at: Duration,
        err: &ProbeError,
    ) -> Self {
        let mut obs = Self {
            ended_at,
            ..Self::new(role, level)
        };
        obs.record_failure(Action::Commit, err, ended_at);
        obs
    }

    pub fn record_failure(&mut self, during: Action, err: &ProbeError, waited: Duration) {
        self.terminal = Terminal::Errored(Failure {
            kind: err.kind(),
            message: err.to_string(),
            during,
            waited,
        });
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.terminal {
            Terminal::Errored(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.terminal, Terminal::Committed | Terminal::RolledBack)
    }

    /// Cancelled while running, or never reported at all.
    pub fn is_timed_out(&self) -> bool {
        match &self.terminal {
            Terminal::TimedOut => true,
            Terminal::Errored(failure) => failure.kind == ErrorKind::Timeout,
            _ => false,
        }
    }

    pub fn probes_of(&self, action: Action) -> impl Iterator<Item = &Probe> {
        self.probes.iter().filter(move |probe| probe.action == action)
    }

    pub fn texts(&self) -> Vec<Option<&str>> {
        self.probes
            .iter()
            .filter_map(|probe| match &probe.value {
                ProbeValue::Text(text) => Some(text.as_deref()),
                _ => None,
            })
            .collect()
    }

    pub fn counts(&self) -> Vec<u64> {
        self.probes
            .iter()
            .filter_map(|probe| match probe.value {
                ProbeValue::Count(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    /// Time between the end of the first probe of `action` and the start of
    /// the second one.
    pub fn window(&self, action: Action) -> Option<Duration> {
        let mut probes = self.probes_of(action);
        let first = probes.next()?;
        let second = probes.next()?;
        Some(second.at.saturating_sub(first.ended_at()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(action: Action, at: u64, took: u64, value: ProbeValue) -> Probe {
        Probe {
            action,
            at: Duration::from_millis(at),
            took: Duration::from_millis(took),
            value,
        }
    }

    #[test]
    fn window_spans_between_reads() {
        let mut obs = Observation::new("Reader", IsolationLevel::ReadCommitted);
        obs.probes.push(probe(Action::Read, 0, 5, ProbeValue::Text(Some("a".into()))));
        obs.probes.push(probe(Action::Read, 105, 5, ProbeValue::Text(None)));
        assert_eq!(obs.window(Action::Read), Some(Duration::from_millis(100)));
        assert_eq!(obs.window(Action::Count), None);
        assert_eq!(obs.texts(), vec![Some("a"), None]);
    }

    #[test]
    fn failures_keep_their_kind() {
        let mut obs = Observation::new("Writer", IsolationLevel::Serializable);
        assert!(obs.is_timed_out());
        obs.record_failure(
            Action::Insert,
            &ProbeError::Statement("lock wait timeout exceeded".into()),
            Duration::from_millis(40),
        );
        let failure = obs.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::Statement);
        assert_eq!(failure.during, Action::Insert);
        assert!(!obs.is_complete());
    }

    #[test]
    fn missing_worker_is_a_timeout_failure() {
        let err = ProbeError::Timeout("Writer C did not report within 900 ms".into());
        let obs = Observation::timed_out(
            "Writer C",
            IsolationLevel::Serializable,
            Duration::from_millis(1_400),
            &err,
        );
        assert!(obs.is_timed_out());
        assert!(!obs.is_complete());
        let failure = obs.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::Timeout);
        assert!(failure.message.starts_with("Timeout: Writer C"));
        assert_eq!(obs.ended_at, Duration::from_millis(1_400));
    }

    #[test]
    fn serializes_durations_as_millis() {
        let mut obs = Observation::new("Reader", IsolationLevel::RepeatableRead);
        obs.probes.push(probe(Action::Count, 2, 3, ProbeValue::Count(1)));
        obs.terminal = Terminal::Committed;
        let json = serde_json::to_value(&obs).unwrap();
        assert_eq!(json["level"], "repeatable-read");
        assert_eq!(json["probes"][0]["took_ms"], 3.0);
        assert_eq!(json["probes"][0]["value"]["count"], 1);
        assert_eq!(json["terminal"]["state"], "committed");
    }
}
