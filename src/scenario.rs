//! The fixed catalog of concurrency scenarios.
//!
//! Each scenario lists two or more roles. The first role is the leader: it
//! opens the interaction and, when the handshake is enabled, cues every
//! other role once its first observation or write is in place. Scripts only
//! reference symbolic delays, so the whole catalog is static data.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{FixtureConfig, TimingConfig};
use crate::errors::ProbeError;
use crate::interleave::Delay;
use crate::isolation::IsolationLevel;

/// Anomaly class a scenario probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Two staggered readers. Baseline: plain reads never block or fail.
    ReadRead,
    /// Reader reads twice around a committed update (non-repeatable read).
    ReadWrite,
    /// Two writers race for the same row (lock wait / lost update).
    WriteWrite,
    /// Reader counts a range twice around a committed insert.
    PhantomRead,
    /// Reader reads while a writer holds an update it later rolls back.
    DirtyRead,
    /// Two writers queue up behind a third one holding the row.
    WriteQueue,
    /// Two readers arrive while a writer holds the row.
    ReadQueue,
}

impl ScenarioKind {
    /// Catalog order.
    pub const ALL: [ScenarioKind; 7] = [
        ScenarioKind::ReadRead,
        ScenarioKind::ReadWrite,
        ScenarioKind::WriteWrite,
        ScenarioKind::PhantomRead,
        ScenarioKind::DirtyRead,
        ScenarioKind::WriteQueue,
        ScenarioKind::ReadQueue,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            ScenarioKind::ReadRead => "read-read",
            ScenarioKind::ReadWrite => "read-write",
            ScenarioKind::WriteWrite => "write-write",
            ScenarioKind::PhantomRead => "phantom-read",
            ScenarioKind::DirtyRead => "dirty-read",
            ScenarioKind::WriteQueue => "write-queue",
            ScenarioKind::ReadQueue => "read-queue",
        }
    }

    /// The anomaly an observed verdict stands for.
    pub fn anomaly(self) -> &'static str {
        match self {
            ScenarioKind::ReadRead => "blocked concurrent read",
            ScenarioKind::ReadWrite => "non-repeatable read",
            ScenarioKind::WriteWrite => "unblocked concurrent write",
            ScenarioKind::PhantomRead => "phantom read",
            ScenarioKind::DirtyRead => "dirty read",
            ScenarioKind::WriteQueue => "unblocked queued writes",
            ScenarioKind::ReadQueue => "reads past an uncommitted write",
        }
    }

    pub fn scenario(self) -> &'static Scenario {
        match self {
            ScenarioKind::ReadRead => &READ_READ,
            ScenarioKind::ReadWrite => &READ_WRITE,
            ScenarioKind::WriteWrite => &WRITE_WRITE,
            ScenarioKind::PhantomRead => &PHANTOM_READ,
            ScenarioKind::DirtyRead => &DIRTY_READ,
            ScenarioKind::WriteQueue => &WRITE_QUEUE,
            ScenarioKind::ReadQueue => &READ_QUEUE,
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for ScenarioKind {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        ScenarioKind::ALL
            .into_iter()
            .find(|kind| {
                kind.slug() == normalized || kind.slug().trim_end_matches("-read") == normalized
            })
            .ok_or_else(|| ProbeError::Configuration(format!("unknown scenario '{s}'")))
    }
}

/// Value an `Update` step writes, taken from the fixture configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteValue {
    Modified,
    Dirty,
    Holder,
    Contender,
    Queued,
}

impl WriteValue {
    pub fn resolve(self, fixture: &FixtureConfig) -> &str {
        match self {
            WriteValue::Modified => &fixture.modified_value,
            WriteValue::Dirty => &fixture.dirty_value,
            WriteValue::Holder => &fixture.holder_value,
            WriteValue::Contender => &fixture.contender_value,
            WriteValue::Queued => &fixture.queued_value,
        }
    }
}

/// One instruction of a role's script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Pause(Delay),
    /// Read the test row's text field.
    Read,
    /// Count the phantom set.
    Count,
    Update(WriteValue),
    /// Insert a new member of the phantom set.
    Insert,
    /// Cue every other role (handshake only).
    Signal,
    /// Wait for the leader's cue (handshake only).
    AwaitCue,
    Commit,
    Rollback,
}

#[derive(Debug)]
pub struct Role {
    pub label: &'static str,
    pub steps: &'static [Step],
}

impl Role {
    /// Sum of the pauses in this role's script.
    pub fn delays(&self, timing: &TimingConfig) -> Duration {
        self.steps
            .iter()
            .map(|step| match step {
                Step::Pause(delay) => delay.resolve(timing),
                _ => Duration::ZERO,
            })
            .sum()
    }
}

/// What the ANSI definition of a level says a scenario should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Expectation {
    Anomaly,
    NoAnomaly,
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Anomaly => f.write_str("anomaly"),
            Expectation::NoAnomaly => f.write_str("no anomaly"),
        }
    }
}

#[derive(Debug)]
pub struct Scenario {
    pub kind: ScenarioKind,
    pub name: &'static str,
    /// Leader first.
    pub roles: &'static [Role],
}

impl Scenario {
    /// The whole catalog, in execution order.
    pub fn catalog() -> [&'static Scenario; 7] {
        ScenarioKind::ALL.map(ScenarioKind::scenario)
    }

    /// Upper bound on how long a run of this scenario should take: every
    /// pause of every role, plus one full lock wait.
    pub fn budget(&self, timing: &TimingConfig, lock_wait: Duration) -> Duration {
        self.roles
            .iter()
            .map(|role| role.delays(timing))
            .sum::<Duration>()
            + lock_wait
    }

    /// Documented outcome at `level`.
    ///
    /// Phantom-read is the only scenario that separates repeatable-read from
    /// serializable.
    pub fn expectation(&self, level: IsolationLevel) -> Expectation {
        use IsolationLevel::*;
        let anomaly = match self.kind {
            ScenarioKind::ReadRead => false,
            ScenarioKind::DirtyRead => level == ReadUncommitted,
            ScenarioKind::ReadWrite => matches!(level, ReadUncommitted | ReadCommitted),
            ScenarioKind::WriteWrite => level == ReadUncommitted,
            ScenarioKind::PhantomRead => level != Serializable,
            ScenarioKind::WriteQueue => level == ReadUncommitted,
            // Only shared read locks make a reader wait for a writer.
            ScenarioKind::ReadQueue => level != Serializable,
        };
        if anomaly {
            Expectation::Anomaly
        } else {
            Expectation::NoAnomaly
        }
    }
}

static READ_READ: Scenario = Scenario {
    kind: ScenarioKind::ReadRead,
    name: "Read-Read",
    roles: &[
        Role {
            label: "Reader A",
            steps: &[Step::Read, Step::Signal, Step::Commit],
        },
        Role {
            label: "Reader B",
            steps: &[
                Step::AwaitCue,
                Step::Pause(Delay::Stagger),
                Step::Read,
                Step::Commit,
            ],
        },
    ],
};

static READ_WRITE: Scenario = Scenario {
    kind: ScenarioKind::ReadWrite,
    name: "Read-Write",
    roles: &[
        Role {
            label: "Reader",
            steps: &[
                Step::Read,
                Step::Signal,
                Step::Pause(Delay::Dwell),
                Step::Read,
                Step::Commit,
            ],
        },
        Role {
            label: "Writer",
            steps: &[
                Step::AwaitCue,
                Step::Pause(Delay::WriterOffset),
                Step::Update(WriteValue::Modified),
                Step::Commit,
            ],
        },
    ],
};

static WRITE_WRITE: Scenario = Scenario {
    kind: ScenarioKind::WriteWrite,
    name: "Write-Write",
    roles: &[
        Role {
            label: "Writer A",
            steps: &[
                Step::Update(WriteValue::Holder),
                Step::Signal,
                Step::Pause(Delay::Hold),
                Step::Commit,
            ],
        },
        Role {
            label: "Writer B",
            steps: &[
                Step::AwaitCue,
                Step::Pause(Delay::ContenderOffset),
                Step::Update(WriteValue::Contender),
                Step::Commit,
            ],
        },
    ],
};

static PHANTOM_READ: Scenario = Scenario {
    kind: ScenarioKind::PhantomRead,
    name: "Phantom-Read",
    roles: &[
        Role {
            label: "Reader",
            steps: &[
                Step::Count,
                Step::Signal,
                Step::Pause(Delay::Dwell),
                Step::Count,
                Step::Commit,
            ],
        },
        Role {
            label: "Writer",
            steps: &[
                Step::AwaitCue,
                Step::Pause(Delay::WriterOffset),
                Step::Insert,
                Step::Commit,
            ],
        },
    ],
};

static DIRTY_READ: Scenario = Scenario {
    kind: ScenarioKind::DirtyRead,
    name: "Dirty-Read",
    roles: &[
        Role {
            label: "Writer",
            steps: &[
                Step::Update(WriteValue::Dirty),
                Step::Signal,
                Step::Pause(Delay::Hold),
                Step::Rollback,
            ],
        },
        Role {
            label: "Reader",
            steps: &[
                Step::AwaitCue,
                Step::Pause(Delay::ContenderOffset),
                Step::Read,
                Step::Commit,
            ],
        },
    ],
};

/// Writer C starts `stagger` after writer B, so both wait on writer A and
/// C is expected to be served after B.
static WRITE_QUEUE: Scenario = Scenario {
    kind: ScenarioKind::WriteQueue,
    name: "Write-Queue",
    roles: &[
        Role {
            label: "Writer A",
            steps: &[
                Step::Update(WriteValue::Holder),
                Step::Signal,
                Step::Pause(Delay::Hold),
                Step::Commit,
            ],
        },
        Role {
            label: "Writer B",
            steps: &[
                Step::AwaitCue,
                Step::Pause(Delay::ContenderOffset),
                Step::Update(WriteValue::Contender),
                Step::Commit,
            ],
        },
        Role {
            label: "Writer C",
            steps: &[
                Step::AwaitCue,
                Step::Pause(Delay::ContenderOffset),
                Step::Pause(Delay::Stagger),
                Step::Update(WriteValue::Queued),
                Step::Commit,
            ],
        },
    ],
};

static READ_QUEUE: Scenario = Scenario {
    kind: ScenarioKind::ReadQueue,
    name: "Read-Queue",
    roles: &[
        Role {
            label: "Writer",
            steps: &[
                Step::Update(WriteValue::Holder),
                Step::Signal,
                Step::Pause(Delay::Hold),
                Step::Commit,
            ],
        },
        Role {
            label: "Reader B",
            steps: &[
                Step::AwaitCue,
                Step::Pause(Delay::ContenderOffset),
                Step::Read,
                Step::Commit,
            ],
        },
        Role {
            label: "Reader C",
            steps: &[
                Step::AwaitCue,
                Step::Pause(Delay::ContenderOffset),
                Step::Pause(Delay::Stagger),
                Step::Read,
                Step::Commit,
            ],
        },
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_order_and_lookup() {
        let kinds: Vec<_> = Scenario::catalog().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, ScenarioKind::ALL.to_vec());
        for kind in ScenarioKind::ALL {
            assert_eq!(kind.scenario().kind, kind);
            assert_eq!(kind.slug().parse::<ScenarioKind>().unwrap(), kind);
        }
        assert_eq!("phantom".parse::<ScenarioKind>().unwrap(), ScenarioKind::PhantomRead);
        assert_eq!("WRITE_WRITE".parse::<ScenarioKind>().unwrap(), ScenarioKind::WriteWrite);
        assert!("lost-update".parse::<ScenarioKind>().is_err());
    }

    #[test]
    fn every_script_ends_its_transaction_once() {
        for scenario in Scenario::catalog() {
            for role in scenario.roles {
                let ends = role
                    .steps
                    .iter()
                    .filter(|s| matches!(s, Step::Commit | Step::Rollback))
                    .count();
                assert_eq!(ends, 1, "{} / {}", scenario.name, role.label);
                assert!(matches!(
                    role.steps.last(),
                    Some(Step::Commit | Step::Rollback)
                ));
            }
            let (leader, followers) = scenario.roles.split_first().unwrap();
            assert!(leader.steps.contains(&Step::Signal));
            assert!(!followers.is_empty());
            for follower in followers {
                assert!(follower.steps.contains(&Step::AwaitCue));
            }
        }
    }

    #[test]
    fn phantom_read_separates_repeatable_read_from_serializable() {
        let phantom = ScenarioKind::PhantomRead.scenario();
        let rw = ScenarioKind::ReadWrite.scenario();
        assert_eq!(
            phantom.expectation(IsolationLevel::RepeatableRead),
            Expectation::Anomaly
        );
        assert_eq!(
            phantom.expectation(IsolationLevel::Serializable),
            Expectation::NoAnomaly
        );
        assert_eq!(
            rw.expectation(IsolationLevel::RepeatableRead),
            rw.expectation(IsolationLevel::Serializable)
        );
        for level in IsolationLevel::ALL {
            assert_eq!(
                ScenarioKind::ReadRead.scenario().expectation(level),
                Expectation::NoAnomaly
            );
        }
    }

    #[test]
    fn budget_sums_every_script() {
        let timing = TimingConfig::default();
        let budget = ScenarioKind::ReadWrite
            .scenario()
            .budget(&timing, Duration::from_secs(1));
        assert_eq!(budget, timing.dwell() + timing.writer_offset() + Duration::from_secs(1));

        let queue = ScenarioKind::WriteQueue.scenario();
        assert_eq!(queue.roles.len(), 3);
        assert_eq!(
            queue.budget(&timing, Duration::ZERO),
            timing.hold() + timing.contender_offset() * 2 + timing.stagger()
        );
    }

    #[test]
    fn queue_scenarios_share_the_write_window() {
        assert_eq!(
            "write-queue".parse::<ScenarioKind>().unwrap(),
            ScenarioKind::WriteQueue
        );
        for kind in [ScenarioKind::WriteQueue, ScenarioKind::ReadQueue] {
            let scenario = kind.scenario();
            assert_eq!(scenario.roles[0].steps, WRITE_WRITE.roles[0].steps);
            assert_eq!(
                scenario.expectation(IsolationLevel::Serializable),
                Expectation::NoAnomaly
            );
            assert_eq!(
                scenario.expectation(IsolationLevel::ReadUncommitted),
                Expectation::Anomaly
            );
        }
        assert_eq!(
            ScenarioKind::ReadQueue
                .scenario()
                .expectation(IsolationLevel::RepeatableRead),
            Expectation::Anomaly
        );
    }
}
