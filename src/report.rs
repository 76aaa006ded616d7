use std::fmt;

use serde::Serialize;

use crate::errors::Result;
use crate::isolation::IsolationLevel;
use crate::runner::ScenarioOutcome;
use crate::scenario::ScenarioKind;
use crate::verdict::Verdict;

/// One pass over the selected level × scenario matrix.
#[derive(Debug, Clone, Serialize)]
pub struct Round {
    pub index: usize,
    pub outcomes: Vec<ScenarioOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub scenarios: usize,
    pub observed: usize,
    pub absent: usize,
    pub inconclusive: usize,
    pub mismatches: usize,
    pub fixture_errors: usize,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} scenario run(s): {} observed, {} absent, {} inconclusive, {} mismatch(es)",
            self.scenarios, self.observed, self.absent, self.inconclusive, self.mismatches
        )?;
        if self.fixture_errors > 0 {
            write!(f, ", {} fixture error(s)", self.fixture_errors)?;
        }
        Ok(())
    }
}

/// Everything a run of the matrix produced.
#[derive(Debug, Clone, Serialize)]
pub struct MatrixReport {
    pub target: String,
    pub rounds: Vec<Round>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    target: &'a str,
    stable: bool,
    summary: Summary,
    rounds: &'a [Round],
}

impl MatrixReport {
    pub fn new(target: impl Into<String>, rounds: Vec<Round>) -> Self {
        Self {
            target: target.into(),
            rounds,
        }
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &ScenarioOutcome> {
        self.rounds.iter().flat_map(|round| round.outcomes.iter())
    }

    pub fn outcome(
        &self,
        round: usize,
        level: IsolationLevel,
        scenario: ScenarioKind,
    ) -> Option<&ScenarioOutcome> {
        self.outcomes()
            .find(|o| o.round == round && o.level == level && o.scenario == scenario)
    }

    /// Verdicts of every round for one matrix cell.
    pub fn verdicts(&self, level: IsolationLevel, scenario: ScenarioKind) -> Vec<Verdict> {
        self.outcomes()
            .filter(|o| o.level == level && o.scenario == scenario)
            .map(|o| o.verdict)
            .collect()
    }

    /// True when every cell got the same verdict in every round.
    pub fn stable(&self) -> bool {
        let Some(first) = self.rounds.first() else {
            return true;
        };
        first.outcomes.iter().all(|cell| {
            self.verdicts(cell.level, cell.scenario)
                .iter()
                .all(|verdict| *verdict == cell.verdict)
        })
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for outcome in self.outcomes() {
            summary.scenarios += 1;
            match outcome.verdict {
                Verdict::AnomalyObserved => summary.observed += 1,
                Verdict::AnomalyAbsent => summary.absent += 1,
                Verdict::Inconclusive => summary.inconclusive += 1,
            }
            if outcome.mismatch() {
                summary.mismatches += 1;
            }
            if outcome.fixture_error.is_some() {
                summary.fixture_errors += 1;
            }
        }
        summary
    }

    pub fn to_json(&self) -> Result<String> {
        let report = JsonReport {
            target: &self.target,
            stable: self.stable(),
            summary: self.summary(),
            rounds: &self.rounds,
        };
        Ok(serde_json::to_string_pretty(&report)?)
    }
}

impl fmt::Display for MatrixReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "isolation matrix for {}", self.target)?;
        for round in &self.rounds {
            if self.rounds.len() > 1 {
                writeln!(f, "round {}", round.index)?;
            }
            writeln!(
                f,
                "  {:<18} {:<14} {:<18} {}",
                "level", "scenario", "verdict", "documented"
            )?;
            for outcome in &round.outcomes {
                let mark = if outcome.mismatch() { "  !" } else { "" };
                writeln!(
                    f,
                    "  {:<18} {:<14} {:<18} {}{mark}",
                    outcome.level.slug(),
                    outcome.scenario.slug(),
                    outcome.verdict.to_string(),
                    outcome.expectation.to_string()
                )?;
                writeln!(f, "      {}", outcome.reason)?;
            }
        }
        if self.rounds.len() > 1 {
            let stability = if self.stable() { "stable" } else { "unstable" };
            writeln!(f, "verdicts across rounds: {stability}")?;
        }
        write!(f, "{}", self.summary())
    }
}
