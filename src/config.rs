//! Harness configuration.
//!
//! A [`ProbeConfig`] is assembled once (defaults, then an optional TOML file,
//! then environment overrides, then command-line flags) and handed to the
//! session provider, fixture controller and runner. Delays are written in
//! milliseconds and read back as [`Duration`]s.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ProbeError, Result};
use crate::isolation::IsolationLevel;
use crate::scenario::ScenarioKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// The in-process reference engine.
    #[default]
    Memory,
    /// A SQLite database file.
    Sqlite,
}

impl FromStr for Backend {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Backend::Memory),
            "sqlite" => Ok(Backend::Sqlite),
            other => Err(ProbeError::Configuration(format!(
                "unknown target backend '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Memory => f.write_str("memory"),
            Backend::Sqlite => f.write_str("sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub backend: Backend,
    /// Label shown in reports. Defaults to the backend name.
    pub name: Option<String>,
    pub sqlite_path: Option<PathBuf>,
    /// How long a statement may wait on a conflicting lock before the store
    /// rejects it.
    pub lock_wait_timeout_ms: u64,
    /// Pause after every fixture commit, for targets that read from a
    /// replica of the node the fixtures are written to. Zero disables it.
    pub settle_ms: u64,
    /// Create the probe table when it does not exist.
    pub create_schema: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            name: None,
            sqlite_path: None,
            lock_wait_timeout_ms: 10_000,
            settle_ms: 0,
            create_schema: true,
        }
    }
}

impl TargetConfig {
    pub fn label(&self) -> String {
        match (&self.name, self.backend, &self.sqlite_path) {
            (Some(name), _, _) => name.clone(),
            (None, Backend::Sqlite, Some(path)) => format!("sqlite:{}", path.display()),
            (None, backend, _) => backend.to_string(),
        }
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn settle(&self) -> Option<Duration> {
        (self.settle_ms > 0).then(|| Duration::from_millis(self.settle_ms))
    }
}

/// Names of the table and columns the fixed statements run against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSchema {
    pub table: String,
    pub key_column: String,
    pub text_column: String,
    pub marker_column: String,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            table: "title_basics".into(),
            key_column: "tconst".into(),
            text_column: "primaryTitle".into(),
            marker_column: "titleType".into(),
        }
    }
}

impl TableSchema {
    /// Identifiers are spliced into SQL text, so only plain names pass.
    pub fn validate(&self) -> Result<()> {
        for ident in [
            &self.table,
            &self.key_column,
            &self.text_column,
            &self.marker_column,
        ] {
            let plain = !ident.is_empty()
                && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !ident.starts_with(|c: char| c.is_ascii_digit());
            if !plain {
                return Err(ProbeError::Configuration(format!(
                    "'{ident}' is not a plain SQL identifier"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    #[serde(flatten)]
    pub schema: TableSchema,
    /// Key of the test row.
    pub test_key: String,
    /// Value the test row's text field holds before every scenario.
    pub baseline: String,
    /// Secondary-field value shared by the phantom set.
    pub phantom_marker: String,
    /// Key of the phantom row seeded before the phantom-read scenario.
    pub seed_key: String,
    /// Key of the phantom row the writer inserts.
    pub phantom_key: String,
    /// Written by the read-write scenario's writer.
    pub modified_value: String,
    /// Written, then rolled back, by the dirty-read scenario's writer.
    pub dirty_value: String,
    pub holder_value: String,
    pub contender_value: String,
    /// Written by the last writer of the write-queue scenario.
    pub queued_value: String,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            schema: TableSchema::default(),
            test_key: "tt1234567".into(),
            baseline: "Should be in B".into(),
            phantom_marker: "isoprobe-phantom".into(),
            seed_key: "tt-phantom-seed".into(),
            phantom_key: "tt-phantom-new".into(),
            modified_value: "MODIFIED".into(),
            dirty_value: "DIRTY_UNCOMMITTED".into(),
            holder_value: "TxA_Was_Here".into(),
            contender_value: "TxB_Was_Here".into(),
            queued_value: "TxC_Was_Here".into(),
        }
    }
}

impl FixtureConfig {
    fn validate(&self) -> Result<()> {
        self.schema.validate()?;
        for value in [
            &self.modified_value,
            &self.dirty_value,
            &self.holder_value,
            &self.contender_value,
            &self.queued_value,
        ] {
            if *value == self.baseline {
                return Err(ProbeError::Configuration(format!(
                    "written value '{value}' is indistinguishable from the baseline"
                )));
            }
        }
        let keys = [&self.test_key, &self.seed_key, &self.phantom_key];
        for (i, a) in keys.iter().enumerate() {
            if a.is_empty() || keys[i + 1..].contains(a) {
                return Err(ProbeError::Configuration(format!(
                    "fixture keys must be distinct and non-empty, got '{a}' twice"
                )));
            }
        }
        Ok(())
    }
}

/// Calibrated delays of the interleaving primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Offset of the second reader in read-read, and of the last
    /// contender in the queue scenarios.
    pub stagger_ms: u64,
    /// Offset of a writer racing a reader (read-write, phantom-read).
    pub writer_offset_ms: u64,
    /// How long a reader keeps its transaction open between observations.
    pub dwell_ms: u64,
    /// Offset of the second participant when the first holds a write open
    /// (write-write, dirty-read).
    pub contender_offset_ms: u64,
    /// How long a holder keeps its uncommitted write open.
    pub hold_ms: u64,
    /// Exchange explicit cues between workers on top of the delays.
    pub handshake: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stagger_ms: 200,
            writer_offset_ms: 500,
            dwell_ms: 2_000,
            contender_offset_ms: 500,
            hold_ms: 3_000,
            handshake: false,
        }
    }
}

impl TimingConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn writer_offset(&self) -> Duration {
        Duration::from_millis(self.writer_offset_ms)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    pub fn contender_offset(&self) -> Duration {
        Duration::from_millis(self.contender_offset_ms)
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    /// Time a contender is expected to spend blocked if the holder's write
    /// lock is enforced.
    pub fn expected_block(&self) -> Duration {
        self.hold().saturating_sub(self.contender_offset())
    }

    /// Expected block of the contender that starts `stagger` after the
    /// first one.
    pub fn expected_queued_block(&self) -> Duration {
        self.expected_block().saturating_sub(self.stagger())
    }

    fn validate(&self) -> Result<()> {
        if self.writer_offset_ms >= self.dwell_ms {
            return Err(ProbeError::Configuration(format!(
                "writer_offset_ms ({}) must be smaller than dwell_ms ({})",
                self.writer_offset_ms, self.dwell_ms
            )));
        }
        if self.contender_offset_ms >= self.hold_ms {
            return Err(ProbeError::Configuration(format!(
                "contender_offset_ms ({}) must be smaller than hold_ms ({})",
                self.contender_offset_ms, self.hold_ms
            )));
        }
        if self.contender_offset_ms + self.stagger_ms >= self.hold_ms {
            return Err(ProbeError::Configuration(format!(
                "contender_offset_ms + stagger_ms ({}) must be smaller than hold_ms ({})",
                self.contender_offset_ms + self.stagger_ms,
                self.hold_ms
            )));
        }
        Ok(())
    }
}

/// Tunable bounds of the verdict heuristics. None of them is a hard
/// correctness boundary: under heavy load they can misclassify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictThresholds {
    /// A contender counts as blocked once its statement took at least this
    /// fraction of the expected block time.
    pub blocked_fraction: f64,
    /// A contender counts as unblocked when its statement took at most this
    /// fraction of the expected block time. In between is ambiguous.
    pub unblocked_fraction: f64,
    /// The observed window between a reader's two observations (or a
    /// holder's write and its end) must reach this fraction of the
    /// configured dwell/hold, otherwise the run is scheduling noise.
    pub min_window_fraction: f64,
    /// A plain read slower than this counts as blocked in read-read.
    pub slow_read_ms: u64,
}

impl Default for VerdictThresholds {
    fn default() -> Self {
        Self {
            blocked_fraction: 0.8,
            unblocked_fraction: 0.25,
            min_window_fraction: 0.9,
            slow_read_ms: 1_000,
        }
    }
}

impl VerdictThresholds {
    pub fn slow_read(&self) -> Duration {
        Duration::from_millis(self.slow_read_ms)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("blocked_fraction", self.blocked_fraction),
            ("unblocked_fraction", self.unblocked_fraction),
            ("min_window_fraction", self.min_window_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ProbeError::Configuration(format!(
                    "{name} must lie in (0, 1], got {value}"
                )));
            }
        }
        if self.unblocked_fraction >= self.blocked_fraction {
            return Err(ProbeError::Configuration(
                "unblocked_fraction must be smaller than blocked_fraction".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Added to a scenario's summed delays to form its deadline.
    pub safety_margin_ms: u64,
    /// How long cancelled workers get to report after the deadline.
    pub grace_ms: u64,
    /// Number of times the whole matrix is executed.
    pub rounds: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            safety_margin_ms: 2_000,
            grace_ms: 1_000,
            rounds: 1,
        }
    }
}

impl RunnerConfig {
    pub fn safety_margin(&self) -> Duration {
        Duration::from_millis(self.safety_margin_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub target: TargetConfig,
    pub fixture: FixtureConfig,
    pub timing: TimingConfig,
    pub thresholds: VerdictThresholds,
    pub runner: RunnerConfig,
    pub levels: Vec<IsolationLevel>,
    pub scenarios: Vec<ScenarioKind>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            fixture: FixtureConfig::default(),
            timing: TimingConfig::default(),
            thresholds: VerdictThresholds::default(),
            runner: RunnerConfig::default(),
            levels: IsolationLevel::ALL.to_vec(),
            scenarios: ScenarioKind::ALL.to_vec(),
        }
    }
}

impl ProbeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            ProbeError::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Applies `ISOPROBE_*` overrides looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("ISOPROBE_TARGET") {
            self.target.backend = backend.parse()?;
        }
        if let Some(path) = lookup("ISOPROBE_SQLITE_PATH") {
            self.target.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(settle) = lookup("ISOPROBE_SETTLE_MS") {
            self.target.settle_ms = settle.trim().parse().map_err(|_| {
                ProbeError::Configuration(format!("ISOPROBE_SETTLE_MS is not a number: '{settle}'"))
            })?;
        }
        Ok(())
    }

    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(ProbeError::Configuration("no isolation level selected".into()));
        }
        if self.scenarios.is_empty() {
            return Err(ProbeError::Configuration("no scenario selected".into()));
        }
        if self.runner.rounds == 0 {
            return Err(ProbeError::Configuration("rounds must be at least 1".into()));
        }
        if self.target.backend == Backend::Sqlite && self.target.sqlite_path.is_none() {
            return Err(ProbeError::Configuration(
                "sqlite target requires sqlite_path".into(),
            ));
        }
        self.fixture.validate()?;
        self.timing.validate()?;
        self.thresholds.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_catalog() {
        let config = ProbeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.levels, IsolationLevel::ALL.to_vec());
        assert_eq!(config.fixture.baseline, "Should be in B");
        assert_eq!(config.timing.expected_block(), Duration::from_millis(2_500));
    }

    #[test]
    fn toml_overrides_single_fields() {
        let config = ProbeConfig::from_toml_str(
            r#"
            levels = ["read-committed", "serializable"]

            [target]
            backend = "sqlite"
            sqlite_path = "/tmp/probe.db"

            [fixture]
            table = "movies"

            [timing]
            dwell_ms = 900
            handshake = true
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.target.backend, Backend::Sqlite);
        assert_eq!(config.fixture.schema.table, "movies");
        assert_eq!(config.fixture.schema.key_column, "tconst");
        assert_eq!(config.timing.dwell(), Duration::from_millis(900));
        assert_eq!(config.timing.hold_ms, 3_000);
        assert!(config.timing.handshake);
        assert_eq!(
            config.levels,
            vec![IsolationLevel::ReadCommitted, IsolationLevel::Serializable]
        );
    }

    #[test]
    fn sqlite_without_path_is_rejected() {
        let mut config = ProbeConfig::default();
        config.target.backend = Backend::Sqlite;
        assert!(matches!(
            config.validate(),
            Err(ProbeError::Configuration(_))
        ));
    }

    #[test]
    fn writer_offset_must_fit_in_dwell() {
        let mut config = ProbeConfig::default();
        config.timing.writer_offset_ms = config.timing.dwell_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn queued_contender_must_start_inside_hold() {
        let mut config = ProbeConfig::default();
        config.timing.stagger_ms = config.timing.hold_ms - config.timing.contender_offset_ms;
        assert!(config.validate().is_err());
        config.timing.stagger_ms -= 1;
        config.validate().unwrap();
        assert_eq!(config.timing.expected_queued_block(), Duration::from_millis(1));
    }

    #[test]
    fn identifiers_are_checked() {
        let mut config = ProbeConfig::default();
        config.fixture.schema.table = "title_basics; DROP TABLE x".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = ProbeConfig::default();
        config
            .apply_env(|key| match key {
                "ISOPROBE_TARGET" => Some("sqlite".into()),
                "ISOPROBE_SQLITE_PATH" => Some("/var/tmp/x.db".into()),
                "ISOPROBE_SETTLE_MS" => Some("250".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.target.backend, Backend::Sqlite);
        assert_eq!(config.target.settle(), Some(Duration::from_millis(250)));
        assert_eq!(config.target.label(), "sqlite:/var/tmp/x.db");
        config.validate().unwrap();

        assert!(config.apply_env(|_| Some("later".into())).is_err());
    }
}
