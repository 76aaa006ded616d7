use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::{FixtureConfig, ProbeConfig};
use crate::errors::{ProbeError, Result};
use crate::isolation::IsolationLevel;
use crate::scenario::ScenarioKind;
use crate::session::{SessionProvider, Statement};

/// Text of the seeded phantom-set member.
const SEED_TEXT: &str = "Phantom seed";

/// Restores the known pre-state before every scenario execution.
///
/// The reset runs in its own committed and closed transaction, so every
/// worker session opened afterwards starts from the baseline, even at
/// read-uncommitted.
pub struct FixtureController {
    provider: SessionProvider,
    fixture: FixtureConfig,
    settle: Option<Duration>,
}

impl FixtureController {
    pub fn new(provider: SessionProvider, config: &ProbeConfig) -> Self {
        Self {
            provider,
            fixture: config.fixture.clone(),
            settle: config.target.settle(),
        }
    }

    /// Puts the test row back to the baseline and clears the phantom set,
    /// along with whatever occupies the phantom and seed keys. Before
    /// phantom-read, one member of the set is seeded.
    ///
    /// Any failure is reported as [`ProbeError::Fixture`].
    pub fn reset(&self, kind: ScenarioKind) -> Result<()> {
        self.apply(kind).map_err(ProbeError::into_fixture)?;
        if let Some(settle) = self.settle {
            debug!("fixture settling for {} ms", settle.as_millis());
            thread::sleep(settle);
        }
        Ok(())
    }

    fn apply(&self, kind: ScenarioKind) -> Result<()> {
        let fixture = &self.fixture;
        let mut guard = self.provider.open(IsolationLevel::ReadCommitted)?;
        let cleared = guard
            .execute(&Statement::DeleteMarked {
                marker: fixture.phantom_marker.clone(),
            })?
            .into_affected()?;
        let mut strays = 0;
        for key in [&fixture.phantom_key, &fixture.seed_key] {
            strays += guard
                .execute(&Statement::DeleteKey { key: key.clone() })?
                .into_affected()?;
        }
        if strays > 0 {
            warn!("fixture removed {strays} unmarked row(s) from the phantom keys");
        }
        guard.execute(&Statement::UpsertRow {
            key: fixture.test_key.clone(),
            text: fixture.baseline.clone(),
        })?;
        if kind == ScenarioKind::PhantomRead {
            guard.execute(&Statement::InsertRow {
                key: fixture.seed_key.clone(),
                text: SEED_TEXT.to_string(),
                marker: fixture.phantom_marker.clone(),
            })?;
        }
        guard.commit()?;
        info!(
            "fixture reset for {kind}: '{}' = '{}', {cleared} phantom row(s) cleared",
            fixture.test_key, fixture.baseline
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryEngine, MemoryFactory, RowImage};
    use std::sync::Arc;

    fn controller(config: &ProbeConfig) -> (FixtureController, Arc<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new(Duration::from_millis(100)));
        let factory = MemoryFactory::new(Arc::clone(&engine), "fixture-test");
        let provider = SessionProvider::new(Arc::new(factory));
        (FixtureController::new(provider, config), engine)
    }

    #[test]
    fn reset_restores_baseline_and_phantom_seed() {
        let config = ProbeConfig::default();
        let (controller, engine) = controller(&config);
        let marker = config.fixture.phantom_marker.clone();
        engine.seed(&config.fixture.test_key, RowImage::new("leftover", None));
        engine.seed("stray-1", RowImage::new("x", Some(marker.clone())));
        engine.seed("stray-2", RowImage::new("x", Some(marker.clone())));

        controller.reset(ScenarioKind::PhantomRead).unwrap();
        assert_eq!(
            engine.committed_text(&config.fixture.test_key).as_deref(),
            Some("Should be in B")
        );
        assert_eq!(engine.committed_marked(&marker), 1);

        controller.reset(ScenarioKind::ReadWrite).unwrap();
        assert_eq!(engine.committed_marked(&marker), 0);
        assert_eq!(engine.active_transactions(), 0);
    }

    #[test]
    fn reset_frees_phantom_keys_without_the_marker() {
        let config = ProbeConfig::default();
        let (controller, engine) = controller(&config);
        let fixture = &config.fixture;
        engine.seed(&fixture.phantom_key, RowImage::new("left behind", None));
        engine.seed(&fixture.seed_key, RowImage::new("left behind", Some("other".into())));

        controller.reset(ScenarioKind::PhantomRead).unwrap();
        assert_eq!(engine.committed_text(&fixture.phantom_key), None);
        assert_eq!(
            engine.committed_text(&fixture.seed_key).as_deref(),
            Some(SEED_TEXT)
        );
        assert_eq!(engine.committed_marked(&fixture.phantom_marker), 1);
    }

    #[test]
    fn unreachable_target_is_a_fixture_error() {
        let config = ProbeConfig::default();
        let (controller, engine) = controller(&config);
        engine.set_available(false);
        let err = controller.reset(ScenarioKind::ReadRead).unwrap_err();
        assert!(matches!(err, ProbeError::Fixture(_)));
    }

    #[test]
    fn reset_waits_for_settling() {
        let mut config = ProbeConfig::default();
        config.target.settle_ms = 60;
        let (controller, _engine) = controller(&config);
        let started = std::time::Instant::now();
        controller.reset(ScenarioKind::ReadRead).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
