//! Stores the probe can run against.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use log::info;

use crate::config::{Backend, ProbeConfig};
use crate::errors::{ProbeError, Result};
use crate::session::SessionFactory;
use memory::{MemoryEngine, MemoryFactory};

/// Builds the session factory for the configured target, preparing the
/// target's storage where the backend needs it.
pub fn build_factory(config: &ProbeConfig) -> Result<Arc<dyn SessionFactory>> {
    let target = &config.target;
    let label = target.label();
    info!("connecting to target {label} ({})", target.backend);
    match target.backend {
        Backend::Memory => {
            let engine = Arc::new(MemoryEngine::new(target.lock_wait_timeout()));
            Ok(Arc::new(MemoryFactory::new(engine, label)))
        }
        Backend::Sqlite => sqlite_factory(config, label),
    }
}

#[cfg(feature = "sqlite")]
fn sqlite_factory(config: &ProbeConfig, label: String) -> Result<Arc<dyn SessionFactory>> {
    let target = &config.target;
    let path = target.sqlite_path.as_ref().ok_or_else(|| {
        ProbeError::Configuration("sqlite target requires sqlite_path".into())
    })?;
    let factory = sqlite::SqliteFactory::new(
        path,
        config.fixture.schema.clone(),
        target.lock_wait_timeout(),
        label,
    )?;
    factory
        .prepare(target.create_schema)
        .map_err(|err| match err {
            ProbeError::Statement(msg) => ProbeError::Connection(msg),
            other => other,
        })?;
    Ok(Arc::new(factory))
}

#[cfg(not(feature = "sqlite"))]
fn sqlite_factory(_config: &ProbeConfig, _label: String) -> Result<Arc<dyn SessionFactory>> {
    Err(ProbeError::Configuration(
        "built without the `sqlite` feature".into(),
    ))
}
