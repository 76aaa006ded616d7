//! Empirical probing of transaction isolation levels.
//!
//! For each isolation level, `isoprobe` runs a fixed catalog of multi-worker
//! concurrency scenarios against a store and records what each worker
//! actually observed: values read, statement durations, and how each
//! transaction ended. A verdict function turns the observations of every
//! run into anomaly-observed, anomaly-absent or inconclusive, and the report sets
//! that against the documented behaviour of the level.
//!
//! ```no_run
//! use std::sync::Arc;
//! use isoprobe::{ProbeConfig, Runner, backend};
//!
//! let config = Arc::new(ProbeConfig::default());
//! let factory = backend::build_factory(&config).unwrap();
//! let report = Runner::new(config, factory).run();
//! println!("{report}");
//! ```

pub mod backend;
pub mod config;
pub mod errors;
pub mod fixture;
pub mod interleave;
pub mod isolation;
pub mod observation;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod session;
pub mod verdict;
pub mod worker;

pub use config::{Backend, ProbeConfig};
pub use errors::{ErrorKind, ProbeError, Result};
pub use fixture::FixtureController;
pub use isolation::IsolationLevel;
pub use observation::{Observation, Terminal};
pub use report::{MatrixReport, Round, Summary};
pub use runner::{Runner, ScenarioOutcome};
pub use scenario::{Expectation, Scenario, ScenarioKind};
pub use session::{Session, SessionFactory, SessionGuard, SessionProvider, Statement};
pub use verdict::{Judge, Judgement, Verdict};
