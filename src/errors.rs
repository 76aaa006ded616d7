use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Statement error: {0}")]
    Statement(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Fixture error: {0}")]
    Fixture(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Serializable tag of a [`ProbeError`], carried inside observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Configuration,
    Statement,
    Timeout,
    Fixture,
    Other,
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::Connection(_) => ErrorKind::Connection,
            ProbeError::Configuration(_) => ErrorKind::Configuration,
            ProbeError::Statement(_) => ErrorKind::Statement,
            ProbeError::Timeout(_) => ErrorKind::Timeout,
            ProbeError::Fixture(_) => ErrorKind::Fixture,
            ProbeError::Io(_) | ProbeError::Other(_) => ErrorKind::Other,
        }
    }

    /// Re-tags any failure raised while preparing fixtures.
    pub fn into_fixture(self) -> ProbeError {
        match self {
            ProbeError::Fixture(msg) => ProbeError::Fixture(msg),
            other => ProbeError::Fixture(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for ProbeError {
    fn from(err: toml::de::Error) -> Self {
        ProbeError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for ProbeError {
    fn from(err: serde_json::Error) -> Self {
        ProbeError::Other(format!("json: {err}"))
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for ProbeError {
    fn from(err: rusqlite::Error) -> Self {
        ProbeError::Statement(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_retag_keeps_message() {
        let err = ProbeError::Statement("lock wait timeout exceeded".into()).into_fixture();
        assert_eq!(err.kind(), ErrorKind::Fixture);
        assert!(err.to_string().contains("lock wait timeout"));
    }

    #[test]
    fn io_errors_are_other() {
        let err: ProbeError = std::io::Error::other("boom").into();
        assert_eq!(err.kind(), ErrorKind::Other);
    }
}
