pub mod agent;
pub mod cleanup;
pub mod config;
pub mod dataplane;
pub mod http;
pub mod metrics;
pub mod network;
pub mod pod;
pub mod provision;
pub mod storage;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("dataplane error: {0}")]
    Dataplane(String),

    #[error("dataplane resource not found: {0}")]
    NotFound(String),

    #[error("network not found {0}")]
    NetworkNotFound(String),

    #[error("invalid allowed spoofing prefixes annotation: {0}")]
    InvalidAnnotation(String),

    #[error("{step}: {source}")]
    Provision {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("unsupported save file version: {found} (expected {expected})")]
    UnsupportedStateVersion { expected: u32, found: u32 },

    #[error("failed to decode state file: {0}")]
    StateDecode(String),

    #[error("failed to encode state file: {0}")]
    StateEncode(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error("failed to parse networks config: {0}")]
    YamlConversion(#[from] serde_yaml::Error),

    #[error("task failed: {0}")]
    Task(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wraps a failed forward step so the caller can tell which step aborted.
    pub fn provision(step: &'static str, source: Error) -> Self {
        Self::Provision {
            step,
            source: Box::new(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Provision { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}
