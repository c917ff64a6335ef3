use std::fmt;

use thiserror::Error;

use crate::request::FetchRequest;

pub type Result<T> = std::result::Result<T, Error>;

/// The part of the scheduling core that raised a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Fingerprinter,
    DupeFilter,
    Queue,
    JobDir,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Fingerprinter => "fingerprinter",
            Component::DupeFilter => "dupefilter",
            Component::Queue => "queue",
            Component::JobDir => "jobdir",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Halts the crawl. `key` names the slot, file or request that failed so
    /// the job directory can be inspected before resuming.
    #[error("fatal {component} error on {key:?}: {reason}")]
    Fatal {
        component: Component,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Storage(#[from] rocksdb::Error),
}

impl Error {
    pub fn fatal(component: Component, key: impl Into<String>, reason: impl ToString) -> Self {
        Error::Fatal {
            component,
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why a downstream queue refused an item.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Retryable storage hiccup. The item goes to the memory fallback.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// The item can never be persisted. It stays in memory for good.
    #[error("cannot serialize request: {0}")]
    Serialization(String),

    /// Anything else. The crawl must stop.
    #[error("{0}")]
    Fatal(String),
}

/// A rejected push. Carries the request back so the caller can re-home it.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct PushError {
    pub request: Box<FetchRequest>,
    #[source]
    pub kind: QueueError,
}

impl PushError {
    pub fn new(request: FetchRequest, kind: QueueError) -> Self {
        Self {
            request: Box::new(request),
            kind,
        }
    }

    pub fn into_request(self) -> FetchRequest {
        *self.request
    }
}
