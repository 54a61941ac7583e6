//! error families for the transport, the build/ask flows and configuration.

use thiserror::Error;

use crate::transcript::ReplySlot;

/// low-level failures talking to the chatbot service.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("unexpected status {status}")]
    Status { status: u16 },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("transport worker stopped: {0}")]
    Worker(String),
}

/// why `/ask-stream` could not be opened.
#[derive(Debug, Error)]
pub enum OpenError {
    /// the service has no index yet; the one case that triggers a rebuild.
    #[error("remote index is missing: {detail}")]
    IndexMissing { detail: String },
    #[error("ask-stream rejected with status {status}")]
    Status { status: u16, detail: Option<String> },
    #[error("ask-stream response has no body")]
    NoBody,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl OpenError {
    pub fn is_index_missing(&self) -> bool {
        matches!(self, OpenError::IndexMissing { .. })
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("index build rejected with status {status}")]
    Rejected { status: u16 },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// outcome of a `send` that did not finish with a completed stream.
///
/// `Blank`, `Busy` and `NotReady` leave the transcript untouched. the
/// remaining variants carry the reply slot that was opened and left as-is.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("question is empty")]
    Blank,
    #[error("a stream is already in flight")]
    Busy,
    #[error("index is not ready")]
    NotReady(#[source] BuildError),
    #[error("failed to open answer stream")]
    Open {
        slot: ReplySlot,
        #[source]
        source: OpenError,
    },
    #[error("index rebuild after missing-index failed")]
    Rebuild {
        slot: ReplySlot,
        #[source]
        source: BuildError,
    },
    #[error("answer stream broke off")]
    Stream {
        slot: ReplySlot,
        #[source]
        source: TransportError,
    },
}

impl SendError {
    /// the reply slot left behind by a failed exchange, if one was opened.
    pub fn slot(&self) -> Option<ReplySlot> {
        match self {
            SendError::Open { slot, .. }
            | SendError::Rebuild { slot, .. }
            | SendError::Stream { slot, .. } => Some(*slot),
            SendError::Blank | SendError::Busy | SendError::NotReady(_) => None,
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, SendError::Blank | SendError::Busy)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: &'static str, value: String },
}
