//! transport seam between the session and the chatbot service.
//!
//! - native: [`HttpTransport`] on `ureq`, blocking reads run on tokio's
//!   blocking pool and are forwarded over a `flume` channel.
//! - wasm: [`HttpTransport`] on `gloo-net`, reading the fetch body's
//!   `ReadableStream`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelHandle;
use crate::error::{BuildError, OpenError, TransportError};

#[cfg(not(target_arch = "wasm32"))]
mod http;
#[cfg(not(target_arch = "wasm32"))]
pub use http::HttpTransport;

#[cfg(target_arch = "wasm32")]
mod web;
#[cfg(target_arch = "wasm32")]
pub use web::HttpTransport;

pub const HEALTH_PATH: &str = "/health";
pub const STARTERS_PATH: &str = "/starters";
pub const BUILD_PATH: &str = "/build";
pub const ASK_STREAM_PATH: &str = "/ask-stream";

const INDEX_MISSING_MARKER: &str = "Index not found";
const INDEX_MISSING_CODE: &str = "index_not_found";

/// `Send` on native; nothing on wasm where futures are single-threaded.
#[cfg(not(target_arch = "wasm32"))]
pub trait MaybeSend: Send {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send + ?Sized> MaybeSend for T {}

#[cfg(target_arch = "wasm32")]
pub trait MaybeSend {}
#[cfg(target_arch = "wasm32")]
impl<T: ?Sized> MaybeSend for T {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AskRequest {
    pub question: String,
}

impl AskRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self { question: question.into() }
    }
}

/// `/health` payload. only `status` is guaranteed.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Health {
    pub status: String,
    #[serde(default)]
    pub ollama: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Health {
    pub const DEGRADED: &'static str = "error";

    /// marker stored when the health probe itself failed.
    pub fn degraded() -> Self {
        Self {
            status: Self::DEGRADED.to_string(),
            ollama: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.status == Self::DEGRADED
    }

    /// `ollama` rendered for display, whatever json type the service used.
    pub fn ollama_label(&self) -> Option<String> {
        self.ollama.as_ref().map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Starters {
    #[serde(default)]
    pub starters: Vec<String>,
}

/// body chunks of an opened answer stream.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait ByteStream: MaybeSend {
    /// `None` at end of body.
    async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

pub type BoxByteStream = Box<dyn ByteStream>;

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait Transport: MaybeSend + Sync {
    async fn health(&self) -> Result<Health, TransportError>;

    async fn starters(&self) -> Result<Vec<String>, TransportError>;

    /// POST `/build`; any non-2xx is a rejection.
    async fn build(&self) -> Result<(), BuildError>;

    /// POST `/ask-stream`. `cancel` stays tied to the returned stream: a
    /// cancelled handle must stop further reads.
    async fn open_stream(
        &self,
        request: &AskRequest,
        cancel: &CancelHandle,
    ) -> Result<BoxByteStream, OpenError>;
}

/// turn a non-success `/ask-stream` answer into an [`OpenError`].
pub fn classify_open_failure(status: u16, body: &str) -> OpenError {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").cloned());

    if status == 400
        && let Some(detail) = &detail
        && signals_missing_index(detail)
    {
        return OpenError::IndexMissing { detail: detail_text(detail) };
    }

    OpenError::Status {
        status,
        detail: detail.as_ref().map(detail_text),
    }
}

fn signals_missing_index(detail: &serde_json::Value) -> bool {
    match detail {
        serde_json::Value::String(s) => s.contains(INDEX_MISSING_MARKER),
        serde_json::Value::Object(map) => {
            map.get("code").and_then(|c| c.as_str()) == Some(INDEX_MISSING_CODE)
                || map
                    .get("message")
                    .and_then(|m| m.as_str())
                    .is_some_and(|m| m.contains(INDEX_MISSING_MARKER))
        }
        _ => false,
    }
}

fn detail_text(detail: &serde_json::Value) -> String {
    match detail {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
