use async_trait::async_trait;
use bevy::log::{debug, info};
use gloo_net::http::Request;
use js_sys::{Reflect, Uint8Array};
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{AbortController, ReadableStreamDefaultReader};

use super::{
    ASK_STREAM_PATH, AskRequest, BUILD_PATH, BoxByteStream, ByteStream, HEALTH_PATH, Health,
    STARTERS_PATH, Starters, Transport, classify_open_failure,
};
use crate::cancel::CancelHandle;
use crate::config::ChatConfig;
use crate::error::{BuildError, OpenError, TransportError};

/// browser transport on `fetch`; the body is read through its
/// `ReadableStream` reader and aborted with an `AbortController`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    base: String,
}

impl HttpTransport {
    pub fn new(config: &ChatConfig) -> Self {
        Self { base: config.base_url() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let resp = Request::get(&self.url(path))
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        if !resp.ok() {
            return Err(TransportError::Status { status: resp.status() });
        }
        resp.json::<T>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

fn js_err(value: JsValue) -> TransportError {
    TransportError::Body(format!("{value:?}"))
}

#[async_trait(?Send)]
impl Transport for HttpTransport {
    async fn health(&self) -> Result<Health, TransportError> {
        self.get_json::<Health>(HEALTH_PATH).await
    }

    async fn starters(&self) -> Result<Vec<String>, TransportError> {
        self.get_json::<Starters>(STARTERS_PATH).await.map(|s| s.starters)
    }

    async fn build(&self) -> Result<(), BuildError> {
        let url = self.url(BUILD_PATH);
        info!(target: "bevy_rag_chat", "POST {}", url);
        let resp = Request::post(&url)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        if resp.ok() {
            Ok(())
        } else {
            Err(BuildError::Rejected { status: resp.status() })
        }
    }

    async fn open_stream(
        &self,
        request: &AskRequest,
        cancel: &CancelHandle,
    ) -> Result<BoxByteStream, OpenError> {
        let url = self.url(ASK_STREAM_PATH);
        info!(target: "bevy_rag_chat", "POST {} (question len={})", url, request.question.len());

        let controller = AbortController::new().map_err(js_err)?;
        let resp = Request::post(&url)
            .abort_signal(Some(&controller.signal()))
            .json(request)
            .map_err(|e| TransportError::Encode(e.to_string()))?
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !resp.ok() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_open_failure(status, &text));
        }

        let body = resp.body().ok_or(OpenError::NoBody)?;
        let reader = body.get_reader().unchecked_into::<ReadableStreamDefaultReader>();
        Ok(Box::new(FetchStream { reader, controller, cancel: cancel.clone(), finished: false }))
    }
}

struct FetchStream {
    reader: ReadableStreamDefaultReader,
    controller: AbortController,
    cancel: CancelHandle,
    finished: bool,
}

impl FetchStream {
    fn abort(&mut self) {
        if !self.finished {
            self.finished = true;
            self.controller.abort();
        }
    }
}

#[async_trait(?Send)]
impl ByteStream for FetchStream {
    async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        if self.finished {
            return None;
        }
        if self.cancel.is_cancelled() {
            debug!(target: "bevy_rag_chat", "fetch stream: cancelled");
            self.abort();
            return None;
        }

        let result = match JsFuture::from(self.reader.read()).await {
            Ok(v) => v,
            Err(e) => {
                self.finished = true;
                return Some(Err(js_err(e)));
            }
        };
        let done = Reflect::get(&result, &JsValue::from_str("done"))
            .ok()
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if done {
            self.finished = true;
            return None;
        }
        let value = match Reflect::get(&result, &JsValue::from_str("value")) {
            Ok(v) => v,
            Err(e) => return Some(Err(js_err(e))),
        };
        Some(Ok(Uint8Array::new(&value).to_vec()))
    }
}

impl Drop for FetchStream {
    fn drop(&mut self) {
        self.abort();
    }
}
