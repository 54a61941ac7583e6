use std::io::Read;

use async_trait::async_trait;
use bevy::log::{debug, info, warn};
use flume::{Receiver, Sender};
use ureq::Agent;

use super::{
    ASK_STREAM_PATH, AskRequest, BUILD_PATH, BoxByteStream, ByteStream, HEALTH_PATH, Health,
    STARTERS_PATH, Starters, Transport, classify_open_failure,
};
use crate::cancel::CancelHandle;
use crate::config::ChatConfig;
use crate::error::{BuildError, OpenError, TransportError};

const READ_CHUNK: usize = 8 * 1024;
// chunks in flight between the reader thread and the decode loop
const CHANNEL_DEPTH: usize = 64;

/// native transport: `ureq` is blocking, so every call runs on tokio's
/// blocking pool and the body is pumped through a bounded channel.
#[derive(Clone)]
pub struct HttpTransport {
    agent: Agent,
    base: String,
}

impl HttpTransport {
    pub fn new(config: &ChatConfig) -> Self {
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(config.connect_timeout()))
            // bounds the body reader thread when a server goes quiet after a cancel
            .timeout_recv_body(Some(config.stream_timeout()))
            .build()
            .into();
        Self { agent, base: config.base_url() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn blocking<T, F>(f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| TransportError::Worker(e.to_string()))?
    }

    fn get_json<T: serde::de::DeserializeOwned>(agent: &Agent, url: &str) -> Result<T, TransportError> {
        let mut res = agent
            .get(url)
            .header("accept", "application/json")
            .call()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            return Err(TransportError::Status { status: status.as_u16() });
        }
        let text = res
            .body_mut()
            .read_to_string()
            .map_err(|e| TransportError::Body(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn health(&self) -> Result<Health, TransportError> {
        let agent = self.agent.clone();
        let url = self.url(HEALTH_PATH);
        Self::blocking(move || Self::get_json::<Health>(&agent, &url)).await
    }

    async fn starters(&self) -> Result<Vec<String>, TransportError> {
        let agent = self.agent.clone();
        let url = self.url(STARTERS_PATH);
        Self::blocking(move || Self::get_json::<Starters>(&agent, &url))
            .await
            .map(|s| s.starters)
    }

    async fn build(&self) -> Result<(), BuildError> {
        let agent = self.agent.clone();
        let url = self.url(BUILD_PATH);
        info!(target: "bevy_rag_chat", "POST {}", url);
        let status = Self::blocking(move || {
            agent
                .post(&url)
                .send_empty()
                .map(|res| res.status().as_u16())
                .map_err(|e| TransportError::Network(e.to_string()))
        })
        .await?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(BuildError::Rejected { status })
        }
    }

    async fn open_stream(
        &self,
        request: &AskRequest,
        cancel: &CancelHandle,
    ) -> Result<BoxByteStream, OpenError> {
        let agent = self.agent.clone();
        let url = self.url(ASK_STREAM_PATH);
        let body = serde_json::to_vec(request).map_err(|e| TransportError::Encode(e.to_string()))?;
        info!(target: "bevy_rag_chat", "POST {} (question len={})", url, request.question.len());

        let res = Self::blocking(move || {
            agent
                .post(&url)
                .header("content-type", "application/json")
                .header("accept", "text/event-stream")
                .send(&body[..])
                .map_err(|e| TransportError::Network(e.to_string()))
        })
        .await?;

        let status = res.status().as_u16();
        if !res.status().is_success() {
            let text = Self::blocking(move || {
                let mut res = res;
                res.body_mut()
                    .read_to_string()
                    .map_err(|e| TransportError::Body(e.to_string()))
            })
            .await
            .unwrap_or_default();
            return Err(classify_open_failure(status, &text));
        }

        let reader = res.into_body().into_reader();
        let (tx, rx) = flume::bounded(CHANNEL_DEPTH);
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || pump_body(reader, tx, cancel));
        Ok(Box::new(ChannelStream { rx }))
    }
}

/// reader side: runs until eof, error, cancel or the consumer hanging up.
fn pump_body(
    mut reader: impl Read,
    tx: Sender<Result<Vec<u8>, TransportError>>,
    cancel: CancelHandle,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if cancel.is_cancelled() {
            debug!(target: "bevy_rag_chat", "body reader: cancelled");
            return;
        }
        match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(target: "bevy_rag_chat", "body reader: {}", err);
                let _ = tx.send(Err(TransportError::Body(err.to_string())));
                return;
            }
        }
    }
}

struct ChannelStream {
    rx: Receiver<Result<Vec<u8>, TransportError>>,
}

#[async_trait]
impl ByteStream for ChannelStream {
    async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        // a closed channel is end of body; errors travel as items
        self.rx.recv_async().await.ok()
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").field("base", &self.base).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn url_joins_normalised_base() {
        let t = HttpTransport::new(&ChatConfig::with_api_base("http://localhost:8000/nomad-oasis/"));
        assert_eq!(t.url(ASK_STREAM_PATH), "http://localhost:8000/nomad-oasis/chatbot-api/ask-stream");
    }

    #[test]
    fn pump_forwards_body_then_closes() {
        let (tx, rx) = flume::bounded(CHANNEL_DEPTH);
        let cancel = CancelHandle::new();
        pump_body(Cursor::new(b"event:done\n\n".to_vec()), tx, cancel);
        let chunks: Vec<_> = rx.drain().map(|c| c.unwrap()).collect();
        assert_eq!(chunks.concat(), b"event:done\n\n".to_vec());
    }

    #[test]
    fn pump_stops_when_cancelled() {
        let (tx, rx) = flume::bounded(CHANNEL_DEPTH);
        let cancel = CancelHandle::new();
        let _guard = cancel.begin();
        cancel.cancel();
        pump_body(Cursor::new(b"data:x\n\n".to_vec()), tx, cancel);
        assert!(rx.drain().next().is_none());
    }

    #[test]
    fn pump_gives_up_on_a_timed_out_body() {
        struct Quiet;
        impl Read for Quiet {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::ErrorKind::TimedOut.into())
            }
        }

        let (tx, rx) = flume::bounded(CHANNEL_DEPTH);
        pump_body(Quiet, tx, CancelHandle::new());
        let items: Vec<_> = rx.drain().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(TransportError::Body(_))));
    }

    #[test]
    fn agent_bounds_body_reads() {
        let config = ChatConfig { stream_timeout_secs: 7, ..ChatConfig::default() };
        let t = HttpTransport::new(&config);
        assert_eq!(t.agent.config().timeouts().recv_body, Some(config.stream_timeout()));
    }

    #[test]
    fn channel_stream_ends_when_sender_drops() {
        let (tx, rx) = flume::bounded(2);
        tx.send(Ok(b"a".to_vec())).unwrap();
        drop(tx);
        let mut s = ChannelStream { rx };
        pollster::block_on(async {
            assert_eq!(s.next_chunk().await.unwrap().unwrap(), b"a".to_vec());
            assert!(s.next_chunk().await.is_none());
        });
    }

    #[tokio::test]
    async fn unreachable_service_fails_softly() {
        let t = HttpTransport::new(&ChatConfig {
            api_base: "http://127.0.0.1:1".into(),
            connect_timeout_secs: 1,
            ..ChatConfig::default()
        });
        assert!(t.health().await.is_err());
        assert!(matches!(t.build().await, Err(BuildError::Transport(_))));
        let cancel = CancelHandle::new();
        assert!(matches!(
            t.open_stream(&AskRequest::new("q"), &cancel).await,
            Err(OpenError::Transport(_))
        ));
    }
}
