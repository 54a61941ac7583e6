//! the streaming session controller.
//!
//! a [`ChatSession`] owns readiness, the transcript and the in-flight flag.
//! `send` borrows the session mutably for the whole exchange, so only one
//! decode loop can ever be live; out-of-band cancellation goes through a
//! cloned [`CancelHandle`].

use std::future::Future;

use bevy::log::{debug, error, info, warn};
use flume::{Receiver, Sender};
use futures_lite::future;

use crate::cancel::{CancelHandle, StreamingGuard};
use crate::error::{BuildError, SendError, TransportError};
use crate::event::StreamEvent;
use crate::frame::FrameDecoder;
use crate::transcript::{ReplySlot, Transcript};
use crate::transport::{AskRequest, BoxByteStream, Health, Transport};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Readiness {
    #[default]
    Unbuilt,
    Building,
    Ready,
}

/// how a stream that was opened came to an end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamEnd {
    /// the server sent `done`.
    Done,
    /// the body ended without `done`.
    Eof,
    Cancelled,
}

/// a finished exchange: where the reply lives and why it stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Exchange {
    pub slot: ReplySlot,
    pub end: StreamEnd,
}

/// progress published to observers, in the order it happened.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    Readiness(Readiness),
    StreamStarted { slot: ReplySlot, question: String },
    Delta { slot: ReplySlot, text: String },
    Sources { slot: ReplySlot, sources: Vec<String> },
    StreamEnded { slot: ReplySlot, end: StreamEnd },
    StreamFailed { slot: ReplySlot, error: String },
    BuildFailed { error: String },
    Cleared,
    /// the draft was replaced; a started stream empties it implicitly.
    Draft(String),
    Health(Health),
    Starters(Vec<String>),
}

/// open attempts for one `send`; the missing-index rebuild moves
/// `First` to `Retried`, and nothing moves past `Retried`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    First,
    Retried,
}

pub struct ChatSession<T: Transport> {
    transport: T,
    readiness: Readiness,
    transcript: Transcript,
    draft: String,
    health: Option<Health>,
    starters: Vec<String>,
    cancel: CancelHandle,
    observers: Vec<Sender<SessionUpdate>>,
}

impl<T: Transport> ChatSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            readiness: Readiness::Unbuilt,
            transcript: Transcript::new(),
            draft: String::new(),
            health: None,
            starters: Vec::new(),
            cancel: CancelHandle::new(),
            observers: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn is_streaming(&self) -> bool {
        self.cancel.is_streaming()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
        self.publish(SessionUpdate::Draft(self.draft.clone()));
    }

    pub fn health(&self) -> Option<&Health> {
        self.health.as_ref()
    }

    pub fn starters(&self) -> &[String] {
        &self.starters
    }

    /// out-of-band handle; `cancel()` on it aborts the running `send`.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// new observer channel. updates sent to a dropped receiver are discarded.
    pub fn subscribe(&mut self) -> Receiver<SessionUpdate> {
        let (tx, rx) = flume::unbounded();
        self.observers.push(tx);
        rx
    }

    fn publish(&mut self, update: SessionUpdate) {
        self.observers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn set_readiness(&mut self, readiness: Readiness) {
        if self.readiness != readiness {
            debug!(target: "bevy_rag_chat", "readiness {:?} -> {:?}", self.readiness, readiness);
            self.readiness = readiness;
            self.publish(SessionUpdate::Readiness(readiness));
        }
    }

    /// ask the service to build its index. the only way to become `Ready`.
    pub async fn build(&mut self) -> Result<(), BuildError> {
        self.set_readiness(Readiness::Building);
        match self.transport.build().await {
            Ok(()) => {
                info!(target: "bevy_rag_chat", "index ready");
                self.set_readiness(Readiness::Ready);
                Ok(())
            }
            Err(err) => {
                error!(target: "bevy_rag_chat", "index build failed: {}", err);
                self.set_readiness(Readiness::Unbuilt);
                self.publish(SessionUpdate::BuildFailed { error: err.to_string() });
                Err(err)
            }
        }
    }

    /// best-effort refresh of `/health` and `/starters`.
    pub async fn probe(&mut self) {
        let health = match self.transport.health().await {
            Ok(health) => health,
            Err(err) => {
                warn!(target: "bevy_rag_chat", "health probe failed: {}", err);
                Health::degraded()
            }
        };
        self.health = Some(health.clone());
        self.publish(SessionUpdate::Health(health));

        let starters = self.transport.starters().await.unwrap_or_else(|err| {
            warn!(target: "bevy_rag_chat", "starters fetch failed: {}", err);
            Vec::new()
        });
        self.starters = starters.clone();
        self.publish(SessionUpdate::Starters(starters));
    }

    /// send the current draft.
    pub async fn submit(&mut self) -> Result<Exchange, SendError> {
        let question = self.draft.clone();
        self.send(&question).await
    }

    /// ask `question` and stream the answer into the transcript.
    ///
    /// blank questions and calls while streaming are rejected untouched. an
    /// unbuilt index is built first. a missing-index answer from the service
    /// triggers exactly one rebuild and one retry.
    pub async fn send(&mut self, question: &str) -> Result<Exchange, SendError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(SendError::Blank);
        }
        if self.cancel.is_busy() {
            return Err(SendError::Busy);
        }
        if self.readiness != Readiness::Ready {
            self.build().await.map_err(SendError::NotReady)?;
        }

        let slot = self.transcript.begin_exchange(question);
        self.draft.clear();
        let guard = self.cancel.begin();
        info!(target: "bevy_rag_chat", "send: question len={} slot={}", question.len(), slot.index());
        self.publish(SessionUpdate::StreamStarted { slot, question: question.to_string() });

        let request = AskRequest::new(question);
        let outcome = match self.open_with_recovery(&request, slot, &guard).await {
            Ok(Some(stream)) => self
                .pump(stream, slot, guard.handle())
                .await
                .map_err(|source| SendError::Stream { slot, source }),
            Ok(None) => Ok(StreamEnd::Cancelled),
            Err(err) => Err(err),
        };
        drop(guard);

        match outcome {
            Ok(end) => {
                info!(target: "bevy_rag_chat", "stream ended: {:?}", end);
                self.publish(SessionUpdate::StreamEnded { slot, end });
                Ok(Exchange { slot, end })
            }
            Err(err) => {
                error!(target: "bevy_rag_chat", "send failed: {}", err);
                self.publish(SessionUpdate::StreamFailed { slot, error: error_chain(&err) });
                Err(err)
            }
        }
    }

    /// abort the in-flight stream, if any.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// empty the transcript. refused (returns `false`) while an exchange runs.
    pub fn clear(&mut self) -> bool {
        if self.cancel.is_busy() {
            return false;
        }
        self.transcript.clear();
        self.publish(SessionUpdate::Cleared);
        true
    }

    /// `Ok(None)` when cancelled before a stream was obtained.
    async fn open_with_recovery(
        &mut self,
        request: &AskRequest,
        slot: ReplySlot,
        guard: &StreamingGuard,
    ) -> Result<Option<BoxByteStream>, SendError> {
        let mut attempt = Attempt::First;
        loop {
            let opened = until_cancelled(
                guard.handle(),
                self.transport.open_stream(request, guard.handle()),
            )
            .await;
            match opened {
                None => return Ok(None),
                Some(Ok(stream)) => return Ok(Some(stream)),
                Some(Err(err)) if err.is_index_missing() && attempt == Attempt::First => {
                    warn!(target: "bevy_rag_chat", "{}; rebuilding once and retrying", err);
                    // the index is not ready while it rebuilds
                    guard.pause();
                    self.build()
                        .await
                        .map_err(|source| SendError::Rebuild { slot, source })?;
                    if !guard.resume() {
                        info!(target: "bevy_rag_chat", "cancelled during rebuild; not retrying");
                        return Ok(None);
                    }
                    attempt = Attempt::Retried;
                }
                Some(Err(source)) => return Err(SendError::Open { slot, source }),
            }
        }
    }

    /// decode loop: reads until `done`, end of body, cancel or error.
    async fn pump(
        &mut self,
        mut stream: BoxByteStream,
        slot: ReplySlot,
        cancel: &CancelHandle,
    ) -> Result<StreamEnd, TransportError> {
        let mut decoder = FrameDecoder::new();
        loop {
            let bytes = match until_cancelled(cancel, stream.next_chunk()).await {
                None => return Ok(StreamEnd::Cancelled),
                Some(None) => {
                    let dropped = decoder.finish();
                    if dropped > 0 {
                        debug!(target: "bevy_rag_chat", "discarding {} unterminated bytes", dropped);
                    }
                    return Ok(StreamEnd::Eof);
                }
                Some(Some(Err(err))) => return Err(err),
                Some(Some(Ok(bytes))) => bytes,
            };

            for frame in decoder.feed_bytes(&bytes) {
                if cancel.is_cancelled() {
                    return Ok(StreamEnd::Cancelled);
                }
                let Some(event) = StreamEvent::interpret(&frame) else {
                    continue;
                };
                if event == StreamEvent::Done {
                    // stops the transport's reader as well
                    cancel.cancel();
                    return Ok(StreamEnd::Done);
                }
                let Some(reply) = self.transcript.reply_mut(slot) else {
                    continue;
                };
                event.apply(reply);
                let update = match event {
                    StreamEvent::Delta(text) => SessionUpdate::Delta { slot, text },
                    StreamEvent::Sources(sources) => SessionUpdate::Sources { slot, sources },
                    StreamEvent::Done => continue,
                };
                self.publish(update);
            }
        }
    }
}

/// race `fut` against cancellation; `None` once cancelled.
async fn until_cancelled<F: Future>(cancel: &CancelHandle, fut: F) -> Option<F::Output> {
    if cancel.is_cancelled() {
        return None;
    }
    future::or(async { Some(fut.await) }, async {
        cancel.cancelled().await;
        None
    })
    .await
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

impl<T: Transport> std::fmt::Debug for ChatSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("readiness", &self.readiness)
            .field("streaming", &self.is_streaming())
            .field("messages", &self.transcript.len())
            .finish()
    }
}
