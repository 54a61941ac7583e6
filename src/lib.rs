//! bevy_rag_chat: streamed chat with a retrieval-augmented backend.
//!
//! - [`ChatSession`] is the controller: readiness (`unbuilt`/`building`/
//!   `ready`), the transcript, the in-flight flag, build-before-ask and the
//!   one-shot rebuild-and-retry when the service reports a missing index.
//! - the wire format is blank-line delimited `event:`/`data:` frames
//!   (`chunk`, `meta`, `done`), decoded by [`FrameDecoder`] and mapped by
//!   [`StreamEvent`].
//! - [`RagChatPlugin`] runs one session off the main thread and mirrors it
//!   into bevy: intents go in through [`ChatClient`], progress comes out as
//!   `Chat*` events and the [`ChatView`] resource. rendering is left to you.
//! - never blocks the main thread: on native the session runs on a tiny
//!   tokio runtime; on wasm on bevy's io pool.
//!
//! service endpoints (under `<api_base>/chatbot-api`):
//!   - `GET /health`, `GET /starters`: best-effort probes
//!   - `POST /build`: build the index
//!   - `POST /ask-stream` with `{ "question": ... }`: the answer stream

use bevy::prelude::*;
use flume::{Receiver, Sender, TryRecvError};
use std::collections::HashMap;
#[cfg(not(target_arch = "wasm32"))]
use std::sync::Arc;

pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod session;
pub mod transcript;
pub mod transport;

pub use cancel::CancelHandle;
pub use config::ChatConfig;
pub use error::{BuildError, ConfigError, OpenError, SendError, TransportError};
pub use event::StreamEvent;
pub use frame::{Frame, FrameDecoder};
pub use session::{ChatSession, Exchange, Readiness, SessionUpdate, StreamEnd};
pub use transcript::{Message, ReplySlot, Role, Transcript};
pub use transport::{AskRequest, ByteStream, Health, HttpTransport, Transport};

/// on native we keep a tiny tokio runtime for the session driver and the
/// blocking http reads.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_rag_chat", "RagChatPlugin: initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum RagChatSet {
    /// session updates are turned into events here (in `Update`)
    Drain,
}

/// user intents, processed by the session driver in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatIntent {
    Build,
    Send(String),
    SetDraft(String),
    Submit,
    Clear,
    Probe,
}

/// the ecs side of the running session.
///
/// intents are queued; `cancel` bypasses the queue so it can interrupt a
/// stream the driver is busy with.
#[derive(Resource, Clone)]
pub struct ChatClient {
    intents: Sender<ChatIntent>,
    cancel: CancelHandle,
}

impl ChatClient {
    pub fn new(cancel: CancelHandle) -> (Self, Receiver<ChatIntent>) {
        let (intents, rx) = flume::unbounded();
        (Self { intents, cancel }, rx)
    }

    fn push(&self, intent: ChatIntent) -> bool {
        self.intents.send(intent).is_ok()
    }

    /// queue a question. blank text and sends while an exchange runs are
    /// dropped here; returns whether the intent was queued.
    pub fn send(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        let question = text.trim();
        if question.is_empty() || self.is_busy() {
            debug!(target: "bevy_rag_chat", "send ignored (blank={}, busy={})", question.is_empty(), self.is_busy());
            return false;
        }
        info!(target: "bevy_rag_chat", "send -> '{}' (len={})", question, question.len());
        self.push(ChatIntent::Send(question.to_string()))
    }

    /// replace the session's draft. mirrored back through `ChatView::draft`.
    pub fn set_draft(&self, text: impl Into<String>) -> bool {
        self.push(ChatIntent::SetDraft(text.into()))
    }

    /// send the session's draft; a blank draft is rejected by the session.
    pub fn submit(&self) -> bool {
        !self.is_busy() && self.push(ChatIntent::Submit)
    }

    pub fn build(&self) -> bool {
        self.push(ChatIntent::Build)
    }

    /// refused while an exchange runs, including its index rebuild.
    pub fn clear(&self) -> bool {
        !self.is_busy() && self.push(ChatIntent::Clear)
    }

    pub fn probe(&self) -> bool {
        self.push(ChatIntent::Probe)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_streaming(&self) -> bool {
        self.cancel.is_streaming()
    }

    pub fn is_busy(&self) -> bool {
        self.cancel.is_busy()
    }
}

/// read-only mirror of the session for rendering.
#[derive(Resource, Debug, Default, Clone)]
pub struct ChatView {
    pub readiness: Readiness,
    pub streaming: bool,
    pub messages: Vec<Message>,
    pub draft: String,
    pub health: Option<Health>,
    pub starters: Vec<String>,
    pub last_error: Option<String>,
}

impl ChatView {
    fn apply(&mut self, update: &SessionUpdate) {
        match update {
            SessionUpdate::Readiness(r) => self.readiness = *r,
            SessionUpdate::StreamStarted { question, .. } => {
                self.messages.push(Message::user(question.clone()));
                self.messages.push(Message::assistant());
                self.draft.clear();
                self.streaming = true;
                self.last_error = None;
            }
            SessionUpdate::Delta { slot, text } => {
                if let Some(m) = self.messages.get_mut(slot.index()) {
                    m.content.push_str(text);
                }
            }
            SessionUpdate::Sources { slot, sources } => {
                if let Some(m) = self.messages.get_mut(slot.index()) {
                    m.sources = sources.clone();
                }
            }
            SessionUpdate::StreamEnded { .. } => self.streaming = false,
            SessionUpdate::StreamFailed { error, .. } => {
                self.streaming = false;
                self.last_error = Some(error.clone());
            }
            SessionUpdate::BuildFailed { error } => self.last_error = Some(error.clone()),
            SessionUpdate::Cleared => self.messages.clear(),
            SessionUpdate::Draft(text) => self.draft = text.clone(),
            SessionUpdate::Health(h) => self.health = Some(h.clone()),
            SessionUpdate::Starters(s) => self.starters = s.clone(),
        }
    }
}

#[derive(Event, Debug)]
pub struct ChatDeltaEvt {
    pub slot: ReplySlot,
    pub text: String,
}
#[derive(Event, Debug)]
pub struct ChatSourcesEvt {
    pub slot: ReplySlot,
    pub sources: Vec<String>,
}
#[derive(Event, Debug)]
pub struct ChatFinishedEvt {
    pub slot: ReplySlot,
    pub end: StreamEnd,
}
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    /// `None` for failures outside an exchange (index build).
    pub slot: Option<ReplySlot>,
    pub error: String,
}
#[derive(Event, Debug)]
pub struct ReadinessEvt {
    pub readiness: Readiness,
}

/// session updates waiting for the main thread.
#[derive(Resource, Clone)]
struct SessionInbox {
    rx: Receiver<SessionUpdate>,
}

/// bevy plugin: wires systems, events, resources.
/// uses the `ChatConfig` resource if present, `ChatConfig::from_env()`
/// otherwise. on native, also inserts a tiny tokio runtime by default.
pub struct RagChatPlugin;

impl Plugin for RagChatPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_rag_chat", "RagChatPlugin: build()");
        if app.world().get_resource::<ChatConfig>().is_none() {
            let config = ChatConfig::from_env().unwrap_or_else(|err| {
                warn!(target: "bevy_rag_chat", "{}; using default config", err);
                ChatConfig::default()
            });
            app.insert_resource(config);
        }

        app.init_resource::<ChatView>()
            .add_event::<ChatDeltaEvt>()
            .add_event::<ChatSourcesEvt>()
            .add_event::<ChatFinishedEvt>()
            .add_event::<ChatErrorEvt>()
            .add_event::<ReadinessEvt>()
            .configure_sets(Update, RagChatSet::Drain)
            .add_systems(Startup, start_session_driver)
            .add_systems(Update, drain_session_inbox.in_set(RagChatSet::Drain));

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

/// process intents one at a time until every `ChatClient` is gone.
pub async fn drive_session<T: Transport>(mut session: ChatSession<T>, intents: Receiver<ChatIntent>) {
    while let Ok(intent) = intents.recv_async().await {
        debug!(target: "bevy_rag_chat", "driver: {:?}", intent);
        match intent {
            ChatIntent::Build => {
                // failures are published as updates
                let _ = session.build().await;
            }
            ChatIntent::Send(question) => {
                if let Err(err) = session.send(&question).await
                    && err.is_rejection()
                {
                    debug!(target: "bevy_rag_chat", "send rejected: {}", err);
                }
            }
            ChatIntent::SetDraft(text) => session.set_draft(text),
            ChatIntent::Submit => {
                if let Err(err) = session.submit().await
                    && err.is_rejection()
                {
                    debug!(target: "bevy_rag_chat", "submit rejected: {}", err);
                }
            }
            ChatIntent::Clear => {
                session.clear();
            }
            ChatIntent::Probe => session.probe().await,
        }
    }
    info!(target: "bevy_rag_chat", "driver: all clients dropped, stopping");
}

fn start_session_driver(
    mut commands: Commands,
    config: Res<ChatConfig>,
    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    info!(target: "bevy_rag_chat", "starting session driver: base={}", config.base_url());
    let mut session = ChatSession::new(HttpTransport::new(&config));
    let updates = session.subscribe();
    let (client, intents) = ChatClient::new(session.cancel_handle());

    #[cfg(not(target_arch = "wasm32"))]
    {
        rt.0.spawn(drive_session(session, intents));
    }
    #[cfg(target_arch = "wasm32")]
    {
        bevy::tasks::IoTaskPool::get()
            .spawn(drive_session(session, intents))
            .detach();
    }

    // initial health + starters
    client.probe();
    commands.insert_resource(client);
    commands.insert_resource(SessionInbox { rx: updates });
}

/// drains the inbox, updates the view and emits user-facing events.
fn drain_session_inbox(
    inbox: Option<Res<SessionInbox>>,
    client: Option<Res<ChatClient>>,
    mut view: ResMut<ChatView>,
    mut ev_delta: EventWriter<ChatDeltaEvt>,
    mut ev_sources: EventWriter<ChatSourcesEvt>,
    mut ev_done: EventWriter<ChatFinishedEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
    mut ev_ready: EventWriter<ReadinessEvt>,
) {
    let Some(inbox) = inbox else { return };

    // drain up to a cap per frame to avoid long frames on bursty streams
    const MAX_PER_FRAME: usize = 512;
    let mut drained = Vec::with_capacity(64);
    for _ in 0..MAX_PER_FRAME {
        match inbox.rx.try_recv() {
            Ok(u) => drained.push(u),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
    if drained.is_empty() {
        return;
    }

    // aggregate deltas per slot so uis apply a single push per frame
    let mut deltas: HashMap<ReplySlot, String> = HashMap::new();
    let mut order: Vec<ReplySlot> = Vec::new();
    for update in &drained {
        view.apply(update);
        match update {
            SessionUpdate::Delta { slot, text } => {
                deltas
                    .entry(*slot)
                    .or_insert_with(|| {
                        order.push(*slot);
                        String::new()
                    })
                    .push_str(text);
            }
            SessionUpdate::Readiness(readiness) => {
                ev_ready.write(ReadinessEvt { readiness: *readiness });
            }
            SessionUpdate::Sources { slot, sources } => {
                ev_sources.write(ChatSourcesEvt { slot: *slot, sources: sources.clone() });
            }
            SessionUpdate::StreamFailed { slot, error } => {
                ev_err.write(ChatErrorEvt { slot: Some(*slot), error: error.clone() });
            }
            SessionUpdate::BuildFailed { error } => {
                ev_err.write(ChatErrorEvt { slot: None, error: error.clone() });
            }
            _ => {}
        }
    }

    for slot in order {
        if let Some(text) = deltas.remove(&slot) {
            ev_delta.write(ChatDeltaEvt { slot, text });
        }
    }
    // ensure deltas land before "finished" for the same frame
    for update in &drained {
        if let SessionUpdate::StreamEnded { slot, end } = update {
            ev_done.write(ChatFinishedEvt { slot: *slot, end: *end });
        }
    }

    if let Some(client) = client {
        view.streaming = client.is_streaming();
    }
}
