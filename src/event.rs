//! maps decoded frames onto the three actions the session understands.

use bevy::log::debug;
use serde::Deserialize;

use crate::frame::Frame;
use crate::transcript::Message;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// append to the reply being streamed.
    Delta(String),
    /// replace the reply's citation list.
    Sources(Vec<String>),
    /// the server finished; stop reading.
    Done,
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    delta: Option<String>,
}

#[derive(Deserialize)]
struct MetaPayload {
    #[serde(default)]
    sources: Option<Vec<String>>,
}

impl StreamEvent {
    /// `None` for anything that must not touch the transcript: unknown
    /// event names, unparsable payloads, empty deltas.
    pub fn interpret(frame: &Frame) -> Option<Self> {
        match frame.event.as_str() {
            "chunk" => match serde_json::from_str::<ChunkPayload>(&frame.data) {
                Ok(ChunkPayload { delta: Some(delta) }) if !delta.is_empty() => {
                    Some(StreamEvent::Delta(delta))
                }
                Ok(_) => None,
                Err(err) => {
                    debug!(target: "bevy_rag_chat", "dropping chunk frame: {err}");
                    None
                }
            },
            "meta" => match serde_json::from_str::<MetaPayload>(&frame.data) {
                Ok(meta) => Some(StreamEvent::Sources(meta.sources.unwrap_or_default())),
                Err(err) => {
                    debug!(target: "bevy_rag_chat", "dropping meta frame: {err}");
                    None
                }
            },
            "done" => Some(StreamEvent::Done),
            other => {
                debug!(target: "bevy_rag_chat", "ignoring frame event '{other}'");
                None
            }
        }
    }

    /// apply to the reply message. returns `false` for `Done`, which ends
    /// the stream instead of mutating anything.
    pub fn apply(&self, reply: &mut Message) -> bool {
        match self {
            StreamEvent::Delta(delta) => {
                reply.content.push_str(delta);
                true
            }
            StreamEvent::Sources(sources) => {
                reply.sources = sources.clone();
                true
            }
            StreamEvent::Done => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn interpret(event: &str, data: &str) -> Option<StreamEvent> {
        StreamEvent::interpret(&Frame::new(event, data))
    }

    #[test]
    fn chunk_with_delta() {
        assert_eq!(interpret("chunk", r#"{"delta":"hi"}"#), Some(StreamEvent::Delta("hi".into())));
    }

    #[test]
    fn chunk_without_usable_delta_is_ignored() {
        assert_eq!(interpret("chunk", r#"{"delta":""}"#), None);
        assert_eq!(interpret("chunk", r#"{"other":1}"#), None);
        assert_eq!(interpret("chunk", r#"{"delta":"#), None);
        assert_eq!(interpret("chunk", ""), None);
    }

    #[test]
    fn meta_sources_and_missing_field() {
        assert_eq!(
            interpret("meta", r#"{"sources":["a","b"]}"#),
            Some(StreamEvent::Sources(vec!["a".into(), "b".into()]))
        );
        assert_eq!(interpret("meta", "{}"), Some(StreamEvent::Sources(vec![])));
        assert_eq!(interpret("meta", "not json"), None);
    }

    #[test]
    fn done_and_unknown() {
        assert_eq!(interpret("done", ""), Some(StreamEvent::Done));
        assert_eq!(interpret("done", "garbage"), Some(StreamEvent::Done));
        assert_eq!(interpret("message", r#"{"delta":"x"}"#), None);
        assert_eq!(interpret("progress", "{}"), None);
    }

    #[test]
    fn sources_replace_previous_value() {
        let mut reply = Message::assistant();
        StreamEvent::Sources(vec!["a".into(), "b".into()]).apply(&mut reply);
        StreamEvent::Sources(vec!["c".into()]).apply(&mut reply);
        assert_eq!(reply.sources, vec!["c".to_string()]);
    }

    #[test]
    fn deltas_append_in_order() {
        let mut reply = Message::assistant();
        for d in ["a", "b", "c"] {
            assert!(StreamEvent::Delta(d.into()).apply(&mut reply));
        }
        assert!(!StreamEvent::Done.apply(&mut reply));
        assert_eq!(reply.content, "abc");
    }
}
