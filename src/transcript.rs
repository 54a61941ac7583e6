use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), sources: Vec::new() }
    }

    /// an empty reply, filled in while streaming.
    pub fn assistant() -> Self {
        Self { role: Role::Assistant, content: String::new(), sources: Vec::new() }
    }
}

/// handle to the assistant message opened by one exchange.
///
/// only the decode loop of that exchange writes through it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReplySlot(usize);

impl ReplySlot {
    pub fn index(self) -> usize {
        self.0
    }
}

/// ordered conversation; grows at the end, shrinks only on `clear`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// push the question and an empty reply; the reply slot is returned.
    pub fn begin_exchange(&mut self, question: impl Into<String>) -> ReplySlot {
        self.messages.push(Message::user(question));
        self.messages.push(Message::assistant());
        ReplySlot(self.messages.len() - 1)
    }

    /// the reply addressed by `slot`, if it is still the open tail of the
    /// transcript.
    pub fn reply_mut(&mut self, slot: ReplySlot) -> Option<&mut Message> {
        if slot.0 + 1 != self.messages.len() {
            return None;
        }
        self.messages
            .get_mut(slot.0)
            .filter(|m| m.role == Role::Assistant)
    }

    pub fn get(&self, slot: ReplySlot) -> Option<&Message> {
        self.messages.get(slot.0)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exchange_appends_question_and_empty_reply() {
        let mut t = Transcript::new();
        let slot = t.begin_exchange("why?");
        assert_eq!(slot.index(), 1);
        assert_eq!(t.messages(), &[Message::user("why?"), Message::assistant()]);
    }

    #[test]
    fn only_the_tail_reply_is_writable() {
        let mut t = Transcript::new();
        let first = t.begin_exchange("a");
        assert!(t.reply_mut(first).is_some());
        let second = t.begin_exchange("b");
        assert!(t.reply_mut(first).is_none());
        t.reply_mut(second).unwrap().content.push_str("ok");
        assert_eq!(t.last().unwrap().content, "ok");
    }

    #[test]
    fn stale_slot_after_clear() {
        let mut t = Transcript::new();
        let slot = t.begin_exchange("a");
        t.clear();
        assert!(t.is_empty());
        assert!(t.reply_mut(slot).is_none());
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::user("x")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"x","sources":[]}"#);
    }
}
