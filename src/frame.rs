//! incremental decoder for the blank-line delimited event stream.
//!
//! bytes arrive in arbitrary chunks; frames (and utf-8 code points) may be
//! split anywhere. the decoder keeps the unfinished tail and only emits a
//! frame once its terminating blank line has been seen.

const SEPARATOR: &str = "\n\n";
const DEFAULT_EVENT: &str = "message";

/// one parsed protocol unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self { event: event.into(), data: data.into() }
    }

    /// parse one separator-free segment. `None` when the segment carries
    /// neither an `event:` nor a `data:` line.
    pub fn parse(segment: &str) -> Option<Self> {
        let mut event = None;
        let mut data = String::new();
        let mut has_data = false;

        for line in segment.split('\n').filter(|l| !l.is_empty()) {
            if let Some(name) = line.strip_prefix("event:") {
                event = Some(name.trim().to_string());
            } else if let Some(fragment) = line.strip_prefix("data:") {
                data.push_str(fragment.trim());
                has_data = true;
            }
        }

        if event.is_none() && !has_data {
            return None;
        }
        Some(Self {
            event: event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
        })
    }
}

/// per-stream decoder state. create one per stream; never share.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    // trailing bytes of a code point cut by a chunk boundary
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// append text and return every frame completed by it, in order.
    pub fn feed(&mut self, chunk: &str) -> Vec<Frame> {
        self.buffer.push_str(chunk);

        let Some(last_sep) = self.buffer.rfind(SEPARATOR) else {
            return Vec::new();
        };
        let tail = self.buffer.split_off(last_sep + SEPARATOR.len());
        let complete = std::mem::replace(&mut self.buffer, tail);

        complete.split(SEPARATOR).filter_map(Frame::parse).collect()
    }

    /// like [`feed`](Self::feed) for raw bytes. an incomplete utf-8 sequence
    /// at the end of `chunk` is held back until the next call; invalid
    /// sequences are replaced with U+FFFD.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let keep = incomplete_suffix_len(&bytes);
        self.pending = bytes.split_off(bytes.len() - keep);

        let text = String::from_utf8_lossy(&bytes);
        self.feed(&text)
    }

    /// bytes/chars buffered but not yet part of an emitted frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending.len()
    }

    /// end of input. the unterminated tail is dropped; its length is
    /// returned so callers can log it.
    pub fn finish(self) -> usize {
        self.buffered_len()
    }
}

/// length of a trailing, not yet complete utf-8 sequence (0..=3).
fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let b = bytes[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let need = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return 0,
        };
        let have = bytes.len() - i;
        return if have < need { have } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "event:chunk\ndata:{\"delta\":\"Hel\"}\n\nevent:chunk\ndata:{\"delta\":\"lo\"}\n\nevent:meta\ndata:{\"sources\":[\"docA\"]}\n\nevent:done\ndata:\n\n";

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::new("chunk", r#"{"delta":"Hel"}"#),
            Frame::new("chunk", r#"{"delta":"lo"}"#),
            Frame::new("meta", r#"{"sources":["docA"]}"#),
            Frame::new("done", ""),
        ]
    }

    #[test]
    fn single_chunk_yields_all_frames() {
        let mut dec = FrameDecoder::new();
        assert_eq!(dec.feed(SAMPLE), sample_frames());
        assert_eq!(dec.buffered_len(), 0);
    }

    #[test]
    fn every_split_point_yields_same_frames() {
        for cut in 0..=SAMPLE.len() {
            let mut dec = FrameDecoder::new();
            let mut out = dec.feed(&SAMPLE[..cut]);
            out.extend(dec.feed(&SAMPLE[cut..]));
            assert_eq!(out, sample_frames(), "split at {cut}");
        }
    }

    #[test]
    fn byte_at_a_time_yields_same_frames() {
        let mut dec = FrameDecoder::new();
        let mut out = Vec::new();
        for b in SAMPLE.as_bytes() {
            out.extend(dec.feed_bytes(std::slice::from_ref(b)));
        }
        assert_eq!(out, sample_frames());
    }

    #[test]
    fn multibyte_code_point_split_across_chunks() {
        let text = "event:chunk\ndata:{\"delta\":\"h\u{e9}\u{1f600}\"}\n\n";
        let bytes = text.as_bytes();
        for cut in 0..=bytes.len() {
            let mut dec = FrameDecoder::new();
            let mut out = dec.feed_bytes(&bytes[..cut]);
            out.extend(dec.feed_bytes(&bytes[cut..]));
            assert_eq!(
                out,
                vec![Frame::new("chunk", "{\"delta\":\"h\u{e9}\u{1f600}\"}")],
                "split at {cut}"
            );
        }
    }

    #[test]
    fn partial_frame_is_kept_until_terminated() {
        let mut dec = FrameDecoder::new();
        assert!(dec.feed("event:chunk\ndata:{\"del").is_empty());
        assert!(dec.feed("ta\":\"x\"}\n").is_empty());
        assert_eq!(dec.feed("\n"), vec![Frame::new("chunk", r#"{"delta":"x"}"#)]);
        // nothing is emitted twice
        assert!(dec.feed("").is_empty());
    }

    #[test]
    fn missing_event_defaults_to_message() {
        assert_eq!(Frame::parse("data: hi "), Some(Frame::new("message", "hi")));
    }

    #[test]
    fn data_lines_are_concatenated_trimmed() {
        assert_eq!(
            Frame::parse("event: chunk\ndata: {\"delta\":\ndata: \"ab\"}"),
            Some(Frame::new("chunk", r#"{"delta":"ab"}"#))
        );
    }

    #[test]
    fn empty_and_unrecognised_segments_yield_nothing() {
        let mut dec = FrameDecoder::new();
        assert!(dec.feed("\n\n\n\n: keepalive\n\nid: 4\n\n").is_empty());
    }

    #[test]
    fn unterminated_tail_is_reported_on_finish() {
        let mut dec = FrameDecoder::new();
        assert!(dec.feed("event:chunk\ndata:{}").is_empty());
        assert_eq!(dec.finish(), "event:chunk\ndata:{}".len());
    }

    #[test]
    fn incomplete_suffix_detection() {
        assert_eq!(incomplete_suffix_len(b"abc"), 0);
        assert_eq!(incomplete_suffix_len(&[0x61, 0xC3]), 1);
        assert_eq!(incomplete_suffix_len(&[0xC3, 0xA9]), 0);
        assert_eq!(incomplete_suffix_len(&[0xF0, 0x9F, 0x98]), 3);
        assert_eq!(incomplete_suffix_len(&[0xF0, 0x9F, 0x98, 0x80]), 0);
    }
}
