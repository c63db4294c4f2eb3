//! Newline-delimited JSON framing for streaming chat responses.
//!
//! The backend answers `POST /api/chat` with one JSON object per line:
//!
//! ```text
//! {"message":{"role":"assistant","content":"Hel"},"done":false}
//! {"message":{"role":"assistant","content":"lo"},"done":false}
//! {"done":true}
//! ```
//!
//! [`StreamFramer`] turns those bytes into [`StreamEvent`]s. Malformed lines
//! are logged and skipped, a `done` line ends decoding, and every event
//! carries a per-message `sequence` that starts at 0 and has no gaps. The
//! last event of a stream is always [`StreamEvent::Complete`] or
//! [`StreamEvent::Error`].

use std::collections::VecDeque;
use std::fmt::Display;

use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// One decoded unit of an incremental chat response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// An incremental text delta.
    Chunk {
        id: String,
        conversation_id: String,
        sequence: u64,
        model: String,
        text: String,
    },
    /// The response finished normally.
    Complete {
        id: String,
        conversation_id: String,
        sequence: u64,
        model: String,
    },
    /// The response ended with an error. Text already delivered stays delivered.
    Error {
        id: String,
        conversation_id: String,
        sequence: u64,
        message: String,
    },
}

impl StreamEvent {
    pub fn id(&self) -> &str {
        match self {
            StreamEvent::Chunk { id, .. }
            | StreamEvent::Complete { id, .. }
            | StreamEvent::Error { id, .. } => id,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            StreamEvent::Chunk { sequence, .. }
            | StreamEvent::Complete { sequence, .. }
            | StreamEvent::Error { sequence, .. } => *sequence,
        }
    }

    /// Whether this event ends its stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk { .. })
    }
}

/// How a framed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// A `done` line was received.
    Completed,
    /// The backend reported an error line; the connection itself is fine.
    BackendError(String),
    /// The byte stream failed or ended before a `done` line.
    TransportFailed(String),
}

/// Raw NDJSON line from the backend.
#[derive(Deserialize, Debug)]
struct WireLine {
    message: Option<WireMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

/// Incremental decoder for one streamed message.
#[derive(Debug)]
pub struct StreamFramer {
    id: String,
    conversation_id: String,
    model: String,
    sequence: u64,
    buffer: Vec<u8>,
    outcome: Option<StreamOutcome>,
}

impl StreamFramer {
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            model: model.into(),
            sequence: 0,
            buffer: Vec::new(),
            outcome: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether a terminal event has been emitted.
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.outcome.as_ref()
    }

    /// Feed bytes and return the events completed by them. Bytes after a
    /// terminal event are discarded.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.is_finished() {
            return events;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            self.decode_line(&line, &mut events);
            if self.is_finished() {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Flush at end of input. Decodes a trailing unterminated line, then
    /// emits an error if the stream never completed.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.is_finished() {
            return events;
        }
        let remaining = std::mem::take(&mut self.buffer);
        self.decode_line(&remaining, &mut events);
        if !self.is_finished() {
            events.extend(self.fail("stream ended before completion"));
        }
        events
    }

    /// End the stream with a transport failure. No-op once finished.
    pub fn fail(&mut self, message: impl Into<String>) -> Option<StreamEvent> {
        if self.is_finished() {
            return None;
        }
        let message = message.into();
        self.buffer.clear();
        self.outcome = Some(StreamOutcome::TransportFailed(message.clone()));
        Some(self.error_event(message))
    }

    /// End with a transport failure numbered `sequence`, regardless of what
    /// was decoded after it.
    fn interrupt(&mut self, sequence: u64, message: String) -> StreamEvent {
        self.sequence = sequence;
        self.buffer.clear();
        self.outcome = Some(StreamOutcome::TransportFailed(message.clone()));
        self.error_event(message)
    }

    fn decode_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        if line.is_empty() {
            return;
        }

        let parsed = match serde_json::from_str::<WireLine>(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Skipping malformed stream line: {e} (data: {line})");
                return;
            }
        };

        if let Some(message) = parsed.error {
            debug!("Backend reported stream error: {message}");
            self.outcome = Some(StreamOutcome::BackendError(message.clone()));
            events.push(self.error_event(message));
            return;
        }

        if let Some(content) = parsed.message.map(|m| m.content)
            && !content.is_empty()
        {
            let sequence = self.next_sequence();
            events.push(StreamEvent::Chunk {
                id: self.id.clone(),
                conversation_id: self.conversation_id.clone(),
                sequence,
                model: self.model.clone(),
                text: content,
            });
        }

        if parsed.done {
            trace!("Stream {} done after {} event(s)", self.id, self.sequence);
            let sequence = self.next_sequence();
            self.outcome = Some(StreamOutcome::Completed);
            events.push(StreamEvent::Complete {
                id: self.id.clone(),
                conversation_id: self.conversation_id.clone(),
                sequence,
                model: self.model.clone(),
            });
        }
    }

    fn error_event(&mut self, message: String) -> StreamEvent {
        let sequence = self.next_sequence();
        StreamEvent::Error {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            sequence,
            message,
        }
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }
}

/// Pulls events out of a byte stream through a [`StreamFramer`], reading
/// more bytes only when no decoded event is pending.
pub struct FrameReader<S> {
    framer: StreamFramer,
    bytes: S,
    pending: VecDeque<StreamEvent>,
}

impl<S, B, E> FrameReader<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    pub fn new(framer: StreamFramer, bytes: S) -> Self {
        Self {
            framer,
            bytes,
            pending: VecDeque::new(),
        }
    }

    /// Next event, or `None` once the terminal event has been returned.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.framer.is_finished() {
                return None;
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.framer.push(chunk.as_ref())),
                Some(Err(e)) => self
                    .pending
                    .extend(self.framer.fail(format!("stream read failed: {e}"))),
                None => self.pending.extend(self.framer.finish()),
            }
        }
    }

    /// Terminate early (for example, the connection moved on). Decoded events
    /// not yet returned are dropped and the error takes the first dropped
    /// sequence number. Returns `None` once the terminal event was returned.
    pub fn abort(&mut self, message: impl Into<String>) -> Option<StreamEvent> {
        let resume_at = match self.pending.front() {
            Some(event) => event.sequence(),
            None if self.framer.is_finished() => return None,
            None => self.framer.sequence,
        };
        self.pending.clear();
        Some(self.framer.interrupt(resume_at, message.into()))
    }

    /// Like [`abort`](Self::abort), but also discards `event`, which must be
    /// the event most recently returned by [`next`](Self::next). A terminal
    /// `event` is returned unchanged.
    pub fn preempt(&mut self, event: StreamEvent, message: impl Into<String>) -> Option<StreamEvent> {
        if event.is_terminal() {
            return Some(event);
        }
        self.pending.push_front(event);
        self.abort(message)
    }

    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.framer.outcome()
    }
}

/// Decode a byte stream into a lazy, finite stream of events.
pub fn decode_stream<S, B, E>(framer: StreamFramer, bytes: S) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    stream::unfold(FrameReader::new(framer, bytes), |mut reader| async move {
        let event = reader.next().await?;
        Some((event, reader))
    })
}

/// Assemble the text of all chunks in a sequence of events.
pub fn collect_text(events: &[StreamEvent]) -> String {
    let mut text = String::new();
    for event in events {
        if let StreamEvent::Chunk { text: delta, .. } = event {
            text.push_str(delta);
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn framer() -> StreamFramer {
        StreamFramer::new("msg-1", "conv-1", "llama3")
    }

    fn lines(input: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for line in input {
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
        }
        bytes
    }

    fn assert_well_formed(events: &[StreamEvent]) {
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence(), i as u64, "sequence gap at {i}");
        }
        let last = events.last().expect("at least one event");
        assert!(last.is_terminal(), "last event must be terminal: {last:?}");
        assert!(
            events[..events.len() - 1].iter().all(|e| !e.is_terminal()),
            "terminal event before end"
        );
    }

    #[test]
    fn malformed_line_is_skipped() {
        let mut f = framer();
        let events = f.push(&lines(&[
            r#"{"message":{"content":"a"},"done":false}"#,
            "garbage",
            r#"{"message":{"content":"b"},"done":false}"#,
            r#"{"done":true}"#,
        ]));

        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            StreamEvent::Chunk { sequence: 0, text, .. } if text == "a"
        ));
        assert!(matches!(
            &events[1],
            StreamEvent::Chunk { sequence: 1, text, .. } if text == "b"
        ));
        assert!(matches!(&events[2], StreamEvent::Complete { sequence: 2, .. }));
        assert_eq!(f.outcome(), Some(&StreamOutcome::Completed));
    }

    #[test]
    fn lines_split_across_pushes() {
        let mut f = framer();
        let bytes = lines(&[
            r#"{"message":{"content":"Hel"},"done":false}"#,
            r#"{"message":{"content":"lo"},"done":false}"#,
            r#"{"done":true}"#,
        ]);
        let mut events = Vec::new();
        for piece in bytes.chunks(7) {
            events.extend(f.push(piece));
        }
        assert_eq!(collect_text(&events), "Hello");
        assert_well_formed(&events);
    }

    #[test]
    fn blank_lines_and_crlf_are_ignored() {
        let mut f = framer();
        let events = f.push(b"\r\n\n{\"message\":{\"content\":\"x\"},\"done\":false}\r\n{\"done\":true}\r\n");
        assert_eq!(events.len(), 2);
        assert_well_formed(&events);
    }

    #[test]
    fn empty_content_emits_nothing() {
        let mut f = framer();
        let events = f.push(&lines(&[r#"{"message":{"content":""},"done":false}"#]));
        assert!(events.is_empty());
        assert!(!f.is_finished());
    }

    #[test]
    fn bytes_after_done_are_discarded() {
        let mut f = framer();
        let events = f.push(&lines(&[
            r#"{"done":true}"#,
            r#"{"message":{"content":"late"},"done":false}"#,
        ]));
        assert_eq!(events.len(), 1);
        assert!(f.push(b"{\"message\":{\"content\":\"later\"}}\n").is_empty());
        assert!(f.finish().is_empty());
    }

    #[test]
    fn final_content_on_done_line_is_kept() {
        let mut f = framer();
        let events = f.push(&lines(&[r#"{"message":{"content":"end"},"done":true}"#]));
        assert_eq!(events.len(), 2);
        assert_eq!(collect_text(&events), "end");
        assert_well_formed(&events);
    }

    #[test]
    fn backend_error_line_terminates() {
        let mut f = framer();
        let events = f.push(&lines(&[
            r#"{"message":{"content":"a"},"done":false}"#,
            r#"{"error":"model 'nope' not found"}"#,
        ]));
        assert!(matches!(
            &events[1],
            StreamEvent::Error { sequence: 1, message, .. } if message.contains("not found")
        ));
        assert!(matches!(f.outcome(), Some(StreamOutcome::BackendError(_))));
        assert_well_formed(&events);
    }

    #[test]
    fn unterminated_final_line_is_decoded_on_finish() {
        let mut f = framer();
        let mut events = f.push(br#"{"message":{"content":"a"},"done":false}"#);
        assert!(events.is_empty());
        events.extend(f.push(b"\n{\"done\":true}"));
        events.extend(f.finish());
        assert_eq!(events.len(), 2);
        assert_well_formed(&events);
    }

    #[test]
    fn premature_end_emits_error() {
        let mut f = framer();
        let mut events = f.push(&lines(&[r#"{"message":{"content":"a"},"done":false}"#]));
        events.extend(f.finish());
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
        assert!(matches!(f.outcome(), Some(StreamOutcome::TransportFailed(_))));
        assert_well_formed(&events);
    }

    #[test]
    fn fail_after_finish_is_noop() {
        let mut f = framer();
        f.push(&lines(&[r#"{"done":true}"#]));
        assert!(f.fail("too late").is_none());
    }

    #[tokio::test]
    async fn decode_stream_is_lazy_and_finite() {
        let chunks: Vec<Result<Vec<u8>, Infallible>> = vec![
            Ok(b"{\"message\":{\"content\":\"a\"},\"done\":false}\ngarb".to_vec()),
            Ok(b"age\n{\"message\":{\"content\":\"b\"},\"done\":false}\n".to_vec()),
            Ok(b"{\"done\":true}\n".to_vec()),
            Ok(b"{\"message\":{\"content\":\"ignored\"}}\n".to_vec()),
        ];
        let events: Vec<StreamEvent> = decode_stream(framer(), stream::iter(chunks))
            .collect()
            .await;
        assert_eq!(collect_text(&events), "ab");
        assert_eq!(events.len(), 3);
        assert_well_formed(&events);
    }

    #[tokio::test]
    async fn stream_read_error_becomes_terminal_error() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"{\"message\":{\"content\":\"a\"},\"done\":false}\n".to_vec()),
            Err("connection reset".to_string()),
            Ok(b"{\"done\":true}\n".to_vec()),
        ];
        let events: Vec<StreamEvent> = decode_stream(framer(), stream::iter(chunks))
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            StreamEvent::Error { message, .. } if message.contains("connection reset")
        ));
        assert_well_formed(&events);
    }

    #[tokio::test]
    async fn reader_abort_ends_stream() {
        let chunks: Vec<Result<Vec<u8>, Infallible>> =
            vec![Ok(b"{\"message\":{\"content\":\"a\"},\"done\":false}\n".to_vec())];
        let mut reader = FrameReader::new(framer(), stream::iter(chunks));
        let first = reader.next().await.unwrap();
        let abort = reader.abort("connection lost").unwrap();
        assert_eq!(abort.sequence(), first.sequence() + 1);
        assert!(reader.next().await.is_none());
        assert!(reader.abort("again").is_none());
    }

    #[tokio::test]
    async fn abort_drops_pending_without_sequence_gap() {
        let chunks: Vec<Result<Vec<u8>, Infallible>> = vec![Ok(lines(&[
            r#"{"message":{"content":"a"},"done":false}"#,
            r#"{"message":{"content":"b"},"done":false}"#,
            r#"{"done":true}"#,
        ]))];
        let mut reader = FrameReader::new(framer(), stream::iter(chunks));
        let first = reader.next().await.unwrap();
        let abort = reader.abort("connection lost").unwrap();
        assert_eq!(abort.sequence(), 1);
        assert!(matches!(
            reader.outcome(),
            Some(StreamOutcome::TransportFailed(_))
        ));
        assert_well_formed(&[first, abort]);
    }

    #[tokio::test]
    async fn preempt_replaces_the_returned_chunk() {
        let chunks: Vec<Result<Vec<u8>, Infallible>> = vec![Ok(lines(&[
            r#"{"message":{"content":"a"},"done":false}"#,
            r#"{"message":{"content":"b"},"done":false}"#,
        ]))];
        let mut reader = FrameReader::new(framer(), stream::iter(chunks));
        let first = reader.next().await.unwrap();
        let second = reader.next().await.unwrap();
        let replaced = reader.preempt(second, "connection lost").unwrap();
        assert!(matches!(&replaced, StreamEvent::Error { sequence: 1, .. }));
        assert_well_formed(&[first, replaced]);
        assert!(reader.next().await.is_none());
    }
}
