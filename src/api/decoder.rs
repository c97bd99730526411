//! Incremental decoder for the `data:`-framed event stream the chat service
//! answers with.
//!
//! Bytes arrive in arbitrary slices: a read may end in the middle of a UTF-8
//! sequence, in the middle of a JSON object, or carry several records at once.
//! [`SseDecoder`] turns those slices into whole [`StreamEvent`]s in record
//! order; [`EventStream`] drives it from a response body and observes the
//! caller's cancellation token between reads.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{ChatError, StreamEvent};

const RECORD_SEPARATOR: &str = "\n\n";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Undecoded tail of a multi-byte character split across reads.
    pending_bytes: Vec<u8>,
    /// Decoded text not yet closed by a record separator.
    buffer: String,
    terminated: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read. Returns every event completed by it, in order.
    /// Nothing is returned once a terminal event has been seen.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }
        self.decode_utf8(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find(RECORD_SEPARATOR) {
            let record: String = self.buffer.drain(..pos + RECORD_SEPARATOR.len()).collect();
            let Some(event) = parse_record(&record[..pos]) else {
                continue;
            };
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                self.terminated = true;
                self.buffer.clear();
                self.pending_bytes.clear();
                break;
            }
        }
        events
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Connection closed: drop whatever incomplete record is left over.
    /// Returns the number of bytes discarded.
    pub fn finish(&mut self) -> usize {
        let discarded = self.buffer.len() + self.pending_bytes.len();
        if discarded > 0 {
            tracing::debug!(bytes = discarded, "Discarding incomplete trailing record");
        }
        self.buffer.clear();
        self.pending_bytes.clear();
        discarded
    }

    fn decode_utf8(&mut self, bytes: &[u8]) {
        let mut input = std::mem::take(&mut self.pending_bytes);
        input.extend_from_slice(bytes);

        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    push_text(&mut self.buffer, text);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        push_text(&mut self.buffer, text);
                    }
                    match err.error_len() {
                        // Truncated sequence at the end of this read.
                        None => {
                            rest = tail;
                            break;
                        }
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                    }
                }
            }
        }
        self.pending_bytes = rest.to_vec();
    }
}

/// Carriage returns only ever appear as line terminators; JSON escapes them
/// inside strings.
fn push_text(buffer: &mut String, text: &str) {
    buffer.extend(text.chars().filter(|c| *c != '\r'));
}

/// Extract the event carried by one record. Records without data, the
/// terminator sentinel, and payloads that are not a known event are skipped.
fn parse_record(record: &str) -> Option<StreamEvent> {
    let data: Vec<&str> = record
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();
    if data.is_empty() {
        return None;
    }
    let payload = data.join("\n");
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return None;
    }
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable stream record");
            None
        }
    }
}

/// Pulls events out of a response body until a terminal event, the end of
/// the body, or cancellation.
pub struct EventStream<S> {
    body: S,
    decoder: SseDecoder,
    queue: VecDeque<StreamEvent>,
    cancel: CancellationToken,
    exhausted: bool,
}

impl<S, E> EventStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<ChatError>,
{
    pub fn new(body: S, cancel: CancellationToken) -> Self {
        Self {
            body,
            decoder: SseDecoder::new(),
            queue: VecDeque::new(),
            cancel,
            exhausted: false,
        }
    }

    /// Next decoded event, `Ok(None)` once the stream is over.
    ///
    /// Fails with [`ChatError::Cancelled`] as soon as the token fires, even if
    /// decoded events are still queued.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, ChatError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            if let Some(event) = self.queue.pop_front() {
                return Ok(Some(event));
            }
            if self.exhausted || self.decoder.is_terminated() {
                return Ok(None);
            }

            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ChatError::Cancelled),
                read = self.body.next() => read,
            };
            match read {
                Some(Ok(bytes)) => {
                    let events = self.decoder.push(&bytes);
                    self.queue.extend(events);
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    self.decoder.finish();
                    self.exhausted = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Source;

    const STREAM: &str = concat!(
        "data: {\"type\":\"metadata\",\"sources\":[],\"used_rag\":false,\"used_web_search\":false}\n\n",
        "data: {\"type\":\"chunk\",\"content\":\"Håfa\"}\n\n",
        "data: {\"type\":\"chunk\",\"content\":\" adai! 👋\"}\n\n",
        "data: {\"type\":\"done\",\"response_time\":0.75}\n\n",
        "data: [DONE]\n\n",
    );

    fn decode_all(parts: &[&[u8]]) -> Vec<StreamEvent> {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for part in parts {
            events.extend(decoder.push(part));
        }
        decoder.finish();
        events
    }

    fn expected() -> Vec<StreamEvent> {
        vec![
            StreamEvent::Metadata {
                sources: Vec::new(),
                used_rag: false,
                used_web_search: false,
            },
            StreamEvent::Chunk {
                content: "Håfa".into(),
            },
            StreamEvent::Chunk {
                content: " adai! 👋".into(),
            },
            StreamEvent::Done {
                response_time: 0.75,
            },
        ]
    }

    #[test]
    fn whole_stream_in_one_read() {
        assert_eq!(decode_all(&[STREAM.as_bytes()]), expected());
    }

    #[test]
    fn every_two_way_split_decodes_identically() {
        let bytes = STREAM.as_bytes();
        for offset in 0..=bytes.len() {
            let (a, b) = bytes.split_at(offset);
            assert_eq!(decode_all(&[a, b]), expected(), "split at byte {offset}");
        }
    }

    #[test]
    fn byte_at_a_time_decodes_identically() {
        let parts: Vec<&[u8]> = STREAM.as_bytes().chunks(1).collect();
        assert_eq!(decode_all(&parts), expected());
    }

    #[test]
    fn event_straddling_two_reads_is_emitted_once() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"typ").is_empty());
        let events = decoder.push("e\":\"chunk\",\"content\":\"håfa\"}\n\n".as_bytes());
        assert_eq!(
            events,
            vec![StreamEvent::Chunk {
                content: "håfa".into()
            }]
        );
    }

    #[test]
    fn split_inside_multibyte_character() {
        let record = "data: {\"type\":\"chunk\",\"content\":\"å\"}\n\n".as_bytes();
        let split = record.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&record[..split]).is_empty());
        assert_eq!(
            decoder.push(&record[split..]),
            vec![StreamEvent::Chunk {
                content: "å".into()
            }]
        );
    }

    #[test]
    fn crlf_framing_is_accepted() {
        let events = decode_all(&[&b"data: {\"type\":\"chunk\",\"content\":\"a\"}\r\n\r\n"[..]]);
        assert_eq!(
            events,
            vec![StreamEvent::Chunk {
                content: "a".into()
            }]
        );
    }

    #[test]
    fn malformed_and_unknown_records_are_skipped() {
        let events = decode_all(&[concat!(
            "data: {\"type\":\"chunk\",\"content\":\n\n",
            "data: {\"type\":\"ping\"}\n\n",
            ": keep-alive\n\n",
            "event: message\ndata: {\"type\":\"chunk\",\"content\":\"ok\"}\n\n",
        )
        .as_bytes()]);
        assert_eq!(
            events,
            vec![StreamEvent::Chunk {
                content: "ok".into()
            }]
        );
    }

    #[test]
    fn incomplete_trailing_record_is_discarded() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"type\":\"chunk\",\"content\":\"a\"}\n\ndata: {\"type\":\"chu");
        assert_eq!(events.len(), 1);
        assert!(decoder.finish() > 0);
        assert!(decoder.push(b"").is_empty());
    }

    #[test]
    fn nothing_after_terminal_event() {
        let events = decode_all(&[concat!(
            "data: {\"type\":\"error\",\"content\":\"model overloaded\"}\n\n",
            "data: {\"type\":\"chunk\",\"content\":\"late\"}\n\n",
        )
        .as_bytes()]);
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                content: Some("model overloaded".into())
            }]
        );
    }

    #[test]
    fn metadata_sources_survive_decoding() {
        let events = decode_all(&[
            &b"data: {\"type\":\"metadata\",\"sources\":[\"Chamorro-English Dictionary\"],\"used_rag\":true}\n\n"[..],
        ]);
        assert_eq!(
            events,
            vec![StreamEvent::Metadata {
                sources: vec![Source::Name("Chamorro-English Dictionary".into())],
                used_rag: true,
                used_web_search: false,
            }]
        );
    }

    #[tokio::test]
    async fn event_stream_stops_reading_after_terminal_event() {
        let reads: Vec<Result<Bytes, ChatError>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"type\":\"chunk\",\"content\":\"a\"}\n\ndata: {\"type\":\"cancelled\",\"content\":\"stopped\"}\n\n",
            )),
            Err(ChatError::Decode("must not be polled".into())),
        ];
        let mut stream = EventStream::new(futures::stream::iter(reads), CancellationToken::new());

        assert!(matches!(
            stream.next_event().await,
            Ok(Some(StreamEvent::Chunk { .. }))
        ));
        assert!(matches!(
            stream.next_event().await,
            Ok(Some(StreamEvent::Cancelled { .. }))
        ));
        assert!(matches!(stream.next_event().await, Ok(None)));
    }

    #[tokio::test]
    async fn event_stream_aborts_before_first_byte() {
        let token = CancellationToken::new();
        let body = futures::stream::pending::<Result<Bytes, ChatError>>();
        let mut stream = EventStream::new(body, token.clone());

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });

        assert!(matches!(
            stream.next_event().await,
            Err(ChatError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn cancellation_wins_over_queued_events() {
        let token = CancellationToken::new();
        let reads: Vec<Result<Bytes, ChatError>> = vec![Ok(Bytes::from(STREAM))];
        let mut stream = EventStream::new(futures::stream::iter(reads), token.clone());

        assert!(matches!(
            stream.next_event().await,
            Ok(Some(StreamEvent::Metadata { .. }))
        ));
        token.cancel();
        assert!(matches!(
            stream.next_event().await,
            Err(ChatError::Cancelled)
        ));
    }
}
