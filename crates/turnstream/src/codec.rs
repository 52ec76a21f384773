use std::collections::VecDeque;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::{DecodeError, StreamError};
use crate::part::{StreamPart, decode};
use crate::pipeline::ByteStream;

const NEWLINE: u8 = b'\n';

/// Streaming UTF-8 decoder that keeps incomplete trailing sequences for the
/// next call. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(text) => {
                    out.push_str(text);
                    self.carry.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.carry[..valid]));
                    match err.error_len() {
                        None => {
                            self.carry.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.carry.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Flushes any incomplete sequence left at end of input.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        rest
    }
}

/// Reassembles wire lines from arbitrarily split byte chunks.
///
/// Decoding only happens once the most recently pushed chunk ends with a
/// newline, so a source that never aligns a chunk to a line boundary is only
/// decoded at `finish`.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    text: Utf8Decoder,
}

impl LineDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<StreamPart>, DecodeError> {
        self.buf.extend_from_slice(chunk);
        if chunk.last() != Some(&NEWLINE) {
            return Ok(Vec::new());
        }
        self.flush()
    }

    /// Decodes whatever is still buffered, complete line or not.
    pub fn finish(&mut self) -> Result<Vec<StreamPart>, DecodeError> {
        let mut parts = self.flush()?;
        let tail = self.text.finish();
        parts.extend(decode_lines(&tail)?);
        Ok(parts)
    }

    fn flush(&mut self) -> Result<Vec<StreamPart>, DecodeError> {
        if self.buf.is_empty() {
            return Ok(Vec::new());
        }
        let bytes = std::mem::take(&mut self.buf);
        let text = self.text.decode(&bytes);
        decode_lines(&text)
    }
}

fn decode_lines(text: &str) -> Result<Vec<StreamPart>, DecodeError> {
    text.split('\n')
        .filter(|line| !line.is_empty())
        .map(decode)
        .collect()
}

/// Turns a byte stream into decoded parts.
///
/// `is_aborted` is checked after each decoded batch has been yielded; once
/// it returns true the byte source is dropped and the stream ends cleanly.
pub fn read_parts<F>(
    bytes: ByteStream,
    is_aborted: F,
) -> impl futures::Stream<Item = Result<StreamPart, StreamError>> + Send
where
    F: Fn() -> bool + Send + 'static,
{
    struct State<F> {
        bytes: ByteStream,
        decoder: LineDecoder,
        pending: VecDeque<StreamPart>,
        is_aborted: F,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes,
            decoder: LineDecoder::default(),
            pending: VecDeque::new(),
            is_aborted,
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(part) = state.pending.pop_front() {
                    return Ok(Some((part, state)));
                }
                if state.done {
                    return Ok(None);
                }
                if (state.is_aborted)() {
                    debug!("part reader aborted by caller");
                    return Ok(None);
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        let parts = state.decoder.push_chunk(&chunk)?;
                        state.pending.extend(parts);
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        let parts = state.decoder.finish()?;
                        state.pending.extend(parts);
                        state.done = true;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{StreamExt as _, TryStreamExt as _, stream};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn byte_stream(chunks: Vec<&'static str>) -> ByteStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes()))),
        ))
    }

    #[test]
    fn split_line_is_reassembled() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push_chunk(b"0:\"hel").expect("push").is_empty());
        let parts = decoder.push_chunk(b"lo\"\n").expect("push");
        assert_eq!(parts, vec![StreamPart::Text("hello".into())]);
    }

    #[test]
    fn several_lines_in_one_chunk_keep_order() {
        let mut decoder = LineDecoder::default();
        let parts = decoder
            .push_chunk(b"0:\"a\"\n2:[1]\n0:\"b\"\n")
            .expect("push");
        assert_eq!(
            parts,
            vec![
                StreamPart::Text("a".into()),
                StreamPart::Data(vec![serde_json::json!(1)]),
                StreamPart::Text("b".into()),
            ]
        );
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let line = "0:\"héllo 👋\"\n".as_bytes();
        let split = line.len() - 4;
        let mut decoder = Utf8Decoder::default();
        let mut text = decoder.decode(&line[..split]);
        text.push_str(&decoder.decode(&line[split..]));
        assert_eq!(text, "0:\"héllo 👋\"\n");
    }

    #[test]
    fn invalid_utf8_becomes_replacement_character() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xff, b'b']), "a\u{fffd}b");
    }

    #[test]
    fn unterminated_tail_is_decoded_at_finish() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push_chunk(b"0:\"tail\"").expect("push").is_empty());
        assert_eq!(
            decoder.finish().expect("finish"),
            vec![StreamPart::Text("tail".into())]
        );
    }

    #[tokio::test]
    async fn read_parts_yields_parts_across_chunks() {
        let parts: Vec<StreamPart> = read_parts(
            byte_stream(vec!["0:\"Hi\"\n2:[{\"a\"", ":1}]\n", "0:\" there\"\n"]),
            || false,
        )
        .try_collect()
        .await
        .expect("parts");
        assert_eq!(
            parts,
            vec![
                StreamPart::Text("Hi".into()),
                StreamPart::Data(vec![serde_json::json!({"a": 1})]),
                StreamPart::Text(" there".into()),
            ]
        );
    }

    #[tokio::test]
    async fn read_parts_fails_on_unknown_code() {
        let result: Result<Vec<StreamPart>, StreamError> =
            read_parts(byte_stream(vec!["0:\"ok\"\n9:\"x\"\n"]), || false)
                .try_collect()
                .await;
        assert!(matches!(result, Err(StreamError::Decode(DecodeError::InvalidCode { .. }))));
    }

    #[tokio::test]
    async fn abort_stops_after_current_batch() {
        let aborted = Arc::new(AtomicBool::new(false));
        let flag = aborted.clone();
        let mut parts = Box::pin(read_parts(
            byte_stream(vec!["0:\"a\"\n0:\"b\"\n", "0:\"c\"\n"]),
            move || flag.load(Ordering::SeqCst),
        ));

        let first = parts.next().await.expect("first").expect("ok");
        assert_eq!(first, StreamPart::Text("a".into()));
        aborted.store(true, Ordering::SeqCst);
        let second = parts.next().await.expect("second").expect("ok");
        assert_eq!(second, StreamPart::Text("b".into()));
        assert!(parts.next().await.is_none());
    }
}
