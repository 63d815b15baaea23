//! Decoding of the `text/event-stream` body of a streamed chat completion.

use std::{
    collections::VecDeque,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::Bytes;
use chat_coordinator::coordination::backend::BackendError;
use futures::Stream;
use pin_project::pin_project;
use serde::Deserialize;

use crate::Error as CrateError;

const DONE: &str = "[DONE]";

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    Delta(String),
    /// A choice reported its finish reason.
    Finished,
    Done,
}

/// Splits raw body bytes into lines and turns `data:` lines into frames.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, BackendError> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            if let Some(frame) = Self::decode_line(&line)? {
                frames.extend(frame);
            }
        }
        Ok(frames)
    }

    /// Decodes whatever is left once the body ended without a final newline.
    pub(crate) fn finish(&mut self) -> Result<Vec<Frame>, BackendError> {
        let line = std::mem::take(&mut self.buffer);
        Ok(Self::decode_line(&line)?.unwrap_or_default())
    }

    fn decode_line(line: &[u8]) -> Result<Option<Vec<Frame>>, BackendError> {
        let line = std::str::from_utf8(line).map_err(|error| BackendError::Stream {
            message: format!("Event stream is not valid UTF-8: {error}"),
        })?;
        let line = line.trim_end_matches(['\r', '\n']);
        // blank lines end an event, `:` lines are comments, other fields are unused
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim_start();
        if data == DONE {
            return Ok(Some(vec![Frame::Done]));
        }

        let chunk: CompletionChunk =
            serde_json::from_str(data).map_err(|error| BackendError::Stream {
                message: format!("Malformed completion chunk: {error}"),
            })?;
        if let Some(error) = chunk.error {
            return Err(BackendError::Content {
                message: error.message,
            });
        }

        let mut frames = Vec::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                frames.push(Frame::Delta(content));
            }
            if choice.finish_reason.is_some() {
                frames.push(Frame::Finished);
            }
        }
        Ok(Some(frames))
    }
}

/// Content deltas of a streamed completion.
///
/// Ends at `data: [DONE]`. A body that closes without it still counts as complete
/// when a finish reason was seen; otherwise the truncation is reported as an error.
#[pin_project]
pub struct DeltaStream<S> {
    #[pin]
    body: S,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    finish_seen: bool,
    done: bool,
}

impl<S> DeltaStream<S> {
    pub fn new(body: S) -> Self {
        Self {
            body,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            finish_seen: false,
            done: false,
        }
    }

    fn absorb(
        frames: Vec<Frame>,
        pending: &mut VecDeque<String>,
        finish_seen: &mut bool,
        done: &mut bool,
    ) {
        for frame in frames {
            match frame {
                Frame::Delta(text) => pending.push_back(text),
                Frame::Finished => *finish_seen = true,
                Frame::Done => {
                    *done = true;
                    break;
                }
            }
        }
    }
}

impl<S> Stream for DeltaStream<S>
where
    S: Stream<Item = Result<Bytes, CrateError>>,
{
    type Item = Result<String, BackendError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(text) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(text)));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match ready!(this.body.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => match this.decoder.push(&bytes) {
                    Ok(frames) => {
                        Self::absorb(frames, this.pending, this.finish_seen, this.done)
                    }
                    Err(error) => {
                        *this.done = true;
                        return Poll::Ready(Some(Err(error)));
                    }
                },
                Some(Err(error)) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(BackendError::Stream {
                        message: error.to_string(),
                    })));
                }
                None => {
                    let frames = match this.decoder.finish() {
                        Ok(frames) => frames,
                        Err(error) => {
                            *this.done = true;
                            return Poll::Ready(Some(Err(error)));
                        }
                    };
                    let mut done = false;
                    Self::absorb(frames, this.pending, this.finish_seen, &mut done);
                    *this.done = true;
                    if !done && !*this.finish_seen && this.pending.is_empty() {
                        return Poll::Ready(Some(Err(BackendError::Stream {
                            message: "Event stream closed before the completion finished"
                                .to_owned(),
                        })));
                    }
                    if !done && !*this.finish_seen {
                        debug!(
                            target: "openai_client::sse",
                            "Event stream ended without a finish marker"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{StreamExt, stream};

    use super::*;

    async fn collect<P: AsRef<str>>(parts: &[P]) -> Vec<Result<String, BackendError>> {
        let body: Vec<Result<Bytes, CrateError>> = parts
            .iter()
            .map(|part| Ok(Bytes::copy_from_slice(part.as_ref().as_bytes())))
            .collect();
        DeltaStream::new(stream::iter(body)).collect().await
    }

    fn delta(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{content}\"}},\"finish_reason\":null}}]}}\n\n"
        )
    }

    #[tokio::test]
    async fn decodes_deltas_until_done() {
        let out = collect(&[
            ": keep-alive\n\n".to_owned(),
            delta("Hel"),
            delta("lo"),
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n".to_owned(),
            "data: [DONE]\n\n".to_owned(),
            delta("ignored"),
        ])
        .await;
        let text: Vec<String> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(text, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn lines_split_across_network_chunks() {
        let out = collect(&[
            "data: {\"choices\":[{\"delta\":{\"con",
            "tent\":\"caf\u{e9}\"}}]}\r\n\r\nda",
            "ta: [DONE]\n",
        ])
        .await;
        assert_eq!(out, vec![Ok("caf\u{e9}".to_owned())]);
    }

    #[tokio::test]
    async fn multibyte_character_split_between_chunks() {
        let bytes = "data: {\"choices\":[{\"delta\":{\"content\":\"\u{e9}\"}}]}\ndata: [DONE]\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let parts: Vec<Result<Bytes, CrateError>> = vec![
            Ok(Bytes::copy_from_slice(&bytes[..split])),
            Ok(Bytes::copy_from_slice(&bytes[split..])),
        ];
        let out: Vec<_> = DeltaStream::new(stream::iter(parts)).collect().await;
        assert_eq!(out, vec![Ok("\u{e9}".to_owned())]);
    }

    #[tokio::test]
    async fn error_payload_is_a_content_error() {
        let out = collect(&["data: {\"error\":{\"message\":\"content filtered\"}}\n\n"]).await;
        assert_eq!(
            out,
            vec![Err(BackendError::Content {
                message: "content filtered".to_owned()
            })]
        );
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let out = collect(&["data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n"]).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Ok("par".to_owned()));
        assert!(matches!(out[1], Err(BackendError::Stream { .. })));
    }

    #[tokio::test]
    async fn finish_reason_without_done_completes() {
        let out = collect(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}",
        ])
        .await;
        assert_eq!(out, vec![Ok("ok".to_owned())]);
    }

    #[tokio::test]
    async fn malformed_json_is_a_stream_error() {
        let out = collect(&["data: {not json}\n\n"]).await;
        assert!(matches!(out.as_slice(), [Err(BackendError::Stream { .. })]));
    }
}
