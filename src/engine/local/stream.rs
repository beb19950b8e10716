use std::fmt::Display;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::models::OpenAiStreamChunk;
use crate::engine::types::StreamEvent;

/// Incremental Server-Sent Events splitter. Bytes go in, complete `data:`
/// payloads come out. Multi-byte characters split across network chunks are
/// held back until complete.
#[derive(Debug, Default)]
pub struct SseDecoder {
    byte_buf: Vec<u8>,
    buffer: String,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.byte_buf.extend_from_slice(bytes);

        let valid_up_to = match std::str::from_utf8(&self.byte_buf) {
            Ok(_) => self.byte_buf.len(),
            Err(e) => e.valid_up_to(),
        };
        if valid_up_to == 0 {
            return Vec::new();
        }

        let decoded = String::from_utf8_lossy(&self.byte_buf[..valid_up_to]).into_owned();
        self.byte_buf.drain(..valid_up_to);

        // Normalize CRLF to LF
        self.buffer.push_str(&decoded.replace("\r\n", "\n"));

        let mut payloads = Vec::new();
        while let Some(event_end) = self.buffer.find("\n\n") {
            let event_text: String = self.buffer.drain(..event_end + 2).collect();
            for line in event_text.lines() {
                let payload = if let Some(p) = line.strip_prefix("data: ") {
                    p
                } else if let Some(p) = line.strip_prefix("data:") {
                    p
                } else {
                    continue;
                };
                payloads.push(payload.to_string());
            }
        }
        payloads
    }
}

/// Pump an SSE byte stream of chat completion chunks into `tx`.
pub async fn parse_sse_stream<S, B, E>(stream: S, tx: mpsc::Sender<StreamEvent>)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    futures::pin_mut!(stream);
    let mut decoder = SseDecoder::default();
    let mut tokens_in = None;
    let mut tokens_out = None;

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(format!("Stream error: {}", e)))
                    .await;
                return;
            }
        };

        for payload in decoder.push(bytes.as_ref()) {
            // OpenAI signals end of stream with [DONE]
            if payload.trim() == "[DONE]" {
                let _ = tx
                    .send(StreamEvent::Done {
                        tokens_in,
                        tokens_out,
                    })
                    .await;
                return;
            }

            match serde_json::from_str::<OpenAiStreamChunk>(&payload) {
                Ok(chunk) => {
                    if let Some(usage) = chunk.usage {
                        tokens_in = usage.prompt_tokens;
                        tokens_out = usage.completion_tokens;
                    }
                    let content = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content);
                    if let Some(content) = content {
                        if !content.is_empty()
                            && tx.send(StreamEvent::Token(content)).await.is_err()
                        {
                            return; // receiver dropped
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to parse SSE data: {}", e);
                }
            }
        }
    }

    // If the stream ended without a [DONE] signal, send Done anyway
    let _ = tx
        .send(StreamEvent::Done {
            tokens_in,
            tokens_out,
        })
        .await;
}
