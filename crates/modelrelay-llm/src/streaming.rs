//! Streaming responses
//!
//! A [`ChatStream`] is an mpsc-backed [`futures::Stream`] of [`StreamChunk`]s.
//! Producers (provider adapters, the router) push text deltas and finish with
//! exactly one [`StreamChunk::Done`] carrying usage and cost.

use crate::completion::TokenUsage;
use crate::error::Result;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Channel capacity used by adapters
pub const STREAM_BUFFER: usize = 64;

/// One item of a streaming response
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Incremental text
    Delta {
        /// Text fragment
        content: String,
    },
    /// Final item with accounting data
    Done {
        /// Token usage reported (or estimated) for the whole stream
        tokens: TokenUsage,
        /// Cost in USD, filled in by the router
        cost: Option<f64>,
        /// Provider that produced the stream
        provider: String,
        /// Model that produced the stream
        model: String,
        /// Time from request to last chunk
        latency_ms: u64,
        /// Provider finish reason
        finish_reason: Option<String>,
    },
}

/// Producing half of a [`ChatStream`]
pub type ChunkSender = mpsc::Sender<Result<StreamChunk>>;

/// Stream of response chunks
#[derive(Debug)]
pub struct ChatStream {
    rx: mpsc::Receiver<Result<StreamChunk>>,
}

impl ChatStream {
    /// Create a connected sender/stream pair
    #[must_use]
    pub fn channel(buffer: usize) -> (ChunkSender, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }

    /// Wrap an existing receiver
    #[must_use]
    pub fn from_receiver(rx: mpsc::Receiver<Result<StreamChunk>>) -> Self {
        Self { rx }
    }

    /// Next chunk, `None` once the producer is gone
    pub async fn next_chunk(&mut self) -> Option<Result<StreamChunk>> {
        self.rx.recv().await
    }

    /// Drain the stream into the full text and the final `Done` chunk
    ///
    /// Stops at the first error.
    pub async fn collect_text(mut self) -> Result<(String, Option<StreamChunk>)> {
        let mut text = String::new();
        let mut done = None;
        while let Some(chunk) = self.next_chunk().await {
            match chunk? {
                StreamChunk::Delta { content } => text.push_str(&content),
                last @ StreamChunk::Done { .. } => done = Some(last),
            }
        }
        Ok((text, done))
    }
}

impl Stream for ChatStream {
    type Item = Result<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Splits a byte stream into complete SSE `data:` payloads
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence, so
/// raw bytes are buffered until a full line is available.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every complete `data:` payload
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }

        payloads
    }
}

/// End-of-stream marker used by OpenAI-compatible APIs
pub const SSE_DONE: &str = "[DONE]";

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_chat_stream_yields_in_order() {
        let (tx, stream) = ChatStream::channel(4);
        tokio::spawn(async move {
            for part in ["Hel", "lo"] {
                tx.send(Ok(StreamChunk::Delta {
                    content: part.to_string(),
                }))
                .await
                .unwrap();
            }
            tx.send(Ok(StreamChunk::Done {
                tokens: TokenUsage::new(3, 2),
                cost: None,
                provider: "mock".to_string(),
                model: "m".to_string(),
                latency_ms: 1,
                finish_reason: Some("stop".to_string()),
            }))
            .await
            .unwrap();
        });

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 3);
        assert!(matches!(items[2], Ok(StreamChunk::Done { .. })));
    }

    #[tokio::test]
    async fn test_collect_text() {
        let (tx, stream) = ChatStream::channel(4);
        tx.send(Ok(StreamChunk::Delta {
            content: "a".into(),
        }))
        .await
        .unwrap();
        tx.send(Ok(StreamChunk::Delta {
            content: "b".into(),
        }))
        .await
        .unwrap();
        drop(tx);

        let (text, done) = stream.collect_text().await.unwrap();
        assert_eq!(text, "ab");
        assert!(done.is_none());
    }

    #[test]
    fn test_sse_buffer_handles_split_lines() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        let out = buf.push(b":1}\n\n: keep-alive\ndata: [DONE]\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), SSE_DONE.to_string()]);
    }

    #[test]
    fn test_sse_buffer_handles_split_utf8() {
        let mut buf = SseLineBuffer::new();
        let bytes = "data: é\n".as_bytes();
        assert!(buf.push(&bytes[..7]).is_empty());
        assert_eq!(buf.push(&bytes[7..]), vec!["é".to_string()]);
    }
}
