use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use langdag_core::error::{LangdagError, Result};

/// Parse a raw SSE text stream into individual events.
/// SSE format: `event: <type>\ndata: <json>\n\n`
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

/// A parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text into the parser and extract complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        if chunk.contains('\r') {
            self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(chunk);
        }
        let mut events = Vec::new();

        // Split on double newlines (event boundaries)
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();

            let mut event_type = None;
            let mut data_lines = Vec::new();

            for line in block.lines() {
                if let Some(val) = line.strip_prefix("event:") {
                    event_type = Some(val.trim_start().to_string());
                } else if let Some(val) = line.strip_prefix("data:") {
                    data_lines.push(val.strip_prefix(' ').unwrap_or(val).to_string());
                }
            }

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event_type,
                    data: data_lines.join("\n"),
                });
            }
        }

        events
    }
}

/// A stream of SSE events from raw bytes.
///
/// Multi-byte characters split across chunks are carried over to the next
/// chunk. Transport errors end the stream with an `Err` item.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: std::collections::VecDeque<SseEvent>,
    carry: Vec<u8>,
    failed: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: Default::default(),
            carry: Vec::new(),
            failed: false,
        }
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<String> {
        self.carry.extend_from_slice(bytes);
        match std::str::from_utf8(&self.carry) {
            Ok(text) => {
                let text = text.to_string();
                self.carry.clear();
                Ok(text)
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete trailing character; keep it for the next chunk
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.carry[..valid]).into_owned();
                self.carry.drain(..valid);
                Ok(text)
            }
            Err(e) => Err(LangdagError::ProviderStream(format!("invalid UTF-8 in stream: {e}"))),
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.failed {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => match this.decode(&bytes) {
                    Ok(text) => this.pending.extend(this.parser.feed(&text)),
                    Err(e) => {
                        this.failed = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    this.failed = true;
                    return Poll::Ready(Some(Err(LangdagError::ProviderStream(e.to_string()))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
