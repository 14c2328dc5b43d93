use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep};

use loom_core::errors::GatewayError;
use loom_core::stream::StreamEvent;

pub const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// One server-sent event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Provider-specific interpretation of SSE frames.
pub trait EventParser: Send {
    fn parse(&mut self, frame: &SseFrame) -> Vec<StreamEvent>;

    /// Called once when the byte stream ends. Returns whatever the parser still
    /// owes the consumer, typically `Done` or an interruption error.
    fn finish(&mut self) -> Vec<StreamEvent>;
}

/// Parse one blank-line-delimited block into a frame.
pub fn parse_frame(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data.join("\n"),
    })
}

/// Parse raw SSE text into frames.
pub fn parse_sse_frames(raw: &str) -> Vec<SseFrame> {
    raw.replace("\r\n", "\n")
        .split("\n\n")
        .filter_map(parse_frame)
        .collect()
}

pin_project! {
    /// Turns an HTTP byte stream into normalized [`StreamEvent`]s.
    ///
    /// If no bytes arrive within the idle timeout the stream ends with a
    /// retryable interruption. Nothing is yielded after a terminal event.
    pub struct SseStream<P> {
        inner: ByteStream,
        parser: P,
        buffer: String,
        pending: VecDeque<StreamEvent>,
        #[pin]
        idle: Sleep,
        idle_duration: Duration,
        eof: bool,
        finished: bool,
    }
}

impl<P: EventParser> SseStream<P> {
    pub fn new(inner: ByteStream, parser: P) -> Self {
        Self::with_idle_timeout(inner, parser, SSE_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(inner: ByteStream, parser: P, idle_duration: Duration) -> Self {
        Self {
            inner,
            parser,
            buffer: String::new(),
            pending: VecDeque::new(),
            idle: tokio::time::sleep(idle_duration),
            idle_duration,
            eof: false,
            finished: false,
        }
    }
}

impl<P: EventParser> Stream for SseStream<P> {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let mut this = self.project();
        loop {
            if *this.finished {
                return Poll::Ready(None);
            }
            if let Some(event) = this.pending.pop_front() {
                if event.is_terminal() {
                    *this.finished = true;
                    this.pending.clear();
                }
                return Poll::Ready(Some(event));
            }
            if *this.eof {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.idle
                        .as_mut()
                        .reset(Instant::now() + *this.idle_duration);
                    let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
                    this.buffer.push_str(&text);

                    while let Some(pos) = this.buffer.find("\n\n") {
                        let block: String = this.buffer.drain(..pos + 2).collect();
                        if let Some(frame) = parse_frame(&block) {
                            this.pending.extend(this.parser.parse(&frame));
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.finished = true;
                    return Poll::Ready(Some(StreamEvent::Error {
                        error: GatewayError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    *this.eof = true;
                    let rest = std::mem::take(this.buffer);
                    if let Some(frame) = parse_frame(&rest) {
                        this.pending.extend(this.parser.parse(&frame));
                    }
                    this.pending.extend(this.parser.finish());
                }
                Poll::Pending => {
                    if this.idle.as_mut().poll(cx).is_ready() {
                        *this.finished = true;
                        return Poll::Ready(Some(StreamEvent::Error {
                            error: GatewayError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                this.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
