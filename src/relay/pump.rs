//! # Relay Pumps
//!
//! The two forwarding loops of a connection pair and the task that races them.
//!
//! ## Shape:
//! ```text
//! client actor ──mpsc──▶ forward_to_upstream ──▶ upstream sink
//! client actor ◀─deliver── forward_to_client ◀── upstream stream
//! ```
//! Each direction has exactly one consumer, so frames keep arrival order.
//! The channel is bounded: the writer only pulls the next frame once the
//! upstream accepted the previous one, so a stalled upstream fills the queue
//! instead of growing memory. Whichever loop finishes first ends the pair;
//! the other is dropped.

use crate::relay::messages::{map_upstream_text, ClientEvent, UpstreamFrame};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

/// Why the upstream reader stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEnd {
    /// Upstream sent a Close frame, or the stream ended cleanly
    Closed(String),
    /// Transport error on the upstream socket
    Failed(String),
    /// The client side is gone; nothing left to deliver to
    ClientGone,
}

impl UpstreamEnd {
    pub fn reason(&self) -> String {
        match self {
            UpstreamEnd::Closed(reason) => reason.clone(),
            UpstreamEnd::Failed(err) => format!("upstream error: {}", err),
            UpstreamEnd::ClientGone => "client disconnected".to_string(),
        }
    }
}

/// How a connection pair finished.
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    /// The client dropped its sender; the writer closed the upstream
    ClientClosed { frames_to_upstream: u64 },
    /// The upstream leg ended first
    UpstreamEnded(UpstreamEnd),
}

/// Drain the pair's channel into the upstream sink.
///
/// When every sender has been dropped the writer sends a Close frame and
/// closes the sink. A failed write ends the loop immediately.
pub async fn forward_to_upstream<S>(mut rx: mpsc::Receiver<UpstreamFrame>, mut sink: S) -> u64
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut frames = 0u64;

    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame.into()).await {
            warn!(frames = frames, error = %e, "Upstream write failed");
            return frames;
        }
        frames += 1;
    }

    debug!(frames = frames, "Client channel closed, closing upstream");
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!(error = %e, "Upstream already closed");
    }
    let _ = sink.close().await;
    frames
}

/// Read the upstream and hand each mapped frame to `deliver`.
///
/// `deliver` returns `false` once the client can no longer receive, which
/// ends the loop.
pub async fn forward_to_client<St, F>(mut stream: St, mut deliver: F) -> UpstreamEnd
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    F: FnMut(ClientEvent) -> bool,
{
    while let Some(next) = stream.next().await {
        let event = match next {
            Ok(Message::Binary(bytes)) => ClientEvent::audio_chunk(&bytes),
            Ok(Message::Text(text)) => map_upstream_text(&text),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "upstream closed the connection".to_string());
                return UpstreamEnd::Closed(reason);
            }
            Err(e) => return UpstreamEnd::Failed(e.to_string()),
        };

        if !deliver(event) {
            return UpstreamEnd::ClientGone;
        }
    }

    UpstreamEnd::Closed("upstream stream ended".to_string())
}

/// Run both directions of a pair until either finishes.
pub async fn run_pair<S, St, F>(
    rx: mpsc::Receiver<UpstreamFrame>,
    sink: S,
    stream: St,
    deliver: F,
) -> PairOutcome
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    F: FnMut(ClientEvent) -> bool,
{
    tokio::select! {
        frames = forward_to_upstream(rx, sink) => PairOutcome::ClientClosed { frames_to_upstream: frames },
        end = forward_to_client(stream, deliver) => PairOutcome::UpstreamEnded(end),
    }
}
