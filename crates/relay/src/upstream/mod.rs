// Upstream live-source collaborator.
//
// The supervisor only needs `connect` to yield a typed event stream and a
// way to tear it down. Sources own decoding; the supervisor never sees the
// platform's wire format. A fresh `UpstreamSession` is created per attempt
// and dropping it cancels the producer.

pub mod webcast;

use std::time::Duration;

use serde_json::{Map, Value};
use tapcast_common::protocol::{EventBody, TransportMode};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use url::Url;

pub use webcast::{WebcastConfig, WebcastSource};

// ── Source trait ────────────────────────────────────────────────────

/// How a single attempt reaches the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub mode: TransportMode,
    pub proxy_url: Option<Url>,
}

impl TransportOptions {
    pub fn direct() -> Self {
        Self { mode: TransportMode::Direct, proxy_url: None }
    }

    /// Proxy URL to apply, only when the mode asks for it.
    pub fn effective_proxy(&self) -> Option<&Url> {
        match self.mode {
            TransportMode::Proxy => self.proxy_url.as_ref(),
            TransportMode::Direct => None,
        }
    }
}

/// Producer of per-tenant live event streams.
///
/// Returns `Send` futures so supervisors can run on the multi-threaded
/// runtime.
pub trait UpstreamSource: Send + Sync + 'static {
    /// Open a stream for `identity` (the streamer's platform username).
    fn connect(
        &self,
        identity: &str,
        transport: &TransportOptions,
    ) -> impl std::future::Future<Output = Result<UpstreamSession, UpstreamError>> + Send;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream disconnected: {0}")]
    Disconnected(String),
    #[error("upstream identity `{0}` not found")]
    TenantNotFound(String),
}

impl UpstreamError {
    /// Permanent errors pause the session instead of retrying.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::TenantNotFound(_))
    }

    /// Short reason carried in status frames.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Disconnected(_) => "disconnected",
            Self::TenantNotFound(_) => "tenant_not_found",
        }
    }
}

// ── Event stream ────────────────────────────────────────────────────

/// One decoded upstream message, before avatar resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamMessage {
    pub body: EventBody,
    pub participant_id: String,
    pub display_name: String,
    /// Raw participant attributes, scanned for avatar candidates.
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Message(UpstreamMessage),
    /// The producer stopped; the supervisor treats this as a failure.
    Closed { reason: String },
}

/// Live handle to one upstream attempt.
#[derive(Debug)]
pub struct UpstreamSession {
    room_id: Option<String>,
    events: mpsc::Receiver<UpstreamEvent>,
    cancel: Option<oneshot::Sender<()>>,
}

/// Producer half of an [`UpstreamSession`].
#[derive(Debug)]
pub struct UpstreamFeed {
    events: mpsc::Sender<UpstreamEvent>,
    cancelled: oneshot::Receiver<()>,
}

impl UpstreamSession {
    /// Create a connected session/feed pair.
    pub fn channel(room_id: Option<String>, capacity: usize) -> (Self, UpstreamFeed) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        (
            Self { room_id, events: events_rx, cancel: Some(cancel_tx) },
            UpstreamFeed { events: events_tx, cancelled: cancel_rx },
        )
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    /// Next event; `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<UpstreamEvent> {
        self.events.recv().await
    }

    /// Tear down the producer.
    pub fn disconnect(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl UpstreamFeed {
    /// Queue an event. Returns false once the session is gone.
    pub async fn send(&self, event: UpstreamEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Resolves when the session disconnects or is dropped.
    pub async fn cancelled(&mut self) {
        let _ = (&mut self.cancelled).await;
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}
