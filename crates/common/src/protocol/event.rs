// Live events relayed to overlays.
//
// Field names on the wire follow the overlay format the renderers already
// consume (`user`, `nickname`, `pfp`, `likes`, `giftName`, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::status::StatusReport;
use crate::tenant::TenantKey;

/// Closed set of event kinds handled at the aggregation and fan-out boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Tap,
    Follow,
    Gift,
    Status,
    Raw,
}

/// The viewer who triggered an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    #[serde(rename = "user")]
    pub id: String,
    #[serde(rename = "nickname")]
    pub display_name: String,
    #[serde(rename = "pfp")]
    pub avatar_url: String,
}

/// Kind-specific payload. Serialized inline with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    Tap {
        #[serde(rename = "likes")]
        count: u64,
    },
    Follow,
    Gift {
        #[serde(rename = "giftName")]
        gift_name: String,
        #[serde(rename = "repeatCount")]
        repeat_count: u32,
        /// False while a gift streak is still running.
        #[serde(rename = "repeatEnd")]
        repeat_end: bool,
    },
    Status(StatusReport),
    Raw {
        event: String,
        data: Value,
    },
}

impl EventBody {
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Tap { .. } => EventKind::Tap,
            Self::Follow => EventKind::Follow,
            Self::Gift { .. } => EventKind::Gift,
            Self::Status(_) => EventKind::Status,
            Self::Raw { .. } => EventKind::Raw,
        }
    }
}

/// One event in the relay path. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveEvent {
    /// Routing key; kept off the wire because it may be a credential.
    #[serde(skip)]
    pub tenant: TenantKey,
    /// Upstream identity (platform username) of the streamer.
    pub streamer: String,
    #[serde(flatten)]
    pub participant: Option<Participant>,
    #[serde(flatten)]
    pub body: EventBody,
}

impl LiveEvent {
    pub fn new(
        tenant: TenantKey,
        streamer: impl Into<String>,
        participant: Option<Participant>,
        body: EventBody,
    ) -> Self {
        Self { tenant, streamer: streamer.into(), participant, body }
    }

    pub fn status(tenant: TenantKey, streamer: impl Into<String>, report: StatusReport) -> Self {
        Self::new(tenant, streamer, None, EventBody::Status(report))
    }

    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    /// Like count carried by a tap, `None` for every other kind.
    pub fn tap_count(&self) -> Option<u64> {
        match self.body {
            EventBody::Tap { count } => Some(count),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
